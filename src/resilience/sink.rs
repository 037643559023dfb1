//! Response sinks.
//!
//! # Responsibilities
//! - Define the write surface a downstream handler renders into
//! - Model optional sink capabilities (flush, connection takeover)
//! - Record the released response for the client (`ResponseRecorder`)
//! - Hand a committed body stream through without buffering it
//!
//! # Design Decisions
//! - Capabilities are declared up front, not probed per call
//! - Using a capability the sink lacks is an explicit `SinkError`
//! - First status write wins, as on a real HTTP connection

use std::fmt;
use std::io;

use axum::{
    body::Body,
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::Response,
};
use bytes::{Bytes, BytesMut};
use futures_util::{future, stream, StreamExt};
use hyper::upgrade::OnUpgrade;

use crate::resilience::error::SinkError;

/// An optional sink capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Flush,
    Hijack,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Flush => write!(f, "flush"),
            Capability::Hijack => write!(f, "hijack"),
        }
    }
}

/// Capabilities a sink supports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub flush: bool,
    pub hijack: bool,
}

impl Capabilities {
    pub const NONE: Self = Self {
        flush: false,
        hijack: false,
    };

    pub fn supports(&self, capability: Capability) -> bool {
        match capability {
            Capability::Flush => self.flush,
            Capability::Hijack => self.hijack,
        }
    }
}

/// Destination a handler writes one response into.
pub trait ResponseSink: Send {
    /// Set the response status. Only the first call has an effect.
    fn set_status(&mut self, status: StatusCode);

    /// Set a header, replacing any values already present for `name`.
    fn write_header(&mut self, name: HeaderName, value: HeaderValue);

    /// Add a value to a header without replacing existing ones.
    fn append_header(&mut self, name: HeaderName, value: HeaderValue);

    /// Write a chunk of the response body. Returns the number of bytes accepted.
    fn write_body(&mut self, chunk: &[u8]) -> io::Result<usize>;

    /// Hand over the rest of the body as a stream.
    ///
    /// Gives the body back when the sink cannot take it; the caller then
    /// copies it through `write_body`.
    fn write_stream(&mut self, body: Body) -> Result<(), Body> {
        Err(body)
    }

    /// True while everything written is thrown away, letting a handler skip
    /// rendering a body nobody will see.
    fn is_discarding(&self) -> bool {
        false
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::NONE
    }

    /// Push buffered output towards the client.
    fn flush(&mut self) -> Result<(), SinkError> {
        Err(SinkError::Unsupported(Capability::Flush))
    }

    /// Take over the underlying connection.
    fn hijack(&mut self) -> Result<OnUpgrade, SinkError> {
        Err(SinkError::Unsupported(Capability::Hijack))
    }
}

/// Sink that turns into the client `Response`.
///
/// Written chunks are held in memory; a body handed over with `write_stream`
/// is passed to the client as it arrives.
#[derive(Default)]
pub struct ResponseRecorder {
    status: Option<StatusCode>,
    headers: HeaderMap,
    body: BytesMut,
    stream: Option<Body>,
    flushed: bool,
    upgrade: Option<OnUpgrade>,
    hijacked: bool,
}

impl ResponseRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow handlers to take over the connection via `upgrade`.
    pub fn with_upgrade(mut self, upgrade: OnUpgrade) -> Self {
        self.upgrade = Some(upgrade);
        self
    }

    /// Status written so far, if any.
    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Body chunks written so far, excluding any attached stream.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn is_streaming(&self) -> bool {
        self.stream.is_some()
    }

    /// True once a handler flushed through this sink.
    pub fn flushed(&self) -> bool {
        self.flushed
    }

    /// Status, headers and written chunks. An attached stream is dropped.
    pub fn into_parts(self) -> (StatusCode, HeaderMap, Bytes) {
        (
            self.status.unwrap_or(StatusCode::OK),
            self.headers,
            self.body.freeze(),
        )
    }

    /// Convert into the response delivered to the client. Defaults to 200.
    pub fn into_response(self) -> Response {
        let body = match self.stream {
            Some(rest) if self.body.is_empty() => rest,
            Some(rest) => {
                let written = stream::once(future::ready(Ok::<_, axum::Error>(self.body.freeze())));
                Body::from_stream(written.chain(rest.into_data_stream()))
            }
            None => Body::from(self.body.freeze()),
        };

        let mut response = Response::new(body);
        *response.status_mut() = self.status.unwrap_or(StatusCode::OK);
        *response.headers_mut() = self.headers;
        response
    }
}

impl fmt::Debug for ResponseRecorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseRecorder")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("body_len", &self.body.len())
            .field("streaming", &self.stream.is_some())
            .field("flushed", &self.flushed)
            .finish()
    }
}

impl ResponseSink for ResponseRecorder {
    fn set_status(&mut self, status: StatusCode) {
        if self.status.is_none() {
            self.status = Some(status);
        }
    }

    fn write_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.headers.insert(name, value);
    }

    fn append_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.headers.append(name, value);
    }

    fn write_body(&mut self, chunk: &[u8]) -> io::Result<usize> {
        if self.stream.is_some() {
            return Err(io::Error::other("response body was already handed over as a stream"));
        }
        if self.status.is_none() {
            self.status = Some(StatusCode::OK);
        }
        self.body.extend_from_slice(chunk);
        Ok(chunk.len())
    }

    fn write_stream(&mut self, body: Body) -> Result<(), Body> {
        if self.stream.is_some() {
            return Err(body);
        }
        if self.status.is_none() {
            self.status = Some(StatusCode::OK);
        }
        self.stream = Some(body);
        Ok(())
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            flush: true,
            hijack: self.upgrade.is_some() || self.hijacked,
        }
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        self.flushed = true;
        Ok(())
    }

    fn hijack(&mut self) -> Result<OnUpgrade, SinkError> {
        match self.upgrade.take() {
            Some(upgrade) => {
                self.hijacked = true;
                Ok(upgrade)
            }
            None if self.hijacked => Err(SinkError::AlreadyHijacked),
            None => Err(SinkError::Unsupported(Capability::Hijack)),
        }
    }
}
