//! Request body handle shared by all attempts of one request.
//!
//! # Responsibilities
//! - Hand the body to each attempt without letting an attempt close it
//! - Rewind between attempts
//! - Close exactly once, when the coordinator is done
//!
//! # Design Decisions
//! - Buffered bodies replay freely
//! - A streaming body can be read by one attempt only; rewinding it after it
//!   was taken is a `BodyError::NotReplayable`, never a silently empty body

use axum::body::Body;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;

use crate::resilience::error::BodyError;

enum State {
    Buffered { bytes: Bytes, consumed: bool },
    Streaming(Option<Body>),
    Closed,
}

/// Request body owned by the coordinator for the lifetime of a request.
pub struct RequestBody {
    state: State,
}

impl RequestBody {
    /// A body held in memory, replayable any number of times.
    pub fn buffered(bytes: impl Into<Bytes>) -> Self {
        Self {
            state: State::Buffered {
                bytes: bytes.into(),
                consumed: false,
            },
        }
    }

    /// A single-pass body stream.
    pub fn streaming(body: Body) -> Self {
        Self {
            state: State::Streaming(Some(body)),
        }
    }

    pub fn empty() -> Self {
        Self::buffered(Bytes::new())
    }

    /// Read `body` into memory for replay, refusing anything over `limit` bytes.
    pub async fn read_limited(body: Body, limit: usize) -> Result<Self, BodyError> {
        let mut buffered = BytesMut::new();
        let mut stream = body.into_data_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if buffered.len() + chunk.len() > limit {
                return Err(BodyError::TooLarge { limit });
            }
            buffered.extend_from_slice(&chunk);
        }
        Ok(Self::buffered(buffered.freeze()))
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, State::Closed)
    }

    /// Take the remaining body as a stream for a downstream service.
    pub fn take(&mut self) -> Result<Body, BodyError> {
        match &mut self.state {
            State::Buffered { bytes, consumed } => {
                if *consumed {
                    return Ok(Body::empty());
                }
                *consumed = true;
                Ok(Body::from(bytes.clone()))
            }
            State::Streaming(body) => body.take().ok_or(BodyError::NotReplayable),
            State::Closed => Err(BodyError::Closed),
        }
    }

    /// Read the remaining body into memory.
    pub async fn collect(&mut self) -> Result<Bytes, BodyError> {
        match &mut self.state {
            State::Buffered { bytes, consumed } => {
                if *consumed {
                    return Ok(Bytes::new());
                }
                *consumed = true;
                Ok(bytes.clone())
            }
            State::Streaming(body) => {
                let body = body.take().ok_or(BodyError::NotReplayable)?;
                Ok(axum::body::to_bytes(body, usize::MAX).await?)
            }
            State::Closed => Err(BodyError::Closed),
        }
    }

    /// Reset to the start of the body for the next attempt.
    pub fn rewind(&mut self) -> Result<(), BodyError> {
        match &mut self.state {
            State::Buffered { consumed, .. } => {
                *consumed = false;
                Ok(())
            }
            State::Streaming(Some(_)) => Ok(()),
            State::Streaming(None) => Err(BodyError::NotReplayable),
            State::Closed => Err(BodyError::Closed),
        }
    }

    pub(crate) fn close(&mut self) {
        self.state = State::Closed;
    }
}

impl Default for RequestBody {
    fn default() -> Self {
        Self::empty()
    }
}

impl std::fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.state {
            State::Buffered { bytes, consumed } => f
                .debug_struct("RequestBody::Buffered")
                .field("len", &bytes.len())
                .field("consumed", consumed)
                .finish(),
            State::Streaming(body) => f
                .debug_struct("RequestBody::Streaming")
                .field("taken", &body.is_none())
                .finish(),
            State::Closed => f.write_str("RequestBody::Closed"),
        }
    }
}
