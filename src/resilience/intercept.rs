//! Per-attempt intercepting response sink.
//!
//! # States
//! - Open: nothing observed yet, headers buffered
//! - Swallowed: retryable status seen on a non-final attempt, output discarded
//! - Committed: output released to the real sink
//!
//! # State Transitions
//! ```text
//! Open → Swallowed: retryable status and attempt < max_attempts
//! Open → Committed: any other status, or a body write
//! ```
//! Committed never reverts. Swallowed never commits: the attempt is retried.
//! A handler that returns while the sink is still Open wrote nothing; that
//! attempt is retried too, and on the final attempt the real sink is left
//! untouched.

use std::io;

use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use hyper::upgrade::OnUpgrade;

use crate::resilience::error::SinkError;
use crate::resilience::retries::RetryPolicy;
use crate::resilience::sink::{Capabilities, Capability, ResponseSink};

/// Number of attempts discarded before the one that was delivered.
pub const RETRY_ATTEMPTS_HEADER: HeaderName = HeaderName::from_static("x-retry-attempts");

/// Sink handed to the downstream handler for one attempt.
///
/// Holds the attempt's status and headers back from the real sink until the
/// attempt is known to be the delivered one.
pub struct InterceptingSink<'a> {
    real: &'a mut dyn ResponseSink,
    policy: &'a RetryPolicy,
    attempt: u32,
    retry_eligible: bool,
    status: Option<StatusCode>,
    buffered_headers: HeaderMap,
    committed: bool,
    capabilities: Capabilities,
    discarded_bytes: usize,
}

impl<'a> InterceptingSink<'a> {
    /// Create the sink for `attempt` (1-based).
    pub fn new(real: &'a mut dyn ResponseSink, policy: &'a RetryPolicy, attempt: u32) -> Self {
        let capabilities = real.capabilities();
        Self {
            real,
            policy,
            attempt,
            retry_eligible: attempt < policy.max_attempts(),
            status: None,
            buffered_headers: HeaderMap::new(),
            committed: false,
            capabilities,
            discarded_bytes: 0,
        }
    }

    /// First status the handler wrote, if any.
    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    pub fn is_retry_eligible(&self) -> bool {
        self.retry_eligible
    }

    /// Body bytes swallowed because the attempt was still retryable.
    pub fn discarded_bytes(&self) -> usize {
        self.discarded_bytes
    }

    /// Whether the coordinator should discard this attempt and try again.
    pub fn should_retry(&self) -> bool {
        !self.committed
    }

    fn observe_status(&mut self, status: StatusCode, forward: bool) {
        if self.status.is_some() {
            return;
        }
        self.status = Some(status);

        if self.retry_eligible && self.policy.is_retryable(status) {
            return;
        }

        self.retry_eligible = false;
        self.commit(forward.then_some(status));
    }

    fn commit(&mut self, status: Option<StatusCode>) {
        self.real
            .write_header(RETRY_ATTEMPTS_HEADER, HeaderValue::from(self.attempt - 1));

        // Buffered values replace whatever the real sink holds for the same name.
        let mut current: Option<HeaderName> = None;
        for (name, value) in std::mem::take(&mut self.buffered_headers) {
            match name {
                Some(name) => {
                    self.real.write_header(name.clone(), value);
                    current = Some(name);
                }
                None => {
                    if let Some(name) = &current {
                        self.real.append_header(name.clone(), value);
                    }
                }
            }
        }

        if let Some(status) = status {
            self.real.set_status(status);
        }
        self.committed = true;
    }
}

impl ResponseSink for InterceptingSink<'_> {
    fn set_status(&mut self, status: StatusCode) {
        self.observe_status(status, true);
    }

    fn write_header(&mut self, name: HeaderName, value: HeaderValue) {
        if self.committed {
            self.real.write_header(name, value);
        } else {
            self.buffered_headers.insert(name, value);
        }
    }

    fn append_header(&mut self, name: HeaderName, value: HeaderValue) {
        if self.committed {
            self.real.append_header(name, value);
        } else {
            self.buffered_headers.append(name, value);
        }
    }

    fn write_body(&mut self, chunk: &[u8]) -> io::Result<usize> {
        if self.status.is_none() {
            self.observe_status(StatusCode::OK, false);
        }

        if self.committed {
            self.real.write_body(chunk)
        } else {
            self.discarded_bytes += chunk.len();
            Ok(chunk.len())
        }
    }

    fn write_stream(&mut self, body: Body) -> Result<(), Body> {
        if self.committed {
            self.real.write_stream(body)
        } else {
            Err(body)
        }
    }

    fn is_discarding(&self) -> bool {
        self.status.is_some() && !self.committed
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        if !self.capabilities.supports(Capability::Flush) {
            return Err(SinkError::Unsupported(Capability::Flush));
        }
        if self.committed {
            self.real.flush()
        } else {
            Ok(())
        }
    }

    fn hijack(&mut self) -> Result<OnUpgrade, SinkError> {
        if !self.capabilities.supports(Capability::Hijack) {
            return Err(SinkError::Unsupported(Capability::Hijack));
        }
        if !self.committed {
            return Err(SinkError::Uncommitted(Capability::Hijack));
        }
        self.real.hijack()
    }
}
