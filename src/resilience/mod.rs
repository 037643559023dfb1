//! Resilience subsystem: status-driven request retries.
//!
//! # Data Flow
//! ```text
//! Request into the retry layer:
//!     → layer.rs (buffer body, adapt the inner service into a Handler)
//!     → coordinator.rs (attempt loop: 1..=max_attempts)
//!         → intercept.rs (one InterceptingSink per attempt)
//!         → downstream handler writes status/headers/body
//!         → retryable status on a non-final attempt: output swallowed, loop
//!         → anything else: commit, output released to the real sink
//!     → sink.rs (ResponseRecorder becomes the client response)
//! ```
//!
//! # Design Decisions
//! - A client never sees a partial or retried-away response
//! - Retries are immediate: no backoff, no delay
//! - Only the downstream status triggers a retry; handler errors propagate
//! - The last attempt always commits, so the loop always terminates

pub mod body;
pub mod coordinator;
pub mod error;
pub mod intercept;
pub mod layer;
pub mod observer;
pub mod retries;
pub mod sink;

pub use body::RequestBody;
pub use coordinator::{Handler, RetryCoordinator};
pub use error::{BodyError, PolicyError, ServeError, SinkError};
pub use intercept::{InterceptingSink, RETRY_ATTEMPTS_HEADER};
pub use layer::{RetryLayer, RetryService, ServiceHandler, ServiceHandlerError};
pub use observer::{NoopObserver, RetryObserver, TracingObserver};
pub use retries::RetryPolicy;
pub use sink::{Capabilities, Capability, ResponseRecorder, ResponseSink};
