//! Retry coordinator: the attempt loop for one request.
//!
//! # State Machine
//! ```text
//! ATTEMPTING(1) → [handler returns] → DECIDE → ATTEMPTING(i+1) | SETTLED
//! ```
//! The last attempt is never retry-eligible, so DECIDE always reaches SETTLED
//! within `max_attempts` iterations. An attempt that wrote nothing is retried;
//! if the last attempt writes nothing the real sink is left as it was.

use std::sync::Arc;

use axum::http::Request;
use futures_util::future::BoxFuture;

use crate::resilience::body::RequestBody;
use crate::resilience::error::ServeError;
use crate::resilience::intercept::InterceptingSink;
use crate::resilience::observer::{RetryObserver, TracingObserver};
use crate::resilience::retries::RetryPolicy;
use crate::resilience::sink::ResponseSink;

/// Downstream request handler invoked once per attempt.
///
/// Implementations render their response into `sink`. The request body must be
/// read through [`RequestBody`] so it can be rewound for the next attempt.
pub trait Handler: Send + Sync {
    type Error: Send;

    fn serve<'a>(
        &'a self,
        request: &'a mut Request<RequestBody>,
        sink: &'a mut dyn ResponseSink,
    ) -> BoxFuture<'a, Result<(), Self::Error>>;
}

/// Runs a handler until an attempt commits or the budget is spent.
pub struct RetryCoordinator<H> {
    policy: Arc<RetryPolicy>,
    handler: H,
    observer: Arc<dyn RetryObserver>,
}

impl<H: Handler> RetryCoordinator<H> {
    pub fn new(policy: Arc<RetryPolicy>, handler: H) -> Self {
        Self {
            policy,
            handler,
            observer: Arc::new(TracingObserver::default()),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn RetryObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Serve one request, delivering exactly one attempt's output to `real`.
    ///
    /// The request body is closed before returning, whatever the outcome.
    pub async fn serve(
        &self,
        mut request: Request<RequestBody>,
        real: &mut dyn ResponseSink,
    ) -> Result<(), ServeError<H::Error>> {
        let result = if self.policy.max_attempts() == 1 {
            self.observer.attempt_started(1, 1);
            let result = self
                .handler
                .serve(&mut request, real)
                .await
                .map_err(ServeError::Downstream);
            if result.is_ok() {
                self.observer.settled(1, None);
            }
            result
        } else {
            self.run_attempts(&mut request, real).await
        };

        request.body_mut().close();
        result
    }

    async fn run_attempts(
        &self,
        request: &mut Request<RequestBody>,
        real: &mut dyn ResponseSink,
    ) -> Result<(), ServeError<H::Error>> {
        let max_attempts = self.policy.max_attempts();

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                request
                    .body_mut()
                    .rewind()
                    .map_err(|source| ServeError::Replay { attempt, source })?;
            }

            self.observer.attempt_started(attempt, max_attempts);

            let mut sink = InterceptingSink::new(&mut *real, &self.policy, attempt);
            self.handler
                .serve(request, &mut sink)
                .await
                .map_err(ServeError::Downstream)?;

            if !sink.should_retry() || attempt == max_attempts {
                self.observer.settled(attempt, sink.status());
                return Ok(());
            }
            self.observer.attempt_discarded(attempt, sink.status());
        }

        Ok(())
    }
}
