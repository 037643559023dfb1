//! Tower layer mounting the retry coordinator in front of a service.
//!
//! # Responsibilities
//! - Buffer the inbound body so every attempt sees the same bytes
//! - Adapt the inner service into a [`Handler`]
//! - Turn the recorded response into the client response
//!
//! # Design Decisions
//! - Single-attempt policies bypass everything, including body buffering
//! - Inner service errors are returned unchanged
//! - A retryable response's body is never read from the inner service
//! - The committed response body streams to the client, it is not buffered
//! - Attempts never see the client's upgrade handle; a committed
//!   `101 Switching Protocols` takes the connection through `hijack`

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    response::{IntoResponse, Response},
};
use futures_util::{future::BoxFuture, StreamExt};
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tower::{Layer, Service, ServiceExt};

use crate::resilience::body::RequestBody;
use crate::resilience::coordinator::{Handler, RetryCoordinator};
use crate::resilience::error::{BodyError, ServeError, SinkError};
use crate::resilience::observer::{RetryObserver, TracingObserver};
use crate::resilience::retries::RetryPolicy;
use crate::resilience::sink::{Capability, ResponseRecorder, ResponseSink};

/// Default cap on the request body held for replay.
pub const DEFAULT_MAX_BUFFERED_BODY: usize = 1024 * 1024;

/// Layer that retries the inner service on retryable response statuses.
#[derive(Clone)]
pub struct RetryLayer {
    policy: Arc<RetryPolicy>,
    observer: Arc<dyn RetryObserver>,
    max_body_bytes: usize,
}

impl RetryLayer {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy: Arc::new(policy),
            observer: Arc::new(TracingObserver::default()),
            max_body_bytes: DEFAULT_MAX_BUFFERED_BODY,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn RetryObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_max_body_bytes(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes;
        self
    }
}

impl<S> Layer<S> for RetryLayer {
    type Service = RetryService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RetryService {
            inner,
            policy: self.policy.clone(),
            observer: self.observer.clone(),
            max_body_bytes: self.max_body_bytes,
        }
    }
}

/// Service produced by [`RetryLayer`].
#[derive(Clone)]
pub struct RetryService<S> {
    inner: S,
    policy: Arc<RetryPolicy>,
    observer: Arc<dyn RetryObserver>,
    max_body_bytes: usize,
}

impl<S> Service<Request<Body>> for RetryService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + Sync + 'static,
    S::Future: Send,
    S::Error: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        // Consume the instance that was poll_ready'd, keep a fresh clone.
        let clone = self.inner.clone();
        let inner = std::mem::replace(&mut self.inner, clone);
        let policy = self.policy.clone();
        let observer = self.observer.clone();
        let max_body_bytes = self.max_body_bytes;

        Box::pin(async move {
            if policy.max_attempts() == 1 {
                return inner.oneshot(request).await;
            }

            let (mut parts, body) = request.into_parts();
            if exceeds_limit(&parts.headers, max_body_bytes) {
                return Ok(too_large(max_body_bytes));
            }
            let body = match RequestBody::read_limited(body, max_body_bytes).await {
                Ok(body) => body,
                Err(BodyError::TooLarge { limit }) => return Ok(too_large(limit)),
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to buffer request body");
                    return Ok((StatusCode::BAD_REQUEST, "Unreadable request body").into_response());
                }
            };

            let mut recorder = ResponseRecorder::new();
            if let Some(upgrade) = parts.extensions.remove::<OnUpgrade>() {
                recorder = recorder.with_upgrade(upgrade);
            }

            let request = Request::from_parts(parts, body);
            let coordinator =
                RetryCoordinator::new(policy, ServiceHandler::new(inner)).with_observer(observer);

            match coordinator.serve(request, &mut recorder).await {
                Ok(()) => Ok(recorder.into_response()),
                Err(ServeError::Downstream(ServiceHandlerError::Service(e))) => Err(e),
                Err(e) => {
                    tracing::error!(error = %e, "Retry middleware failed to deliver response");
                    Ok((StatusCode::BAD_GATEWAY, "Upstream response could not be delivered").into_response())
                }
            }
        })
    }
}

fn too_large(limit: usize) -> Response {
    tracing::warn!(limit, "Request body too large to buffer for retries");
    (StatusCode::PAYLOAD_TOO_LARGE, "Request body too large").into_response()
}

fn exceeds_limit(headers: &axum::http::HeaderMap, limit: usize) -> bool {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .is_some_and(|len| len > limit as u64)
}

/// Failure while adapting a tower service into a [`Handler`].
#[derive(Debug, Error)]
pub enum ServiceHandlerError<E> {
    #[error("inner service failed")]
    Service(E),

    #[error(transparent)]
    Body(#[from] BodyError),

    #[error("failed to read response body: {0}")]
    ResponseBody(axum::Error),

    #[error("failed to write response body: {0}")]
    Sink(std::io::Error),

    #[error("failed to take over the client connection: {0}")]
    Hijack(#[from] SinkError),
}

/// Runs a tower service as a retry [`Handler`].
///
/// Each attempt gets a fresh request carrying the original method, URI,
/// version, headers and extensions plus the rewound body. The client's
/// upgrade handle is withheld from attempts.
#[derive(Clone)]
pub struct ServiceHandler<S> {
    inner: S,
}

impl<S> ServiceHandler<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

impl<S> Handler for ServiceHandler<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + Sync + 'static,
    S::Future: Send,
    S::Error: Send + 'static,
{
    type Error = ServiceHandlerError<S::Error>;

    fn serve<'a>(
        &'a self,
        request: &'a mut Request<RequestBody>,
        sink: &'a mut dyn ResponseSink,
    ) -> BoxFuture<'a, Result<(), Self::Error>> {
        Box::pin(async move {
            let body = request.body_mut().take()?;
            let mut attempt = Request::new(body);
            *attempt.method_mut() = request.method().clone();
            *attempt.uri_mut() = request.uri().clone();
            *attempt.version_mut() = request.version();
            *attempt.headers_mut() = request.headers().clone();
            *attempt.extensions_mut() = request.extensions().clone();
            attempt.extensions_mut().remove::<OnUpgrade>();

            let response = self
                .inner
                .clone()
                .oneshot(attempt)
                .await
                .map_err(ServiceHandlerError::Service)?;
            let (mut parts, body) = response.into_parts();

            let mut current = None;
            for (name, value) in parts.headers {
                match name {
                    Some(name) => {
                        sink.write_header(name.clone(), value);
                        current = Some(name);
                    }
                    None => {
                        if let Some(name) = &current {
                            sink.append_header(name.clone(), value);
                        }
                    }
                }
            }
            sink.set_status(parts.status);

            if sink.is_discarding() {
                return Ok(());
            }

            if parts.status == StatusCode::SWITCHING_PROTOCOLS
                && sink.capabilities().supports(Capability::Hijack)
            {
                if let Some(upstream) = parts.extensions.remove::<OnUpgrade>() {
                    let client = sink.hijack()?;
                    tokio::spawn(bridge_upgraded(client, upstream));
                }
            }

            let body = match sink.write_stream(body) {
                Ok(()) => return Ok(()),
                Err(body) => body,
            };
            let mut stream = body.into_data_stream();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(ServiceHandlerError::ResponseBody)?;
                sink.write_body(&chunk).map_err(ServiceHandlerError::Sink)?;
            }
            Ok(())
        })
    }
}

/// Copy bytes both ways between the upgraded client and upstream connections.
async fn bridge_upgraded(client: OnUpgrade, upstream: OnUpgrade) {
    let (client, upstream) = match tokio::try_join!(client, upstream) {
        Ok(pair) => pair,
        Err(e) => {
            tracing::warn!(error = %e, "Connection upgrade failed");
            return;
        }
    };

    let mut client = TokioIo::new(client);
    let mut upstream = TokioIo::new(upstream);
    match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
        Ok((sent, received)) => tracing::debug!(sent, received, "Upgraded connection closed"),
        Err(e) => tracing::debug!(error = %e, "Upgraded connection ended with error"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use bytes::Bytes;
    use tower::service_fn;

    use crate::resilience::intercept::RETRY_ATTEMPTS_HEADER;
    use crate::resilience::observer::NoopObserver;

    fn scripted(
        statuses: &'static [u16],
        calls: Arc<AtomicU32>,
        seen: Arc<Mutex<Vec<Bytes>>>,
    ) -> impl Service<
        Request<Body>,
        Response = Response,
        Error = Infallible,
        Future = impl Future<Output = Result<Response, Infallible>> + Send,
    > + Clone
           + Send
           + Sync
           + 'static {
        service_fn(move |request: Request<Body>| {
            let calls = calls.clone();
            let seen = seen.clone();
            async move {
                let call = calls.fetch_add(1, Ordering::SeqCst) as usize;
                let body = axum::body::to_bytes(request.into_body(), usize::MAX)
                    .await
                    .unwrap();
                seen.lock().unwrap().push(body);

                let status = statuses[call.min(statuses.len() - 1)];
                let response = Response::builder()
                    .status(status)
                    .header("x-call", call.to_string())
                    .body(Body::from(format!("call {call}")))
                    .unwrap();
                Ok::<_, Infallible>(response)
            }
        })
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_layer_retries_service() {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let service = RetryLayer::new(RetryPolicy::new(3, [503]).unwrap())
            .layer(scripted(&[503, 503, 200], calls.clone(), seen.clone()));

        let request = Request::post("/submit").body(Body::from("payload")).unwrap();
        let response = service.oneshot(request).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[RETRY_ATTEMPTS_HEADER], "2");
        assert_eq!(response.headers()["x-call"], "2");
        assert_eq!(body_text(response).await, "call 2");

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert!(seen.iter().all(|b| b == "payload"));
    }

    #[tokio::test]
    async fn test_layer_single_attempt_bypass() {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let service = RetryLayer::new(RetryPolicy::new(1, [503]).unwrap())
            .layer(scripted(&[503], calls.clone(), seen));

        let response = service.oneshot(Request::new(Body::empty())).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(response.headers().get(RETRY_ATTEMPTS_HEADER).is_none());
        assert_eq!(body_text(response).await, "call 0");
    }

    #[tokio::test]
    async fn test_layer_exhausts_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let service = RetryLayer::new(RetryPolicy::new(2, [502, 503]).unwrap())
            .with_observer(Arc::new(NoopObserver))
            .layer(scripted(&[502, 503], calls.clone(), seen));

        let response = service.oneshot(Request::new(Body::empty())).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[RETRY_ATTEMPTS_HEADER], "1");
        assert_eq!(body_text(response).await, "call 1");
    }

    #[tokio::test]
    async fn test_layer_rejects_oversized_body() {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let service = RetryLayer::new(RetryPolicy::new(2, [503]).unwrap())
            .with_max_body_bytes(4)
            .layer(scripted(&[200], calls.clone(), seen));

        let request = Request::post("/")
            .header(header::CONTENT_LENGTH, "7")
            .body(Body::from("payload"))
            .unwrap();
        let response = service.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_layer_rejects_oversized_chunked_body() {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let service = RetryLayer::new(RetryPolicy::new(2, [503]).unwrap())
            .with_max_body_bytes(4)
            .layer(scripted(&[200], calls.clone(), seen));

        let chunks = futures_util::stream::iter(vec![
            Ok::<_, std::io::Error>(Bytes::from_static(b"pay")),
            Ok(Bytes::from_static(b"load")),
        ]);
        let request = Request::post("/").body(Body::from_stream(chunks)).unwrap();
        let response = service.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_committed_body_streams_without_waiting_for_end() {
        let inner = service_fn(|_request: Request<Body>| async {
            let chunks = futures_util::stream::iter(vec![Ok::<_, std::io::Error>(
                Bytes::from_static(b"first"),
            )])
            .chain(futures_util::stream::pending());
            Ok::<_, Infallible>(Response::new(Body::from_stream(chunks)))
        });
        let service = RetryLayer::new(RetryPolicy::new(2, [503]).unwrap()).layer(inner);

        let response = tokio::time::timeout(
            Duration::from_secs(5),
            service.oneshot(Request::new(Body::empty())),
        )
        .await
        .expect("response held back until the upstream body ended")
        .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[RETRY_ATTEMPTS_HEADER], "0");

        let mut stream = response.into_body().into_data_stream();
        let first = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("first chunk not delivered")
            .unwrap()
            .unwrap();
        assert_eq!(&first[..], b"first");
    }

    #[tokio::test]
    async fn test_inner_error_propagates() {
        let calls = Arc::new(AtomicU32::new(0));
        let counted = calls.clone();
        let inner = service_fn(move |_request: Request<Body>| {
            counted.fetch_add(1, Ordering::SeqCst);
            async { Err::<Response, &'static str>("connection reset") }
        });
        let service = RetryLayer::new(RetryPolicy::new(3, [503]).unwrap()).layer(inner);

        let err = service.oneshot(Request::new(Body::empty())).await.unwrap_err();
        assert_eq!(err, "connection reset");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
