//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create Axum Router with the forwarding handler
//! - Wire up middleware (tracing, timeout, request ID, retries)
//! - Bind server to listener
//! - Forward requests to the upstream

use axum::{
    body::Body,
    extract::State,
    http::{
        uri::{Authority, PathAndQuery, Scheme},
        Request, StatusCode, Uri,
    },
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::config::ProxyConfig;
use crate::http::request::{propagate_request_id_layer, request_id, set_request_id_layer};
use crate::resilience::{PolicyError, RetryLayer, RetryPolicy, TracingObserver};

/// Error building the server from configuration.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid retry policy: {0}")]
    Policy(#[from] PolicyError),

    #[error("invalid upstream address '{0}'")]
    Upstream(String),
}

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub client: Client<HttpConnector, Body>,
    pub upstream: Authority,
}

/// HTTP server for the retrying proxy.
pub struct HttpServer {
    router: Router,
}

impl HttpServer {
    /// Create a new HTTP server with the given configuration.
    ///
    /// Fails if the retry policy or upstream address is invalid; nothing is
    /// checked again at request time.
    pub fn new(config: ProxyConfig) -> Result<Self, ServerError> {
        let policy = RetryPolicy::try_from(&config.retry)?;
        let upstream: Authority = config
            .upstream
            .address
            .parse()
            .map_err(|_| ServerError::Upstream(config.upstream.address.clone()))?;

        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(Duration::from_secs(config.timeouts.connect_secs)));
        let client = Client::builder(TokioExecutor::new()).build(connector);

        tracing::info!(
            upstream = %upstream,
            attempts = policy.max_attempts(),
            status_codes = ?policy.status_codes(),
            "Retry policy configured"
        );

        let state = AppState { client, upstream };
        let router = Self::build_router(&config, policy, state);
        Ok(Self { router })
    }

    /// Build the Axum router with all middleware layers.
    #[allow(deprecated)]
    fn build_router(config: &ProxyConfig, policy: RetryPolicy, state: AppState) -> Router {
        let retry = RetryLayer::new(policy)
            .with_observer(Arc::new(TracingObserver::new(config.retry.name.clone())))
            .with_max_body_bytes(config.retry.max_buffered_body_bytes);

        Router::new()
            .route("/{*path}", any(forward_handler))
            .route("/", any(forward_handler))
            .with_state(state)
            .layer(retry)
            .layer(TimeoutLayer::new(Duration::from_secs(config.timeouts.request_secs)))
            .layer(propagate_request_id_layer())
            .layer(set_request_id_layer())
            .layer(TraceLayer::new_for_http())
    }

    /// Run the server until `shutdown` fires.
    pub async fn run(
        self,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        axum::serve(listener, self.router.into_make_service())
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                tracing::info!("Shutdown signal received");
            })
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

/// Forward one attempt to the upstream.
async fn forward_handler(State(state): State<AppState>, request: Request<Body>) -> Response {
    let start_time = Instant::now();
    let request_id = request_id(&request);
    let (mut parts, body) = request.into_parts();

    tracing::debug!(
        request_id = %request_id,
        method = %parts.method,
        path = %parts.uri.path(),
        "Forwarding request"
    );

    // URI rewrite
    let mut uri_parts = parts.uri.clone().into_parts();
    uri_parts.scheme = Some(Scheme::HTTP);
    uri_parts.authority = Some(state.upstream.clone());
    if uri_parts.path_and_query.is_none() {
        uri_parts.path_and_query = Some(PathAndQuery::from_static("/"));
    }
    parts.uri = match Uri::from_parts(uri_parts) {
        Ok(uri) => uri,
        Err(e) => {
            tracing::warn!(request_id = %request_id, error = %e, "Failed to build upstream URI");
            return (StatusCode::BAD_REQUEST, "Invalid request URI").into_response();
        }
    };

    match state.client.request(Request::from_parts(parts, body)).await {
        Ok(response) => {
            tracing::debug!(
                request_id = %request_id,
                status = %response.status(),
                elapsed_ms = start_time.elapsed().as_millis() as u64,
                "Upstream responded"
            );
            let (parts, body) = response.into_parts();
            Response::from_parts(parts, Body::new(body))
        }
        Err(e) => {
            tracing::error!(request_id = %request_id, error = %e, "Upstream error");
            (StatusCode::BAD_GATEWAY, "Upstream request failed").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_policy_refuses_to_build() {
        let mut config = ProxyConfig::default();
        config.retry.status_codes.clear();
        assert!(matches!(
            HttpServer::new(config),
            Err(ServerError::Policy(PolicyError::NoStatusCodes))
        ));
    }

    #[test]
    fn test_invalid_upstream_refuses_to_build() {
        let mut config = ProxyConfig::default();
        config.upstream.address = "bad host".into();
        assert!(matches!(HttpServer::new(config), Err(ServerError::Upstream(_))));
    }
}
