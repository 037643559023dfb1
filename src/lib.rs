//! Status-driven retry middleware and the reverse proxy built on it.

pub mod config;
pub mod http;
pub mod lifecycle;
pub mod observability;
pub mod resilience;

pub use config::ProxyConfig;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
pub use resilience::{RetryCoordinator, RetryLayer, RetryPolicy};
