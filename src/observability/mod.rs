//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Retry middleware and proxy produce:
//!     → logging.rs (structured log events)
//!     → metrics.rs (attempt counters, attempts-per-request histogram)
//!
//! Consumers:
//!     → Log aggregation (stdout, pretty or JSON)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Structured logging (JSON) for machine parsing
//! - Request ID flows through all attempts of a request
//! - Metrics are cheap (atomic increments)

pub mod logging;
pub mod metrics;
