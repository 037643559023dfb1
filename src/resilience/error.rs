//! Error types for the retry subsystem.

use thiserror::Error;

use crate::resilience::sink::Capability;

/// Invalid retry policy. Raised once at setup, never while serving.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    #[error("incorrect value for attempts ({0}), at least one attempt is required")]
    NoAttempts(u32),

    #[error("no retryable status codes configured, define at least one")]
    NoStatusCodes,

    #[error("{0} is not a valid HTTP status code")]
    InvalidStatusCode(u16),
}

/// A response sink capability could not be used.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("response sink does not support {0}")]
    Unsupported(Capability),

    #[error("cannot {0} a response that may still be retried")]
    Uncommitted(Capability),

    #[error("connection was already taken over")]
    AlreadyHijacked,
}

/// The request body could not be handed to another attempt.
#[derive(Debug, Error)]
pub enum BodyError {
    #[error("request body was already consumed and cannot be replayed")]
    NotReplayable,

    #[error("request body is closed")]
    Closed,

    #[error("request body exceeds the {limit} byte replay buffer")]
    TooLarge { limit: usize },

    #[error("failed to read request body: {0}")]
    Read(#[from] axum::Error),
}

/// Failure of a whole request served by the coordinator.
#[derive(Debug, Error)]
pub enum ServeError<E> {
    /// The downstream handler failed. Never retried.
    #[error("downstream handler failed: {0}")]
    Downstream(E),

    #[error("request body cannot be replayed for attempt {attempt}: {source}")]
    Replay {
        attempt: u32,
        #[source]
        source: BodyError,
    },
}
