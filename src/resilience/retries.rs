//! Retry policy.
//!
//! # Responsibilities
//! - Hold the attempt budget and the set of retryable status codes
//! - Validate both at construction time
//!
//! # Design Decisions
//! - Immutable once built; shared through `Arc` by every request
//! - An empty code set is rejected rather than degrading to pass-through

use std::collections::HashSet;

use axum::http::StatusCode;

use crate::config::RetryConfig;
use crate::resilience::error::PolicyError;

/// Validated retry policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    retryable: HashSet<StatusCode>,
}

impl RetryPolicy {
    /// Build a policy from an attempt budget and raw status codes.
    pub fn new(
        max_attempts: u32,
        status_codes: impl IntoIterator<Item = u16>,
    ) -> Result<Self, PolicyError> {
        if max_attempts == 0 {
            return Err(PolicyError::NoAttempts(max_attempts));
        }

        let retryable = status_codes
            .into_iter()
            .map(|code| StatusCode::from_u16(code).map_err(|_| PolicyError::InvalidStatusCode(code)))
            .collect::<Result<HashSet<_>, _>>()?;

        if retryable.is_empty() {
            return Err(PolicyError::NoStatusCodes);
        }

        Ok(Self {
            max_attempts,
            retryable,
        })
    }

    /// Total number of downstream invocations allowed per request.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Returns true if `status` should trigger another attempt.
    pub fn is_retryable(&self, status: StatusCode) -> bool {
        self.retryable.contains(&status)
    }

    /// Retryable codes in ascending order.
    pub fn status_codes(&self) -> Vec<u16> {
        let mut codes: Vec<u16> = self.retryable.iter().map(StatusCode::as_u16).collect();
        codes.sort_unstable();
        codes
    }
}

impl TryFrom<&RetryConfig> for RetryPolicy {
    type Error = PolicyError;

    fn try_from(config: &RetryConfig) -> Result<Self, Self::Error> {
        Self::new(config.attempts, config.status_codes.iter().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_validation() {
        assert_eq!(RetryPolicy::new(0, [503]), Err(PolicyError::NoAttempts(0)));
        assert_eq!(RetryPolicy::new(3, []), Err(PolicyError::NoStatusCodes));
        assert_eq!(
            RetryPolicy::new(3, [503, 42]),
            Err(PolicyError::InvalidStatusCode(42))
        );
    }

    #[test]
    fn test_retryable_lookup() {
        let policy = RetryPolicy::new(3, [503, 502, 503]).unwrap();
        assert_eq!(policy.max_attempts(), 3);
        assert!(policy.is_retryable(StatusCode::SERVICE_UNAVAILABLE));
        assert!(policy.is_retryable(StatusCode::BAD_GATEWAY));
        assert!(!policy.is_retryable(StatusCode::OK));
        assert_eq!(policy.status_codes(), vec![502, 503]);
    }

    #[test]
    fn test_from_default_config() {
        let policy = RetryPolicy::try_from(&RetryConfig::default()).unwrap();
        assert_eq!(policy.max_attempts(), 2);
        assert_eq!(policy.status_codes(), vec![503]);
    }
}
