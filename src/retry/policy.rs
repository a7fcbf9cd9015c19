//! Retry policy: strategy + classifier + deadlines (spec §4.6).
use std::time::Duration;

use crate::error::Error;
use crate::retry::circuit_breaker::CircuitBreakerSettings;
use crate::retry::strategy::RetryStrategyKind;

#[derive(Clone, Debug)]
pub struct RetrySettings {
    pub strategy: RetryStrategyKind,
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: f64,
    pub total_deadline: Option<Duration>,
    pub circuit: CircuitBreakerSettings,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            strategy: RetryStrategyKind::Exponential,
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            jitter: 0.25,
            total_deadline: Some(Duration::from_secs(60)),
            circuit: CircuitBreakerSettings::default(),
        }
    }
}

/// Default classifier (spec §4.6): connection/timeout/internal and
/// server-classified conflicts are retryable; validation/access/auth/
/// not-found/protocol/method-not-found are not.
pub fn should_retry(error: &Error) -> bool {
    match error {
        Error::ConnectionError { .. } | Error::TimeoutError { .. } => true,
        Error::InternalError { message, .. } => {
            let lower = message.to_lowercase();
            lower.contains("serializ") || lower.contains("conflict") || lower.contains("deadlock")
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorContext;

    #[test]
    fn connection_and_timeout_are_retryable() {
        let ctx = ErrorContext::default();
        assert!(should_retry(&Error::ConnectionError {
            message: "x".into(),
            context: ctx.clone()
        }));
        assert!(should_retry(&Error::TimeoutError {
            message: "x".into(),
            context: ctx
        }));
    }

    #[test]
    fn validation_access_auth_are_not_retryable() {
        let ctx = ErrorContext::default();
        assert!(!should_retry(&Error::ValidationError {
            message: "x".into(),
            traceback: None,
            context: ctx.clone()
        }));
        assert!(!should_retry(&Error::AccessError {
            message: "x".into(),
            traceback: None,
            context: ctx.clone()
        }));
        assert!(!should_retry(&Error::AuthenticationError { message: "x".into() }));
        assert!(!should_retry(&Error::MethodNotFoundError {
            message: "x".into(),
            context: ctx.clone()
        }));
        assert!(!should_retry(&Error::NotFoundError { context: ctx }));
    }

    #[test]
    fn internal_error_retryable_only_when_conflict_like() {
        let ctx = ErrorContext::default();
        assert!(should_retry(&Error::InternalError {
            message: "serialization failure".into(),
            traceback: None,
            context: ctx.clone()
        }));
        assert!(!should_retry(&Error::InternalError {
            message: "unhandled exception".into(),
            traceback: None,
            context: ctx
        }));
    }
}
