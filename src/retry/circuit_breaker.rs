//! Per-endpoint (optionally per-method) circuit breaker (spec §4.6, §5).
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Clone, Debug)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub success_threshold: u32,
    pub half_open_permit_budget: u32,
    pub max_recovery_timeout: Duration,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            success_threshold: 2,
            half_open_permit_budget: 1,
            max_recovery_timeout: Duration::from_secs(300),
        }
    }
}

struct Inner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    open_until: Option<Instant>,
    current_recovery_timeout: Duration,
    half_open_permits_issued: u32,
}

/// State transitions are atomic; the fast-path read used to decide whether to
/// even attempt acquiring the lock may be stale (spec §5: "an outdated read
/// at worst admits one extra probe").
#[derive(Clone)]
pub struct CircuitBreaker {
    settings: CircuitBreakerSettings,
    inner: Arc<Mutex<Inner>>,
}

pub enum Admission {
    Admitted,
    AdmittedAsProbe,
    Rejected { retry_after: Duration },
}

impl CircuitBreaker {
    pub fn new(settings: CircuitBreakerSettings) -> Self {
        let recovery = settings.recovery_timeout;
        Self {
            settings,
            inner: Arc::new(Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                open_until: None,
                current_recovery_timeout: recovery,
                half_open_permits_issued: 0,
            })),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Admits or rejects a request, transitioning `open` -> `half-open` when
    /// the recovery timeout has elapsed.
    pub fn try_admit(&self) -> Admission {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Admission::Admitted,
            CircuitState::Open => {
                let open_until = inner.open_until.unwrap_or(now);
                if now >= open_until {
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_permits_issued = 1;
                    inner.success_count = 0;
                    Admission::AdmittedAsProbe
                } else {
                    Admission::Rejected {
                        retry_after: open_until - now,
                    }
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_permits_issued < self.settings.half_open_permit_budget {
                    inner.half_open_permits_issued += 1;
                    Admission::AdmittedAsProbe
                } else {
                    let open_until = inner.open_until.unwrap_or(now);
                    Admission::Rejected {
                        retry_after: open_until.saturating_duration_since(now),
                    }
                }
            }
        }
    }

    pub fn on_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.settings.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.current_recovery_timeout = self.settings.recovery_timeout;
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn on_failure(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.settings.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.open_until = Some(now + inner.current_recovery_timeout);
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                let doubled = inner.current_recovery_timeout * 2;
                inner.current_recovery_timeout = doubled.min(self.settings.max_recovery_timeout);
                inner.open_until = Some(now + inner.current_recovery_timeout);
                inner.success_count = 0;
            }
            CircuitState::Open => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let cb = CircuitBreaker::new(CircuitBreakerSettings {
            failure_threshold: 2,
            ..Default::default()
        });
        cb.on_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.on_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(matches!(cb.try_admit(), Admission::Rejected { .. }));
    }

    #[test]
    fn half_open_probe_then_close_on_success_streak() {
        let cb = CircuitBreaker::new(CircuitBreakerSettings {
            failure_threshold: 1,
            recovery_timeout: Duration::from_millis(0),
            success_threshold: 2,
            half_open_permit_budget: 1,
            ..Default::default()
        });
        cb.on_failure();
        assert!(matches!(cb.try_admit(), Admission::AdmittedAsProbe));
        cb.on_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.on_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_failure_reopens_and_doubles_timeout() {
        let cb = CircuitBreaker::new(CircuitBreakerSettings {
            failure_threshold: 1,
            recovery_timeout: Duration::from_millis(0),
            success_threshold: 2,
            half_open_permit_budget: 1,
            max_recovery_timeout: Duration::from_secs(100),
            ..Default::default()
        });
        cb.on_failure();
        assert!(matches!(cb.try_admit(), Admission::AdmittedAsProbe));
        cb.on_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.inner.lock().current_recovery_timeout > Duration::from_millis(0));
    }

    #[test]
    fn half_open_permit_budget_bounds_concurrent_probes() {
        let cb = CircuitBreaker::new(CircuitBreakerSettings {
            failure_threshold: 1,
            recovery_timeout: Duration::from_millis(0),
            half_open_permit_budget: 1,
            ..Default::default()
        });
        cb.on_failure();
        assert!(matches!(cb.try_admit(), Admission::AdmittedAsProbe));
        assert!(matches!(cb.try_admit(), Admission::Rejected { .. }));
    }
}
