//! Retry manager (spec §4.6, component E): every outbound RPC from the
//! cache, query, batch, and transaction layers passes through here.
pub mod circuit_breaker;
pub mod metrics;
pub mod policy;
pub mod strategy;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerSettings, CircuitState};
pub use metrics::{Metrics, MetricsSink, RetryEvent};
pub use policy::{should_retry, RetrySettings};
pub use strategy::RetryStrategyKind;

use crate::error::Error;

/// Bound to a session; owns one circuit breaker per endpoint by default, or
/// one per method key when `per_method` is used.
#[derive(Clone)]
pub struct RetryManager {
    settings: RetrySettings,
    metrics: Metrics,
    breakers: Arc<Mutex<HashMap<String, CircuitBreaker>>>,
}

impl RetryManager {
    pub fn new(settings: RetrySettings) -> Self {
        Self {
            settings,
            metrics: Metrics::default(),
            breakers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    fn breaker_for(&self, key: &str) -> CircuitBreaker {
        let mut breakers = self.breakers.lock();
        breakers
            .entry(key.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.settings.circuit.clone()))
            .clone()
    }

    /// Runs `op` under the retry policy and circuit breaker keyed by
    /// `breaker_key` (typically the endpoint, or `"<endpoint>:<method>"` for
    /// per-method isolation). `context` is a short label for metrics/logging.
    pub async fn invoke<T, F, Fut>(&self, breaker_key: &str, context: &str, mut op: F) -> Result<T, Error>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let breaker = self.breaker_for(breaker_key);
        let deadline = self.settings.total_deadline.map(|d| Instant::now() + d);
        let mut attempt: u32 = 0;
        let mut last_error: Option<Error> = None;

        loop {
            attempt += 1;

            match breaker.try_admit() {
                circuit_breaker::Admission::Rejected { retry_after } => {
                    return Err(Error::CircuitBreakerOpenError {
                        retry_after_secs: retry_after.as_secs(),
                    });
                }
                circuit_breaker::Admission::AdmittedAsProbe => {
                    self.metrics.record_circuit_half_open(context);
                }
                circuit_breaker::Admission::Admitted => {}
            }

            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    let last = last_error.unwrap_or(Error::RetryTimeoutError {
                        last: Box::new(Error::ProtocolError {
                            message: "no attempt completed before deadline".to_string(),
                        }),
                    });
                    return Err(Error::RetryTimeoutError { last: Box::new(last) });
                }
            }

            self.metrics.record_attempt(context);
            let started = Instant::now();
            let result = op().await;

            match result {
                Ok(value) => {
                    let was_half_open = matches!(breaker.state(), CircuitState::HalfOpen);
                    breaker.on_success();
                    if was_half_open && breaker.state() == CircuitState::Closed {
                        self.metrics.record_circuit_closed(context);
                    }
                    self.metrics.record_success(started.elapsed(), context);
                    return Ok(value);
                }
                Err(err) => {
                    self.metrics.record_failure(&err, context);
                    let was_closed = matches!(breaker.state(), CircuitState::Closed);
                    breaker.on_failure();
                    if was_closed && breaker.state() == CircuitState::Open {
                        self.metrics.record_circuit_opened(context);
                    }

                    if !should_retry(&err) || attempt >= self.settings.max_attempts {
                        if attempt >= self.settings.max_attempts && should_retry(&err) {
                            return Err(Error::MaxRetriesExceededError {
                                attempts: attempt,
                                last: Box::new(err),
                            });
                        }
                        return Err(err);
                    }

                    let delay = strategy::delay_for(
                        self.settings.strategy,
                        attempt,
                        self.settings.base_delay,
                        self.settings.max_delay,
                        self.settings.jitter,
                    );
                    let delay = match deadline {
                        Some(deadline) => delay.min(deadline.saturating_duration_since(Instant::now())),
                        None => delay,
                    };
                    last_error = Some(err);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
