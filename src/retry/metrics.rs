//! Retry/circuit metrics (spec §4.6): counters, a latency histogram, and a
//! pluggable event sink.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryEvent {
    RetryAttempt,
    RetrySuccess,
    RetryFailed,
    CircuitOpened,
    CircuitClosed,
    CircuitHalfOpen,
}

/// `(event, context)` tuples handed to a pluggable sink.
pub trait MetricsSink: Send + Sync {
    fn on_event(&self, event: RetryEvent, context: &str);
}

/// A no-op sink used when the caller does not register one.
#[derive(Default)]
pub struct NullSink;
impl MetricsSink for NullSink {
    fn on_event(&self, _event: RetryEvent, _context: &str) {}
}

#[derive(Default)]
struct Counters {
    attempts: AtomicU64,
    successes: AtomicU64,
    failures_connection: AtomicU64,
    failures_timeout: AtomicU64,
    failures_internal: AtomicU64,
    failures_other: AtomicU64,
    circuit_opens: AtomicU64,
    latency_sum_micros: AtomicU64,
    latency_count: AtomicU64,
}

#[derive(Clone)]
pub struct Metrics {
    counters: Arc<Counters>,
    sink: Arc<dyn MetricsSink>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            counters: Arc::new(Counters::default()),
            sink: Arc::new(NullSink),
        }
    }
}

impl Metrics {
    pub fn with_sink(sink: Arc<dyn MetricsSink>) -> Self {
        Self {
            counters: Arc::new(Counters::default()),
            sink,
        }
    }

    pub fn record_attempt(&self, context: &str) {
        self.counters.attempts.fetch_add(1, Ordering::Relaxed);
        self.sink.on_event(RetryEvent::RetryAttempt, context);
    }

    pub fn record_success(&self, latency: Duration, context: &str) {
        self.counters.successes.fetch_add(1, Ordering::Relaxed);
        self.counters
            .latency_sum_micros
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
        self.counters.latency_count.fetch_add(1, Ordering::Relaxed);
        self.sink.on_event(RetryEvent::RetrySuccess, context);
    }

    pub fn record_failure(&self, kind: &crate::error::Error, context: &str) {
        match kind {
            crate::error::Error::ConnectionError { .. } => {
                self.counters.failures_connection.fetch_add(1, Ordering::Relaxed);
            }
            crate::error::Error::TimeoutError { .. } => {
                self.counters.failures_timeout.fetch_add(1, Ordering::Relaxed);
            }
            crate::error::Error::InternalError { .. } => {
                self.counters.failures_internal.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.counters.failures_other.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.sink.on_event(RetryEvent::RetryFailed, context);
    }

    pub fn record_circuit_opened(&self, context: &str) {
        self.counters.circuit_opens.fetch_add(1, Ordering::Relaxed);
        self.sink.on_event(RetryEvent::CircuitOpened, context);
    }

    pub fn record_circuit_closed(&self, context: &str) {
        self.sink.on_event(RetryEvent::CircuitClosed, context);
    }

    pub fn record_circuit_half_open(&self, context: &str) {
        self.sink.on_event(RetryEvent::CircuitHalfOpen, context);
    }

    pub fn attempts(&self) -> u64 {
        self.counters.attempts.load(Ordering::Relaxed)
    }

    pub fn successes(&self) -> u64 {
        self.counters.successes.load(Ordering::Relaxed)
    }

    pub fn mean_latency(&self) -> Option<Duration> {
        let count = self.counters.latency_count.load(Ordering::Relaxed);
        if count == 0 {
            return None;
        }
        let sum = self.counters.latency_sum_micros.load(Ordering::Relaxed);
        Some(Duration::from_micros(sum / count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct CollectingSink(Mutex<Vec<RetryEvent>>);

    impl MetricsSink for CollectingSink {
        fn on_event(&self, event: RetryEvent, _context: &str) {
            self.0.lock().unwrap().push(event);
        }
    }

    #[test]
    fn counters_increment_and_sink_receives_events() {
        let sink = Arc::new(CollectingSink(Mutex::new(vec![])));
        let metrics = Metrics::with_sink(sink.clone());
        metrics.record_attempt("ctx");
        metrics.record_success(Duration::from_millis(5), "ctx");
        assert_eq!(metrics.attempts(), 1);
        assert_eq!(metrics.successes(), 1);
        assert_eq!(sink.0.lock().unwrap().len(), 2);
    }
}
