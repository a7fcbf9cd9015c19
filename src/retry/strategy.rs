//! Retry delay strategies (spec §4.6). Grounded on the exponential-backoff
//! iterator shape in `google_cloud_gax::retry::ExponentialBackoff`, extended
//! with the linear/fixed variants and symmetric jitter the spec requires.
use std::time::Duration;

use rand::Rng;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryStrategyKind {
    Exponential,
    Linear,
    Fixed,
}

/// `delay_for(attempt)` for the three strategies of spec §4.6's table.
/// `attempt` is 1-based (the delay preceding the *next* attempt).
pub fn delay_for(kind: RetryStrategyKind, attempt: u32, base: Duration, max: Duration, jitter: f64) -> Duration {
    let raw = match kind {
        RetryStrategyKind::Exponential => {
            let mult = 2u64.saturating_pow(attempt.saturating_sub(1));
            base.checked_mul(mult as u32).unwrap_or(max)
        }
        RetryStrategyKind::Linear => base + base.mul_f64((attempt.saturating_sub(1)) as f64),
        RetryStrategyKind::Fixed => base,
    };
    let capped = raw.min(max);
    apply_jitter(capped, jitter)
}

fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return delay;
    }
    let width = delay.as_secs_f64() * jitter;
    let offset = rand::thread_rng().gen_range(-width..=width);
    let jittered = (delay.as_secs_f64() + offset).max(0.0);
    Duration::from_secs_f64(jittered)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_doubles_each_attempt_without_jitter() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(60);
        assert_eq!(delay_for(RetryStrategyKind::Exponential, 1, base, max, 0.0), Duration::from_secs(1));
        assert_eq!(delay_for(RetryStrategyKind::Exponential, 2, base, max, 0.0), Duration::from_secs(2));
        assert_eq!(delay_for(RetryStrategyKind::Exponential, 3, base, max, 0.0), Duration::from_secs(4));
    }

    #[test]
    fn exponential_is_capped_at_max() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(3);
        assert_eq!(delay_for(RetryStrategyKind::Exponential, 10, base, max, 0.0), max);
    }

    #[test]
    fn linear_grows_by_increment() {
        let base = Duration::from_secs(2);
        let max = Duration::from_secs(60);
        assert_eq!(delay_for(RetryStrategyKind::Linear, 1, base, max, 0.0), Duration::from_secs(2));
        assert_eq!(delay_for(RetryStrategyKind::Linear, 3, base, max, 0.0), Duration::from_secs(6));
    }

    #[test]
    fn fixed_never_changes() {
        let base = Duration::from_millis(500);
        let max = Duration::from_secs(60);
        assert_eq!(delay_for(RetryStrategyKind::Fixed, 1, base, max, 0.0), base);
        assert_eq!(delay_for(RetryStrategyKind::Fixed, 9, base, max, 0.0), base);
    }

    #[test]
    fn jitter_stays_within_proportional_width() {
        let base = Duration::from_secs(10);
        let max = Duration::from_secs(60);
        for _ in 0..200 {
            let d = delay_for(RetryStrategyKind::Fixed, 1, base, max, 0.25);
            assert!(d.as_secs_f64() >= 7.5 && d.as_secs_f64() <= 12.5, "{d:?} out of jitter band");
        }
    }
}
