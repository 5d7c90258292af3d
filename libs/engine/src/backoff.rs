use std::time::Duration;

use rand::Rng;

/// Longest delay any single retry will wait.
const BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Deterministic exponential schedule: `base × 2^(attempts_made − 1)`, capped.
pub fn scheduled_backoff(base: Duration, attempts_made: u32) -> Duration {
    let exponent = attempts_made.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exponent).min(BACKOFF_CAP)
}

/// Full jitter: uniform in `[0, delay]`. Prevents synchronized retry herds
/// after a mass failure.
pub fn full_jitter(delay: Duration) -> Duration {
    let millis = delay.as_millis() as u64;
    if millis == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::rng().random_range(0..=millis))
}

/// Delay before the next attempt. A platform-provided `retry_after` is a
/// floor, never shortened by jitter: the jittered backoff only wins when it
/// is longer.
pub fn retry_delay(base: Duration, attempts_made: u32, retry_after: Option<Duration>) -> Duration {
    let jittered = full_jitter(scheduled_backoff(base, attempts_made));
    match retry_after {
        Some(after) => {
            let padded = after + full_jitter(base.min(Duration::from_millis(500)));
            jittered.max(padded)
        }
        None => jittered,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_doubles_and_caps() {
        let base = Duration::from_millis(1000);
        assert_eq!(scheduled_backoff(base, 1), Duration::from_millis(1000));
        assert_eq!(scheduled_backoff(base, 2), Duration::from_millis(2000));
        assert_eq!(scheduled_backoff(base, 3), Duration::from_millis(4000));
        assert_eq!(scheduled_backoff(base, 30), BACKOFF_CAP);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        for _ in 0..100 {
            let jittered = full_jitter(Duration::from_millis(400));
            assert!(jittered <= Duration::from_millis(400));
        }
        assert_eq!(full_jitter(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn retry_after_is_a_floor() {
        for _ in 0..100 {
            let delay = retry_delay(
                Duration::from_millis(100),
                1,
                Some(Duration::from_millis(5000)),
            );
            assert!(delay >= Duration::from_millis(5000));
            assert!(delay <= Duration::from_millis(5600));
        }
    }
}
