use std::time::Duration;

use rand::Rng;

const MAX_JITTER_MS: u64 = 500;

/// Exponential backoff for bounded local retries.
///
/// ```text
/// delay(n) = min(base * 2^(n-1), cap) + jitter
/// ```
///
/// `n` is the 1-indexed attempt that just failed.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
    pub jitter: bool,
}

impl Backoff {
    pub const fn new(max_attempts: u32, base: Duration, cap: Duration) -> Self {
        Self {
            max_attempts,
            base,
            cap,
            jitter: true,
        }
    }

    /// Same schedule without random jitter, for deterministic callers.
    pub const fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Whether another attempt is allowed after `attempt` failed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let raw = self.base.saturating_mul(1u32 << exponent);
        let capped = raw.min(self.cap);
        if self.jitter {
            capped + Duration::from_millis(rand::thread_rng().gen_range(0..=MAX_JITTER_MS))
        } else {
            capped
        }
    }

    /// Sleep for the delay belonging to `attempt`.
    pub async fn wait(&self, attempt: u32) {
        let delay = self.delay(attempt);
        tracing::debug!(
            "Backing off {:.1}s after attempt {}/{}",
            delay.as_secs_f64(),
            attempt,
            self.max_attempts
        );
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_until_cap() {
        let b = Backoff::new(5, Duration::from_secs(1), Duration::from_secs(5)).without_jitter();
        assert_eq!(b.delay(1), Duration::from_secs(1));
        assert_eq!(b.delay(2), Duration::from_secs(2));
        assert_eq!(b.delay(3), Duration::from_secs(4));
        assert_eq!(b.delay(4), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_stays_bounded() {
        let b = Backoff::new(3, Duration::from_secs(1), Duration::from_secs(8));
        for _ in 0..20 {
            let d = b.delay(1);
            assert!(d >= Duration::from_secs(1));
            assert!(d <= Duration::from_millis(1000 + MAX_JITTER_MS));
        }
    }

    #[test]
    fn test_retry_bound() {
        let b = Backoff::new(3, Duration::from_secs(1), Duration::from_secs(8));
        assert!(b.should_retry(1));
        assert!(b.should_retry(2));
        assert!(!b.should_retry(3));
    }
}
