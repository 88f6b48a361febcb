//! Per-source request throttle with a circuit breaker.
//!
//! Every external source owns one [`Throttle`]. It spaces requests by a minimum
//! delay, enforces a rolling daily ceiling and stops calling the source after a run
//! of consecutive failures until a cooldown has passed.
//!
//! ```text
//! closed --(failures >= threshold)--> open --(deadline passed)--> half-open (one trial)
//!   ^                                   ^                            |
//!   |                                   +--------(failure)-----------+
//!   +----------------------------(success)---------------------------+
//! ```

use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    pub min_delay: Duration,
    pub daily_limit: u32,
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct ThrottleState {
    last_request: Option<Instant>,
    window_start: Instant,
    requests_in_window: u32,
    consecutive_failures: u32,
    circuit: CircuitState,
    reopen_at: Option<Instant>,
    /// When the single half-open trial was admitted. A trial older than the
    /// cooldown is treated as abandoned.
    trial_since: Option<Instant>,
}

impl ThrottleState {
    fn fresh(now: Instant) -> Self {
        Self {
            last_request: None,
            window_start: now,
            requests_in_window: 0,
            consecutive_failures: 0,
            circuit: CircuitState::Closed,
            reopen_at: None,
            trial_since: None,
        }
    }
}

/// Snapshot for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct ThrottleStatus {
    pub circuit: CircuitState,
    pub consecutive_failures: u32,
    pub requests_in_window: u32,
    pub daily_limit: u32,
    pub reopens_in_secs: Option<u64>,
}

#[derive(Debug)]
pub struct Throttle {
    source: String,
    config: ThrottleConfig,
    state: Mutex<ThrottleState>,
}

impl Throttle {
    pub fn new(source: impl Into<String>, config: ThrottleConfig) -> Self {
        Self {
            source: source.into(),
            config,
            state: Mutex::new(ThrottleState::fresh(Instant::now())),
        }
    }

    /// Whether a request may be attempted now. Never touches the network.
    pub fn can_proceed(&self) -> bool {
        self.can_proceed_at(Instant::now())
    }

    fn can_proceed_at(&self, now: Instant) -> bool {
        let Ok(mut st) = self.state.lock() else {
            return false;
        };

        if st.circuit == CircuitState::Open {
            match st.reopen_at {
                Some(deadline) if now < deadline => {
                    tracing::debug!(
                        "{} circuit open for another {:.0}s",
                        self.source,
                        (deadline - now).as_secs_f64()
                    );
                    return false;
                }
                _ => {
                    tracing::info!("{} circuit half-open, allowing a trial request", self.source);
                    st.circuit = CircuitState::HalfOpen;
                }
            }
        }

        if now.duration_since(st.window_start) >= DAY {
            st.window_start = now;
            st.requests_in_window = 0;
        }
        if st.requests_in_window >= self.config.daily_limit {
            tracing::warn!(
                "{} daily limit reached ({} requests)",
                self.source,
                self.config.daily_limit
            );
            return false;
        }

        if st.circuit == CircuitState::HalfOpen {
            match st.trial_since {
                Some(since) if now.duration_since(since) < self.config.cooldown => {
                    tracing::debug!("{} half-open trial already in flight", self.source);
                    return false;
                }
                _ => st.trial_since = Some(now),
            }
        }
        true
    }

    /// Sleep until the minimum inter-request delay has elapsed, reserving the slot.
    ///
    /// The slot is claimed under the lock before sleeping, so concurrent callers
    /// queue up one `min_delay` apart instead of firing together.
    pub async fn wait_if_needed(&self) {
        let wait = {
            let Ok(mut st) = self.state.lock() else {
                return;
            };
            let now = Instant::now();
            let slot = match st.last_request {
                Some(last) => (last + self.config.min_delay).max(now),
                None => now,
            };
            st.last_request = Some(slot);
            st.requests_in_window += 1;
            slot - now
        };
        if !wait.is_zero() {
            tracing::debug!("{} throttled for {:.1}s", self.source, wait.as_secs_f64());
            tokio::time::sleep(wait).await;
        }
    }

    pub fn record_outcome(&self, success: bool) {
        self.record_outcome_at(success, Instant::now());
    }

    fn record_outcome_at(&self, success: bool, now: Instant) {
        let Ok(mut st) = self.state.lock() else {
            return;
        };
        st.trial_since = None;

        if success {
            if st.circuit != CircuitState::Closed {
                tracing::info!("{} circuit closed after successful request", self.source);
            }
            st.consecutive_failures = 0;
            st.circuit = CircuitState::Closed;
            st.reopen_at = None;
            return;
        }

        st.consecutive_failures += 1;
        let reopen = match st.circuit {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => st.consecutive_failures >= self.config.failure_threshold,
            CircuitState::Open => false,
        };
        if reopen {
            st.circuit = CircuitState::Open;
            st.reopen_at = Some(now + self.config.cooldown);
            tracing::warn!(
                "{} circuit opened after {} consecutive failures, cooling down {}s",
                self.source,
                st.consecutive_failures,
                self.config.cooldown.as_secs()
            );
        }
    }

    pub fn reset(&self) {
        if let Ok(mut st) = self.state.lock() {
            *st = ThrottleState::fresh(Instant::now());
        }
        tracing::info!("{} throttle reset", self.source);
    }

    pub fn status(&self) -> ThrottleStatus {
        let now = Instant::now();
        match self.state.lock() {
            Ok(st) => ThrottleStatus {
                circuit: st.circuit,
                consecutive_failures: st.consecutive_failures,
                requests_in_window: st.requests_in_window,
                daily_limit: self.config.daily_limit,
                reopens_in_secs: st
                    .reopen_at
                    .filter(|_| st.circuit == CircuitState::Open)
                    .map(|d| d.saturating_duration_since(now).as_secs()),
            },
            Err(_) => ThrottleStatus {
                circuit: CircuitState::Open,
                consecutive_failures: 0,
                requests_in_window: 0,
                daily_limit: self.config.daily_limit,
                reopens_in_secs: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn throttle(threshold: u32, daily_limit: u32) -> Throttle {
        Throttle::new(
            "test",
            ThrottleConfig {
                min_delay: Duration::from_millis(500),
                daily_limit,
                failure_threshold: threshold,
                cooldown: Duration::from_secs(300),
            },
        )
    }

    #[test]
    fn test_opens_after_threshold() {
        let t = throttle(3, 100);
        let now = Instant::now();
        t.record_outcome_at(false, now);
        t.record_outcome_at(false, now);
        assert!(t.can_proceed_at(now));
        t.record_outcome_at(false, now);
        assert!(!t.can_proceed_at(now));
        assert!(!t.can_proceed_at(now + Duration::from_secs(299)));
        assert_eq!(t.status().circuit, CircuitState::Open);
    }

    #[test]
    fn test_half_open_success_closes() {
        let t = throttle(2, 100);
        let now = Instant::now();
        t.record_outcome_at(false, now);
        t.record_outcome_at(false, now);

        let later = now + Duration::from_secs(301);
        assert!(t.can_proceed_at(later));
        assert_eq!(t.status().circuit, CircuitState::HalfOpen);
        t.record_outcome_at(true, later);
        assert_eq!(t.status().circuit, CircuitState::Closed);
        assert_eq!(t.status().consecutive_failures, 0);
    }

    #[test]
    fn test_half_open_admits_one_trial_at_a_time() {
        let t = throttle(2, 100);
        let now = Instant::now();
        t.record_outcome_at(false, now);
        t.record_outcome_at(false, now);

        let later = now + Duration::from_secs(301);
        assert!(t.can_proceed_at(later));
        assert!(!t.can_proceed_at(later));
        assert!(!t.can_proceed_at(later + Duration::from_secs(1)));
        assert_eq!(t.status().circuit, CircuitState::HalfOpen);

        t.record_outcome_at(true, later + Duration::from_secs(2));
        assert!(t.can_proceed_at(later + Duration::from_secs(2)));
        assert!(t.can_proceed_at(later + Duration::from_secs(2)));
    }

    #[test]
    fn test_abandoned_trial_expires() {
        let t = throttle(1, 100);
        let now = Instant::now();
        t.record_outcome_at(false, now);
        let later = now + Duration::from_secs(301);
        assert!(t.can_proceed_at(later));
        assert!(!t.can_proceed_at(later + Duration::from_secs(299)));
        assert!(t.can_proceed_at(later + Duration::from_secs(300)));
    }

    #[test]
    fn test_reset_clears_pending_trial() {
        let t = throttle(1, 100);
        let now = Instant::now();
        t.record_outcome_at(false, now);
        assert!(t.can_proceed_at(now + Duration::from_secs(301)));
        t.reset();
        assert!(t.can_proceed());
        assert!(t.can_proceed());
    }

    #[test]
    fn test_half_open_failure_reopens_with_fresh_deadline() {
        let t = throttle(2, 100);
        let now = Instant::now();
        t.record_outcome_at(false, now);
        t.record_outcome_at(false, now);

        let later = now + Duration::from_secs(301);
        assert!(t.can_proceed_at(later));
        t.record_outcome_at(false, later);
        assert!(!t.can_proceed_at(later + Duration::from_secs(10)));
        assert!(t.can_proceed_at(later + Duration::from_secs(301)));
    }

    #[test]
    fn test_success_resets_failure_counter() {
        let t = throttle(3, 100);
        let now = Instant::now();
        t.record_outcome_at(false, now);
        t.record_outcome_at(false, now);
        t.record_outcome_at(true, now);
        t.record_outcome_at(false, now);
        t.record_outcome_at(false, now);
        assert!(t.can_proceed_at(now));
    }

    #[tokio::test(start_paused = true)]
    async fn test_daily_limit_uses_rolling_window() {
        let t = throttle(3, 2);
        t.wait_if_needed().await;
        t.wait_if_needed().await;
        assert!(!t.can_proceed());

        tokio::time::advance(DAY).await;
        assert!(t.can_proceed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_spaces_requests() {
        let t = throttle(3, 100);
        let start = Instant::now();
        t.wait_if_needed().await;
        t.wait_if_needed().await;
        t.wait_if_needed().await;
        assert!(Instant::now() - start >= Duration::from_millis(1000));
    }

    #[test]
    fn test_reset_closes_circuit() {
        let t = throttle(1, 100);
        t.record_outcome(false);
        assert!(!t.can_proceed());
        t.reset();
        assert!(t.can_proceed());
    }
}
