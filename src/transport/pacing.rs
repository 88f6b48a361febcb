use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

/// Minimum interval between requests to the same host.
///
/// Independent of the per-source [`Throttle`](super::throttle::Throttle): a single
/// resolution chain may hop across many publisher hosts that belong to no source.
/// The next free slot for a host is reserved while its map entry is locked, so
/// concurrent tasks on a multi-threaded runtime still queue one interval apart.
#[derive(Debug)]
pub struct HostPacer {
    interval: Duration,
    next_slot: DashMap<String, Instant>,
}

impl HostPacer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_slot: DashMap::new(),
        }
    }

    /// Wait until `host` may be contacted again.
    pub async fn pace(&self, host: &str) {
        if self.interval.is_zero() {
            return;
        }
        let now = Instant::now();
        let host = host.to_ascii_lowercase();
        if !self.next_slot.contains_key(&host) {
            self.prune(now);
        }
        let slot = {
            let mut entry = self
                .next_slot
                .entry(host.clone())
                .or_insert(now);
            let slot = (*entry).max(now);
            *entry = slot + self.interval;
            slot
        };

        if slot > now {
            tracing::debug!(
                "Pacing {} for {:.1}s",
                host,
                (slot - now).as_secs_f64()
            );
            tokio::time::sleep_until(slot).await;
        }
    }

    /// Drop hosts whose next slot has already passed; they would not wait anyway.
    fn prune(&self, now: Instant) {
        self.next_slot.retain(|_, slot| *slot > now);
    }

    #[cfg(test)]
    fn tracked_hosts(&self) -> usize {
        self.next_slot.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_same_host_is_spaced() {
        let pacer = HostPacer::new(Duration::from_secs(2));
        let start = Instant::now();
        pacer.pace("host.example").await;
        assert_eq!(Instant::now(), start);
        pacer.pace("HOST.example").await;
        assert!(Instant::now() - start >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_hosts_do_not_wait() {
        let pacer = HostPacer::new(Duration::from_secs(2));
        let start = Instant::now();
        pacer.pace("a.example").await;
        pacer.pace("b.example").await;
        assert_eq!(Instant::now(), start);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_hosts_are_forgotten() {
        let pacer = HostPacer::new(Duration::from_secs(2));
        for i in 0..50 {
            pacer.pace(&format!("h{}.example", i)).await;
        }
        assert_eq!(pacer.tracked_hosts(), 50);

        tokio::time::advance(Duration::from_secs(3)).await;
        pacer.pace("fresh.example").await;
        assert_eq!(pacer.tracked_hosts(), 1);

        // A host still inside its interval keeps its reservation.
        let start = Instant::now();
        pacer.pace("another.example").await;
        pacer.pace("fresh.example").await;
        assert!(Instant::now() - start >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_queue() {
        let pacer = std::sync::Arc::new(HostPacer::new(Duration::from_secs(1)));
        let start = Instant::now();
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let p = pacer.clone();
                tokio::spawn(async move { p.pace("busy.example").await })
            })
            .collect();
        for h in handles {
            h.await.unwrap();
        }
        assert!(Instant::now() - start >= Duration::from_secs(2));
    }
}
