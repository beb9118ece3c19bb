use std::sync::atomic::{AtomicU64, Ordering};

use pq_common::{RoutingPolicy, Service};
use tokio::sync::Notify;

/// Shared routing state: the published threshold and the processed counter.
///
/// Owned by the engine and handed to the router and the threshold updater.
/// Readers may see a threshold one window stale.
#[derive(Debug)]
pub struct RoutingState {
    policy: RoutingPolicy,
    window: u64,
    threshold_bits: AtomicU64,
    processed: AtomicU64,
    window_crossed: Notify,
}

impl RoutingState {
    pub fn new(policy: RoutingPolicy, window: u64) -> Self {
        Self {
            policy,
            window: window.max(1),
            threshold_bits: AtomicU64::new(0f64.to_bits()),
            processed: AtomicU64::new(0),
            window_crossed: Notify::new(),
        }
    }

    pub fn policy(&self) -> RoutingPolicy {
        self.policy
    }

    pub fn window(&self) -> u64 {
        self.window
    }

    pub fn threshold(&self) -> f64 {
        f64::from_bits(self.threshold_bits.load(Ordering::Acquire))
    }

    pub fn publish_threshold(&self, threshold: f64) {
        self.threshold_bits.store(threshold.to_bits(), Ordering::Release);
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Acquire)
    }

    /// Count one completed payment. Wakes the updater when the count lands on
    /// a window boundary.
    pub fn record_processed(&self) -> u64 {
        let processed = self.processed.fetch_add(1, Ordering::AcqRel) + 1;
        if processed % self.window == 0 {
            self.window_crossed.notify_one();
        }
        processed
    }

    /// Number of complete windows processed so far.
    pub fn window_index(&self) -> u64 {
        self.processed() / self.window
    }

    pub async fn window_crossed(&self) {
        self.window_crossed.notified().await;
    }

    pub fn select(&self, amount: f64) -> Service {
        self.policy.select(amount, self.threshold())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_threshold_publish() {
        let state = RoutingState::new(RoutingPolicy::FallbackBelowThreshold, 10);
        assert_eq!(state.threshold(), 0.0);
        assert_eq!(state.select(100.0), Service::Default);

        state.publish_threshold(150.5);
        assert_eq!(state.threshold(), 150.5);
        assert_eq!(state.select(100.0), Service::Fallback);
        assert_eq!(state.select(200.0), Service::Default);
    }

    #[test]
    fn test_window_index() {
        let state = RoutingState::new(RoutingPolicy::default(), 10);
        for _ in 0..9 {
            state.record_processed();
        }
        assert_eq!(state.window_index(), 0);
        assert_eq!(state.record_processed(), 10);
        assert_eq!(state.window_index(), 1);
    }

    #[tokio::test]
    async fn test_crossing_wakes_waiter() {
        let state = RoutingState::new(RoutingPolicy::default(), 2);
        state.record_processed();
        state.record_processed();

        // Permit stored even though nobody was waiting yet.
        tokio::time::timeout(Duration::from_millis(100), state.window_crossed())
            .await
            .expect("woken");
    }
}
