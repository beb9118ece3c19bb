//! Rolling Threshold Updater
//!
//! Single worker on the watcher topic. Whenever the processed counter has
//! crossed a new multiple of the window it asks the store for a fresh median
//! and publishes it into the shared routing state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pq_store::PaymentRepository;
use tracing::{error, info};

use crate::registry::{TopicHandler, WorkerContext};
use crate::state::RoutingState;
use crate::Result;

pub struct ThresholdUpdater {
    repository: Arc<dyn PaymentRepository>,
    state: Arc<RoutingState>,
    interval: Duration,
    last_window: AtomicU64,
}

impl ThresholdUpdater {
    pub fn new(
        repository: Arc<dyn PaymentRepository>,
        state: Arc<RoutingState>,
        interval: Duration,
    ) -> Self {
        Self {
            repository,
            state,
            interval,
            last_window: AtomicU64::new(0),
        }
    }

    /// Recompute if a window boundary was crossed since the last publish.
    /// Returns the published threshold, or `None` when nothing was due.
    pub async fn tick(&self) -> Result<Option<f64>> {
        let window_index = self.state.window_index();
        if window_index == 0 || window_index == self.last_window.load(Ordering::Acquire) {
            return Ok(None);
        }

        let threshold = self.repository.recompute_threshold(self.state.window()).await?;
        self.state.publish_threshold(threshold);
        self.last_window.store(window_index, Ordering::Release);

        info!(
            threshold = threshold,
            processed = self.state.processed(),
            window = self.state.window(),
            "Published rolling threshold"
        );
        Ok(Some(threshold))
    }
}

#[async_trait]
impl TopicHandler for ThresholdUpdater {
    async fn run(&self, ctx: WorkerContext) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = ctx.cancel.cancelled() => break,
                _ = self.state.window_crossed() => {}
                _ = tokio::time::sleep(self.interval) => {}
            }

            if let Err(e) = self.tick().await {
                error!(topic = %ctx.topic, error = %e, "Threshold recomputation failed");
            }
        }
        Ok(())
    }
}
