//! Payment Engine - the three worker pools built from configuration
//!
//! | Topic | Handler | Pool size |
//! |-------|---------|-----------|
//! | `payments_queue` | `PaymentQueueWorker` on `pending` rows | `payments_pool_size` |
//! | `payments_failing_queue` | `PaymentQueueWorker` on `failing` rows | `failing_pool_size` |
//! | `processed_watcher` | `ThresholdUpdater` | 1 |

use std::sync::Arc;
use std::time::Duration;

use pq_common::{QueueTopic, WATCHER_TOPIC};
use pq_config::EngineConfig;
use pq_store::PaymentRepository;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::claim::ClaimLoopConfig;
use crate::gateway::PaymentGateway;
use crate::registry::TopicRegistry;
use crate::router::PaymentRouter;
use crate::state::RoutingState;
use crate::threshold::ThresholdUpdater;
use crate::worker::PaymentQueueWorker;

pub struct PaymentEngine {
    registry: TopicRegistry,
    state: Arc<RoutingState>,
}

impl PaymentEngine {
    pub fn new(
        config: &EngineConfig,
        repository: Arc<dyn PaymentRepository>,
        gateway: Arc<dyn PaymentGateway>,
    ) -> Self {
        Self::with_shutdown(config, repository, gateway, CancellationToken::new())
    }

    pub fn with_shutdown(
        config: &EngineConfig,
        repository: Arc<dyn PaymentRepository>,
        gateway: Arc<dyn PaymentGateway>,
        shutdown: CancellationToken,
    ) -> Self {
        let state = Arc::new(RoutingState::new(config.routing_policy, config.rolling_window));
        let router = Arc::new(PaymentRouter::new(gateway, state.clone(), config.max_retries));
        let updater = Arc::new(ThresholdUpdater::new(
            repository.clone(),
            state.clone(),
            config.watcher_interval(),
        ));

        let claim_config = ClaimLoopConfig {
            notification_timeout: config.notification_timeout(),
            sweep_every: config.sweep_every,
        };

        let mut registry = TopicRegistry::with_shutdown(shutdown);
        for (topic, pool_size) in [
            (QueueTopic::Payments, config.payments_pool_size),
            (QueueTopic::Failing, config.failing_pool_size),
        ] {
            let worker = PaymentQueueWorker::new(
                topic,
                repository.clone(),
                router.clone(),
                claim_config.clone(),
                config.idle_delay(),
            );
            registry.subscribe(topic.channel(), pool_size, Arc::new(worker));
        }
        registry.subscribe(WATCHER_TOPIC, 1, updater);

        Self { registry, state }
    }

    pub fn start(&self) {
        info!(topics = ?self.registry.topics(), "Starting payment engine");
        self.registry.start();
    }

    pub fn stop(&self) {
        self.registry.stop();
    }

    /// Wait for workers to finish in-flight payments after `stop`.
    pub async fn join(&self, timeout: Duration) -> bool {
        self.registry.join(timeout).await
    }

    pub fn state(&self) -> &Arc<RoutingState> {
        &self.state
    }

    pub fn registry(&self) -> &TopicRegistry {
        &self.registry
    }
}
