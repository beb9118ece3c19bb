//! Payment Queue Worker - one slot of the main or retry queue pool
//!
//! Keeps a claim session open for its whole life and runs the claim loop
//! until cancelled. The claimed payment is finalized on the same session.
//! Store errors drop the session; a fresh one is opened after a short
//! backoff. A claimed payment is always routed to the end, even if
//! cancellation arrives mid-call.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pq_common::QueueTopic;
use pq_store::{ClaimSession, PaymentRepository};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::claim::{ClaimLoop, ClaimLoopConfig, ClaimPoll};
use crate::registry::{TopicHandler, WorkerContext};
use crate::router::PaymentRouter;

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

pub struct PaymentQueueWorker {
    topic: QueueTopic,
    repository: Arc<dyn PaymentRepository>,
    router: Arc<PaymentRouter>,
    claim_config: ClaimLoopConfig,
    idle_delay: Duration,
    reconnect_delay: Duration,
}

impl PaymentQueueWorker {
    pub fn new(
        topic: QueueTopic,
        repository: Arc<dyn PaymentRepository>,
        router: Arc<PaymentRouter>,
        claim_config: ClaimLoopConfig,
        idle_delay: Duration,
    ) -> Self {
        Self {
            topic,
            repository,
            router,
            claim_config,
            idle_delay,
            reconnect_delay: RECONNECT_DELAY,
        }
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }
}

/// Sleep unless cancelled first. Returns true on cancellation.
async fn pause(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

#[async_trait]
impl TopicHandler for PaymentQueueWorker {
    async fn run(&self, ctx: WorkerContext) -> anyhow::Result<()> {
        let mut claims = ClaimLoop::new(self.claim_config.clone());
        let mut session: Option<Box<dyn ClaimSession>> = None;

        while !ctx.cancel.is_cancelled() {
            if session.is_none() {
                match self.repository.open_session(self.topic).await {
                    Ok(opened) => session = Some(opened),
                    Err(e) => {
                        error!(
                            topic = %ctx.topic,
                            slot = ctx.slot,
                            error = %e,
                            "Failed to open claim session"
                        );
                        if pause(&ctx.cancel, self.reconnect_delay).await {
                            break;
                        }
                        continue;
                    }
                }
            }
            let Some(active) = session.as_mut() else { continue };

            let claim = match claims.poll(active.as_mut(), &ctx.cancel).await {
                Ok(ClaimPoll::Cancelled) => break,
                Ok(ClaimPoll::Idle) => continue,
                Ok(ClaimPoll::Empty) => {
                    if pause(&ctx.cancel, self.idle_delay).await {
                        break;
                    }
                    continue;
                }
                Ok(ClaimPoll::Claimed(claim)) => claim,
                Err(e) => {
                    error!(
                        topic = %ctx.topic,
                        slot = ctx.slot,
                        error = %e,
                        "Claim attempt failed, reopening session"
                    );
                    session = None;
                    if pause(&ctx.cancel, self.reconnect_delay).await {
                        break;
                    }
                    continue;
                }
            };

            let id = claim.payment.correlation_id.as_str();
            match self.router.process(active.as_mut(), &claim.payment).await {
                Ok(outcome) => {
                    debug!(
                        topic = %ctx.topic,
                        slot = ctx.slot,
                        correlation_id = %id,
                        outcome = ?outcome,
                        "Payment routed"
                    );
                }
                Err(e) => {
                    error!(
                        topic = %ctx.topic,
                        slot = ctx.slot,
                        correlation_id = %id,
                        error = %e,
                        "Failed to finalize payment, reopening session"
                    );
                    session = None;
                    if pause(&ctx.cancel, self.reconnect_delay).await {
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}
