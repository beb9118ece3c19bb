//! Payment Router - finalizes a claimed payment
//!
//! Selects a gateway from the shared threshold, performs the downstream call
//! and writes the resulting transition through the session that claimed the
//! row. The completion write and the processed counter only move after the
//! gateway confirmed success.

use std::sync::Arc;

use chrono::Utc;
use pq_common::{ClaimedPayment, Service};
use pq_store::{ClaimSession, FailureOutcome};
use tracing::{debug, error, warn};

use crate::gateway::PaymentGateway;
use crate::state::RoutingState;
use crate::Result;

/// What happened to a claimed payment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Completed { service: Service },
    /// Gateway failed; row moved to `failing`
    Retrying { retries: u32 },
    /// Gateway failed and the retry limit is reached
    Failed { retries: u32 },
    /// The row left `processing` under us (administrative purge)
    LeaseLost,
}

pub struct PaymentRouter {
    gateway: Arc<dyn PaymentGateway>,
    state: Arc<RoutingState>,
    max_retries: u32,
}

impl PaymentRouter {
    pub fn new(
        gateway: Arc<dyn PaymentGateway>,
        state: Arc<RoutingState>,
        max_retries: u32,
    ) -> Self {
        Self {
            gateway,
            state,
            max_retries,
        }
    }

    pub fn state(&self) -> &Arc<RoutingState> {
        &self.state
    }

    pub async fn process(
        &self,
        session: &mut dyn ClaimSession,
        payment: &ClaimedPayment,
    ) -> Result<RouteOutcome> {
        let service = self.state.select(payment.amount);
        let id = payment.correlation_id.as_str();

        match self.gateway.send(service, &payment.payload()).await {
            Ok(()) => {
                if !session.complete(id, service, Utc::now()).await? {
                    warn!(correlation_id = %id, "Payment no longer held, completion dropped");
                    return Ok(RouteOutcome::LeaseLost);
                }
                let processed = self.state.record_processed();
                debug!(
                    correlation_id = %id,
                    service = %service,
                    processed = processed,
                    "Payment completed"
                );
                Ok(RouteOutcome::Completed { service })
            }
            Err(e) => {
                let attempt = payment.retries + 1;
                match session.record_failure(id, self.max_retries).await? {
                    FailureOutcome::Requeued { retries } => {
                        warn!(
                            correlation_id = %id,
                            service = %service,
                            attempt = attempt,
                            error = %e,
                            "Gateway call failed, requeued for retry"
                        );
                        Ok(RouteOutcome::Retrying { retries })
                    }
                    FailureOutcome::Exhausted { retries } => {
                        error!(
                            correlation_id = %id,
                            service = %service,
                            attempt = attempt,
                            error = %e,
                            "Gateway call failed, retry limit reached"
                        );
                        Ok(RouteOutcome::Failed { retries })
                    }
                    FailureOutcome::NotHeld => {
                        warn!(
                            correlation_id = %id,
                            error = %e,
                            "Payment no longer held after failure"
                        );
                        Ok(RouteOutcome::LeaseLost)
                    }
                }
            }
        }
    }
}
