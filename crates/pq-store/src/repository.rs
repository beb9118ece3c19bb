use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pq_common::{
    ClaimedPayment, NewPayment, Notification, PaymentRecord, PaymentSummary, QueueTopic, Service,
};

use crate::Result;

/// How a claim found its row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimPath {
    /// The row named by the received notification
    Notified,
    /// The oldest eligible row, skipping rows locked by other claimers
    Oldest,
}

/// A row moved to `processing` by this session
#[derive(Debug, Clone, PartialEq)]
pub struct Claim {
    pub payment: ClaimedPayment,
    pub path: ClaimPath,
}

/// Result of recording a failed gateway attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Moved to `failing` and announced on the retry queue
    Requeued { retries: u32 },
    /// Retry limit reached, moved to `failed`
    Exhausted { retries: u32 },
    /// The row was no longer `processing` (purged or lease lost)
    NotHeld,
}

/// A worker's long-lived hold on the store: one subscription to the topic's
/// notification channel plus the connection its claims and finalize writes
/// run on. A claimed row is finalized through the session that claimed it.
#[async_trait]
pub trait ClaimSession: Send {
    fn topic(&self) -> QueueTopic;

    /// Wait up to `timeout` for the next notification. `Ok(None)` on timeout.
    async fn next_notification(&mut self, timeout: Duration) -> Result<Option<Notification>>;

    /// Claim one row in the topic's source status, in a single transaction.
    ///
    /// With a `target`, first try that exact row; if it is not in the source
    /// status (or no target is given) claim the oldest eligible row instead.
    /// `Ok(None)` when nothing is eligible.
    async fn claim(&mut self, target: Option<&str>) -> Result<Option<Claim>>;

    /// `processing -> completed`. Returns false if the row was not `processing`.
    async fn complete(
        &mut self,
        correlation_id: &str,
        service: Service,
        processed_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// `processing -> failing | failed`, incrementing `retries`. The row
    /// becomes `failed` once `retries` reaches `max_retries`.
    async fn record_failure(
        &mut self,
        correlation_id: &str,
        max_retries: u32,
    ) -> Result<FailureOutcome>;
}

#[async_trait]
pub trait PaymentRepository: Send + Sync {
    async fn open_session(&self, topic: QueueTopic) -> Result<Box<dyn ClaimSession>>;

    /// Insert a `pending` row and announce it on the main queue atomically.
    async fn submit(&self, payment: NewPayment) -> Result<PaymentRecord>;

    /// Median amount of the `window` most recently completed payments.
    async fn recompute_threshold(&self, window: u64) -> Result<f64>;

    async fn find(&self, correlation_id: &str) -> Result<Option<PaymentRecord>>;

    async fn list(&self, limit: u32) -> Result<Vec<PaymentRecord>>;

    /// Completed payments per gateway with `requested_at` in `[from, to]`.
    async fn summary(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<PaymentSummary>;

    /// Delete every payment and metric row. Returns deleted payments.
    async fn purge(&self) -> Result<u64>;
}
