//! In-memory payment store
//!
//! Rows live behind a single mutex, so every conditional transition is
//! serialized the way row locks serialize them in PostgreSQL. Each queue
//! topic has a broadcast channel standing in for `LISTEN/NOTIFY`; lagging
//! receivers drop notifications, which the claim protocol tolerates.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use pq_common::{
    ClaimedPayment, NewPayment, Notification, PaymentRecord, PaymentStatus, PaymentSummary,
    QueueTopic, Service,
};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

use crate::repository::{Claim, ClaimPath, ClaimSession, FailureOutcome, PaymentRepository};
use crate::{Result, StoreError};

const CHANNEL_CAPACITY: usize = 1024;

struct Inner {
    rows: Mutex<HashMap<String, PaymentRecord>>,
    thresholds: Mutex<Vec<f64>>,
    payments_tx: broadcast::Sender<String>,
    failing_tx: broadcast::Sender<String>,
}

impl Inner {
    fn sender(&self, topic: QueueTopic) -> &broadcast::Sender<String> {
        match topic {
            QueueTopic::Payments => &self.payments_tx,
            QueueTopic::Failing => &self.failing_tx,
        }
    }

    fn notify(&self, topic: QueueTopic, payload: &str) {
        // No subscribers is not an error: the row is still found by a scan.
        let _ = self.sender(topic).send(payload.to_string());
    }

    fn complete(
        &self,
        correlation_id: &str,
        service: Service,
        processed_at: DateTime<Utc>,
    ) -> bool {
        let mut rows = self.rows.lock();
        match rows.get_mut(correlation_id) {
            Some(row) if row.status == PaymentStatus::Processing => {
                row.status = PaymentStatus::Completed;
                row.processed_at = Some(processed_at);
                row.service = Some(service);
                true
            }
            _ => false,
        }
    }

    fn record_failure(&self, correlation_id: &str, max_retries: u32) -> FailureOutcome {
        let outcome = {
            let mut rows = self.rows.lock();
            match rows.get_mut(correlation_id) {
                Some(row) if row.status == PaymentStatus::Processing => {
                    row.retries += 1;
                    if row.retries >= max_retries {
                        row.status = PaymentStatus::Failed;
                        FailureOutcome::Exhausted { retries: row.retries }
                    } else {
                        row.status = PaymentStatus::Failing;
                        FailureOutcome::Requeued { retries: row.retries }
                    }
                }
                _ => FailureOutcome::NotHeld,
            }
        };
        if matches!(outcome, FailureOutcome::Requeued { .. }) {
            self.notify(QueueTopic::Failing, correlation_id);
        }
        outcome
    }
}

#[derive(Clone)]
pub struct MemoryPaymentRepository {
    inner: Arc<Inner>,
}

impl Default for MemoryPaymentRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPaymentRepository {
    pub fn new() -> Self {
        let (payments_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (failing_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                rows: Mutex::new(HashMap::new()),
                thresholds: Mutex::new(Vec::new()),
                payments_tx,
                failing_tx,
            }),
        }
    }

    /// Insert a `pending` row without announcing it.
    pub fn insert_silently(&self, payment: NewPayment) -> Result<()> {
        let mut rows = self.inner.rows.lock();
        if rows.contains_key(&payment.correlation_id) {
            return Err(StoreError::duplicate(payment.correlation_id));
        }
        rows.insert(payment.correlation_id.clone(), payment.into_record());
        Ok(())
    }

    /// Publish an arbitrary payload on a topic channel.
    pub fn notify(&self, topic: QueueTopic, payload: &str) {
        self.inner.notify(topic, payload);
    }

    /// Every threshold computed so far, oldest first.
    pub fn threshold_history(&self) -> Vec<f64> {
        self.inner.thresholds.lock().clone()
    }

    pub fn count_by_status(&self, status: PaymentStatus) -> usize {
        self.inner
            .rows
            .lock()
            .values()
            .filter(|r| r.status == status)
            .count()
    }
}

#[async_trait]
impl PaymentRepository for MemoryPaymentRepository {
    async fn open_session(&self, topic: QueueTopic) -> Result<Box<dyn ClaimSession>> {
        Ok(Box::new(MemoryClaimSession {
            topic,
            rx: self.inner.sender(topic).subscribe(),
            inner: self.inner.clone(),
        }))
    }

    async fn submit(&self, payment: NewPayment) -> Result<PaymentRecord> {
        let record = payment.into_record();
        {
            let mut rows = self.inner.rows.lock();
            if rows.contains_key(&record.correlation_id) {
                return Err(StoreError::duplicate(record.correlation_id));
            }
            rows.insert(record.correlation_id.clone(), record.clone());
        }
        self.inner.notify(QueueTopic::Payments, &record.correlation_id);
        Ok(record)
    }

    async fn recompute_threshold(&self, window: u64) -> Result<f64> {
        let mut completed: Vec<(DateTime<Utc>, f64)> = self
            .inner
            .rows
            .lock()
            .values()
            .filter(|r| r.status == PaymentStatus::Completed)
            .filter_map(|r| r.processed_at.map(|at| (at, r.amount)))
            .collect();
        completed.sort_by(|a, b| b.0.cmp(&a.0));

        let mut amounts: Vec<f64> = completed
            .into_iter()
            .take(window as usize)
            .map(|(_, amount)| amount)
            .collect();
        let threshold = median(&mut amounts);

        self.inner.thresholds.lock().push(threshold);
        Ok(threshold)
    }

    async fn find(&self, correlation_id: &str) -> Result<Option<PaymentRecord>> {
        Ok(self.inner.rows.lock().get(correlation_id).cloned())
    }

    async fn list(&self, limit: u32) -> Result<Vec<PaymentRecord>> {
        let mut records: Vec<PaymentRecord> = self.inner.rows.lock().values().cloned().collect();
        records.sort_by(|a, b| b.requested_at.cmp(&a.requested_at));
        records.truncate(limit as usize);
        Ok(records)
    }

    async fn summary(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<PaymentSummary> {
        let rows = self.inner.rows.lock();
        let mut summary = PaymentSummary::default();
        for row in rows.values() {
            if row.status != PaymentStatus::Completed {
                continue;
            }
            if from.is_some_and(|f| row.requested_at < f)
                || to.is_some_and(|t| row.requested_at > t)
            {
                continue;
            }
            if let Some(service) = row.service {
                summary.record(service, 1, row.amount);
            }
        }
        Ok(summary.rounded())
    }

    async fn purge(&self) -> Result<u64> {
        let deleted = {
            let mut rows = self.inner.rows.lock();
            let count = rows.len() as u64;
            rows.clear();
            count
        };
        self.inner.thresholds.lock().clear();
        Ok(deleted)
    }
}

/// Percentile-continuous median; 0 for an empty sample.
fn median(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

struct MemoryClaimSession {
    topic: QueueTopic,
    rx: broadcast::Receiver<String>,
    inner: Arc<Inner>,
}

#[async_trait]
impl ClaimSession for MemoryClaimSession {
    fn topic(&self) -> QueueTopic {
        self.topic
    }

    async fn next_notification(&mut self, timeout: Duration) -> Result<Option<Notification>> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Err(_) => Ok(None),
            Ok(Ok(payload)) => Ok(Some(Notification::new(self.topic.channel(), payload))),
            Ok(Err(RecvError::Lagged(skipped))) => {
                debug!(topic = %self.topic, skipped, "Notification receiver lagged");
                Ok(None)
            }
            Ok(Err(RecvError::Closed)) => Err(StoreError::ChannelClosed {
                channel: self.topic.channel().to_string(),
            }),
        }
    }

    async fn claim(&mut self, target: Option<&str>) -> Result<Option<Claim>> {
        let source = self.topic.source_status();
        let mut rows = self.inner.rows.lock();

        if let Some(id) = target {
            if let Some(row) = rows.get_mut(id) {
                if row.status == source {
                    row.status = PaymentStatus::Processing;
                    return Ok(Some(Claim {
                        payment: ClaimedPayment::from(&*row),
                        path: ClaimPath::Notified,
                    }));
                }
            }
        }

        let oldest = rows
            .values_mut()
            .filter(|r| r.status == source)
            .min_by(|a, b| {
                a.requested_at
                    .cmp(&b.requested_at)
                    .then_with(|| a.correlation_id.cmp(&b.correlation_id))
            });

        Ok(oldest.map(|row| {
            row.status = PaymentStatus::Processing;
            Claim {
                payment: ClaimedPayment::from(&*row),
                path: ClaimPath::Oldest,
            }
        }))
    }

    async fn complete(
        &mut self,
        correlation_id: &str,
        service: Service,
        processed_at: DateTime<Utc>,
    ) -> Result<bool> {
        Ok(self.inner.complete(correlation_id, service, processed_at))
    }

    async fn record_failure(
        &mut self,
        correlation_id: &str,
        max_retries: u32,
    ) -> Result<FailureOutcome> {
        Ok(self.inner.record_failure(correlation_id, max_retries))
    }
}
