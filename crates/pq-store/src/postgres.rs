//! PostgreSQL payment store
//!
//! Claims are conditional `UPDATE ... RETURNING` statements; the fallback
//! scan picks the oldest eligible row with `FOR UPDATE SKIP LOCKED` so
//! concurrent claimers each take a distinct row instead of queueing on the
//! same lock. Notifications are `pg_notify` calls issued inside the writing
//! transaction, so they are only delivered if the write commits.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pq_common::{
    ClaimedPayment, NewPayment, Notification, PaymentRecord, PaymentStatus, PaymentSummary,
    QueueTopic, Service,
};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgListener, PgRow};
use sqlx::{Connection, PgConnection, PgPool, Postgres, Row};
use tracing::{debug, info};

use crate::repository::{Claim, ClaimPath, ClaimSession, FailureOutcome, PaymentRepository};
use crate::{Result, StoreError};

const SCHEMA: [&str; 4] = [
    r#"
    CREATE TABLE IF NOT EXISTS payments (
        correlation_id TEXT PRIMARY KEY,
        amount DOUBLE PRECISION NOT NULL,
        requested_at TIMESTAMPTZ NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        retries INTEGER NOT NULL DEFAULT 0,
        processed_at TIMESTAMPTZ,
        service TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_payments_status_requested ON payments(status, requested_at)",
    r#"
    CREATE TABLE IF NOT EXISTS payment_metrics (
        id BIGSERIAL PRIMARY KEY,
        threshold DOUBLE PRECISION NOT NULL,
        sample_size BIGINT NOT NULL,
        computed_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_payments_completed
        ON payments(processed_at) WHERE status = 'completed'
    "#,
];

const CLAIM_NOTIFIED: &str = r#"
    UPDATE payments
    SET status = 'processing'
    WHERE correlation_id = $1 AND status = $2
    RETURNING correlation_id, amount, requested_at, retries
"#;

const CLAIM_OLDEST: &str = r#"
    UPDATE payments
    SET status = 'processing'
    WHERE correlation_id = (
        SELECT correlation_id
        FROM payments
        WHERE status = $1
        ORDER BY requested_at ASC
        LIMIT 1
        FOR UPDATE SKIP LOCKED
    )
    RETURNING correlation_id, amount, requested_at, retries
"#;

const RECORD_FAILURE: &str = r#"
    UPDATE payments
    SET retries = retries + 1,
        status = CASE WHEN retries + 1 >= $2 THEN 'failed' ELSE 'failing' END
    WHERE correlation_id = $1 AND status = 'processing'
    RETURNING status, retries
"#;

const RECOMPUTE_THRESHOLD: &str = r#"
    WITH recent AS (
        SELECT amount
        FROM payments
        WHERE status = 'completed'
        ORDER BY processed_at DESC
        LIMIT $1
    )
    INSERT INTO payment_metrics (threshold, sample_size)
    SELECT COALESCE(percentile_cont(0.5) WITHIN GROUP (ORDER BY amount), 0), COUNT(*)
    FROM recent
    RETURNING threshold
"#;

const SUMMARY: &str = r#"
    SELECT service, COUNT(*) AS total_requests, COALESCE(SUM(amount), 0) AS total_amount
    FROM payments
    WHERE status = 'completed'
      AND service IS NOT NULL
      AND ($1::timestamptz IS NULL OR requested_at >= $1)
      AND ($2::timestamptz IS NULL OR requested_at <= $2)
    GROUP BY service
"#;

const SELECT_RECORD: &str = r#"
    SELECT correlation_id, amount, requested_at, status, retries, processed_at, service
    FROM payments
"#;

pub struct PostgresPaymentRepository {
    pool: PgPool,
}

impl PostgresPaymentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("Payment schema ready (PostgreSQL)");
        Ok(())
    }
}

fn row_to_claimed(row: &PgRow) -> Result<ClaimedPayment> {
    Ok(ClaimedPayment {
        correlation_id: row.try_get("correlation_id")?,
        amount: row.try_get("amount")?,
        requested_at: row.try_get("requested_at")?,
        retries: row.try_get::<i32, _>("retries")?.max(0) as u32,
    })
}

fn row_to_record(row: &PgRow) -> Result<PaymentRecord> {
    let status: String = row.try_get("status")?;
    let service: Option<String> = row.try_get("service")?;
    Ok(PaymentRecord {
        correlation_id: row.try_get("correlation_id")?,
        amount: row.try_get("amount")?,
        requested_at: row.try_get("requested_at")?,
        status: status.parse()?,
        retries: row.try_get::<i32, _>("retries")?.max(0) as u32,
        processed_at: row.try_get("processed_at")?,
        service: service.map(|s| s.parse()).transpose()?,
    })
}

async fn complete_on(
    conn: &mut PgConnection,
    correlation_id: &str,
    service: Service,
    processed_at: DateTime<Utc>,
) -> Result<bool> {
    let updated = sqlx::query(
        r#"
        UPDATE payments
        SET status = 'completed', processed_at = $1, service = $2
        WHERE correlation_id = $3 AND status = 'processing'
        "#,
    )
    .bind(processed_at)
    .bind(service.as_str())
    .bind(correlation_id)
    .execute(&mut *conn)
    .await?
    .rows_affected();
    Ok(updated > 0)
}

async fn record_failure_on(
    conn: &mut PgConnection,
    correlation_id: &str,
    max_retries: u32,
) -> Result<FailureOutcome> {
    let mut tx = conn.begin().await?;

    let row = sqlx::query(RECORD_FAILURE)
        .bind(correlation_id)
        .bind(max_retries as i32)
        .fetch_optional(&mut *tx)
        .await?;

    let Some(row) = row else {
        tx.commit().await?;
        return Ok(FailureOutcome::NotHeld);
    };

    let status: String = row.try_get("status")?;
    let retries = row.try_get::<i32, _>("retries")?.max(0) as u32;

    let outcome = match status.parse::<PaymentStatus>()? {
        PaymentStatus::Failing => {
            sqlx::query("SELECT pg_notify($1, $2)")
                .bind(QueueTopic::Failing.channel())
                .bind(correlation_id)
                .execute(&mut *tx)
                .await?;
            FailureOutcome::Requeued { retries }
        }
        _ => FailureOutcome::Exhausted { retries },
    };

    tx.commit().await?;
    Ok(outcome)
}

#[async_trait]
impl PaymentRepository for PostgresPaymentRepository {
    async fn open_session(&self, topic: QueueTopic) -> Result<Box<dyn ClaimSession>> {
        let conn = self.pool.acquire().await?;
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(topic.channel()).await?;
        debug!(topic = %topic, "Claim session opened");
        Ok(Box::new(PostgresClaimSession { topic, conn, listener }))
    }

    async fn submit(&self, payment: NewPayment) -> Result<PaymentRecord> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO payments (correlation_id, amount, requested_at, status, retries)
            VALUES ($1, $2, $3, 'pending', 0)
            ON CONFLICT (correlation_id) DO NOTHING
            "#,
        )
        .bind(&payment.correlation_id)
        .bind(payment.amount)
        .bind(payment.requested_at)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            return Err(StoreError::duplicate(payment.correlation_id));
        }

        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(QueueTopic::Payments.channel())
            .bind(&payment.correlation_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(payment.into_record())
    }

    async fn recompute_threshold(&self, window: u64) -> Result<f64> {
        let threshold: f64 = sqlx::query_scalar(RECOMPUTE_THRESHOLD)
            .bind(window as i64)
            .fetch_one(&self.pool)
            .await?;
        Ok(threshold)
    }

    async fn find(&self, correlation_id: &str) -> Result<Option<PaymentRecord>> {
        let row = sqlx::query(&format!("{} WHERE correlation_id = $1", SELECT_RECORD))
            .bind(correlation_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_record).transpose()
    }

    async fn list(&self, limit: u32) -> Result<Vec<PaymentRecord>> {
        let rows = sqlx::query(&format!("{} ORDER BY requested_at DESC LIMIT $1", SELECT_RECORD))
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_record).collect()
    }

    async fn summary(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<PaymentSummary> {
        let rows = sqlx::query(SUMMARY)
            .bind(from)
            .bind(to)
            .fetch_all(&self.pool)
            .await?;

        let mut summary = PaymentSummary::default();
        for row in rows {
            let service: String = row.try_get("service")?;
            let requests: i64 = row.try_get("total_requests")?;
            let amount: f64 = row.try_get("total_amount")?;
            summary.record(service.parse()?, requests.max(0) as u64, amount);
        }
        Ok(summary.rounded())
    }

    async fn purge(&self) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let deleted = sqlx::query("DELETE FROM payments")
            .execute(&mut *tx)
            .await?
            .rows_affected();
        sqlx::query("DELETE FROM payment_metrics")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        info!(deleted, "Purged payments");
        Ok(deleted)
    }
}

/// Holds one pooled connection for claims and finalize writes and one
/// listener connection for the topic channel, both for the lifetime of the
/// worker. Each session therefore takes two connections from the pool.
struct PostgresClaimSession {
    topic: QueueTopic,
    conn: PoolConnection<Postgres>,
    listener: PgListener,
}

#[async_trait]
impl ClaimSession for PostgresClaimSession {
    fn topic(&self) -> QueueTopic {
        self.topic
    }

    async fn next_notification(&mut self, timeout: Duration) -> Result<Option<Notification>> {
        match tokio::time::timeout(timeout, self.listener.recv()).await {
            Err(_) => Ok(None),
            Ok(Ok(notification)) => Ok(Some(Notification::new(
                notification.channel(),
                notification.payload(),
            ))),
            Ok(Err(e)) => Err(e.into()),
        }
    }

    async fn claim(&mut self, target: Option<&str>) -> Result<Option<Claim>> {
        let source = self.topic.source_status();
        let mut tx = self.conn.begin().await?;

        if let Some(id) = target {
            let row = sqlx::query(CLAIM_NOTIFIED)
                .bind(id)
                .bind(source.as_str())
                .fetch_optional(&mut *tx)
                .await?;
            if let Some(row) = row {
                let payment = row_to_claimed(&row)?;
                tx.commit().await?;
                return Ok(Some(Claim { payment, path: ClaimPath::Notified }));
            }
        }

        let row = sqlx::query(CLAIM_OLDEST)
            .bind(source.as_str())
            .fetch_optional(&mut *tx)
            .await?;

        match row {
            Some(row) => {
                let payment = row_to_claimed(&row)?;
                tx.commit().await?;
                Ok(Some(Claim { payment, path: ClaimPath::Oldest }))
            }
            None => {
                tx.commit().await?;
                Ok(None)
            }
        }
    }

    async fn complete(
        &mut self,
        correlation_id: &str,
        service: Service,
        processed_at: DateTime<Utc>,
    ) -> Result<bool> {
        complete_on(&mut self.conn, correlation_id, service, processed_at).await
    }

    async fn record_failure(
        &mut self,
        correlation_id: &str,
        max_retries: u32,
    ) -> Result<FailureOutcome> {
        record_failure_on(&mut self.conn, correlation_id, max_retries).await
    }
}
