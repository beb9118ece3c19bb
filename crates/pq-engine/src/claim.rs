//! Claim Loop - the wait-then-claim cycle every queue worker runs
//!
//! Phase one waits (bounded) for a notification on the session's topic.
//! Phase two claims a row: the notified row if it is still eligible,
//! otherwise the oldest eligible one. Consecutive empty waits eventually
//! trigger a sweep, a claim with no target, so rows whose notification was
//! dropped are still picked up.

use std::time::Duration;

use pq_store::{Claim, ClaimSession};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct ClaimLoopConfig {
    /// Bound on a single notification wait
    pub notification_timeout: Duration,
    /// Sweep after this many consecutive waits without a notification
    pub sweep_every: u32,
}

impl Default for ClaimLoopConfig {
    fn default() -> Self {
        Self {
            notification_timeout: Duration::from_millis(100),
            sweep_every: 10,
        }
    }
}

/// Result of one claim cycle
#[derive(Debug)]
pub enum ClaimPoll {
    /// The cancellation token fired; no claim was attempted
    Cancelled,
    /// The wait timed out and no sweep was due
    Idle,
    /// A claim was attempted and nothing was eligible
    Empty,
    Claimed(Claim),
}

pub struct ClaimLoop {
    config: ClaimLoopConfig,
    idle_waits: u32,
}

impl ClaimLoop {
    pub fn new(config: ClaimLoopConfig) -> Self {
        Self { config, idle_waits: 0 }
    }

    pub async fn poll(
        &mut self,
        session: &mut dyn ClaimSession,
        cancel: &CancellationToken,
    ) -> pq_store::Result<ClaimPoll> {
        if cancel.is_cancelled() {
            return Ok(ClaimPoll::Cancelled);
        }

        let notification = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(ClaimPoll::Cancelled),
            next = session.next_notification(self.config.notification_timeout) => next?,
        };

        let target = match notification {
            Some(notification) => {
                self.idle_waits = 0;
                match notification.decode() {
                    Ok(payload) => Some(payload.correlation_id().to_string()),
                    Err(e) => {
                        // Something changed on the topic; scan for it.
                        warn!(
                            channel = %notification.channel,
                            error = %e,
                            "Undecodable notification payload, falling back to scan"
                        );
                        None
                    }
                }
            }
            None => {
                self.idle_waits += 1;
                if self.idle_waits < self.config.sweep_every {
                    return Ok(ClaimPoll::Idle);
                }
                self.idle_waits = 0;
                debug!(topic = %session.topic(), "Sweeping for unannounced rows");
                None
            }
        };

        match session.claim(target.as_deref()).await? {
            Some(claim) => {
                debug!(
                    topic = %session.topic(),
                    correlation_id = %claim.payment.correlation_id,
                    path = ?claim.path,
                    "Claimed payment"
                );
                Ok(ClaimPoll::Claimed(claim))
            }
            None => Ok(ClaimPoll::Empty),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use pq_common::{ClaimedPayment, Notification, QueueTopic, Service};
    use pq_store::{ClaimPath, FailureOutcome};

    /// Scripted session: each wait pops one entry (None = timeout), and every
    /// claim records its target and succeeds if any rows remain.
    struct FakeSession {
        waits: VecDeque<Option<Notification>>,
        claim_targets: Vec<Option<String>>,
        rows: VecDeque<String>,
    }

    impl FakeSession {
        fn new(waits: Vec<Option<&str>>, rows: Vec<&str>) -> Self {
            Self {
                waits: waits
                    .into_iter()
                    .map(|w| w.map(|p| Notification::new("payments_queue", p)))
                    .collect(),
                claim_targets: Vec::new(),
                rows: rows.into_iter().map(String::from).collect(),
            }
        }
    }

    #[async_trait]
    impl ClaimSession for FakeSession {
        fn topic(&self) -> QueueTopic {
            QueueTopic::Payments
        }

        async fn next_notification(
            &mut self,
            timeout: Duration,
        ) -> pq_store::Result<Option<Notification>> {
            match self.waits.pop_front() {
                Some(Some(notification)) => Ok(Some(notification)),
                _ => {
                    tokio::time::sleep(timeout).await;
                    Ok(None)
                }
            }
        }

        async fn claim(&mut self, target: Option<&str>) -> pq_store::Result<Option<Claim>> {
            self.claim_targets.push(target.map(String::from));
            Ok(self.rows.pop_front().map(|id| Claim {
                payment: ClaimedPayment {
                    correlation_id: id,
                    amount: 1.0,
                    requested_at: Utc::now(),
                    retries: 0,
                },
                path: if target.is_some() { ClaimPath::Notified } else { ClaimPath::Oldest },
            }))
        }

        async fn complete(
            &mut self,
            _correlation_id: &str,
            _service: Service,
            _processed_at: DateTime<Utc>,
        ) -> pq_store::Result<bool> {
            Ok(true)
        }

        async fn record_failure(
            &mut self,
            _correlation_id: &str,
            _max_retries: u32,
        ) -> pq_store::Result<FailureOutcome> {
            Ok(FailureOutcome::NotHeld)
        }
    }

    fn claim_loop(sweep_every: u32) -> ClaimLoop {
        ClaimLoop::new(ClaimLoopConfig {
            notification_timeout: Duration::from_millis(100),
            sweep_every,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_notification_targets_row() {
        let mut session = FakeSession::new(vec![Some("A")], vec!["A"]);
        let cancel = CancellationToken::new();
        let mut claims = claim_loop(10);

        let poll = claims.poll(&mut session, &cancel).await.unwrap();
        assert!(matches!(poll, ClaimPoll::Claimed(ref c) if c.payment.correlation_id == "A"));
        assert_eq!(session.claim_targets, vec![Some("A".to_string())]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_json_payload_targets_row() {
        let payload = r#"{"correlationId":"J","amount":10.0,"requestedAt":"2025-07-01T12:00:00Z"}"#;
        let mut session = FakeSession::new(vec![Some(payload)], vec![]);
        let cancel = CancellationToken::new();

        let poll = claim_loop(10).poll(&mut session, &cancel).await.unwrap();
        assert!(matches!(poll, ClaimPoll::Empty));
        assert_eq!(session.claim_targets, vec![Some("J".to_string())]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_are_idle_until_sweep() {
        let mut session = FakeSession::new(vec![], vec!["orphan"]);
        let cancel = CancellationToken::new();
        let mut claims = claim_loop(3);
        let started = tokio::time::Instant::now();

        assert!(matches!(claims.poll(&mut session, &cancel).await.unwrap(), ClaimPoll::Idle));
        assert!(matches!(claims.poll(&mut session, &cancel).await.unwrap(), ClaimPoll::Idle));
        assert!(session.claim_targets.is_empty());

        let poll = claims.poll(&mut session, &cancel).await.unwrap();
        assert!(matches!(poll, ClaimPoll::Claimed(ref c) if c.path == ClaimPath::Oldest));
        assert_eq!(session.claim_targets, vec![None]);
        assert!(started.elapsed() >= Duration::from_millis(300));

        // Counter restarts after a sweep.
        assert!(matches!(claims.poll(&mut session, &cancel).await.unwrap(), ClaimPoll::Idle));
    }

    #[tokio::test(start_paused = true)]
    async fn test_notification_resets_idle_count() {
        let mut session = FakeSession::new(vec![None, Some("A"), None, None], vec!["A"]);
        let cancel = CancellationToken::new();
        let mut claims = claim_loop(3);

        assert!(matches!(claims.poll(&mut session, &cancel).await.unwrap(), ClaimPoll::Idle));
        assert!(matches!(claims.poll(&mut session, &cancel).await.unwrap(), ClaimPoll::Claimed(_)));
        assert!(matches!(claims.poll(&mut session, &cancel).await.unwrap(), ClaimPoll::Idle));
        assert!(matches!(claims.poll(&mut session, &cancel).await.unwrap(), ClaimPoll::Idle));
        assert_eq!(session.claim_targets.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_undecodable_payload_scans() {
        let mut session = FakeSession::new(vec![Some("{broken")], vec![]);
        let cancel = CancellationToken::new();

        let poll = claim_loop(10).poll(&mut session, &cancel).await.unwrap();
        assert!(matches!(poll, ClaimPoll::Empty));
        assert_eq!(session.claim_targets, vec![None]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_wait() {
        let mut session = FakeSession::new(vec![], vec!["A"]);
        let cancel = CancellationToken::new();
        let mut claims = ClaimLoop::new(ClaimLoopConfig {
            notification_timeout: Duration::from_secs(60),
            sweep_every: 1,
        });

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let poll = claims.poll(&mut session, &cancel).await.unwrap();
        assert!(matches!(poll, ClaimPoll::Cancelled));
        assert!(session.claim_targets.is_empty());

        // Already cancelled: returns without waiting.
        let poll = claims.poll(&mut session, &cancel).await.unwrap();
        assert!(matches!(poll, ClaimPoll::Cancelled));
    }
}
