//! Topic Registry - named worker pools under one shutdown signal
//!
//! Pools are described once during initialization (`subscribe`), then
//! `start` spawns one task per (topic, slot). Every topic gets a child of
//! the registry's shutdown token, so a topic can be cancelled alone or all
//! together by `stop`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Handed to each worker task
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub topic: String,
    pub slot: usize,
    pub cancel: CancellationToken,
}

/// Body of a worker. Runs until `ctx.cancel` fires; must observe the token
/// at least once per wait cycle.
#[async_trait]
pub trait TopicHandler: Send + Sync + 'static {
    async fn run(&self, ctx: WorkerContext) -> anyhow::Result<()>;
}

struct TopicPool {
    topic: String,
    pool_size: usize,
    handler: Arc<dyn TopicHandler>,
    cancel: CancellationToken,
}

pub struct TopicRegistry {
    shutdown: CancellationToken,
    pools: Vec<TopicPool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl Default for TopicRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::with_shutdown(CancellationToken::new())
    }

    /// Derive every topic's token from an existing process-wide token.
    pub fn with_shutdown(shutdown: CancellationToken) -> Self {
        Self {
            shutdown,
            pools: Vec::new(),
            handles: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    /// Register `handler` to run `pool_size` times concurrently on `topic`.
    /// A repeated topic replaces the earlier registration.
    pub fn subscribe(
        &mut self,
        topic: impl Into<String>,
        pool_size: usize,
        handler: Arc<dyn TopicHandler>,
    ) {
        let topic = topic.into();
        self.unsubscribe(&topic);
        self.pools.push(TopicPool {
            cancel: self.shutdown.child_token(),
            topic,
            pool_size,
            handler,
        });
    }

    /// Remove a topic and cancel its workers if they were started.
    pub fn unsubscribe(&mut self, topic: &str) -> bool {
        match self.pools.iter().position(|p| p.topic == topic) {
            Some(index) => {
                let pool = self.pools.remove(index);
                pool.cancel.cancel();
                info!(topic = %pool.topic, "Topic unsubscribed");
                true
            }
            None => false,
        }
    }

    pub fn topics(&self) -> Vec<(&str, usize)> {
        self.pools.iter().map(|p| (p.topic.as_str(), p.pool_size)).collect()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Spawn every (topic, slot) worker. Later calls are no-ops.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("Topic registry already started");
            return;
        }

        let mut handles = self.handles.lock();
        for pool in &self.pools {
            info!(topic = %pool.topic, pool_size = pool.pool_size, "Starting topic pool");

            for slot in 0..pool.pool_size {
                let handler = pool.handler.clone();
                let ctx = WorkerContext {
                    topic: pool.topic.clone(),
                    slot,
                    cancel: pool.cancel.clone(),
                };

                handles.push(tokio::spawn(async move {
                    let topic = ctx.topic.clone();
                    info!(topic = %topic, slot = slot, "Worker started");
                    match handler.run(ctx).await {
                        Ok(()) => info!(topic = %topic, slot = slot, "Worker stopped"),
                        Err(e) => error!(
                            topic = %topic,
                            slot = slot,
                            error = %e,
                            "Worker exited with error"
                        ),
                    }
                }));
            }
        }
    }

    /// Signal every topic to stop. Safe to call repeatedly.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(topics = self.pools.len(), "Stopping topic registry");
        self.shutdown.cancel();
    }

    /// Wait for spawned workers to exit. Returns false if `timeout` elapsed
    /// first; the remaining workers are left running.
    pub async fn join(&self, timeout: Duration) -> bool {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());
        if handles.is_empty() {
            return true;
        }

        match tokio::time::timeout(timeout, join_all(handles)).await {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        error!(error = %e, "Worker task panicked");
                    }
                }
                true
            }
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "Workers did not stop in time");
                false
            }
        }
    }
}
