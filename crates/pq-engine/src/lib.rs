//! PayQueue Payment Engine
//!
//! This crate drives payments from `pending` to a terminal status:
//! - ClaimLoop: two-phase claim protocol (wait for a notification, then claim)
//! - TopicRegistry: named worker pools with per-topic cancellation
//! - PaymentRouter: gateway selection, downstream call, status finalization
//! - HttpGateway: default/fallback payment processor client
//! - ThresholdUpdater: rolling threshold recomputation every N payments
//! - PaymentEngine: wires the three pools together from `EngineConfig`

pub mod error;
pub mod claim;
pub mod registry;
pub mod gateway;
pub mod state;
pub mod router;
pub mod threshold;
pub mod worker;
pub mod engine;

pub use error::{EngineError, GatewayError};
pub use claim::{ClaimLoop, ClaimLoopConfig, ClaimPoll};
pub use registry::{TopicHandler, TopicRegistry, WorkerContext};
pub use gateway::{HttpGateway, PaymentGateway};
pub use state::RoutingState;
pub use router::{PaymentRouter, RouteOutcome};
pub use threshold::ThresholdUpdater;
pub use worker::PaymentQueueWorker;
pub use engine::PaymentEngine;

pub type Result<T> = std::result::Result<T, EngineError>;
