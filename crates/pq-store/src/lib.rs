//! PayQueue Payment Store
//!
//! The payment table is the single source of truth for claim ownership.
//! Every state transition is a conditional update against it; notifications
//! on top of it are a best-effort wake-up signal only.
//!
//! Backends:
//! - `memory`: mutex-serialized rows and broadcast channels, for tests and local dev
//! - `postgres` (feature): `LISTEN/NOTIFY` plus `FOR UPDATE SKIP LOCKED` claims

pub mod error;
pub mod repository;
pub mod memory;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use error::StoreError;
pub use repository::{Claim, ClaimPath, ClaimSession, FailureOutcome, PaymentRepository};
pub use memory::MemoryPaymentRepository;

#[cfg(feature = "postgres")]
pub use postgres::PostgresPaymentRepository;

pub type Result<T> = std::result::Result<T, StoreError>;
