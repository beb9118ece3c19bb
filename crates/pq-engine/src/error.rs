//! Engine Error Types

use pq_common::CodecError;
use pq_store::StoreError;
use thiserror::Error;

/// A failed downstream call. Always drives a retry/fail transition, never a
/// process-level error.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Gateway transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Gateway returned HTTP {status}")]
    Status { status: u16 },

    #[error("Payload encode error: {0}")]
    Encode(#[from] CodecError),
}

impl GatewayError {
    pub fn status(status: u16) -> Self {
        Self::Status { status }
    }
}

/// Failure to move a claimed payment to its next status. The row stays
/// `processing`; the worker logs it and keeps going.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}
