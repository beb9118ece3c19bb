//! Store Error Types

use pq_common::CodecError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Payment already exists: {correlation_id}")]
    Duplicate { correlation_id: String },

    #[cfg(feature = "postgres")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Decode error: {0}")]
    Decode(#[from] CodecError),

    #[error("Notification channel closed: {channel}")]
    ChannelClosed { channel: String },
}

impl StoreError {
    pub fn duplicate(correlation_id: impl Into<String>) -> Self {
        Self::Duplicate { correlation_id: correlation_id.into() }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, StoreError::Duplicate { .. })
    }
}
