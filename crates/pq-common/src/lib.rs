use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Errors
// ============================================================================

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Empty notification payload")]
    EmptyPayload,

    #[error("Unknown payment status: {0}")]
    UnknownStatus(String),

    #[error("Unknown service: {0}")]
    UnknownService(String),

    #[error("Unknown routing policy: {0}")]
    UnknownPolicy(String),
}

// ============================================================================
// Payment State
// ============================================================================

/// Lifecycle of a payment row.
///
/// `pending -> processing -> completed`, or
/// `processing -> failing -> processing -> ... -> completed | failed`.
/// A row never returns to `pending`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Processing,
    Completed,
    Failing,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Processing => "processing",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failing => "failing",
            PaymentStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PaymentStatus::Pending),
            "processing" => Ok(PaymentStatus::Processing),
            "completed" => Ok(PaymentStatus::Completed),
            "failing" => Ok(PaymentStatus::Failing),
            "failed" => Ok(PaymentStatus::Failed),
            other => Err(CodecError::UnknownStatus(other.to_string())),
        }
    }
}

/// Downstream gateway that handled a payment
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Service {
    Default,
    Fallback,
}

impl Service {
    pub fn as_str(&self) -> &'static str {
        match self {
            Service::Default => "default",
            Service::Fallback => "fallback",
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Service {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(Service::Default),
            "fallback" => Ok(Service::Fallback),
            other => Err(CodecError::UnknownService(other.to_string())),
        }
    }
}

// ============================================================================
// Payment Records
// ============================================================================

/// A payment row as stored
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRecord {
    pub correlation_id: String,
    pub amount: f64,
    pub requested_at: DateTime<Utc>,
    pub status: PaymentStatus,
    pub retries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<Service>,
}

/// A submission accepted at the HTTP boundary, not yet stored
#[derive(Debug, Clone, PartialEq)]
pub struct NewPayment {
    pub correlation_id: String,
    pub amount: f64,
    pub requested_at: DateTime<Utc>,
}

impl NewPayment {
    pub fn new(correlation_id: impl Into<String>, amount: f64) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            amount,
            requested_at: Utc::now(),
        }
    }

    pub fn into_record(self) -> PaymentRecord {
        PaymentRecord {
            correlation_id: self.correlation_id,
            amount: self.amount,
            requested_at: self.requested_at,
            status: PaymentStatus::Pending,
            retries: 0,
            processed_at: None,
            service: None,
        }
    }
}

/// Fields returned by a successful claim. The holder owns the processing
/// lease on `correlation_id` until it writes a completed/failing/failed status.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedPayment {
    pub correlation_id: String,
    pub amount: f64,
    pub requested_at: DateTime<Utc>,
    pub retries: u32,
}

impl ClaimedPayment {
    pub fn payload(&self) -> PaymentPayload {
        PaymentPayload {
            correlation_id: self.correlation_id.clone(),
            amount: self.amount,
            requested_at: self.requested_at,
        }
    }
}

impl From<&PaymentRecord> for ClaimedPayment {
    fn from(record: &PaymentRecord) -> Self {
        Self {
            correlation_id: record.correlation_id.clone(),
            amount: record.amount,
            requested_at: record.requested_at,
            retries: record.retries,
        }
    }
}

// ============================================================================
// Wire Codec
// ============================================================================

/// Body sent to a gateway and the full-payload notification variant
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PaymentPayload {
    pub correlation_id: String,
    pub amount: f64,
    pub requested_at: DateTime<Utc>,
}

impl PaymentPayload {
    pub fn encode(&self) -> Result<String, CodecError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(data: &str) -> Result<Self, CodecError> {
        Ok(serde_json::from_str(data)?)
    }
}

/// What a topic notification carries: either the bare correlation id of the
/// row that changed, or a JSON-encoded [`PaymentPayload`].
#[derive(Debug, Clone, PartialEq)]
pub enum NotificationPayload {
    CorrelationId(String),
    Payment(PaymentPayload),
}

impl NotificationPayload {
    pub fn decode(raw: &str) -> Result<Self, CodecError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(CodecError::EmptyPayload);
        }
        if trimmed.starts_with('{') {
            return Ok(NotificationPayload::Payment(PaymentPayload::decode(trimmed)?));
        }
        Ok(NotificationPayload::CorrelationId(trimmed.to_string()))
    }

    pub fn encode(&self) -> Result<String, CodecError> {
        match self {
            NotificationPayload::CorrelationId(id) => Ok(id.clone()),
            NotificationPayload::Payment(payload) => payload.encode(),
        }
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            NotificationPayload::CorrelationId(id) => id,
            NotificationPayload::Payment(payload) => &payload.correlation_id,
        }
    }
}

/// A notification as delivered on a channel
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub channel: String,
    pub payload: String,
}

impl Notification {
    pub fn new(channel: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            payload: payload.into(),
        }
    }

    pub fn decode(&self) -> Result<NotificationPayload, CodecError> {
        NotificationPayload::decode(&self.payload)
    }
}

// ============================================================================
// Topics
// ============================================================================

/// Topic of the single-worker pool that recomputes the routing threshold
pub const WATCHER_TOPIC: &str = "processed_watcher";

/// A claimable work queue: the notification channel plus the status a row
/// must be in to be claimed from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueTopic {
    Payments,
    Failing,
}

impl QueueTopic {
    pub fn channel(&self) -> &'static str {
        match self {
            QueueTopic::Payments => "payments_queue",
            QueueTopic::Failing => "payments_failing_queue",
        }
    }

    pub fn source_status(&self) -> PaymentStatus {
        match self {
            QueueTopic::Payments => PaymentStatus::Pending,
            QueueTopic::Failing => PaymentStatus::Failing,
        }
    }
}

impl fmt::Display for QueueTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.channel())
    }
}

// ============================================================================
// Routing
// ============================================================================

/// Which side of the rolling threshold goes to the fallback gateway.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RoutingPolicy {
    /// `amount < threshold` routes to fallback
    #[default]
    FallbackBelowThreshold,
    /// `threshold < amount` routes to fallback
    FallbackAboveThreshold,
}

impl RoutingPolicy {
    pub fn select(&self, amount: f64, threshold: f64) -> Service {
        let to_fallback = match self {
            RoutingPolicy::FallbackBelowThreshold => amount < threshold,
            RoutingPolicy::FallbackAboveThreshold => threshold < amount,
        };
        if to_fallback {
            Service::Fallback
        } else {
            Service::Default
        }
    }
}

impl FromStr for RoutingPolicy {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fallback_below_threshold" => Ok(RoutingPolicy::FallbackBelowThreshold),
            "fallback_above_threshold" => Ok(RoutingPolicy::FallbackAboveThreshold),
            other => Err(CodecError::UnknownPolicy(other.to_string())),
        }
    }
}

// ============================================================================
// Reporting
// ============================================================================

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSummary {
    pub total_requests: u64,
    pub total_amount: f64,
}

/// Completed payments aggregated per gateway
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct PaymentSummary {
    pub default: ServiceSummary,
    pub fallback: ServiceSummary,
}

impl PaymentSummary {
    pub fn record(&mut self, service: Service, requests: u64, amount: f64) {
        let entry = match service {
            Service::Default => &mut self.default,
            Service::Fallback => &mut self.fallback,
        };
        entry.total_requests += requests;
        entry.total_amount += amount;
    }

    /// Round totals to cents
    pub fn rounded(mut self) -> Self {
        self.default.total_amount = (self.default.total_amount * 100.0).round() / 100.0;
        self.fallback.total_amount = (self.fallback.total_amount * 100.0).round() / 100.0;
        self
    }
}
