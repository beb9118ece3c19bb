//! PayQueue API
//!
//! HTTP endpoints for:
//! - Payment submission (insert + notify)
//! - Payment lookup and listing
//! - Per-gateway summary of completed payments
//! - Administrative purge
//! - Health with the current routing threshold

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use pq_common::{NewPayment, PaymentRecord, PaymentSummary};
use pq_engine::RoutingState;
use pq_store::PaymentRepository;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub mod error;

pub use error::ApiError;

pub type Result<T> = std::result::Result<T, ApiError>;

const DEFAULT_LIST_LIMIT: u32 = 100;
const MAX_LIST_LIMIT: u32 = 1_000;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub repository: Arc<dyn PaymentRepository>,
    pub routing: Arc<RoutingState>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitPaymentRequest {
    pub correlation_id: String,
    pub amount: f64,
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct SummaryParams {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PurgeResponse {
    pub deleted: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub threshold: f64,
    pub processed: u64,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/payments", post(submit_payment).get(list_payments))
        .route("/payments/:correlation_id", get(get_payment))
        .route("/payments-summary", get(payments_summary))
        .route("/purge-payments", post(purge_payments))
        .route("/health", get(health))
        .with_state(state)
}

async fn submit_payment(
    State(state): State<AppState>,
    body: std::result::Result<Json<SubmitPaymentRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<PaymentRecord>)> {
    let Json(request) = body.map_err(|e| ApiError::bad_request(e.body_text()))?;

    let correlation_id = request.correlation_id.trim();
    if correlation_id.is_empty() {
        return Err(ApiError::bad_request("correlationId must not be empty"));
    }
    if !request.amount.is_finite() || request.amount <= 0.0 {
        return Err(ApiError::bad_request("amount must be a positive number"));
    }

    let record = state
        .repository
        .submit(NewPayment::new(correlation_id, request.amount))
        .await?;

    debug!(correlation_id = %record.correlation_id, amount = record.amount, "Payment accepted");
    Ok((StatusCode::CREATED, Json(record)))
}

async fn get_payment(
    State(state): State<AppState>,
    Path(correlation_id): Path<String>,
) -> Result<Json<PaymentRecord>> {
    state
        .repository
        .find(&correlation_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("Payment not found: {}", correlation_id)))
}

async fn list_payments(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<PaymentRecord>>> {
    let limit = params.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
    Ok(Json(state.repository.list(limit).await?))
}

async fn payments_summary(
    State(state): State<AppState>,
    Query(params): Query<SummaryParams>,
) -> Result<Json<PaymentSummary>> {
    if let (Some(from), Some(to)) = (params.from, params.to) {
        if from > to {
            return Err(ApiError::bad_request("from must not be after to"));
        }
    }
    Ok(Json(state.repository.summary(params.from, params.to).await?))
}

async fn purge_payments(State(state): State<AppState>) -> Result<Json<PurgeResponse>> {
    let deleted = state.repository.purge().await?;
    info!(deleted = deleted, "Payments purged via API");
    Ok(Json(PurgeResponse { deleted }))
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "UP".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        threshold: state.routing.threshold(),
        processed: state.routing.processed(),
    })
}
