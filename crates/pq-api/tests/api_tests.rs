//! API Endpoint Tests
//!
//! Tests for:
//! - Payment submission and validation
//! - Lookup and listing
//! - Summary over completed payments
//! - Purge and health

use std::sync::Arc;

use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
};
use chrono::{TimeZone, Utc};
use http_body_util::BodyExt;
use tower::ServiceExt;

use pq_api::{create_router, AppState, HealthResponse, PurgeResponse};
use pq_common::{
    NewPayment, PaymentRecord, PaymentStatus, PaymentSummary, QueueTopic, RoutingPolicy, Service,
};
use pq_engine::RoutingState;
use pq_store::{MemoryPaymentRepository, PaymentRepository};

fn create_test_app() -> (axum::Router, MemoryPaymentRepository, Arc<RoutingState>) {
    let repo = MemoryPaymentRepository::new();
    let routing = Arc::new(RoutingState::new(RoutingPolicy::default(), 10));
    let app = create_router(AppState {
        repository: Arc::new(repo.clone()),
        routing: routing.clone(),
    });
    (app, repo, routing)
}

async fn send(
    app: &axum::Router,
    method: Method,
    uri: &str,
    body: Option<&str>,
) -> (StatusCode, Vec<u8>) {
    let mut request = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(json) => {
            request = request.header("content-type", "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };

    let response = app.clone().oneshot(request.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, bytes.to_vec())
}

async fn complete(repo: &MemoryPaymentRepository, payment: NewPayment, service: Service) {
    let id = payment.correlation_id.clone();
    repo.insert_silently(payment).unwrap();
    let mut session = repo.open_session(QueueTopic::Payments).await.unwrap();
    session.claim(Some(&id)).await.unwrap().unwrap();
    session.complete(&id, service, Utc::now()).await.unwrap();
}

#[tokio::test]
async fn test_submit_payment_created() {
    let (app, repo, _) = create_test_app();

    let (status, body) = send(
        &app,
        Method::POST,
        "/payments",
        Some(r#"{"correlationId":"A","amount":100.0}"#),
    )
    .await;

    assert_eq!(status, StatusCode::CREATED);
    let record: PaymentRecord = serde_json::from_slice(&body).unwrap();
    assert_eq!(record.correlation_id, "A");
    assert_eq!(record.status, PaymentStatus::Pending);
    assert_eq!(repo.count_by_status(PaymentStatus::Pending), 1);
}

#[tokio::test]
async fn test_submit_duplicate_conflict() {
    let (app, _, _) = create_test_app();
    let body = r#"{"correlationId":"dup","amount":10}"#;

    let (status, _) = send(&app, Method::POST, "/payments", Some(body)).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = send(&app, Method::POST, "/payments", Some(body)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    let error: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(error["error"], "CONFLICT");
}

#[tokio::test]
async fn test_submit_validation() {
    let (app, repo, _) = create_test_app();

    for body in [
        r#"{"correlationId":"","amount":10}"#,
        r#"{"correlationId":"neg","amount":-1}"#,
        r#"{"correlationId":"zero","amount":0}"#,
        r#"{"correlationId":"x"}"#,
        "not json",
    ] {
        let (status, _) = send(&app, Method::POST, "/payments", Some(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "body: {body}");
    }
    assert!(repo.list(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_get_payment() {
    let (app, repo, _) = create_test_app();
    repo.submit(NewPayment::new("known", 42.5)).await.unwrap();

    let (status, body) = send(&app, Method::GET, "/payments/known", None).await;
    assert_eq!(status, StatusCode::OK);
    let record: PaymentRecord = serde_json::from_slice(&body).unwrap();
    assert_eq!(record.amount, 42.5);

    let (status, _) = send(&app, Method::GET, "/payments/unknown", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_list_payments_with_limit() {
    let (app, repo, _) = create_test_app();
    for i in 0..5 {
        repo.submit(NewPayment::new(format!("p{i}"), 1.0)).await.unwrap();
    }

    let (status, body) = send(&app, Method::GET, "/payments?limit=3", None).await;
    assert_eq!(status, StatusCode::OK);
    let records: Vec<PaymentRecord> = serde_json::from_slice(&body).unwrap();
    assert_eq!(records.len(), 3);

    let (_, body) = send(&app, Method::GET, "/payments", None).await;
    let records: Vec<PaymentRecord> = serde_json::from_slice(&body).unwrap();
    assert_eq!(records.len(), 5);
}

#[tokio::test]
async fn test_payments_summary() {
    let (app, repo, _) = create_test_app();
    let at = |second| Utc.with_ymd_and_hms(2025, 7, 1, 12, 0, second).unwrap();

    for (id, amount, second, service) in [
        ("d1", 19.9, 1, Service::Default),
        ("d2", 19.9, 2, Service::Default),
        ("f1", 5.5, 3, Service::Fallback),
        ("out", 1.0, 30, Service::Fallback),
    ] {
        let payment = NewPayment {
            correlation_id: id.to_string(),
            amount,
            requested_at: at(second),
        };
        complete(&repo, payment, service).await;
    }

    let (status, body) = send(
        &app,
        Method::GET,
        "/payments-summary?from=2025-07-01T12:00:00Z&to=2025-07-01T12:00:10Z",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["default"]["totalRequests"], 2);
    assert_eq!(json["default"]["totalAmount"], 39.8);
    assert_eq!(json["fallback"]["totalRequests"], 1);

    let (_, body) = send(&app, Method::GET, "/payments-summary", None).await;
    let summary: PaymentSummary = serde_json::from_slice(&body).unwrap();
    assert_eq!(summary.fallback.total_requests, 2);

    let (status, _) = send(
        &app,
        Method::GET,
        "/payments-summary?from=2025-07-02T00:00:00Z&to=2025-07-01T00:00:00Z",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_purge_payments() {
    let (app, repo, _) = create_test_app();
    repo.submit(NewPayment::new("a", 1.0)).await.unwrap();
    repo.submit(NewPayment::new("b", 1.0)).await.unwrap();

    let (status, body) = send(&app, Method::POST, "/purge-payments", None).await;
    assert_eq!(status, StatusCode::OK);
    let purge: PurgeResponse = serde_json::from_slice(&body).unwrap();
    assert_eq!(purge.deleted, 2);
    assert!(repo.list(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_health_reports_routing_state() {
    let (app, _, routing) = create_test_app();
    routing.publish_threshold(123.45);
    routing.record_processed();

    let (status, body) = send(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    let health: HealthResponse = serde_json::from_slice(&body).unwrap();
    assert_eq!(health.status, "UP");
    assert_eq!(health.threshold, 123.45);
    assert_eq!(health.processed, 1);
}
