mod common;

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tower::ServiceExt;

use ledger_core::create_app;
use ledger_core::handlers::webhook::{DEPOSIT_SIGNATURE, WITHDRAW_NATIVE_SIGNATURE};
use ledger_core::middleware::webhook_auth::{sign_body, SIGNATURE_HEADER};
use ledger_core::services::request_queue::registry::HandlerRegistry;
use ledger_core::AppState;

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

fn webhook(body: &Value, signature: Option<String>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/webhooks/chain")
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(signature) = signature {
        builder = builder.header(SIGNATURE_HEADER, signature);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn signed(body: &Value) -> Request<Body> {
    let signature = sign_body(common::WEBHOOK_SECRET, body.to_string().as_bytes()).unwrap();
    webhook(body, Some(signature))
}

fn event(signature: &str, params: Value) -> Value {
    json!({
        "hash": "0xabc",
        "matchReasons": [{ "signature": signature, "params": params }]
    })
}

async fn setup() -> (Router, AppState) {
    let state = common::test_app(HandlerRegistry::new()).state;
    state
        .settlements
        .request_deposit(common::params("dep-1", "alice", "40"))
        .await
        .unwrap();
    (create_app(state.clone()), state)
}

#[tokio::test]
async fn test_missing_or_wrong_signature_is_unauthorized() {
    let (app, _) = setup().await;
    let body = json!({ "events": [event(DEPOSIT_SIGNATURE, json!({"systemId": "dep-1"}))] });

    let (status, _) = send(&app, webhook(&body, None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let forged = sign_body("some-other-secret", body.to_string().as_bytes()).unwrap();
    let (status, _) = send(&app, webhook(&body, Some(forged))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(&app, webhook(&body, Some("zz-not-hex".to_string()))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_redelivered_deposit_is_booked_once() {
    let (app, state) = setup().await;
    let body = json!({ "events": [event(DEPOSIT_SIGNATURE, json!({"systemId": "dep-1"}))] });

    let (status, summary) = send(&app, signed(&body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(summary["settled"], 1);

    for _ in 0..3 {
        let (status, summary) = send(&app, signed(&body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(summary["settled"], 0);
        assert_eq!(summary["duplicates"], 1);
    }

    let balance = state.ledger.get_balance("alice", "USDT").await.unwrap();
    assert_eq!(balance.real, "40.00000000");
}

#[tokio::test]
async fn test_batch_with_mixed_reasons_reports_each() {
    let (app, _) = setup().await;
    let body = json!([
        event(DEPOSIT_SIGNATURE, json!({"orderId": "dep-1"})),
        event("Transfer(address,address,uint256)", json!({})),
        event(DEPOSIT_SIGNATURE, json!({"systemId": "missing-order"})),
        event(DEPOSIT_SIGNATURE, json!({})),
        event(WITHDRAW_NATIVE_SIGNATURE, json!({"systemId": "dep-1"}))
    ]);

    let (status, summary) = send(&app, signed(&body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(summary["accepted"], 5);
    assert_eq!(summary["settled"], 1);
    assert_eq!(summary["ignored"], 1);
    // unknown order, missing id, and a withdraw event for a deposit order
    assert_eq!(summary["failed"], 3);
}

#[tokio::test]
async fn test_malformed_payload_is_a_bad_request() {
    let (app, _) = setup().await;
    let body = json!({ "unexpected": true });
    let (status, body) = send(&app, signed(&body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn test_concurrent_deliveries_settle_once() {
    let (app, state) = setup().await;
    let body = json!({ "events": [event(DEPOSIT_SIGNATURE, json!({"systemId": "dep-1"}))] });

    let mut handles = Vec::new();
    for _ in 0..10 {
        let app = app.clone();
        let request = signed(&body);
        handles.push(tokio::spawn(async move { send(&app, request).await }));
    }

    let mut settled = 0;
    for handle in handles {
        let (status, summary) = handle.await.unwrap();
        assert_eq!(status, StatusCode::OK);
        settled += summary["settled"].as_u64().unwrap();
    }
    assert_eq!(settled, 1);

    let order = state.settlements.get_order("dep-1").await.unwrap();
    assert!(order.processed);
    let balance = state.ledger.get_balance("alice", "USDT").await.unwrap();
    assert_eq!(balance.real, "40.00000000");
}
