use chrono::Utc;
use mockito::Matcher;
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

use ledger_core::services::request_queue::http::{DexError, DexHttpClient};
use ledger_core::services::request_queue::{ItemStatus, QueueItem};

fn item(method: &str, url: &str) -> QueueItem {
    QueueItem {
        id: Uuid::new_v4(),
        api_path_key: format!("{} {}", method, url),
        method: method.to_string(),
        url: url.to_string(),
        request_function_id: "dex.http".to_string(),
        callback_function_id: "log".to_string(),
        headers: BTreeMap::new(),
        body: None,
        query_params: BTreeMap::new(),
        priority: 0,
        attempt: 0,
        status: ItemStatus::Processing,
        enqueued_at: Utc::now(),
        started_at: Some(Utc::now()),
    }
}

fn client(base_url: String) -> DexHttpClient {
    DexHttpClient::new(base_url, Some("dex-key".to_string()), 0, Duration::from_secs(5))
}

#[tokio::test]
async fn test_successful_call_sends_key_and_query() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/api/v1/price")
        .match_header("x-api-key", "dex-key")
        .match_query(Matcher::UrlEncoded("symbol".into(), "ETHUSDT".into()))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"code":0,"data":{"price":"3120.55"}}"#)
        .create_async()
        .await;

    let mut request = item("GET", "/api/v1/price");
    request.query_params.insert("symbol".to_string(), "ETHUSDT".to_string());

    let payload = client(server.url()).send(&request).await.unwrap();
    assert_eq!(payload["data"]["price"], "3120.55");
    mock.assert_async().await;
}

#[tokio::test]
async fn test_json_body_is_forwarded() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/api/v1/quote")
        .match_body(Matcher::Json(json!({"from": "USDT", "to": "ETH", "amount": "100"})))
        .with_status(200)
        .with_body(r#"{"code":"0","data":{"out":"0.032"}}"#)
        .create_async()
        .await;

    let mut request = item("POST", "api/v1/quote");
    request.body = Some(json!({"from": "USDT", "to": "ETH", "amount": "100"}));

    let payload = client(format!("{}/", server.url())).send(&request).await.unwrap();
    assert_eq!(payload["data"]["out"], "0.032");
    mock.assert_async().await;
}

#[tokio::test]
async fn test_business_error_code_is_a_failure() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/api/v1/price")
        .with_status(200)
        .with_body(r#"{"code":1003,"msg":"symbol not listed"}"#)
        .create_async()
        .await;

    let err = client(server.url()).send(&item("GET", "/api/v1/price")).await.unwrap_err();
    match err {
        DexError::UnexpectedCode { code, message } => {
            assert_eq!(code, Some(1003));
            assert_eq!(message, "symbol not listed");
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[tokio::test]
async fn test_http_error_status_is_reported() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/api/v1/price")
        .with_status(502)
        .with_body("bad gateway")
        .create_async()
        .await;

    let err = client(server.url()).send(&item("GET", "/api/v1/price")).await.unwrap_err();
    assert!(matches!(err, DexError::HttpStatus { status: 502, .. }));
}

#[tokio::test]
async fn test_repeated_upstream_failures_open_the_circuit() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/api/v1/price")
        .with_status(503)
        .expect_at_least(1)
        .create_async()
        .await;

    let client = client(server.url());
    assert_eq!(client.circuit_state(), "closed");

    let mut open = false;
    for _ in 0..8 {
        if let Err(DexError::CircuitBreakerOpen(_)) = client.send(&item("GET", "/api/v1/price")).await {
            open = true;
            break;
        }
    }
    assert!(open);
    assert_eq!(client.circuit_state(), "open");
}

#[tokio::test]
async fn test_business_errors_do_not_open_the_circuit() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/api/v1/price")
        .with_status(200)
        .with_body(r#"{"code":7,"message":"rate limited"}"#)
        .expect(8)
        .create_async()
        .await;

    let client = client(server.url());
    for _ in 0..8 {
        let err = client.send(&item("GET", "/api/v1/price")).await.unwrap_err();
        assert!(matches!(err, DexError::UnexpectedCode { .. }));
    }
    assert_eq!(client.circuit_state(), "closed");
}
