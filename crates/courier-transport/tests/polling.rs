#![cfg(feature = "polling")]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{Value, json};

use courier_core::{TransportError, UpdateSource};
use courier_transport::{PollingSettings, PollingSource};

const TOKEN: &str = "123:abc";

#[derive(Default)]
struct MockApi {
    /// Request bodies of every `getUpdates` call.
    calls: Mutex<Vec<Value>>,
    /// Responses handed out in order; the last one repeats.
    responses: Mutex<Vec<(StatusCode, Value)>>,
}

async fn get_updates(
    State(api): State<Arc<MockApi>>,
    Json(params): Json<Value>,
) -> (StatusCode, Json<Value>) {
    api.calls.lock().unwrap().push(params);
    let mut responses = api.responses.lock().unwrap();
    let (status, body) = if responses.len() > 1 {
        responses.remove(0)
    } else {
        responses[0].clone()
    };
    (status, Json(body))
}

async fn serve(responses: Vec<(StatusCode, Value)>) -> (SocketAddr, Arc<MockApi>) {
    let api = Arc::new(MockApi {
        responses: Mutex::new(responses),
        ..MockApi::default()
    });
    let app = Router::new()
        .route(&format!("/bot{TOKEN}/getUpdates"), post(get_updates))
        .with_state(Arc::clone(&api));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await });
    (addr, api)
}

fn source(addr: SocketAddr) -> PollingSource {
    let settings = PollingSettings::new(TOKEN)
        .api_url(format!("http://{addr}"))
        .timeout(Duration::from_secs(1))
        .limit(50)
        .allowed_updates(["message", "callback_query"]);
    PollingSource::new(settings).unwrap()
}

fn text_update(update_id: i64) -> Value {
    json!({
        "update_id": update_id,
        "message": {
            "message_id": update_id,
            "date": 0,
            "chat": { "id": 1, "type": "private" },
            "text": "hi"
        }
    })
}

#[tokio::test]
async fn test_fetch_sends_offset_and_decodes() {
    let (addr, api) = serve(vec![(
        StatusCode::OK,
        json!({ "ok": true, "result": [text_update(8), text_update(9)] }),
    )])
    .await;
    let source = source(addr);

    let batch = source.fetch_next(Some(8)).await.unwrap();
    assert_eq!(batch.updates.len(), 2);
    assert_eq!(batch.next_cursor, Some(10));

    let calls = api.calls.lock().unwrap();
    assert_eq!(calls[0]["offset"], 8);
    assert_eq!(calls[0]["timeout"], 1);
    assert_eq!(calls[0]["limit"], 50);
    assert_eq!(calls[0]["allowed_updates"], json!(["message", "callback_query"]));
}

#[tokio::test]
async fn test_rejected_token_is_fatal() {
    let (addr, _api) = serve(vec![(
        StatusCode::UNAUTHORIZED,
        json!({ "ok": false, "error_code": 401, "description": "Unauthorized" }),
    )])
    .await;

    let err = source(addr).fetch_next(None).await.unwrap_err();
    assert!(matches!(err, TransportError::Unauthorized(_)));
}

#[tokio::test]
async fn test_flood_control_carries_delay() {
    let (addr, _api) = serve(vec![(
        StatusCode::TOO_MANY_REQUESTS,
        json!({
            "ok": false,
            "error_code": 429,
            "description": "Too Many Requests",
            "parameters": { "retry_after": 3 }
        }),
    )])
    .await;

    let err = source(addr).fetch_next(None).await.unwrap_err();
    assert_eq!(err.retry_after(), Some(Duration::from_secs(3)));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_close_confirms_cursor() {
    let (addr, api) = serve(vec![(StatusCode::OK, json!({ "ok": true, "result": [] }))]).await;
    let source = source(addr);

    source.close(Some(42)).await.unwrap();
    source.close(None).await.unwrap();

    let calls = api.calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0]["offset"], 42);
    assert_eq!(calls[0]["timeout"], 0);
}
