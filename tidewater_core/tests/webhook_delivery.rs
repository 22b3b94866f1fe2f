mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use chrono::Utc;
use common::*;
use tidewater_core::config::WebhookSettings;
use tidewater_core::store::MemoryStore;
use tidewater_core::webhooks::signing::{DELIVERY_HEADER, EVENT_HEADER, SIGNATURE_HEADER};
use tidewater_core::webhooks::{
    DeliveryStatus, EVENT_REFRESH_COMPLETED, EVENT_REFRESH_FAILED, HttpWebhookSender, RetryConfig,
    WebhookConfig, WebhookQueue, WebhookStore, verify_signature,
};
use tokio::sync::Mutex;

const SECRET: &str = "whsec_test";

#[derive(Clone, Default)]
struct Receiver {
    calls: Arc<Mutex<Vec<(HeaderMap, Bytes)>>>,
    status: Arc<AtomicU16>,
}

async fn receive(State(rx): State<Receiver>, headers: HeaderMap, body: Bytes) -> StatusCode {
    rx.calls.lock().await.push((headers, body));
    StatusCode::from_u16(rx.status.load(Ordering::SeqCst)).unwrap_or(StatusCode::OK)
}

async fn spawn_receiver(status: u16) -> (String, Receiver) {
    let rx = Receiver::default();
    rx.status.store(status, Ordering::SeqCst);
    let app = Router::new()
        .route("/hook", post(receive))
        .with_state(rx.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}/hook"), rx)
}

fn queue(store: &MemoryStore) -> Arc<WebhookQueue> {
    Arc::new(WebhookQueue::new(
        Arc::new(store.clone()),
        Arc::new(HttpWebhookSender::new().unwrap()),
        &WebhookSettings {
            timeout: Duration::from_secs(5),
            ..WebhookSettings::default()
        },
    ))
}

async fn subscribe(store: &MemoryStore, url: &str, events: &[&str]) -> WebhookConfig {
    let config = WebhookConfig::new(
        "ops",
        url,
        Some(SECRET.to_string()),
        events.iter().map(|e| e.to_string()).collect(),
        RetryConfig::default(),
        None,
    )
    .unwrap();
    store.upsert_webhook_config(&config).await.unwrap();
    config
}

#[tokio::test]
async fn completed_refresh_sends_a_signed_callback() {
    let (url, rx) = spawn_receiver(200).await;
    let store = MemoryStore::new();
    let webhooks = queue(&store);
    subscribe(&store, &url, &[EVENT_REFRESH_COMPLETED]).await;

    let h = harness_with_webhooks(10, Duration::from_secs(60), webhooks.clone(), store.clone());
    seed_asin_config(&h).await;
    h.warehouse.insert_rows("asin_performance", five_asin_rows()).await;
    h.orchestrator.run_table(ASIN_TABLE, false).await.unwrap();

    // Nothing is sent until the queue drains.
    assert!(rx.calls.lock().await.is_empty());
    let report = webhooks.drain(Utc::now()).await.unwrap();
    assert_eq!(report.delivered, 1);

    let calls = rx.calls.lock().await;
    assert_eq!(calls.len(), 1);
    let (headers, body) = &calls[0];
    let signature = headers[SIGNATURE_HEADER].to_str().unwrap();
    assert!(signature.starts_with("sha256="));
    verify_signature(SECRET, signature, body).unwrap();
    assert!(verify_signature("wrong", signature, body).is_err());
    assert_eq!(headers[EVENT_HEADER], EVENT_REFRESH_COMPLETED);

    let payload: serde_json::Value = serde_json::from_slice(body).unwrap();
    assert_eq!(payload["event"], EVENT_REFRESH_COMPLETED);
    assert_eq!(payload["data"]["table_name"], ASIN_TABLE);
    assert_eq!(payload["data"]["rows_processed"], 5);

    let delivery_id: uuid::Uuid = headers[DELIVERY_HEADER].to_str().unwrap().parse().unwrap();
    let stored = store.get_delivery(delivery_id).await.unwrap().unwrap();
    assert_eq!(stored.status, DeliveryStatus::Success);
    assert_eq!(stored.response_status, Some(200));
    assert!(stored.delivered_at.is_some());
}

#[tokio::test]
async fn failing_endpoint_backs_off_then_fails() {
    let (url, rx) = spawn_receiver(500).await;
    let store = MemoryStore::new();
    let webhooks = queue(&store);
    subscribe(&store, &url, &["*"]).await;

    let t0 = Utc::now();
    let enqueued = webhooks
        .notify(EVENT_REFRESH_FAILED, serde_json::json!({"table_name": "t"}), t0)
        .await
        .unwrap();
    assert_eq!(enqueued, 1);

    let mut now = t0;
    for expected_delay in [5, 30, 300] {
        let report = webhooks.drain(now).await.unwrap();
        assert_eq!(report.retrying, 1);
        let delivery = store.all_deliveries().await.remove(0);
        assert_eq!(delivery.status, DeliveryStatus::Retrying);
        assert_eq!(delivery.response_status, Some(500));
        let next = delivery.next_retry_at.unwrap();
        assert_eq!(next - now, chrono::Duration::seconds(expected_delay));

        // Not due yet.
        let early = webhooks.drain(next - chrono::Duration::seconds(1)).await.unwrap();
        assert_eq!(early.selected, 0);
        now = next;
    }

    let report = webhooks.drain(now).await.unwrap();
    assert_eq!(report.failed, 1);
    let delivery = store.all_deliveries().await.remove(0);
    assert_eq!(delivery.status, DeliveryStatus::Failed);
    assert_eq!(delivery.attempt_count, 3);
    assert_eq!(delivery.next_retry_at, None);
    assert_eq!(rx.calls.lock().await.len(), 4);

    assert_eq!(webhooks.drain(now + chrono::Duration::days(1)).await.unwrap().selected, 0);
}

#[tokio::test]
async fn unsubscribed_and_inactive_configs_receive_nothing() {
    let (url, rx) = spawn_receiver(200).await;
    let store = MemoryStore::new();
    let webhooks = queue(&store);
    subscribe(&store, &url, &[EVENT_REFRESH_COMPLETED]).await;
    let mut inactive = subscribe(&store, &url, &["*"]).await;
    inactive.is_active = false;
    store.upsert_webhook_config(&inactive).await.unwrap();

    let enqueued = webhooks
        .notify(EVENT_REFRESH_FAILED, serde_json::json!({}), Utc::now())
        .await
        .unwrap();
    assert_eq!(enqueued, 0);
    assert_eq!(webhooks.drain(Utc::now()).await.unwrap().selected, 0);
    assert!(rx.calls.lock().await.is_empty());
}
