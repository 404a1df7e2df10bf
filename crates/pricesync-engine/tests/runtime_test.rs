//! End-to-end test through `start()` with a real connection manager.

use pricesync_core::{Price, SystemClock};
use pricesync_engine::{EngineConfig, EngineDeps, PersistenceConfig};
use pricesync_persistence::{JsonFileStore, PersistenceStore};
use pricesync_rest::MockPricingBackend;
use pricesync_ws::ConnectionState;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

#[tokio::test]
async fn test_unreachable_stream_falls_back_to_polling() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("state.json");

    let backend = MockPricingBackend::new();
    backend.push_poll_response(
        r#"{"type":"batch","updates":[{"id":"sku-1","price":"4.20","timestamp":0,"version":3}]}"#,
    );

    let config = EngineConfig {
        // Nothing listens on the discard port
        ws_url: "ws://127.0.0.1:9".to_string(),
        max_reconnect_attempts: 1,
        reconnect_base_delay_ms: 10,
        reconnect_max_delay_ms: 10,
        poll_interval_ms: 20,
        persistence: PersistenceConfig {
            path: Some(path.clone()),
        },
        ..EngineConfig::default()
    };
    let deps = EngineDeps {
        store: Arc::new(JsonFileStore::new(&path)),
        backend: Arc::new(backend.clone()),
        clock: SystemClock::shared(),
    };

    let runtime = pricesync_engine::start(config, deps).unwrap();
    let handle = runtime.handle.clone();
    handle.subscribe(["sku-1"]).await.unwrap();

    let mut applied = false;
    for _ in 0..300 {
        if handle.get_current("sku-1").await.unwrap().is_some() {
            applied = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(applied, "polled update never applied");
    assert_eq!(handle.connection_status(), ConnectionState::Degraded);

    let view = handle.get_current("sku-1").await.unwrap().unwrap();
    assert_eq!(view.price, Price::new(dec!(4.20)));
    assert!(backend
        .poll_calls()
        .iter()
        .any(|ids| ids == &vec!["sku-1".to_string()]));

    let status = handle.status().await.unwrap();
    assert!(status.metrics.inbound_messages >= 1);
    assert!(status.metrics.errors >= 2);

    handle.shutdown().await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), runtime.connection)
        .await
        .unwrap()
        .unwrap();
    runtime.engine.await.unwrap();

    let saved = JsonFileStore::new(&path).load().unwrap().unwrap();
    assert_eq!(saved.entities["sku-1"].version, 3);
}
