/*
[INPUT]:  Mock exchange server, in-memory store
[OUTPUT]: Engines wired to test doubles plus response builders
[POS]:    Test infrastructure - shared across engine integration tests
[UPDATE]: When engine wiring or exchange fixtures change
*/

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bybit_hedge_adapter::{BybitClient, ClientConfig, Credentials, RetryPolicy};
use bybit_hedge_engine::{
    EngineTuning, KeyValueStore, MemoryStore, PriceFeed, SettingsStore, TradeEngine,
};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use wiremock::MockServer;

pub const USER_ID: i64 = 7;

pub fn test_client(server: &MockServer) -> BybitClient {
    let config = ClientConfig {
        timeout: Duration::from_secs(5),
        connect_timeout: Duration::from_secs(1),
        retry: RetryPolicy {
            max_retries: 0,
            max_transient_retries: 0,
        },
        ..ClientConfig::default()
    };
    BybitClient::with_config_and_base_url(
        config,
        &server.uri(),
        Some(Credentials::new("test-key", "test-secret")),
    )
    .expect("mock server uri is a valid url")
}

/// Fast loops, no random stagger and one-shot reconciliation
pub fn fast_tuning() -> EngineTuning {
    EngineTuning {
        run_state_poll_ms: 20,
        settings_refresh_ms: 50,
        hedge_scan_secs: 3600,
        hedge_coin_stagger_ms: 0,
        reconcile_scan_secs: 3600,
        entry_scan_secs: 3600,
        entry_stagger_min_ms: 0,
        entry_stagger_max_ms: 0,
        fill_confirm_delay_ms: 10,
        shutdown_timeout_secs: 5,
        ..EngineTuning::default()
    }
}

pub struct Harness {
    pub store: Arc<dyn KeyValueStore>,
    pub settings: SettingsStore,
    pub shutdown: CancellationToken,
}

impl Harness {
    pub fn new() -> Self {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        Self {
            settings: SettingsStore::new(store.clone()),
            store,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn engine(&self, server: &MockServer, tuning: EngineTuning) -> TradeEngine {
        TradeEngine::new(
            USER_ID,
            test_client(server),
            self.settings.clone(),
            PriceFeed::Store(self.settings.clone()),
            tuning,
            &self.shutdown,
        )
    }
}

pub fn envelope(result: Value) -> Value {
    json!({"retCode": 0, "retMsg": "OK", "result": result, "time": 1_700_000_000_000i64})
}

pub fn list_envelope(list: Value) -> Value {
    envelope(json!({"category": "linear", "list": list, "nextPageCursor": ""}))
}

pub fn position(symbol: &str, side: &str, size: &str, avg_price: &str, idx: u8) -> Value {
    json!({
        "symbol": symbol,
        "side": side,
        "size": size,
        "avgPrice": avg_price,
        "positionValue": "0",
        "leverage": "10",
        "takeProfit": "0",
        "stopLoss": "0",
        "markPrice": avg_price,
        "positionIdx": idx,
        "updatedTime": "1700000000000"
    })
}

pub fn order(order_id: &str, symbol: &str, side: &str, status: &str, stop_type: &str) -> Value {
    json!({
        "orderId": order_id,
        "symbol": symbol,
        "side": side,
        "orderStatus": status,
        "stopOrderType": stop_type,
        "qty": "0",
        "positionIdx": 0
    })
}

pub fn kline(close: &str) -> Value {
    envelope(json!({
        "category": "linear",
        "list": [["1700000000000", close, close, close, close]]
    }))
}

/// Poll `condition` every 10ms for up to five seconds
pub async fn wait_for<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition().await
}
