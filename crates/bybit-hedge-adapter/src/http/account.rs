/*
[INPUT]:  Symbols, order ids and time ranges
[OUTPUT]: Positions, orders, wallet balance, closed PnL and key permissions
[POS]:    HTTP layer - private read endpoints (signed GET)
[UPDATE]: When adding account queries or changing their failure fallbacks
*/

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use futures_util::future::join_all;
use rand::Rng;
use reqwest::Method;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{error, warn};

use crate::http::{BybitClient, Params, Result};
use crate::types::{ApiPermissions, ClosedPnl, OrderInfo, PositionInfo, WalletBalance};

const POSITION_LIST: &str = "/v5/position/list";
const ORDER_HISTORY: &str = "/v5/order/history";
const ORDER_REALTIME: &str = "/v5/order/realtime";
const WALLET_BALANCE: &str = "/v5/account/wallet-balance";
const CLOSED_PNL: &str = "/v5/position/closed-pnl";
const QUERY_API: &str = "/v5/user/query-api";

const POSITION_PAGE_LIMIT: u32 = 200;
const CLOSED_PNL_PAGE_LIMIT: u32 = 100;
const CLOSED_PNL_MAX_JITTER_MS: u64 = 1000;
/// Closed PnL queries span at most seven days
const PNL_WINDOW_DAYS: i64 = 7;

/// Half-open `[start, end)` range for a closed PnL query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PnlWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Split `[start, end)` into consecutive windows no longer than a week
pub fn split_into_weeks(start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<PnlWindow> {
    let mut windows = Vec::new();
    let mut cursor = start;
    while cursor < end {
        let next = (cursor + TimeDelta::days(PNL_WINDOW_DAYS)).min(end);
        windows.push(PnlWindow {
            start: cursor,
            end: next,
        });
        cursor = next;
    }
    windows
}

fn params(value: Value) -> Params {
    match value {
        Value::Object(map) => map,
        _ => Params::new(),
    }
}

impl BybitClient {
    /// Positions for one symbol; empty on failure.
    ///
    /// GET /v5/position/list?category=linear&symbol={symbol}
    pub async fn get_positions(&self, symbol: &str) -> Vec<PositionInfo> {
        let params = params(json!({"category": "linear", "symbol": symbol}));
        self.read_list(POSITION_LIST, &params).await
    }

    /// All USDT-settled positions; empty on failure.
    pub async fn get_all_positions(&self) -> Vec<PositionInfo> {
        match self.fetch_all_positions().await {
            Ok(positions) => positions,
            Err(err) => {
                error!(endpoint = POSITION_LIST, error = %err, "get all positions failed");
                Vec::new()
            }
        }
    }

    /// All USDT-settled positions, keeping the failure visible.
    ///
    /// Reconciliation needs to tell "nothing open" apart from "could not ask".
    ///
    /// GET /v5/position/list?category=linear&settleCoin=USDT (paginated)
    pub async fn fetch_all_positions(&self) -> Result<Vec<PositionInfo>> {
        let params = params(json!({
            "category": "linear",
            "settleCoin": "USDT",
            "limit": POSITION_PAGE_LIMIT,
        }));
        self.send_paginated(Method::GET, POSITION_LIST, params)
            .await?
            .into_iter()
            .map(|item| serde_json::from_value(item).map_err(Into::into))
            .collect()
    }

    /// Orders for a symbol from history or the open-order list; empty on failure.
    ///
    /// GET /v5/order/history | /v5/order/realtime
    pub async fn get_order(
        &self,
        symbol: &str,
        order_id: Option<&str>,
        history: bool,
        limit: u32,
    ) -> Vec<OrderInfo> {
        let mut params = params(json!({"category": "linear", "symbol": symbol, "limit": limit}));
        if let Some(order_id) = order_id {
            params.insert("orderId".to_string(), Value::String(order_id.to_string()));
        }
        let endpoint = if history { ORDER_HISTORY } else { ORDER_REALTIME };
        self.read_list(endpoint, &params).await
    }

    /// Unified account USDT balance; `None` on failure.
    ///
    /// GET /v5/account/wallet-balance?accountType=UNIFIED&coin=USDT
    pub async fn get_balance(&self) -> Option<WalletBalance> {
        let params = params(json!({"accountType": "UNIFIED", "coin": "USDT"}));
        self.read_list::<WalletBalance>(WALLET_BALANCE, &params)
            .await
            .into_iter()
            .next()
    }

    /// Realized PnL records inside one window; empty on failure.
    ///
    /// A random pause of up to a second spreads out concurrent window queries.
    ///
    /// GET /v5/position/closed-pnl (paginated)
    pub async fn get_closed_pnl(&self, window: PnlWindow) -> Vec<ClosedPnl> {
        let jitter_ms = rand::thread_rng().gen_range(0..CLOSED_PNL_MAX_JITTER_MS);
        tokio::time::sleep(Duration::from_millis(jitter_ms)).await;

        let params = params(json!({
            "category": "linear",
            "limit": CLOSED_PNL_PAGE_LIMIT,
            "startTime": window.start.timestamp_millis(),
            "endTime": window.end.timestamp_millis(),
        }));

        let items = match self.send_paginated(Method::GET, CLOSED_PNL, params).await {
            Ok(items) => items,
            Err(err) => {
                error!(endpoint = CLOSED_PNL, error = %err, "closed pnl query failed");
                return Vec::new();
            }
        };

        items
            .into_iter()
            .filter_map(|item| match serde_json::from_value(item) {
                Ok(record) => Some(record),
                Err(err) => {
                    warn!(
                        endpoint = CLOSED_PNL,
                        error = %err,
                        "skipping malformed closed pnl record"
                    );
                    None
                }
            })
            .collect()
    }

    /// Sum of realized PnL across all windows, queried concurrently
    pub async fn total_closed_pnl(&self, windows: &[PnlWindow]) -> Decimal {
        join_all(windows.iter().map(|window| self.get_closed_pnl(*window)))
            .await
            .into_iter()
            .flatten()
            .map(|record| record.closed_pnl)
            .sum()
    }

    /// Scope metadata of the current key; `None` on failure.
    ///
    /// GET /v5/user/query-api
    pub async fn get_api_permissions(&self) -> Option<ApiPermissions> {
        let outcome = async {
            self.send_signed(Method::GET, QUERY_API, &Params::new())
                .await?
                .result_as::<ApiPermissions>()
        }
        .await;

        match outcome {
            Ok(permissions) => Some(permissions),
            Err(err) => {
                error!(endpoint = QUERY_API, error = %err, "get api permissions failed");
                None
            }
        }
    }

    async fn read_list<T: DeserializeOwned>(&self, endpoint: &str, params: &Params) -> Vec<T> {
        let outcome = async {
            self.send_signed(Method::GET, endpoint, params)
                .await?
                .list_as::<T>()
        }
        .await;

        match outcome {
            Ok(items) => items,
            Err(err) => {
                error!(endpoint, error = %err, "read request failed");
                Vec::new()
            }
        }
    }
}
