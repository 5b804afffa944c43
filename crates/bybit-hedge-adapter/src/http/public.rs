/*
[INPUT]:  Symbol identifiers and query parameters
[OUTPUT]: Mark prices and instrument metadata
[POS]:    HTTP layer - public market data endpoints (no auth required)
[UPDATE]: When adding new public endpoints or changing response format
*/

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde_json::{Value, json};
use tracing::{error, warn};

use crate::http::{BybitClient, Params};
use crate::types::{InstrumentFilters, InstrumentInfo, decimal_from_value};

const MARK_PRICE_KLINE: &str = "/v5/market/mark-price-kline";
const INSTRUMENTS_INFO: &str = "/v5/market/instruments-info";

/// Kline rows are `[start, open, high, low, close]`
const KLINE_CLOSE_INDEX: usize = 4;
const INSTRUMENTS_PAGE_LIMIT: u32 = 1000;

impl BybitClient {
    /// Close of the latest one-minute mark-price kline.
    ///
    /// GET /v5/market/mark-price-kline?category=linear&symbol={symbol}&interval=1&limit=1
    ///
    /// Returns zero when no price is available; callers treat zero as "skip".
    pub async fn get_mark_price(&self, symbol: &str) -> Decimal {
        let params = object(json!({
            "category": "linear",
            "symbol": symbol,
            "interval": "1",
            "limit": 1,
        }));

        let response = match self.send_public(MARK_PRICE_KLINE, &params).await {
            Ok(response) => response,
            Err(err) => {
                error!(symbol, error = %err, "get mark price failed");
                return Decimal::ZERO;
            }
        };

        let close = response
            .list()
            .first()
            .and_then(|row| row.get(KLINE_CLOSE_INDEX))
            .map(decimal_from_value);

        match close {
            Some(Ok(price)) => price,
            Some(Err(err)) => {
                warn!(symbol, error = %err, "mark price kline close is not a number");
                Decimal::ZERO
            }
            None => Decimal::ZERO,
        }
    }

    /// Linear perpetual instrument metadata; empty on failure.
    ///
    /// GET /v5/market/instruments-info?category=linear
    pub async fn get_instruments_info(&self) -> Vec<InstrumentInfo> {
        let params = object(json!({"category": "linear", "limit": INSTRUMENTS_PAGE_LIMIT}));
        let outcome = async {
            self.send_public(INSTRUMENTS_INFO, &params)
                .await?
                .list_as::<InstrumentInfo>()
        }
        .await;

        match outcome {
            Ok(instruments) => instruments,
            Err(err) => {
                error!(endpoint = INSTRUMENTS_INFO, error = %err, "get instruments info failed");
                Vec::new()
            }
        }
    }

    /// Rounding filters for every trading USDT-quoted instrument
    pub async fn instrument_filters(&self) -> HashMap<String, InstrumentFilters> {
        self.get_instruments_info()
            .await
            .iter()
            .filter(|info| info.quote_coin == "USDT" && info.status == "Trading")
            .map(|info| (info.symbol.clone(), InstrumentFilters::from(info)))
            .collect()
    }
}

fn object(value: Value) -> Params {
    match value {
        Value::Object(map) => map,
        _ => Params::new(),
    }
}
