/*
[INPUT]:  Exchange v5 response payloads (`result` objects and list entries)
[OUTPUT]: Typed Rust structs with decimal-safe numeric fields
[POS]:    Data layer - type definitions for API communication
[UPDATE]: When API schema changes or new types added
*/

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::enums::{OrderStatus, PositionIdx, Side, StopOrderType};

/// Entry of `/v5/position/list`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionInfo {
    pub symbol: String,
    /// "Buy", "Sell" or "" for an empty one-way slot
    #[serde(default)]
    pub side: String,
    #[serde(
        default,
        deserialize_with = "serde_helpers::deserialize_decimal_or_zero",
        serialize_with = "serde_helpers::serialize_decimal"
    )]
    pub size: Decimal,
    #[serde(
        default,
        deserialize_with = "serde_helpers::deserialize_decimal_or_zero",
        serialize_with = "serde_helpers::serialize_decimal"
    )]
    pub avg_price: Decimal,
    #[serde(
        default,
        deserialize_with = "serde_helpers::deserialize_decimal_or_zero",
        serialize_with = "serde_helpers::serialize_decimal"
    )]
    pub position_value: Decimal,
    #[serde(
        default,
        deserialize_with = "serde_helpers::deserialize_decimal_or_zero",
        serialize_with = "serde_helpers::serialize_decimal"
    )]
    pub leverage: Decimal,
    #[serde(
        default,
        deserialize_with = "serde_helpers::deserialize_decimal_or_zero",
        serialize_with = "serde_helpers::serialize_decimal"
    )]
    pub take_profit: Decimal,
    #[serde(
        default,
        deserialize_with = "serde_helpers::deserialize_decimal_or_zero",
        serialize_with = "serde_helpers::serialize_decimal"
    )]
    pub stop_loss: Decimal,
    #[serde(
        default,
        deserialize_with = "serde_helpers::deserialize_decimal_or_zero",
        serialize_with = "serde_helpers::serialize_decimal"
    )]
    pub mark_price: Decimal,
    #[serde(default)]
    pub position_idx: u8,
    #[serde(default)]
    pub updated_time: String,
}

impl PositionInfo {
    pub fn side(&self) -> Option<Side> {
        match self.side.as_str() {
            "Buy" => Some(Side::Buy),
            "Sell" => Some(Side::Sell),
            _ => None,
        }
    }

    /// Hedge-mode leg, `None` for one-way slots
    pub fn leg(&self) -> Option<PositionIdx> {
        PositionIdx::try_from(self.position_idx).ok()
    }

    pub fn is_open(&self) -> bool {
        !self.size.is_zero()
    }

    pub fn updated_time_ms(&self) -> i64 {
        self.updated_time.parse().unwrap_or_default()
    }
}

/// Entry of `/v5/order/history` and `/v5/order/realtime`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderInfo {
    pub order_id: String,
    #[serde(default)]
    pub order_link_id: String,
    pub symbol: String,
    pub side: Side,
    pub order_status: OrderStatus,
    #[serde(default = "default_stop_order_type")]
    pub stop_order_type: StopOrderType,
    #[serde(
        default,
        deserialize_with = "serde_helpers::deserialize_decimal_or_zero",
        serialize_with = "serde_helpers::serialize_decimal"
    )]
    pub qty: Decimal,
    #[serde(
        default,
        deserialize_with = "serde_helpers::deserialize_decimal_or_zero",
        serialize_with = "serde_helpers::serialize_decimal"
    )]
    pub trigger_price: Decimal,
    #[serde(default)]
    pub position_idx: u8,
    #[serde(default)]
    pub created_time: String,
}

fn default_stop_order_type() -> StopOrderType {
    StopOrderType::None
}

/// `result` of `/v5/order/create`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderAck {
    pub order_id: String,
    #[serde(default)]
    pub order_link_id: String,
}

/// First record of `/v5/account/wallet-balance`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletBalance {
    #[serde(default)]
    pub account_type: String,
    #[serde(
        default,
        deserialize_with = "serde_helpers::deserialize_decimal_or_zero",
        serialize_with = "serde_helpers::serialize_decimal"
    )]
    pub total_equity: Decimal,
    #[serde(
        default,
        deserialize_with = "serde_helpers::deserialize_decimal_or_zero",
        serialize_with = "serde_helpers::serialize_decimal"
    )]
    pub total_margin_balance: Decimal,
    #[serde(
        default,
        deserialize_with = "serde_helpers::deserialize_decimal_or_zero",
        serialize_with = "serde_helpers::serialize_decimal"
    )]
    pub total_available_balance: Decimal,
}

impl WalletBalance {
    /// Share of the margin balance still free; zero margin yields zero
    pub fn available_ratio(&self) -> Decimal {
        if self.total_margin_balance.is_zero() {
            return Decimal::ZERO;
        }
        self.total_available_balance / self.total_margin_balance
    }
}

/// Entry of `/v5/position/closed-pnl`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosedPnl {
    pub symbol: String,
    #[serde(default)]
    pub order_id: String,
    pub side: Side,
    #[serde(
        default,
        deserialize_with = "serde_helpers::deserialize_decimal_or_zero",
        serialize_with = "serde_helpers::serialize_decimal"
    )]
    pub qty: Decimal,
    #[serde(
        default,
        deserialize_with = "serde_helpers::deserialize_decimal_or_zero",
        serialize_with = "serde_helpers::serialize_decimal"
    )]
    pub closed_pnl: Decimal,
    #[serde(
        default,
        deserialize_with = "serde_helpers::deserialize_decimal_or_zero",
        serialize_with = "serde_helpers::serialize_decimal"
    )]
    pub avg_entry_price: Decimal,
    #[serde(
        default,
        deserialize_with = "serde_helpers::deserialize_decimal_or_zero",
        serialize_with = "serde_helpers::serialize_decimal"
    )]
    pub avg_exit_price: Decimal,
    #[serde(default)]
    pub created_time: String,
}

/// `result` of `/v5/user/query-api`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiPermissions {
    #[serde(default)]
    pub api_key: String,
    /// 0 = read/write, 1 = read only
    pub read_only: u8,
    #[serde(default)]
    pub permissions: HashMap<String, Vec<String>>,
}

/// Whether a key may drive the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutomationStatus {
    pub read_write: bool,
    pub has_permissions: bool,
    pub ready: bool,
}

impl ApiPermissions {
    fn grants(&self, group: &str, required: &[&str]) -> bool {
        self.permissions
            .get(group)
            .is_some_and(|granted| required.iter().all(|need| granted.iter().any(|g| g == need)))
    }

    pub fn automation_status(&self) -> AutomationStatus {
        let read_write = self.read_only == 0;
        let has_permissions = self.grants("ContractTrade", &["Order", "Position"])
            && self.grants("Derivatives", &["DerivativesTrade"])
            && self.grants("Options", &["OptionsTrade"]);
        AutomationStatus {
            read_write,
            has_permissions,
            ready: read_write && has_permissions,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LotSizeFilter {
    #[serde(
        default,
        deserialize_with = "serde_helpers::deserialize_decimal_or_zero",
        serialize_with = "serde_helpers::serialize_decimal"
    )]
    pub qty_step: Decimal,
    #[serde(
        default,
        deserialize_with = "serde_helpers::deserialize_decimal_or_zero",
        serialize_with = "serde_helpers::serialize_decimal"
    )]
    pub min_order_qty: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceFilter {
    #[serde(
        default,
        deserialize_with = "serde_helpers::deserialize_decimal_or_zero",
        serialize_with = "serde_helpers::serialize_decimal"
    )]
    pub tick_size: Decimal,
}

/// Entry of `/v5/market/instruments-info`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstrumentInfo {
    pub symbol: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub quote_coin: String,
    pub lot_size_filter: LotSizeFilter,
    pub price_filter: PriceFilter,
}

/// Exchange-side rounding constraints for one symbol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstrumentFilters {
    #[serde(
        deserialize_with = "serde_helpers::deserialize_decimal_or_zero",
        serialize_with = "serde_helpers::serialize_decimal"
    )]
    pub qty_step: Decimal,
    #[serde(
        deserialize_with = "serde_helpers::deserialize_decimal_or_zero",
        serialize_with = "serde_helpers::serialize_decimal"
    )]
    pub min_order_qty: Decimal,
    #[serde(
        deserialize_with = "serde_helpers::deserialize_decimal_or_zero",
        serialize_with = "serde_helpers::serialize_decimal"
    )]
    pub tick_size: Decimal,
}

impl From<&InstrumentInfo> for InstrumentFilters {
    fn from(info: &InstrumentInfo) -> Self {
        Self {
            qty_step: info.lot_size_filter.qty_step,
            min_order_qty: info.lot_size_filter.min_order_qty,
            tick_size: info.price_filter.tick_size,
        }
    }
}

/// Order-book level `[price, size]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthLevel(
    #[serde(with = "rust_decimal::serde::str")] pub Decimal,
    #[serde(with = "rust_decimal::serde::str")] pub Decimal,
);

pub(crate) mod serde_helpers {
    use super::Decimal;
    use serde::{Deserialize, Deserializer, Serializer};
    use serde_json::Value;
    use std::str::FromStr;

    /// Accepts strings, numbers, `""` and `null`; the last two read as zero
    pub fn deserialize_decimal_or_zero<'de, D>(deserializer: D) -> Result<Decimal, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        decimal_from_value(&value).map_err(serde::de::Error::custom)
    }

    pub fn decimal_from_value(value: &Value) -> Result<Decimal, String> {
        if value.is_null() {
            return Ok(Decimal::ZERO);
        }

        if let Some(raw) = value.as_str() {
            if raw.trim().is_empty() {
                return Ok(Decimal::ZERO);
            }
            return Decimal::from_str(raw.trim()).map_err(|err| err.to_string());
        }

        if value.is_number() {
            return Decimal::from_str(&value.to_string())
                .or_else(|_| Decimal::from_scientific(&value.to_string()))
                .map_err(|err| err.to_string());
        }

        Err("invalid decimal value".to_string())
    }

    pub fn serialize_decimal<S>(value: &Decimal, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&value.to_string())
    }
}

pub use serde_helpers::decimal_from_value;
