/*
[INPUT]:  Exchange position snapshots and cached JSON records
[OUTPUT]: Main/secondary leg records composed around a shared core
[POS]:    Domain layer - hedge pair data model
[UPDATE]: When persisted leg fields change
*/

use bybit_hedge_adapter::{PositionIdx, PositionInfo};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Fields shared by both legs of a hedge pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionCore {
    pub size: Decimal,
    /// Position notional divided by leverage
    pub amount: Decimal,
    pub entry_price: Decimal,
    pub position_idx: PositionIdx,
    pub tpsl_order_id: String,
    /// Milliseconds since epoch
    #[serde(deserialize_with = "millis_from_any", default)]
    pub updated_time: i64,
}

impl PositionCore {
    /// Build from an exchange snapshot; `None` for one-way slots
    pub fn from_exchange(position: &PositionInfo, tpsl_order_id: &str) -> Option<Self> {
        let position_idx = position.leg()?;
        let leverage = if position.leverage.is_zero() {
            Decimal::new(1, 2)
        } else {
            position.leverage
        };

        Some(Self {
            size: position.size,
            amount: position.position_value / leverage,
            entry_price: position.avg_price,
            position_idx,
            tpsl_order_id: tpsl_order_id.to_string(),
            updated_time: position.updated_time_ms(),
        })
    }
}

fn millis_from_any<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|ms| ms as i64))
            .ok_or_else(|| serde::de::Error::custom("updated_time out of range")),
        Value::String(raw) if raw.trim().is_empty() => Ok(0),
        Value::String(raw) => raw.trim().parse().map_err(serde::de::Error::custom),
        Value::Null => Ok(0),
        other => Err(serde::de::Error::custom(format!(
            "updated_time must be a number or string, got {other}"
        ))),
    }
}

/// Directional leg carrying the take-profit and the hedge trigger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MainPosition {
    #[serde(flatten)]
    pub core: PositionCore,
    pub take_profit_price: Decimal,
    /// Price at which the hedge leg is opened
    #[serde(default)]
    pub tracking_price: Option<Decimal>,
}

/// Opposite-side hedge leg carrying the stop-loss
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecondaryPosition {
    #[serde(flatten)]
    pub core: PositionCore,
    pub stop_loss_price: Decimal,
}

/// Per-coin pair; never stored with both legs empty
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HedgePosition {
    pub coin: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_position: Option<MainPosition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary_position: Option<SecondaryPosition>,
}

impl HedgePosition {
    pub fn new(coin: impl Into<String>) -> Self {
        Self {
            coin: coin.into(),
            main_position: None,
            secondary_position: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.main_position.is_none() && self.secondary_position.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LegKind {
    Main,
    Secondary,
}

impl LegKind {
    pub fn is_main(self) -> bool {
        self == LegKind::Main
    }
}

/// One leg flattened out of the registry for reconciliation and reporting
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackedLeg {
    pub symbol: String,
    pub kind: LegKind,
    #[serde(flatten)]
    pub core: PositionCore,
}
