/*
[INPUT]:  Typed order/position parameters from the operations layer
[OUTPUT]: camelCase request payloads ready to sign and send
[POS]:    Data layer - request types for signed endpoints
[UPDATE]: When request schemas change
*/

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::enums::{Category, OrderType, PositionIdx, Side, TimeInForce};

/// POST /v5/order/create
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceOrderRequest {
    pub category: Category,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    #[serde(with = "rust_decimal::serde::str")]
    pub qty: Decimal,
    #[serde(
        default,
        with = "rust_decimal::serde::str_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub take_profit: Option<Decimal>,
    #[serde(
        default,
        with = "rust_decimal::serde::str_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub stop_loss: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_in_force: Option<TimeInForce>,
    pub position_idx: PositionIdx,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reduce_only: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub market_unit: Option<String>,
}

/// POST /v5/position/set-leverage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetLeverageRequest {
    pub category: Category,
    pub symbol: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub buy_leverage: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub sell_leverage: Decimal,
}

/// POST /v5/position/switch-mode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchModeRequest {
    pub category: Category,
    pub coin: String,
    /// 0 = one-way, 3 = hedge mode
    pub mode: u8,
}
