/*
[INPUT]:  Order and position parameters from the engine
[OUTPUT]: Order acknowledgements; success flags for fire-and-log calls
[POS]:    HTTP layer - trading endpoints (signed POST)
[UPDATE]: When adding new trading endpoints or changing order flow
*/

use std::time::Duration;

use rand::Rng;
use reqwest::Method;
use rust_decimal::Decimal;
use tracing::{error, info, warn};

use crate::http::client::to_params;
use crate::http::{BybitClient, BybitError, Result};
use crate::types::{
    Category, OrderAck, OrderType, PlaceOrderRequest, PositionIdx, PositionInfo,
    SetLeverageRequest, Side, SwitchModeRequest, TimeInForce,
};

const ORDER_CREATE: &str = "/v5/order/create";
const SET_LEVERAGE: &str = "/v5/position/set-leverage";
const SWITCH_MODE: &str = "/v5/position/switch-mode";

/// Hedge mode: one long and one short leg per symbol
const HEDGE_MODE: u8 = 3;
const SETTLE_COIN: &str = "USDT";

impl BybitClient {
    /// Open a market position with an attached take-profit and/or stop-loss.
    ///
    /// POST /v5/order/create
    ///
    /// `Err` is only returned for invalid arguments. Exchange failures are
    /// logged and reported as `Ok(None)`.
    pub async fn place_order(
        &self,
        symbol: &str,
        amount: Decimal,
        is_buy: bool,
        take_profit: Option<Decimal>,
        stop_loss: Option<Decimal>,
    ) -> Result<Option<OrderAck>> {
        if amount <= Decimal::ZERO {
            return Err(BybitError::Validation(format!(
                "order amount must be greater than 0, got {amount}"
            )));
        }

        let take_profit = take_profit.filter(|price| *price > Decimal::ZERO);
        let stop_loss = stop_loss.filter(|price| *price > Decimal::ZERO);
        if take_profit.is_none() && stop_loss.is_none() {
            return Err(BybitError::Validation(
                "take profit or stop loss price must be greater than 0".to_string(),
            ));
        }

        let side = if is_buy { Side::Buy } else { Side::Sell };
        let request = PlaceOrderRequest {
            category: Category::Linear,
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Market,
            qty: amount,
            take_profit,
            stop_loss,
            time_in_force: Some(TimeInForce::Gtc),
            position_idx: PositionIdx::for_side(side),
            reduce_only: None,
            market_unit: None,
        };

        Ok(self.submit_order(&request).await)
    }

    /// Flatten a position with a reduce-only market order on the opposite side.
    ///
    /// POST /v5/order/create
    pub async fn close_position(&self, position: &PositionInfo) -> Option<OrderAck> {
        let (Some(side), Some(position_idx)) = (position.side(), position.leg()) else {
            warn!(
                symbol = %position.symbol,
                side = %position.side,
                position_idx = position.position_idx,
                "cannot close position without side and hedge-mode leg"
            );
            return None;
        };

        let request = PlaceOrderRequest {
            category: Category::Linear,
            symbol: position.symbol.clone(),
            side: side.opposite(),
            order_type: OrderType::Market,
            qty: position.size,
            take_profit: None,
            stop_loss: None,
            time_in_force: None,
            position_idx,
            reduce_only: Some(true),
            market_unit: Some("baseCoin".to_string()),
        };

        self.submit_order(&request).await
    }

    /// Close every open position, pausing up to a second between orders.
    pub async fn close_all_positions(&self) -> Vec<PositionInfo> {
        let positions: Vec<PositionInfo> = self
            .get_all_positions()
            .await
            .into_iter()
            .filter(PositionInfo::is_open)
            .collect();

        for position in &positions {
            self.close_position(position).await;
            let pause_ms = rand::thread_rng().gen_range(0..1000);
            tokio::time::sleep(Duration::from_millis(pause_ms)).await;
        }

        positions
    }

    /// POST /v5/position/set-leverage
    ///
    /// Failures (including "leverage not modified") are logged and ignored.
    pub async fn set_leverage(&self, symbol: &str, leverage: Decimal) -> bool {
        let request = SetLeverageRequest {
            category: Category::Linear,
            symbol: symbol.to_string(),
            buy_leverage: leverage,
            sell_leverage: leverage,
        };

        match self.post_request(SET_LEVERAGE, &request).await {
            Ok(()) => true,
            Err(err) => {
                warn!(symbol, %leverage, error = %err, "set leverage failed");
                false
            }
        }
    }

    /// Switch all USDT perpetuals into hedge mode.
    ///
    /// POST /v5/position/switch-mode
    pub async fn switch_position_mode(&self) -> bool {
        let request = SwitchModeRequest {
            category: Category::Linear,
            coin: SETTLE_COIN.to_string(),
            mode: HEDGE_MODE,
        };

        match self.post_request(SWITCH_MODE, &request).await {
            Ok(()) => true,
            Err(err) => {
                error!(error = %err, "switch position mode failed");
                false
            }
        }
    }

    async fn submit_order(&self, request: &PlaceOrderRequest) -> Option<OrderAck> {
        let outcome = async {
            let params = to_params(request)?;
            let response = self.send_signed(Method::POST, ORDER_CREATE, &params).await?;
            response.result_as::<OrderAck>()
        }
        .await;

        match outcome {
            Ok(ack) => {
                info!(
                    symbol = %request.symbol,
                    side = request.side.as_str(),
                    qty = %request.qty,
                    order_id = %ack.order_id,
                    reduce_only = request.reduce_only.unwrap_or(false),
                    "order placed"
                );
                Some(ack)
            }
            Err(err) => {
                error!(
                    symbol = %request.symbol,
                    side = request.side.as_str(),
                    qty = %request.qty,
                    error = %err,
                    "order placement failed"
                );
                None
            }
        }
    }

    async fn post_request<T: serde::Serialize>(&self, endpoint: &str, request: &T) -> Result<()> {
        let params = to_params(request)?;
        self.send_signed(Method::POST, endpoint, &params).await?;
        Ok(())
    }
}
