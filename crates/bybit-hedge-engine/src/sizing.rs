/*
[INPUT]:  Trade settings, balances, prices and instrument filters
[OUTPUT]: Exchange-aligned order quantities and TP/SL/trigger prices
[POS]:    Domain layer - pure order arithmetic
[UPDATE]: When sizing or price offset rules change
*/

use bybit_hedge_adapter::{InstrumentFilters, PositionIdx};
use rust_decimal::Decimal;

use crate::settings::TradeSettings;

const HUNDRED: Decimal = Decimal::ONE_HUNDRED;

/// Floor `quantity` to a multiple of `step`; non-positive steps leave it untouched
pub fn round_step_size(quantity: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return quantity;
    }
    (quantity - quantity % step).normalize()
}

/// Entry size in base coin: `size% x balance x leverage / price`, floored to
/// the quantity step and raised to the minimum order quantity.
pub fn entry_quantity(
    settings: &TradeSettings,
    balance: Decimal,
    price: Decimal,
    filters: &InstrumentFilters,
) -> Option<Decimal> {
    if price <= Decimal::ZERO {
        return None;
    }
    let raw = settings.size / HUNDRED * balance * settings.leverage / price;
    Some(round_step_size(raw, filters.qty_step).max(filters.min_order_qty))
}

/// Take-profit `take_profit%` away from `price` in the trade direction
pub fn take_profit_price(
    price: Decimal,
    take_profit_pct: Decimal,
    is_long: bool,
    tick_size: Decimal,
) -> Decimal {
    let offset = take_profit_pct / HUNDRED;
    let multiplier = if is_long {
        Decimal::ONE + offset
    } else {
        Decimal::ONE - offset
    };
    round_step_size(price * multiplier, tick_size)
}

/// Stop-loss for a hedge order, placed against the hedge's own direction
pub fn hedge_stop_loss_price(
    price: Decimal,
    stop_loss_pct: Decimal,
    hedge_is_buy: bool,
    tick_size: Decimal,
) -> Decimal {
    let offset = stop_loss_pct / HUNDRED;
    let multiplier = if hedge_is_buy {
        Decimal::ONE - offset
    } else {
        Decimal::ONE + offset
    };
    round_step_size(price * multiplier, tick_size)
}

/// Price at which a main leg needs its hedge
pub fn tracking_price(entry_price: Decimal, hedge_pct: Decimal, leg: PositionIdx) -> Decimal {
    let offset = hedge_pct / HUNDRED;
    match leg {
        PositionIdx::Long => entry_price * (Decimal::ONE - offset),
        PositionIdx::Short => entry_price * (Decimal::ONE + offset),
    }
}
