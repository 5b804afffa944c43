/*
[INPUT]:  Locally tracked legs and the exchange's live position list
[OUTPUT]: Legs that no longer exist on the exchange
[POS]:    Domain layer - set-difference reconciliation
[UPDATE]: When the identity of a leg changes
*/

use std::collections::HashSet;

use bybit_hedge_adapter::PositionInfo;
use rust_decimal::Decimal;

use crate::position::TrackedLeg;

/// Identity of a leg: `(symbol, size, entry price, positionIdx)`.
///
/// Numbers are normalized so `"1.0"` and `1` compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LegKey {
    pub symbol: String,
    pub size: Decimal,
    pub entry_price: Decimal,
    pub position_idx: u8,
}

impl LegKey {
    pub fn new(symbol: &str, size: Decimal, entry_price: Decimal, position_idx: u8) -> Self {
        Self {
            symbol: symbol.to_string(),
            size: size.normalize(),
            entry_price: entry_price.normalize(),
            position_idx,
        }
    }
}

impl From<&TrackedLeg> for LegKey {
    fn from(leg: &TrackedLeg) -> Self {
        Self::new(
            &leg.symbol,
            leg.core.size,
            leg.core.entry_price,
            leg.core.position_idx.into(),
        )
    }
}

impl From<&PositionInfo> for LegKey {
    fn from(position: &PositionInfo) -> Self {
        Self::new(
            &position.symbol,
            position.size,
            position.avg_price,
            position.position_idx,
        )
    }
}

/// Local legs whose key is absent from the exchange list
pub fn stale_legs(local: &[TrackedLeg], exchange: &[PositionInfo]) -> Vec<TrackedLeg> {
    let live: HashSet<LegKey> = exchange.iter().map(LegKey::from).collect();
    local
        .iter()
        .filter(|leg| !live.contains(&LegKey::from(*leg)))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::{LegKind, PositionCore};
    use bybit_hedge_adapter::PositionIdx;
    use serde_json::json;
    use std::str::FromStr;

    fn leg(symbol: &str, size: &str, entry: &str, idx: PositionIdx, kind: LegKind) -> TrackedLeg {
        TrackedLeg {
            symbol: symbol.to_string(),
            kind,
            core: PositionCore {
                size: Decimal::from_str(size).unwrap(),
                amount: Decimal::ZERO,
                entry_price: Decimal::from_str(entry).unwrap(),
                position_idx: idx,
                tpsl_order_id: "order".to_string(),
                updated_time: 0,
            },
        }
    }

    fn live(symbol: &str, size: &str, avg_price: &str, idx: u8) -> PositionInfo {
        let side = if idx == 1 { "Buy" } else { "Sell" };
        serde_json::from_value(json!({
            "symbol": symbol,
            "side": side,
            "size": size,
            "avgPrice": avg_price,
            "positionIdx": idx
        }))
        .unwrap()
    }

    #[test]
    fn empty_exchange_list_flags_every_leg() {
        let local = vec![leg("BTCUSDT", "1.0", "50000", PositionIdx::Long, LegKind::Main)];
        assert_eq!(stale_legs(&local, &[]), local);
    }

    #[test]
    fn identical_leg_is_kept_across_number_formats() {
        let local = vec![leg("BTCUSDT", "1.0", "50000", PositionIdx::Long, LegKind::Main)];
        let exchange = vec![live("BTCUSDT", "1", "50000.00", 1)];
        assert!(stale_legs(&local, &exchange).is_empty());
    }

    #[test]
    fn changed_size_or_side_counts_as_closed() {
        let local = vec![
            leg("BTCUSDT", "1", "50000", PositionIdx::Long, LegKind::Main),
            leg("BTCUSDT", "1", "47000", PositionIdx::Short, LegKind::Secondary),
            leg("ETHUSDT", "2", "3000", PositionIdx::Short, LegKind::Main),
        ];
        let exchange = vec![
            live("BTCUSDT", "0.5", "50000", 1),
            live("BTCUSDT", "1", "47000", 2),
            live("ETHUSDT", "2", "3000", 1),
        ];

        let stale = stale_legs(&local, &exchange);
        let flagged: Vec<(&str, LegKind)> = stale
            .iter()
            .map(|leg| (leg.symbol.as_str(), leg.kind))
            .collect();
        assert_eq!(flagged, vec![("BTCUSDT", LegKind::Main), ("ETHUSDT", LegKind::Main)]);
    }
}
