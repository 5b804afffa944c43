/*
[INPUT]:  Exchange v5 enum values and serde requirements
[OUTPUT]: Typed Rust enums with serialization support
[POS]:    Data layer - type definitions for API communication
[UPDATE]: When API schema changes or new types added
*/

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Buy => "Buy",
            Side::Sell => "Sell",
        }
    }
}

/// Hedge-mode leg discriminant. Serialized as the bare integer the exchange uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum PositionIdx {
    Long = 1,
    Short = 2,
}

impl PositionIdx {
    /// Leg opened by a market order on `side`
    pub fn for_side(side: Side) -> Self {
        match side {
            Side::Buy => PositionIdx::Long,
            Side::Sell => PositionIdx::Short,
        }
    }

    /// Side of the order that opens this leg
    pub fn opening_side(self) -> Side {
        match self {
            PositionIdx::Long => Side::Buy,
            PositionIdx::Short => Side::Sell,
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            PositionIdx::Long => PositionIdx::Short,
            PositionIdx::Short => PositionIdx::Long,
        }
    }
}

impl From<PositionIdx> for u8 {
    fn from(value: PositionIdx) -> Self {
        value as u8
    }
}

impl TryFrom<u8> for PositionIdx {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(PositionIdx::Long),
            2 => Ok(PositionIdx::Short),
            other => Err(format!("positionIdx {other} is not a hedge-mode leg")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    #[serde(rename = "GTC")]
    Gtc,
    #[serde(rename = "IOC")]
    Ioc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Untriggered,
    Rejected,
    PartiallyFilledCanceled,
    Filled,
    Cancelled,
    Triggered,
    Deactivated,
    #[serde(other)]
    Unknown,
}

/// Conditional order flavour attached to a position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopOrderType {
    TakeProfit,
    StopLoss,
    PartialTakeProfit,
    PartialStopLoss,
    TrailingStop,
    #[serde(other)]
    None,
}

impl StopOrderType {
    /// Whole-position TP or SL, the kind attached by `placeOrder`
    pub fn is_tpsl(self) -> bool {
        matches!(self, StopOrderType::TakeProfit | StopOrderType::StopLoss)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_idx_round_trips_as_integer() {
        assert_eq!(serde_json::to_string(&PositionIdx::Short).unwrap(), "2");
        let parsed: PositionIdx = serde_json::from_str("1").unwrap();
        assert_eq!(parsed, PositionIdx::Long);
        assert!(serde_json::from_str::<PositionIdx>("0").is_err());
    }

    #[test]
    fn unknown_enum_values_fall_back() {
        let status: OrderStatus = serde_json::from_str("\"MadeUp\"").unwrap();
        assert_eq!(status, OrderStatus::Unknown);
        let stop: StopOrderType = serde_json::from_str("\"\"").unwrap();
        assert_eq!(stop, StopOrderType::None);
        assert!(!stop.is_tpsl());
    }

    #[test]
    fn sides_and_legs_line_up() {
        assert_eq!(PositionIdx::for_side(Side::Buy), PositionIdx::Long);
        assert_eq!(PositionIdx::Short.opening_side(), Side::Sell);
        assert_eq!(Side::Buy.opposite(), Side::Sell);
        assert_eq!(PositionIdx::Long.opposite(), PositionIdx::Short);
    }
}
