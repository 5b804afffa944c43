/*
[INPUT]:  Raw WebSocket text frames and topic templates
[OUTPUT]: Classified control frames, typed data messages, outgoing op frames
[POS]:    WebSocket layer - frame types and topic helpers
[UPDATE]: When adding topics or changing the op frame shape
*/

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Default order-book depth for `orderbook.{depth}.{symbol}`
pub const DEFAULT_ORDERBOOK_DEPTH: u32 = 100;

const SYMBOL_PLACEHOLDER: &str = "{symbol}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateKind {
    Snapshot,
    Delta,
    #[serde(other)]
    Other,
}

/// Data frame pushed by the exchange for a subscribed topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<UpdateKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cts: Option<i64>,
    #[serde(default)]
    pub data: Value,
}

/// Inbound frame after classification
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Pong,
    Auth { success: bool, ret_msg: String },
    SubscriptionAck { op: String, success: bool, ret_msg: String },
    Data(StreamMessage),
}

impl InboundFrame {
    /// Classify a decoded frame; control frames never reach callbacks
    pub fn classify(value: Value) -> Result<Self, serde_json::Error> {
        let op = value.get("op").and_then(Value::as_str);
        let ret_msg = value.get("ret_msg").and_then(Value::as_str);
        let success = value.get("success").and_then(Value::as_bool).unwrap_or(false);

        if op == Some("pong") || ret_msg == Some("pong") {
            return Ok(InboundFrame::Pong);
        }

        match op {
            Some("auth") => Ok(InboundFrame::Auth {
                success,
                ret_msg: ret_msg.unwrap_or_default().to_string(),
            }),
            Some(op @ ("subscribe" | "unsubscribe")) => Ok(InboundFrame::SubscriptionAck {
                op: op.to_string(),
                success,
                ret_msg: ret_msg.unwrap_or_default().to_string(),
            }),
            _ => Ok(InboundFrame::Data(serde_json::from_value(value)?)),
        }
    }
}

/// Which local mirror a topic feeds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind {
    OrderBook,
    Ticker,
    Other,
}

impl TopicKind {
    pub fn of(topic: &str) -> Self {
        if topic.starts_with("orderbook.") {
            TopicKind::OrderBook
        } else if topic.starts_with("tickers.") {
            TopicKind::Ticker
        } else {
            TopicKind::Other
        }
    }
}

pub fn orderbook_template(depth: u32) -> String {
    format!("orderbook.{depth}.{SYMBOL_PLACEHOLDER}")
}

pub fn ticker_template() -> String {
    format!("tickers.{SYMBOL_PLACEHOLDER}")
}

pub fn kline_template(interval: &str) -> String {
    format!("kline.{interval}.{SYMBOL_PLACEHOLDER}")
}

/// One topic per symbol, or the template itself when no symbols are given
pub fn expand_template(template: &str, symbols: &[&str]) -> Vec<String> {
    if symbols.is_empty() {
        return vec![template.to_string()];
    }
    symbols
        .iter()
        .map(|symbol| template.replace(SYMBOL_PLACEHOLDER, symbol))
        .collect()
}

pub fn subscription_frame(op: &str, req_id: &str, topics: &[String]) -> String {
    json!({"op": op, "req_id": req_id, "args": topics}).to_string()
}

pub fn auth_frame(api_key: &str, expires: u64, signature: &str) -> String {
    json!({"op": "auth", "args": [api_key, expires, signature]}).to_string()
}

pub fn ping_frame() -> String {
    json!({"op": "ping"}).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_control_frames() {
        let pong = json!({"success": true, "ret_msg": "pong", "conn_id": "x", "op": "ping"});
        assert_eq!(InboundFrame::classify(pong).unwrap(), InboundFrame::Pong);

        let ack = json!({
            "success": false,
            "ret_msg": "error:handler not found",
            "op": "subscribe"
        });
        assert_eq!(
            InboundFrame::classify(ack).unwrap(),
            InboundFrame::SubscriptionAck {
                op: "subscribe".to_string(),
                success: false,
                ret_msg: "error:handler not found".to_string(),
            }
        );

        let auth = json!({"success": true, "ret_msg": "", "op": "auth"});
        assert!(matches!(
            InboundFrame::classify(auth).unwrap(),
            InboundFrame::Auth { success: true, .. }
        ));
    }

    #[test]
    fn classifies_data_frames() {
        let frame = json!({
            "topic": "tickers.BTCUSDT",
            "type": "delta",
            "ts": 1_700_000_000_000i64,
            "data": {"symbol": "BTCUSDT", "markPrice": "47000"}
        });
        let InboundFrame::Data(message) = InboundFrame::classify(frame).unwrap() else {
            panic!("expected data frame");
        };
        assert_eq!(message.topic.as_deref(), Some("tickers.BTCUSDT"));
        assert_eq!(message.kind, Some(UpdateKind::Delta));
    }

    #[test]
    fn expands_templates_per_symbol() {
        assert_eq!(
            expand_template(&orderbook_template(50), &["BTCUSDT", "ETHUSDT"]),
            vec!["orderbook.50.BTCUSDT", "orderbook.50.ETHUSDT"]
        );
        assert_eq!(expand_template("tickers.BTCUSDT", &[]), vec!["tickers.BTCUSDT"]);
        assert_eq!(kline_template("5"), "kline.5.{symbol}");
        assert_eq!(TopicKind::of("tickers.SOLUSDT"), TopicKind::Ticker);
        assert_eq!(TopicKind::of("kline.1.SOLUSDT"), TopicKind::Other);
    }

    #[test]
    fn builds_op_frames() {
        let frame: Value = serde_json::from_str(&subscription_frame(
            "subscribe",
            "req-1",
            &["tickers.BTCUSDT".to_string()],
        ))
        .unwrap();
        assert_eq!(
            frame,
            json!({"op": "subscribe", "req_id": "req-1", "args": ["tickers.BTCUSDT"]})
        );

        let auth: Value = serde_json::from_str(&auth_frame("key", 10, "sig")).unwrap();
        assert_eq!(auth["args"], json!(["key", 10, "sig"]));
    }
}
