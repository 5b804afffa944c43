/*
[INPUT]:  Snapshot and delta data frames for orderbook and ticker topics
[OUTPUT]: Per-topic mirrors and synthesized full-state messages
[POS]:    WebSocket layer - local market state
[UPDATE]: When the exchange changes book or ticker payloads
*/

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::{DepthLevel, decimal_from_value};

use super::message::{StreamMessage, TopicKind, UpdateKind};

#[derive(Debug, Deserialize)]
struct BookPayload {
    #[serde(default)]
    s: Option<String>,
    #[serde(default)]
    b: Vec<DepthLevel>,
    #[serde(default)]
    a: Vec<DepthLevel>,
    #[serde(default)]
    u: Option<u64>,
    #[serde(default)]
    seq: Option<u64>,
}

/// Local copy of one `orderbook.*` topic
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OrderBookMirror {
    #[serde(rename = "s", skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(rename = "b")]
    pub bids: Vec<DepthLevel>,
    #[serde(rename = "a")]
    pub asks: Vec<DepthLevel>,
    #[serde(rename = "u", skip_serializing_if = "Option::is_none")]
    pub update_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

impl OrderBookMirror {
    pub fn from_snapshot(data: &Value) -> Result<Self, serde_json::Error> {
        let payload: BookPayload = serde_json::from_value(data.clone())?;
        Ok(Self {
            symbol: payload.s,
            bids: payload.b,
            asks: payload.a,
            update_id: payload.u,
            seq: payload.seq,
        })
    }

    pub fn apply_delta(&mut self, data: &Value) -> Result<(), serde_json::Error> {
        let payload: BookPayload = serde_json::from_value(data.clone())?;
        if payload.s.is_some() {
            self.symbol = payload.s;
        }
        if payload.u.is_some() {
            self.update_id = payload.u;
        }
        if payload.seq.is_some() {
            self.seq = payload.seq;
        }
        for level in payload.b {
            upsert_level(&mut self.bids, level);
        }
        for level in payload.a {
            upsert_level(&mut self.asks, level);
        }
        Ok(())
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

fn upsert_level(levels: &mut Vec<DepthLevel>, level: DepthLevel) {
    let DepthLevel(price, size) = level;
    let existing = levels.iter().position(|DepthLevel(p, _)| *p == price);
    match (existing, size.is_zero()) {
        (Some(index), true) => {
            levels.remove(index);
        }
        (Some(index), false) => levels[index] = DepthLevel(price, size),
        (None, true) => {}
        (None, false) => levels.push(DepthLevel(price, size)),
    }
}

/// Local copy of one `tickers.*` topic
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickerMirror {
    fields: Map<String, Value>,
}

impl TickerMirror {
    pub fn from_snapshot(data: &Value) -> Self {
        Self {
            fields: data.as_object().cloned().unwrap_or_default(),
        }
    }

    pub fn apply_delta(&mut self, data: &Value) {
        if let Some(update) = data.as_object() {
            for (key, value) in update {
                self.fields.insert(key.clone(), value.clone());
            }
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn mark_price(&self) -> Option<Decimal> {
        self.fields
            .get("markPrice")
            .and_then(|value| decimal_from_value(value).ok())
            .filter(|price| !price.is_zero())
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.fields.clone())
    }
}

#[derive(Debug, Clone, PartialEq)]
enum TopicMirror {
    Book(OrderBookMirror),
    Ticker(TickerMirror),
}

/// Mirrors for every subscribed book and ticker topic
#[derive(Debug, Default)]
pub struct MarketMirror {
    topics: HashMap<String, TopicMirror>,
}

impl MarketMirror {
    /// Merge a data frame into the mirror and return the message to dispatch.
    /// Book and ticker frames come back as full-state snapshots.
    pub fn apply(&mut self, message: StreamMessage) -> Result<StreamMessage, serde_json::Error> {
        let Some(topic) = message.topic.clone() else {
            return Ok(message);
        };
        let kind = message.kind.unwrap_or(UpdateKind::Snapshot);

        let data = match TopicKind::of(&topic) {
            TopicKind::OrderBook => {
                let book = match (kind, self.topics.get_mut(&topic)) {
                    (UpdateKind::Delta, Some(TopicMirror::Book(book))) => {
                        book.apply_delta(&message.data)?;
                        book.clone()
                    }
                    (UpdateKind::Delta, _) => {
                        let mut book = OrderBookMirror::default();
                        book.apply_delta(&message.data)?;
                        book
                    }
                    _ => OrderBookMirror::from_snapshot(&message.data)?,
                };
                let data = book.to_value();
                self.topics.insert(topic, TopicMirror::Book(book));
                data
            }
            TopicKind::Ticker => {
                let ticker = match (kind, self.topics.get_mut(&topic)) {
                    (UpdateKind::Delta, Some(TopicMirror::Ticker(ticker))) => {
                        ticker.apply_delta(&message.data);
                        ticker.clone()
                    }
                    _ => TickerMirror::from_snapshot(&message.data),
                };
                let data = ticker.to_value();
                self.topics.insert(topic, TopicMirror::Ticker(ticker));
                data
            }
            TopicKind::Other => return Ok(message),
        };

        Ok(StreamMessage {
            kind: Some(UpdateKind::Snapshot),
            data,
            ..message
        })
    }

    pub fn order_book(&self, topic: &str) -> Option<&OrderBookMirror> {
        match self.topics.get(topic) {
            Some(TopicMirror::Book(book)) => Some(book),
            _ => None,
        }
    }

    pub fn ticker(&self, topic: &str) -> Option<&TickerMirror> {
        match self.topics.get(topic) {
            Some(TopicMirror::Ticker(ticker)) => Some(ticker),
            _ => None,
        }
    }

    pub fn remove(&mut self, topic: &str) {
        self.topics.remove(topic);
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}
