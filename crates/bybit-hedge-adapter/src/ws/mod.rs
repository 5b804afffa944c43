/*
[INPUT]:  Stream configuration, topic templates and callbacks
[OUTPUT]: Mirrored order-book, ticker and kline updates
[POS]:    WebSocket layer - public market stream
[UPDATE]: When adding topics or changing the session lifecycle
*/

pub mod book;
pub mod client;
pub mod message;

pub use book::{MarketMirror, OrderBookMirror, TickerMirror};
pub use client::{BybitStream, ConnectionState, StreamCallback, StreamConfig};
pub use message::{
    DEFAULT_ORDERBOOK_DEPTH, InboundFrame, StreamMessage, TopicKind, UpdateKind, expand_template,
    kline_template, orderbook_template, ticker_template,
};
