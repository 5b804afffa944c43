/*
[INPUT]:  Crate modules and public type definitions
[OUTPUT]: Public Bybit adapter crate surface
[POS]:    Crate root - module wiring
[UPDATE]: When public modules or exports change
*/

pub mod http;
pub mod types;
pub mod ws;

// Re-export commonly used types from http
pub use http::{
    ApiResponse,
    BybitClient,
    BybitError,
    ClientConfig,
    Credentials,
    Environment,
    Params,
    PnlWindow,
    RequestSigner,
    Result,
    RetryPolicy,
    split_into_weeks,
};

// Re-export all types
pub use types::*;

// Re-export commonly used types from ws
pub use ws::{
    BybitStream,
    ConnectionState,
    OrderBookMirror,
    StreamCallback,
    StreamConfig,
    StreamMessage,
    TickerMirror,
    UpdateKind,
};
