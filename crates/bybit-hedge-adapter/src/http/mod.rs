/*
[INPUT]:  HTTP client configuration and API endpoints
[OUTPUT]: HTTP responses and typed API results
[POS]:    HTTP layer - REST API communication
[UPDATE]: When adding new endpoints or changing client behavior
*/

pub mod account;
pub mod client;
pub mod error;
pub mod public;
pub mod response;
pub mod retry;
pub mod signature;
pub mod trade;

pub use error::{BybitError, Result};
pub use response::{ApiResponse, validate_response};
pub use retry::{RetryPolicy, backoff_delay};
pub use signature::RequestSigner;

pub use account::{PnlWindow, split_into_weeks};
pub use client::{BybitClient, ClientConfig, Credentials, Environment, Params};
