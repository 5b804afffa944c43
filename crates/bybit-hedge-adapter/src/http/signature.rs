/*
[INPUT]:  API key/secret, timestamp, recv window and serialized request payload
[OUTPUT]: Hex-encoded HMAC-SHA256 signatures for REST headers and WebSocket auth
[POS]:    HTTP layer - request signing for authenticated endpoints
[UPDATE]: When changing signing algorithm or header format
*/

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const HEADER_API_KEY: &str = "X-BAPI-API-KEY";
pub const HEADER_SIGN: &str = "X-BAPI-SIGN";
pub const HEADER_SIGN_TYPE: &str = "X-BAPI-SIGN-TYPE";
pub const HEADER_TIMESTAMP: &str = "X-BAPI-TIMESTAMP";
pub const HEADER_RECV_WINDOW: &str = "X-BAPI-RECV-WINDOW";

/// `2` selects HMAC-SHA256 on the exchange side.
pub const SIGN_TYPE_HMAC: &str = "2";

/// Signs REST requests and WebSocket auth frames with the account secret
#[derive(Clone)]
pub struct RequestSigner {
    api_key: String,
    api_secret: String,
}

impl std::fmt::Debug for RequestSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestSigner")
            .field("api_key", &self.api_key)
            .field("api_secret", &"<redacted>")
            .finish()
    }
}

impl RequestSigner {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
        }
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Sign a REST request.
    ///
    /// Format: "{timestamp}{api_key}{recv_window}{payload}" where payload is the
    /// JSON body for POST and the query string for GET.
    pub fn sign_request(&self, timestamp: u64, recv_window: u64, payload: &str) -> String {
        let message = format!("{timestamp}{}{recv_window}{payload}", self.api_key);
        self.hex_hmac(message.as_bytes())
    }

    /// Sign the WebSocket auth challenge `GET/realtime{expires}`
    pub fn sign_ws_auth(&self, expires: u64) -> String {
        self.hex_hmac(format!("GET/realtime{expires}").as_bytes())
    }

    fn hex_hmac(&self, message: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(message);
        hex::encode(mac.finalize().into_bytes())
    }
}
