/*
[INPUT]:  HTTP configuration (environment, timeouts, recv window, retry policy), credentials
[OUTPUT]: Validated exchange envelopes for public, signed and paginated calls
[POS]:    HTTP layer - core client implementation
[UPDATE]: When adding connection options or changing client behavior
*/

use std::collections::HashSet;
use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Method, RequestBuilder, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::http::error::{BybitError, Result};
use crate::http::response::{ApiResponse, validate_response};
use crate::http::retry::{RetryPolicy, with_retry};
use crate::http::signature::{
    HEADER_API_KEY, HEADER_RECV_WINDOW, HEADER_SIGN, HEADER_SIGN_TYPE, HEADER_TIMESTAMP,
    RequestSigner, SIGN_TYPE_HMAC,
};

/// Base URLs for the exchange REST API
const MAINNET_BASE_URL: &str = "https://api.bybit.com";
const TESTNET_BASE_URL: &str = "https://api-testnet.bybit.com";

/// Public linear market stream
const MAINNET_STREAM_URL: &str = "wss://stream.bybit.com/v5/public/linear";
const TESTNET_STREAM_URL: &str = "wss://stream-testnet.bybit.com/v5/public/linear";

const ERROR_BODY_MAX_BYTES: usize = 512;

/// Request parameters. Keys are sorted, so GET query strings are deterministic.
pub type Params = serde_json::Map<String, Value>;

/// Production or sandbox deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Mainnet,
    Testnet,
}

impl Environment {
    pub fn from_testnet(testnet: bool) -> Self {
        if testnet {
            Environment::Testnet
        } else {
            Environment::Mainnet
        }
    }

    pub fn rest_base_url(self) -> &'static str {
        match self {
            Environment::Mainnet => MAINNET_BASE_URL,
            Environment::Testnet => TESTNET_BASE_URL,
        }
    }

    pub fn stream_url(self) -> &'static str {
        match self {
            Environment::Mainnet => MAINNET_STREAM_URL,
            Environment::Testnet => TESTNET_STREAM_URL,
        }
    }
}

/// HTTP client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub timeout: Duration,
    pub connect_timeout: Duration,
    /// Signed-request freshness tolerance in milliseconds
    pub recv_window: u64,
    pub retry: RetryPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            recv_window: 5000,
            retry: RetryPolicy::default(),
        }
    }
}

/// Credentials for authenticated requests
#[derive(Clone)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
}

impl Credentials {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
        }
    }

    pub fn signer(&self) -> RequestSigner {
        RequestSigner::new(&self.api_key, &self.api_secret)
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key)
            .field("api_secret", &"<redacted>")
            .finish()
    }
}

/// Main HTTP client for the exchange REST API.
///
/// The underlying `reqwest::Client` is created on first use and replaced after
/// transport failures. Both happen under one mutex so concurrent callers never
/// race on teardown.
#[derive(Debug)]
pub struct BybitClient {
    config: ClientConfig,
    base_url: Url,
    signer: Option<RequestSigner>,
    session: Mutex<Option<Client>>,
}

impl BybitClient {
    /// Create a client for `environment` with default configuration
    pub fn new(environment: Environment, credentials: Option<Credentials>) -> Result<Self> {
        Self::with_config(ClientConfig::default(), environment, credentials)
    }

    pub fn with_config(
        config: ClientConfig,
        environment: Environment,
        credentials: Option<Credentials>,
    ) -> Result<Self> {
        Self::with_config_and_base_url(config, environment.rest_base_url(), credentials)
    }

    /// Point the client at an arbitrary base URL (mock servers, proxies)
    pub fn with_config_and_base_url(
        config: ClientConfig,
        base_url: &str,
        credentials: Option<Credentials>,
    ) -> Result<Self> {
        Ok(Self {
            config,
            base_url: Url::parse(base_url)?,
            signer: credentials.as_ref().map(Credentials::signer),
            session: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn has_credentials(&self) -> bool {
        self.signer.is_some()
    }

    pub async fn is_session_open(&self) -> bool {
        self.session.lock().await.is_some()
    }

    /// Drop the current session; the next request builds a fresh one
    pub async fn reset_session(&self) {
        let mut guard = self.session.lock().await;
        if guard.take().is_some() {
            info!("HTTP session dropped, will reconnect on next request");
        }
    }

    /// Release the session. Safe to call more than once.
    pub async fn close(&self) {
        let mut guard = self.session.lock().await;
        if guard.take().is_some() {
            info!("HTTP session closed");
        }
    }

    /// Unauthenticated GET with retry
    pub async fn send_public(&self, endpoint: &str, params: &Params) -> Result<ApiResponse> {
        with_retry(self.config.retry, endpoint, || self.public_once(endpoint, params)).await
    }

    /// Signed GET/POST with retry
    pub async fn send_signed(
        &self,
        method: Method,
        endpoint: &str,
        params: &Params,
    ) -> Result<ApiResponse> {
        with_retry(self.config.retry, endpoint, || {
            self.signed_once(&method, endpoint, params)
        })
        .await
    }

    /// Follow `nextPageCursor` until it is absent or repeats, collecting `result.list`.
    ///
    /// Time-range parameters are dropped once a cursor is sent.
    pub async fn send_paginated(
        &self,
        method: Method,
        endpoint: &str,
        mut params: Params,
    ) -> Result<Vec<Value>> {
        let mut items = Vec::new();
        let mut seen_cursors = HashSet::new();

        loop {
            let response = self.send_signed(method.clone(), endpoint, &params).await?;
            items.extend(response.list().iter().cloned());

            let Some(cursor) = response.next_page_cursor() else {
                break;
            };
            if !seen_cursors.insert(cursor.to_string()) {
                debug!(endpoint, cursor, "pagination cursor repeated, stopping");
                break;
            }

            params.insert("cursor".to_string(), Value::String(cursor.to_string()));
            params.remove("startTime");
            params.remove("endTime");
        }

        Ok(items)
    }

    async fn session(&self) -> Result<Client> {
        let mut guard = self.session.lock().await;
        if let Some(client) = guard.as_ref() {
            return Ok(client.clone());
        }

        info!(base_url = %self.base_url, "creating HTTP session");
        let client = Client::builder()
            .timeout(self.config.timeout)
            .connect_timeout(self.config.connect_timeout)
            .build()?;
        *guard = Some(client.clone());
        Ok(client)
    }

    fn url(&self, endpoint: &str, query: &str) -> Result<Url> {
        let mut url = self.base_url.join(endpoint)?;
        if !query.is_empty() {
            url.set_query(Some(query));
        }
        Ok(url)
    }

    async fn public_once(&self, endpoint: &str, params: &Params) -> Result<ApiResponse> {
        let url = self.url(endpoint, &query_string(params))?;
        let session = self.session().await?;
        self.execute(endpoint, session.get(url)).await
    }

    async fn signed_once(
        &self,
        method: &Method,
        endpoint: &str,
        params: &Params,
    ) -> Result<ApiResponse> {
        let signer = self
            .signer
            .as_ref()
            .ok_or_else(|| BybitError::Config("signed request without credentials".to_string()))?;
        let timestamp = timestamp_ms();
        let recv_window = self.config.recv_window;
        let session = self.session().await?;

        let (builder, signature) = match *method {
            Method::GET => {
                let query = query_string(params);
                let signature = signer.sign_request(timestamp, recv_window, &query);
                (session.get(self.url(endpoint, &query)?), signature)
            }
            Method::POST => {
                let body = serde_json::to_string(params)?;
                let signature = signer.sign_request(timestamp, recv_window, &body);
                let builder = session
                    .post(self.url(endpoint, "")?)
                    .header(CONTENT_TYPE, "application/json")
                    .body(body);
                (builder, signature)
            }
            _ => {
                return Err(BybitError::Validation(format!(
                    "unsupported method {method} for {endpoint}"
                )));
            }
        };

        let builder = builder
            .header(HEADER_API_KEY, signer.api_key())
            .header(HEADER_SIGN, signature)
            .header(HEADER_SIGN_TYPE, SIGN_TYPE_HMAC)
            .header(HEADER_TIMESTAMP, timestamp.to_string())
            .header(HEADER_RECV_WINDOW, recv_window.to_string());

        self.execute(endpoint, builder).await
    }

    async fn execute(&self, endpoint: &str, builder: RequestBuilder) -> Result<ApiResponse> {
        let response = match builder.send().await {
            Ok(response) => response,
            Err(err) => return Err(self.transport_failure(endpoint, err).await),
        };

        let status = response.status();
        let body = match response.text().await {
            Ok(body) => body,
            Err(err) => return Err(self.transport_failure(endpoint, err).await),
        };

        if !status.is_success() {
            return Err(BybitError::api_error(
                status,
                truncate_for_log(&body, ERROR_BODY_MAX_BYTES),
            ));
        }

        validate_response(&body)
    }

    async fn transport_failure(&self, endpoint: &str, err: reqwest::Error) -> BybitError {
        let err = BybitError::from(err);
        if err.is_transport() {
            warn!(endpoint, error = %err, "connection error, recreating HTTP session");
            self.reset_session().await;
        }
        err
    }
}

/// `k=v&k=v` over non-null parameters, exactly as signed and sent
pub fn query_string(params: &Params) -> String {
    params
        .iter()
        .filter(|(_, value)| !value.is_null())
        .map(|(key, value)| match value {
            Value::String(s) => format!("{key}={s}"),
            other => format!("{key}={other}"),
        })
        .collect::<Vec<_>>()
        .join("&")
}

/// Serialize a typed request into signable parameters
pub fn to_params<T: Serialize>(request: &T) -> Result<Params> {
    match serde_json::to_value(request)? {
        Value::Object(map) => Ok(map),
        other => Err(BybitError::Validation(format!(
            "request must serialize to an object, got {other}"
        ))),
    }
}

pub(crate) fn timestamp_ms() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default()
}

pub(crate) fn truncate_for_log(value: &str, max_len: usize) -> String {
    if value.len() <= max_len {
        return value.to_string();
    }
    let mut end = max_len;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &value[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param, query_param_is_missing};
    use wiremock::{Match, Mock, MockServer, Request, ResponseTemplate};

    const API_KEY: &str = "test-key";
    const API_SECRET: &str = "test-secret";

    /// Recomputes the HMAC from the headers and the raw query or body
    struct ValidSignatureMatcher;

    impl Match for ValidSignatureMatcher {
        fn matches(&self, request: &Request) -> bool {
            let header = |name: &str| {
                request
                    .headers
                    .get(name)
                    .and_then(|value| value.to_str().ok())
                    .map(str::to_string)
            };
            let (Some(timestamp), Some(recv_window), Some(signature)) = (
                header(HEADER_TIMESTAMP).and_then(|v| v.parse::<u64>().ok()),
                header(HEADER_RECV_WINDOW).and_then(|v| v.parse::<u64>().ok()),
                header(HEADER_SIGN),
            ) else {
                return false;
            };

            let payload = if request.method.as_str() == "GET" {
                request.url.query().unwrap_or_default().to_string()
            } else {
                String::from_utf8_lossy(&request.body).to_string()
            };

            let expected = RequestSigner::new(API_KEY, API_SECRET).sign_request(
                timestamp,
                recv_window,
                &payload,
            );
            signature == expected
        }
    }

    fn signed_client(server: &MockServer, retry: RetryPolicy) -> BybitClient {
        let config = ClientConfig {
            retry,
            ..ClientConfig::default()
        };
        BybitClient::with_config_and_base_url(
            config,
            &server.uri(),
            Some(Credentials::new(API_KEY, API_SECRET)),
        )
        .expect("client init")
    }

    fn params(value: Value) -> Params {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn query_string_is_sorted_and_skips_nulls() {
        let params = params(json!({
            "symbol": "BTCUSDT",
            "category": "linear",
            "limit": 5,
            "orderId": null
        }));
        assert_eq!(query_string(&params), "category=linear&limit=5&symbol=BTCUSDT");
    }

    #[test]
    fn environment_selects_urls() {
        assert_eq!(Environment::from_testnet(true).rest_base_url(), TESTNET_BASE_URL);
        assert_eq!(
            Environment::Mainnet.stream_url(),
            "wss://stream.bybit.com/v5/public/linear"
        );
    }

    #[tokio::test]
    async fn signed_get_carries_valid_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v5/position/list"))
            .and(query_param("category", "linear"))
            .and(query_param("symbol", "BTCUSDT"))
            .and(header(HEADER_API_KEY, API_KEY))
            .and(header(HEADER_SIGN_TYPE, "2"))
            .and(header(HEADER_RECV_WINDOW, "5000"))
            .and(ValidSignatureMatcher)
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "retCode": 0,
                "retMsg": "OK",
                "result": {"list": []}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = signed_client(&server, RetryPolicy::default());
        let response = client
            .send_signed(
                Method::GET,
                "/v5/position/list",
                &params(json!({"category": "linear", "symbol": "BTCUSDT"})),
            )
            .await
            .expect("signed get");
        assert_eq!(response.ret_code, 0);
        assert!(client.is_session_open().await);
    }

    #[tokio::test]
    async fn signed_post_signs_json_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v5/position/switch-mode"))
            .and(header("content-type", "application/json"))
            .and(ValidSignatureMatcher)
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "retCode": 0,
                "retMsg": "OK",
                "result": {}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = signed_client(&server, RetryPolicy::default());
        client
            .send_signed(
                Method::POST,
                "/v5/position/switch-mode",
                &params(json!({"category": "linear", "coin": "USDT", "mode": 3})),
            )
            .await
            .expect("signed post");
    }

    #[tokio::test]
    async fn signed_call_without_credentials_is_config_error() {
        let server = MockServer::start().await;
        let client =
            BybitClient::with_config_and_base_url(ClientConfig::default(), &server.uri(), None)
                .unwrap();
        let err = client
            .send_signed(Method::GET, "/v5/position/list", &Params::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BybitError::Config(_)));
    }

    #[tokio::test]
    async fn malformed_envelope_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v5/market/mark-price-kline"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": {}})))
            .expect(1)
            .mount(&server)
            .await;

        let client = signed_client(
            &server,
            RetryPolicy {
                max_retries: 3,
                max_transient_retries: 3,
            },
        );
        let err = client
            .send_public("/v5/market/mark-price-kline", &Params::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BybitError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn http_error_status_becomes_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v5/market/instruments-info"))
            .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
            .mount(&server)
            .await;

        let client = signed_client(
            &server,
            RetryPolicy {
                max_retries: 0,
                max_transient_retries: 0,
            },
        );
        let err = client
            .send_public("/v5/market/instruments-info", &Params::new())
            .await
            .unwrap_err();
        assert_eq!(err.api_code(), Some(403));
    }

    #[tokio::test]
    async fn transient_code_is_resent_until_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v5/position/set-leverage"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "retCode": 10001,
                "retMsg": "params error",
                "result": {}
            })))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v5/position/set-leverage"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "retCode": 0,
                "retMsg": "OK",
                "result": {}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = signed_client(&server, RetryPolicy::default());
        let response = client
            .send_signed(Method::POST, "/v5/position/set-leverage", &Params::new())
            .await
            .unwrap();
        assert_eq!(response.ret_code, 0);
    }

    #[tokio::test]
    async fn connection_error_drops_session() {
        let client = BybitClient::with_config_and_base_url(
            ClientConfig {
                connect_timeout: Duration::from_millis(200),
                retry: RetryPolicy {
                    max_retries: 0,
                    max_transient_retries: 0,
                },
                ..ClientConfig::default()
            },
            "http://127.0.0.1:9",
            None,
        )
        .unwrap();

        let err = client
            .send_public("/v5/market/time", &Params::new())
            .await
            .unwrap_err();
        assert!(err.is_transport());
        assert!(!client.is_session_open().await);
    }

    #[tokio::test]
    async fn pagination_follows_cursor_and_stops_on_repeat() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v5/position/closed-pnl"))
            .and(query_param_is_missing("cursor"))
            .and(query_param("startTime", "1000"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "retCode": 0,
                "retMsg": "OK",
                "result": {"list": [{"id": 1}, {"id": 2}], "nextPageCursor": "page2"}
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v5/position/closed-pnl"))
            .and(query_param("cursor", "page2"))
            .and(query_param_is_missing("startTime"))
            .and(query_param_is_missing("endTime"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "retCode": 0,
                "retMsg": "OK",
                "result": {"list": [{"id": 3}], "nextPageCursor": "page2"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = signed_client(&server, RetryPolicy::default());
        let items = client
            .send_paginated(
                Method::GET,
                "/v5/position/closed-pnl",
                params(json!({"category": "linear", "startTime": 1000, "endTime": 2000})),
            )
            .await
            .unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(items[2]["id"], 3);
    }
}
