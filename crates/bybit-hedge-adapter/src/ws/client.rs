/*
[INPUT]:  Stream URL, optional API credentials, topic templates and callbacks
[OUTPUT]: Mirrored market data dispatched to per-topic callbacks
[POS]:    WebSocket layer - persistent session with auth, keepalive and reconnect
[UPDATE]: When changing the session lifecycle or dispatch rules
*/

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at, sleep, timeout};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::http::client::{Credentials, Environment, timestamp_ms, truncate_for_log};
use crate::http::error::{BybitError, Result};

use super::book::{MarketMirror, OrderBookMirror, TickerMirror};
use super::message::{
    InboundFrame, StreamMessage, auth_frame, expand_template, kline_template, orderbook_template,
    ping_frame, subscription_frame, ticker_template,
};

const AUTH_EXPIRY_MS: u64 = 1_000;
const CLOSE_WAIT: Duration = Duration::from_secs(5);
const MESSAGE_SAMPLE_LIMIT: usize = 3;
const SUBSCRIPTION_LOG_LIMIT: usize = 10;
const UNHANDLED_LOG_LIMIT: usize = 3;
const PARSE_FAIL_LOG_LIMIT: usize = 3;
const RAW_LOG_MAX_BYTES: usize = 1024;

static MESSAGE_SAMPLE_COUNT: AtomicUsize = AtomicUsize::new(0);
static SUBSCRIBE_LOG_COUNT: AtomicUsize = AtomicUsize::new(0);
static UNHANDLED_LOG_COUNT: AtomicUsize = AtomicUsize::new(0);
static PARSE_FAIL_LOG_COUNT: AtomicUsize = AtomicUsize::new(0);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Callback invoked with every dispatched data frame
pub type StreamCallback = Arc<dyn Fn(StreamMessage) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closing,
}

#[derive(Clone)]
pub struct StreamConfig {
    pub url: String,
    pub ping_interval: Duration,
    pub reconnect_delay: Duration,
    pub credentials: Option<Credentials>,
}

impl StreamConfig {
    pub fn new(environment: Environment) -> Self {
        Self::with_url(environment.stream_url())
    }

    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ping_interval: Duration::from_secs(20),
            reconnect_delay: Duration::from_secs(1),
            credentials: None,
        }
    }

    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }
}

impl std::fmt::Debug for StreamConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamConfig")
            .field("url", &self.url)
            .field("ping_interval", &self.ping_interval)
            .field("reconnect_delay", &self.reconnect_delay)
            .field("authenticated", &self.credentials.is_some())
            .finish()
    }
}

struct Subscription {
    req_id: String,
    topics: Vec<String>,
}

#[derive(Default)]
struct Registry {
    subscriptions: Vec<Subscription>,
    callbacks: HashMap<String, StreamCallback>,
    default_callback: Option<StreamCallback>,
    mirror: MarketMirror,
    outbound: Option<mpsc::UnboundedSender<WsMessage>>,
}

struct Shared {
    config: StreamConfig,
    registry: Mutex<Registry>,
    state: watch::Sender<ConnectionState>,
    shutdown: watch::Sender<bool>,
    closing: AtomicBool,
}

impl Shared {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    fn auth_message(&self) -> Option<WsMessage> {
        let credentials = self.config.credentials.as_ref()?;
        let expires = timestamp_ms() + AUTH_EXPIRY_MS;
        let signature = credentials.signer().sign_ws_auth(expires);
        Some(text(auth_frame(&credentials.api_key, expires, &signature)))
    }
}

/// Streaming client for the public linear market channel
pub struct BybitStream {
    shared: Arc<Shared>,
    supervisor: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl BybitStream {
    pub fn new(config: StreamConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                config,
                registry: Mutex::new(Registry::default()),
                state,
                shutdown,
                closing: AtomicBool::new(false),
            }),
            supervisor: tokio::sync::Mutex::new(None),
        }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.shared.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Open the socket and start the session supervisor.
    ///
    /// Only the first handshake is reported to the caller. Later drops are
    /// handled by the supervisor, which reconnects after `reconnect_delay`
    /// and replays every registered subscription. Calling `connect` while a
    /// supervisor is alive is a no-op.
    pub async fn connect(&self) -> Result<()> {
        if self.shared.is_closing() {
            return Err(BybitError::WebSocket("stream is closed".to_string()));
        }

        let mut supervisor = self.supervisor.lock().await;
        if supervisor.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Ok(());
        }

        self.shared.set_state(ConnectionState::Connecting);
        let socket = match connect_async(self.shared.config.url.as_str()).await {
            Ok((socket, _response)) => socket,
            Err(err) => {
                self.shared.set_state(ConnectionState::Disconnected);
                return Err(BybitError::WebSocket(err.to_string()));
            }
        };
        info!(url = %self.shared.config.url, "ws connected");

        *supervisor = Some(tokio::spawn(supervise(self.shared.clone(), socket)));
        Ok(())
    }

    /// Callback for data frames whose topic has no registered callback
    pub fn set_default_callback(&self, callback: StreamCallback) {
        self.shared.registry().default_callback = Some(callback);
    }

    /// Register `callback` for every topic the template expands to and send
    /// the subscribe frame if a session is open. Returns the request id.
    pub fn subscribe(
        &self,
        template: &str,
        callback: StreamCallback,
        symbols: &[&str],
    ) -> Result<String> {
        if self.shared.is_closing() {
            return Err(BybitError::WebSocket("stream is closed".to_string()));
        }

        let topics = expand_template(template, symbols);
        let req_id = Uuid::new_v4().to_string();
        let frame = subscription_frame("subscribe", &req_id, &topics);

        let sent = {
            let mut registry = self.shared.registry();
            for topic in &topics {
                registry.callbacks.insert(topic.clone(), callback.clone());
            }
            registry.subscriptions.push(Subscription {
                req_id: req_id.clone(),
                topics: topics.clone(),
            });
            registry
                .outbound
                .as_ref()
                .is_some_and(|outbound| outbound.send(text(frame)).is_ok())
        };

        log_subscription_once("subscribe", &topics, sent);
        Ok(req_id)
    }

    pub fn unsubscribe(&self, template: &str, symbols: &[&str]) -> Result<()> {
        let topics = expand_template(template, symbols);
        let frame = subscription_frame("unsubscribe", &Uuid::new_v4().to_string(), &topics);

        let sent = {
            let mut registry = self.shared.registry();
            for topic in &topics {
                registry.callbacks.remove(topic);
                registry.mirror.remove(topic);
            }
            registry
                .subscriptions
                .retain(|subscription| !subscription.topics.iter().any(|t| topics.contains(t)));
            registry
                .outbound
                .as_ref()
                .is_some_and(|outbound| outbound.send(text(frame)).is_ok())
        };

        log_subscription_once("unsubscribe", &topics, sent);
        Ok(())
    }

    pub fn subscribe_orderbook(
        &self,
        symbols: &[&str],
        depth: u32,
        callback: StreamCallback,
    ) -> Result<String> {
        self.subscribe(&orderbook_template(depth), callback, symbols)
    }

    pub fn subscribe_tickers(&self, symbols: &[&str], callback: StreamCallback) -> Result<String> {
        self.subscribe(&ticker_template(), callback, symbols)
    }

    pub fn subscribe_klines(
        &self,
        symbols: &[&str],
        interval: &str,
        callback: StreamCallback,
    ) -> Result<String> {
        self.subscribe(&kline_template(interval), callback, symbols)
    }

    pub fn subscribed_topics(&self) -> Vec<String> {
        let registry = self.shared.registry();
        let mut topics: Vec<String> = registry
            .subscriptions
            .iter()
            .flat_map(|subscription| subscription.topics.iter().cloned())
            .collect();
        topics.sort();
        topics.dedup();
        topics
    }

    pub fn order_book(&self, topic: &str) -> Option<OrderBookMirror> {
        self.shared.registry().mirror.order_book(topic).cloned()
    }

    pub fn ticker(&self, topic: &str) -> Option<TickerMirror> {
        self.shared.registry().mirror.ticker(topic).cloned()
    }

    pub fn is_closing(&self) -> bool {
        self.shared.is_closing()
    }

    /// Stop the session for good; later calls return immediately
    pub async fn close(&self) {
        if self.shared.closing.swap(true, Ordering::SeqCst) {
            return;
        }

        self.shared.set_state(ConnectionState::Closing);
        self.shared.shutdown.send_replace(true);

        if let Some(mut handle) = self.supervisor.lock().await.take()
            && timeout(CLOSE_WAIT, &mut handle).await.is_err()
        {
            warn!("ws supervisor did not stop in time; aborting");
            handle.abort();
        }

        self.shared.registry().outbound = None;
        self.shared.set_state(ConnectionState::Disconnected);
        info!(url = %self.shared.config.url, "ws closed");
    }
}

impl std::fmt::Debug for BybitStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BybitStream")
            .field("config", &self.shared.config)
            .field("state", &self.state())
            .finish()
    }
}

async fn supervise(shared: Arc<Shared>, socket: Socket) {
    let mut shutdown = shared.shutdown.subscribe();
    let mut socket = socket;

    'run: loop {
        shared.set_state(ConnectionState::Connected);
        run_session(&shared, socket, &mut shutdown).await;

        if shared.is_closing() {
            break;
        }
        shared.set_state(ConnectionState::Reconnecting);

        socket = loop {
            tokio::select! {
                _ = closed(&mut shutdown) => break 'run,
                _ = sleep(shared.config.reconnect_delay) => {}
            }
            match connect_async(shared.config.url.as_str()).await {
                Ok((socket, _response)) => {
                    info!(url = %shared.config.url, "ws reconnected");
                    break socket;
                }
                Err(err) => warn!(url = %shared.config.url, error = %err, "ws reconnect failed"),
            }
        };
    }

    shared.registry().outbound = None;
    if !shared.is_closing() {
        shared.set_state(ConnectionState::Disconnected);
    }
}

async fn run_session(shared: &Shared, socket: Socket, shutdown: &mut watch::Receiver<bool>) {
    let (mut write, mut read) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();

    if let Some(auth) = shared.auth_message() {
        let _ = outbound_tx.send(auth);
    }
    {
        let mut registry = shared.registry();
        for subscription in &registry.subscriptions {
            let frame = subscription_frame("subscribe", &subscription.req_id, &subscription.topics);
            let _ = outbound_tx.send(text(frame));
        }
        if !registry.subscriptions.is_empty() {
            debug!(count = registry.subscriptions.len(), "ws subscriptions replayed");
        }
        registry.outbound = Some(outbound_tx);
    }

    let period = shared.config.ping_interval;
    let mut keepalive = interval_at(Instant::now() + period, period);

    loop {
        tokio::select! {
            _ = closed(shutdown) => {
                let _ = write.send(WsMessage::Close(None)).await;
                break;
            }
            outbound = outbound_rx.recv() => {
                let Some(message) = outbound else { break };
                if write.send(message).await.is_err() {
                    break;
                }
            }
            _ = keepalive.tick() => {
                if write.send(text(ping_frame())).await.is_err() {
                    break;
                }
            }
            incoming = read.next() => {
                match incoming {
                    Some(Ok(WsMessage::Text(raw))) => handle_text(shared, raw.as_str()),
                    Some(Ok(WsMessage::Binary(bytes))) => {
                        if let Ok(raw) = std::str::from_utf8(&bytes) {
                            handle_text(shared, raw);
                        }
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        debug!(frame = ?frame, "ws close frame received");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(error = %err, "ws read failed");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    shared.registry().outbound = None;
    if !shared.is_closing() {
        warn!(url = %shared.config.url, "ws session ended");
    }
}

async fn closed(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

fn handle_text(shared: &Shared, raw: &str) {
    let frame = serde_json::from_str::<Value>(raw).and_then(InboundFrame::classify);
    let frame = match frame {
        Ok(frame) => frame,
        Err(err) => {
            log_parse_fail_once(&err, raw);
            return;
        }
    };

    match frame {
        InboundFrame::Pong => debug!("ws pong"),
        InboundFrame::Auth { success: true, .. } => info!("ws authenticated"),
        InboundFrame::Auth { ret_msg, .. } => warn!(ret_msg = %ret_msg, "ws auth rejected"),
        InboundFrame::SubscriptionAck { op, success, ret_msg } => {
            if success {
                debug!(op = %op, "ws subscription acknowledged");
            } else {
                warn!(op = %op, ret_msg = %ret_msg, "ws subscription rejected");
            }
        }
        InboundFrame::Data(message) => dispatch(shared, message, raw),
    }
}

fn dispatch(shared: &Shared, message: StreamMessage, raw: &str) {
    let routed = {
        let mut registry = shared.registry();
        let callback = message
            .topic
            .as_ref()
            .and_then(|topic| registry.callbacks.get(topic).cloned());
        match callback {
            Some(callback) => match registry.mirror.apply(message) {
                Ok(merged) => Some((callback, merged)),
                Err(err) => {
                    log_parse_fail_once(&err, raw);
                    None
                }
            },
            None => match registry.default_callback.clone() {
                Some(callback) => Some((callback, message)),
                None => {
                    log_unhandled_once(message.topic.as_deref(), raw);
                    None
                }
            },
        }
    };

    if let Some((callback, message)) = routed {
        log_message_sample_once(&message);
        callback(message);
    }
}

fn text(frame: String) -> WsMessage {
    WsMessage::Text(frame.into())
}

fn log_subscription_once(action: &'static str, topics: &[String], sent: bool) {
    let count = SUBSCRIBE_LOG_COUNT.fetch_add(1, Ordering::Relaxed);
    if count >= SUBSCRIPTION_LOG_LIMIT {
        return;
    }
    info!(
        sample_index = count + 1,
        sample_limit = SUBSCRIPTION_LOG_LIMIT,
        action,
        topics = ?topics,
        sent,
        "ws subscription registered"
    );
}

fn log_message_sample_once(message: &StreamMessage) {
    let count = MESSAGE_SAMPLE_COUNT.fetch_add(1, Ordering::Relaxed);
    if count >= MESSAGE_SAMPLE_LIMIT {
        return;
    }
    info!(
        sample_index = count + 1,
        sample_limit = MESSAGE_SAMPLE_LIMIT,
        topic = message.topic.as_deref().unwrap_or("-"),
        kind = ?message.kind,
        "ws message sample"
    );
}

fn log_unhandled_once(topic: Option<&str>, raw: &str) {
    let count = UNHANDLED_LOG_COUNT.fetch_add(1, Ordering::Relaxed);
    if count < UNHANDLED_LOG_LIMIT {
        info!(
            sample_index = count + 1,
            sample_limit = UNHANDLED_LOG_LIMIT,
            topic = topic.unwrap_or("-"),
            bytes = raw.len(),
            "ws message has no callback"
        );
        let preview = truncate_for_log(raw, RAW_LOG_MAX_BYTES);
        debug!(
            sample_index = count + 1,
            sample_limit = UNHANDLED_LOG_LIMIT,
            message = %preview,
            "ws message has no callback"
        );
    }
}

fn log_parse_fail_once(err: &serde_json::Error, raw: &str) {
    let count = PARSE_FAIL_LOG_COUNT.fetch_add(1, Ordering::Relaxed);
    if count < PARSE_FAIL_LOG_LIMIT {
        info!(
            sample_index = count + 1,
            sample_limit = PARSE_FAIL_LOG_LIMIT,
            error = %err,
            bytes = raw.len(),
            "ws message parse failed"
        );
        let preview = truncate_for_log(raw, RAW_LOG_MAX_BYTES);
        debug!(
            sample_index = count + 1,
            sample_limit = PARSE_FAIL_LOG_LIMIT,
            error = %err,
            message = %preview,
            "ws message parse failed"
        );
    }
}
