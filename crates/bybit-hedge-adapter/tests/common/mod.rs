/*
[INPUT]:  Test configuration and mock server requirements
[OUTPUT]: Shared test utilities, fixtures, and mock helpers
[POS]:    Test infrastructure - shared across all test modules
[UPDATE]: When adding new test patterns or fixtures
*/

//! Common test utilities for bybit-hedge-adapter tests

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bybit_hedge_adapter::{BybitClient, ClientConfig, Credentials, RetryPolicy};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use wiremock::MockServer;

pub const API_KEY: &str = "test-key";
pub const API_SECRET: &str = "test-secret";

/// Setup a mock HTTP server for testing
pub async fn setup_mock_server() -> MockServer {
    MockServer::start().await
}

/// Signed client pointed at the mock server with fast retries
pub fn test_client(server: &MockServer) -> BybitClient {
    let config = ClientConfig {
        timeout: Duration::from_secs(5),
        connect_timeout: Duration::from_secs(1),
        retry: RetryPolicy {
            max_retries: 0,
            max_transient_retries: 1,
        },
        ..ClientConfig::default()
    };
    BybitClient::with_config_and_base_url(
        config,
        &server.uri(),
        Some(Credentials::new(API_KEY, API_SECRET)),
    )
    .expect("mock server uri is a valid url")
}

/// Successful exchange envelope around `result`
pub fn envelope(result: Value) -> Value {
    json!({"retCode": 0, "retMsg": "OK", "result": result, "time": 1_700_000_000_000i64})
}

pub fn list_envelope(list: Value) -> Value {
    envelope(json!({"category": "linear", "list": list}))
}

#[derive(Debug, Clone)]
enum ServerCommand {
    Send(String),
    Drop,
}

/// Local WebSocket server recording every text frame it receives
pub struct MockWsServer {
    addr: SocketAddr,
    received: Arc<Mutex<Vec<Value>>>,
    connections: Arc<AtomicUsize>,
    commands: broadcast::Sender<ServerCommand>,
}

impl MockWsServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock ws server");
        let addr = listener.local_addr().expect("mock ws server address");
        let received = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));
        let (commands, _) = broadcast::channel(64);

        let accept_received = received.clone();
        let accept_connections = connections.clone();
        let accept_commands = commands.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let Ok(ws) = accept_async(stream).await else {
                    continue;
                };
                accept_connections.fetch_add(1, Ordering::SeqCst);
                let received = accept_received.clone();
                let mut commands = accept_commands.subscribe();

                tokio::spawn(async move {
                    let (mut write, mut read) = ws.split();
                    loop {
                        tokio::select! {
                            command = commands.recv() => match command {
                                Ok(ServerCommand::Send(frame)) => {
                                    if write.send(Message::Text(frame.into())).await.is_err() {
                                        break;
                                    }
                                }
                                Ok(ServerCommand::Drop) | Err(_) => break,
                            },
                            incoming = read.next() => match incoming {
                                Some(Ok(Message::Text(text))) => {
                                    if let Ok(value) = serde_json::from_str(text.as_str()) {
                                        received.lock().unwrap().push(value);
                                    }
                                }
                                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                                Some(Ok(_)) => {}
                            },
                        }
                    }
                });
            }
        });

        Self {
            addr,
            received,
            connections,
            commands,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> Vec<Value> {
        self.received.lock().unwrap().clone()
    }

    pub fn frames_with_op(&self, op: &str) -> Vec<Value> {
        self.received()
            .into_iter()
            .filter(|frame| frame.get("op").and_then(Value::as_str) == Some(op))
            .collect()
    }

    /// Push a frame to every open connection
    pub fn send(&self, frame: Value) {
        let _ = self.commands.send(ServerCommand::Send(frame.to_string()));
    }

    /// Drop every open connection without a close handshake
    pub fn drop_connections(&self) {
        let _ = self.commands.send(ServerCommand::Drop);
    }

    /// Poll until `condition` holds or five seconds pass
    pub async fn wait_until(&self, condition: impl Fn(&Self) -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while tokio::time::Instant::now() < deadline {
            if condition(self) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        condition(self)
    }
}
