/*
[INPUT]:  `tickers.{symbol}` stream or the shared `prices` hash
[OUTPUT]: Latest mark price per symbol via `watch`
[POS]:    Data layer - mark price distribution for the hedge scan (no trading logic)
[UPDATE]: When changing price sources or subscription handling
*/

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use bybit_hedge_adapter::ws::ticker_template;
use bybit_hedge_adapter::{
    BybitStream, ConnectionState, StreamCallback, StreamConfig, StreamMessage, TickerMirror,
};
use rust_decimal::Decimal;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::settings::SettingsStore;

struct TrackedPrice {
    sender: watch::Sender<Decimal>,
    holders: usize,
}

/// Mirrors ticker topics into one `watch` channel per symbol.
///
/// Each channel starts at zero, which callers treat as "no price yet". A
/// symbol stays subscribed until every holder has released it.
pub struct MarkPriceHub {
    stream: BybitStream,
    prices: Mutex<HashMap<String, TrackedPrice>>,
}

impl MarkPriceHub {
    pub fn new(config: StreamConfig) -> Self {
        Self {
            stream: BybitStream::new(config),
            prices: Mutex::new(HashMap::new()),
        }
    }

    fn prices(&self) -> MutexGuard<'_, HashMap<String, TrackedPrice>> {
        self.prices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn start(&self) -> Result<()> {
        self.stream.connect().await?;
        Ok(())
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.stream.state_receiver()
    }

    /// Take a hold on `symbol` and return its price receiver.
    ///
    /// The first holder subscribes the ticker topic.
    pub fn subscribe_price(&self, symbol: &str) -> Result<watch::Receiver<Decimal>> {
        let sender = {
            let mut prices = self.prices();
            if let Some(tracked) = prices.get_mut(symbol) {
                tracked.holders += 1;
                return Ok(tracked.sender.subscribe());
            }
            let (sender, _) = watch::channel(Decimal::ZERO);
            prices.insert(
                symbol.to_string(),
                TrackedPrice {
                    sender: sender.clone(),
                    holders: 1,
                },
            );
            sender
        };

        let receiver = sender.subscribe();
        if let Err(err) = self.stream.subscribe_tickers(&[symbol], price_callback(sender)) {
            self.prices().remove(symbol);
            return Err(err.into());
        }
        debug!(symbol, "tracking mark price");
        Ok(receiver)
    }

    /// Latest mark price, or zero when the symbol is not tracked yet
    pub fn latest(&self, symbol: &str) -> Decimal {
        self.prices()
            .get(symbol)
            .map(|tracked| *tracked.sender.borrow())
            .unwrap_or_default()
    }

    pub fn is_tracked(&self, symbol: &str) -> bool {
        self.prices().contains_key(symbol)
    }

    pub fn holders(&self, symbol: &str) -> usize {
        self.prices().get(symbol).map_or(0, |tracked| tracked.holders)
    }

    pub fn tracked_symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.prices().keys().cloned().collect();
        symbols.sort();
        symbols
    }

    /// Drop one hold on `symbol`; the last release unsubscribes the topic
    pub fn untrack(&self, symbol: &str) -> Result<()> {
        {
            let mut prices = self.prices();
            let Some(tracked) = prices.get_mut(symbol) else {
                return Ok(());
            };
            tracked.holders = tracked.holders.saturating_sub(1);
            if tracked.holders > 0 {
                return Ok(());
            }
            prices.remove(symbol);
        }
        self.stream.unsubscribe(&ticker_template(), &[symbol])?;
        debug!(symbol, "mark price released");
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.stream.close().await;
        info!("mark price hub stopped");
    }
}

/// Pushes the mark price out of every synthesized ticker snapshot
fn price_callback(sender: watch::Sender<Decimal>) -> StreamCallback {
    Arc::new(move |message: StreamMessage| {
        match TickerMirror::from_snapshot(&message.data).mark_price() {
            Some(price) => {
                sender.send_replace(price);
            }
            None => debug!(topic = ?message.topic, "ticker update without mark price"),
        }
    })
}

/// One engine's view of a shared [`MarkPriceHub`].
///
/// Holds at most one hold per symbol and gives every hold back when dropped.
/// Clones start with no holds of their own.
pub struct StreamFeed {
    hub: Arc<MarkPriceHub>,
    held: Mutex<HashSet<String>>,
}

impl StreamFeed {
    pub fn new(hub: Arc<MarkPriceHub>) -> Self {
        Self {
            hub,
            held: Mutex::new(HashSet::new()),
        }
    }

    pub fn hub(&self) -> &Arc<MarkPriceHub> {
        &self.hub
    }

    fn held(&self) -> MutexGuard<'_, HashSet<String>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn mark_price(&self, symbol: &str) -> Decimal {
        let mut held = self.held();
        if !held.contains(symbol) {
            match self.hub.subscribe_price(symbol) {
                Ok(_) => {
                    held.insert(symbol.to_string());
                }
                Err(err) => warn!(symbol, error = %err, "subscribe mark price failed"),
            }
        }
        drop(held);
        self.hub.latest(symbol)
    }

    fn release(&self, symbol: &str) {
        if self.held().remove(symbol)
            && let Err(err) = self.hub.untrack(symbol)
        {
            warn!(symbol, error = %err, "untrack mark price failed");
        }
    }
}

impl Clone for StreamFeed {
    fn clone(&self) -> Self {
        Self::new(self.hub.clone())
    }
}

impl Drop for StreamFeed {
    fn drop(&mut self) {
        let held = std::mem::take(&mut *self.held());
        for symbol in held {
            if let Err(err) = self.hub.untrack(&symbol) {
                warn!(symbol, error = %err, "untrack mark price failed");
            }
        }
    }
}

/// Where the hedge scan reads prices from
#[derive(Clone)]
pub enum PriceFeed {
    Store(SettingsStore),
    Stream(StreamFeed),
}

impl PriceFeed {
    pub fn stream(hub: Arc<MarkPriceHub>) -> Self {
        PriceFeed::Stream(StreamFeed::new(hub))
    }

    /// Latest mark price; zero means no usable price
    pub async fn mark_price(&self, symbol: &str) -> Decimal {
        match self {
            PriceFeed::Store(settings) => match settings.mark_price(symbol).await {
                Ok(price) => price,
                Err(err) => {
                    warn!(symbol, error = %err, "read mark price from store failed");
                    Decimal::ZERO
                }
            },
            PriceFeed::Stream(feed) => feed.mark_price(symbol),
        }
    }

    /// Give back this feed's hold on a coin it no longer tracks
    pub fn release(&self, symbol: &str) {
        if let PriceFeed::Stream(feed) = self {
            feed.release(symbol);
        }
    }

    pub async fn shutdown(&self) {
        if let PriceFeed::Stream(feed) = self {
            feed.hub().shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn ticker_message(data: serde_json::Value) -> StreamMessage {
        serde_json::from_value(json!({
            "topic": "tickers.BTCUSDT",
            "type": "snapshot",
            "ts": 1,
            "data": data
        }))
        .unwrap()
    }

    fn offline_hub() -> MarkPriceHub {
        MarkPriceHub::new(StreamConfig::with_url("ws://127.0.0.1:9"))
    }

    #[test]
    fn callback_publishes_non_zero_mark_price() {
        let (sender, receiver) = watch::channel(Decimal::ZERO);
        let callback = price_callback(sender);

        callback(ticker_message(json!({"symbol": "BTCUSDT", "markPrice": "47000.5"})));
        assert_eq!(*receiver.borrow(), Decimal::new(470005, 1));

        callback(ticker_message(json!({"symbol": "BTCUSDT", "markPrice": "0"})));
        callback(ticker_message(json!({"symbol": "BTCUSDT", "bid1Price": "1"})));
        assert_eq!(*receiver.borrow(), Decimal::new(470005, 1));
    }

    #[tokio::test]
    async fn subscriptions_are_shared_per_symbol() {
        let hub = offline_hub();
        let first = hub.subscribe_price("BTCUSDT").unwrap();
        let second = hub.subscribe_price("BTCUSDT").unwrap();

        assert!(first.same_channel(&second));
        assert_eq!(hub.tracked_symbols(), vec!["BTCUSDT"]);
        assert_eq!(hub.holders("BTCUSDT"), 2);
        assert_eq!(hub.latest("BTCUSDT"), Decimal::ZERO);

        hub.untrack("BTCUSDT").unwrap();
        assert!(hub.is_tracked("BTCUSDT"));
        hub.untrack("BTCUSDT").unwrap();
        assert!(!hub.is_tracked("BTCUSDT"));
    }

    #[tokio::test]
    async fn store_feed_reads_prices_hash() {
        let settings = SettingsStore::new(Arc::new(MemoryStore::new()));
        settings
            .store()
            .hset("prices", "BTCUSDT", "47000")
            .await
            .unwrap();

        let feed = PriceFeed::Store(settings);
        assert_eq!(feed.mark_price("BTCUSDT").await, Decimal::from(47000));
        assert_eq!(feed.mark_price("ETHUSDT").await, Decimal::ZERO);
    }

    #[tokio::test]
    async fn stream_feed_tracks_on_first_read() {
        let hub = Arc::new(offline_hub());
        let feed = PriceFeed::stream(hub.clone());

        assert_eq!(feed.mark_price("ETHUSDT").await, Decimal::ZERO);
        assert_eq!(feed.mark_price("ETHUSDT").await, Decimal::ZERO);
        assert_eq!(hub.holders("ETHUSDT"), 1);

        feed.release("ETHUSDT");
        assert!(!hub.is_tracked("ETHUSDT"));
    }

    #[tokio::test]
    async fn release_by_one_user_keeps_price_for_another() {
        let hub = Arc::new(offline_hub());
        let user_a = PriceFeed::stream(hub.clone());
        let user_b = user_a.clone();

        user_a.mark_price("BTCUSDT").await;
        user_b.mark_price("BTCUSDT").await;
        let receiver = {
            let prices = hub.prices();
            let tracked = &prices["BTCUSDT"];
            tracked.sender.send_replace(Decimal::from(47000));
            tracked.sender.subscribe()
        };

        user_a.release("BTCUSDT");
        assert_eq!(user_b.mark_price("BTCUSDT").await, Decimal::from(47000));
        assert_eq!(hub.holders("BTCUSDT"), 1);
        assert!(receiver.has_changed().is_ok(), "receiver stays open");

        user_b.release("BTCUSDT");
        assert!(!hub.is_tracked("BTCUSDT"));
    }

    #[tokio::test]
    async fn dropped_feed_gives_back_its_holds() {
        let hub = Arc::new(offline_hub());
        let survivor = PriceFeed::stream(hub.clone());
        survivor.mark_price("SOLUSDT").await;
        {
            let stopped = survivor.clone();
            stopped.mark_price("SOLUSDT").await;
            stopped.mark_price("XRPUSDT").await;
            assert_eq!(hub.holders("SOLUSDT"), 2);
        }

        assert_eq!(hub.holders("SOLUSDT"), 1);
        assert!(!hub.is_tracked("XRPUSDT"));
    }
}
