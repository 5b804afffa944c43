/*
[INPUT]:  Exchange position snapshots, live trade settings, key-value store
[OUTPUT]: Per-coin hedge pair registry and the hedge trigger decision
[POS]:    Domain layer - one user's hedge state, persisted on every mutation
[UPDATE]: When leg lifecycle or trigger rules change
*/

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use bybit_hedge_adapter::{PositionIdx, PositionInfo};
use rust_decimal::Decimal;
use tokio::sync::{RwLock, watch};
use tracing::{debug, info, warn};

use crate::position::{
    HedgePosition, LegKind, MainPosition, PositionCore, SecondaryPosition, TrackedLeg,
};
use crate::settings::TradeSettings;
use crate::sizing;
use crate::store::KeyValueStore;

const KEY_PREFIX: &str = "hedge_positions";

pub fn hedge_positions_key(user_id: i64) -> String {
    format!("{KEY_PREFIX}:{user_id}")
}

/// Registry of one user's hedge pairs.
///
/// The map is the in-process source of truth; every mutation is written
/// through to a per-user hash (one field per coin) while the write lock is
/// held, so the stored record follows the same order as the mutations.
pub struct HedgePositionManager {
    user_id: i64,
    key: String,
    store: Arc<dyn KeyValueStore>,
    settings: watch::Receiver<TradeSettings>,
    positions: RwLock<HashMap<String, HedgePosition>>,
}

impl HedgePositionManager {
    pub fn new(
        user_id: i64,
        store: Arc<dyn KeyValueStore>,
        settings: watch::Receiver<TradeSettings>,
    ) -> Self {
        Self {
            user_id,
            key: hedge_positions_key(user_id),
            store,
            settings,
            positions: RwLock::new(HashMap::new()),
        }
    }

    pub fn user_id(&self) -> i64 {
        self.user_id
    }

    /// Replace the registry with the stored hash
    pub async fn load(&self) -> Result<usize> {
        let raw = self
            .store
            .hgetall(&self.key)
            .await
            .with_context(|| format!("load {}", self.key))?;

        let mut loaded = HashMap::with_capacity(raw.len());
        for (coin, record) in raw {
            match serde_json::from_str::<HedgePosition>(&record) {
                Ok(position) if !position.is_empty() => {
                    loaded.insert(coin, position);
                }
                Ok(_) => debug!(coin = %coin, "skipping empty hedge record"),
                Err(err) => warn!(coin = %coin, error = %err, "skipping malformed hedge record"),
            }
        }

        let count = loaded.len();
        *self.positions.write().await = loaded;
        info!(user_id = self.user_id, count, "hedge positions loaded");
        Ok(count)
    }

    async fn persist(&self, coin: &str, position: Option<&HedgePosition>) -> Result<()> {
        match position {
            Some(position) => {
                let record = serde_json::to_string(position)?;
                self.store.hset(&self.key, coin, &record).await
            }
            None => self.store.hdel(&self.key, coin).await,
        }
    }

    /// Write one coin's record, or delete it when the coin is not tracked
    pub async fn save_position(&self, coin: &str) -> Result<()> {
        let positions = self.positions.read().await;
        self.persist(coin, positions.get(coin)).await
    }

    pub async fn save_all(&self) -> Result<()> {
        let positions = self.positions.read().await;
        let entries = positions
            .iter()
            .map(|(coin, position)| -> Result<(String, String)> {
                Ok((coin.clone(), serde_json::to_string(position)?))
            })
            .collect::<Result<Vec<_>>>()?;
        self.store.hset_multiple(&self.key, &entries).await
    }

    /// Record the directional leg and arm its hedge trigger.
    ///
    /// Returns `false` when the snapshot is not a hedge-mode leg.
    pub async fn set_main_position(
        &self,
        position: &PositionInfo,
        tp_order_id: &str,
    ) -> Result<bool> {
        let Some(core) = PositionCore::from_exchange(position, tp_order_id) else {
            warn!(
                symbol = %position.symbol,
                position_idx = position.position_idx,
                "main leg is not a hedge-mode position"
            );
            return Ok(false);
        };

        let hedge_pct = self.settings.borrow().hedge_percentage;
        let tracking = sizing::tracking_price(core.entry_price, hedge_pct, core.position_idx);
        let main = MainPosition {
            core,
            take_profit_price: position.take_profit,
            tracking_price: Some(tracking),
        };

        let mut positions = self.positions.write().await;
        let entry = positions
            .entry(position.symbol.clone())
            .or_insert_with(|| HedgePosition::new(&position.symbol));
        entry.main_position = Some(main);
        self.persist(&position.symbol, Some(&*entry)).await?;

        info!(symbol = %position.symbol, tracking_price = %tracking, "main leg recorded");
        Ok(true)
    }

    /// Record the hedge leg; ignored unless the coin already has a pair
    pub async fn set_secondary_position(
        &self,
        position: &PositionInfo,
        sl_order_id: &str,
    ) -> Result<bool> {
        let Some(core) = PositionCore::from_exchange(position, sl_order_id) else {
            warn!(
                symbol = %position.symbol,
                position_idx = position.position_idx,
                "hedge leg is not a hedge-mode position"
            );
            return Ok(false);
        };

        let mut positions = self.positions.write().await;
        let Some(entry) = positions.get_mut(&position.symbol) else {
            warn!(symbol = %position.symbol, "ignoring hedge leg without a tracked pair");
            return Ok(false);
        };
        entry.secondary_position = Some(SecondaryPosition {
            core,
            stop_loss_price: position.stop_loss,
        });
        self.persist(&position.symbol, Some(&*entry)).await?;

        info!(symbol = %position.symbol, "hedge leg recorded");
        Ok(true)
    }

    /// True once price has crossed the main leg's tracking price and no
    /// hedge leg exists yet.
    pub async fn should_create_hedge(&self, coin: &str, current_price: Decimal) -> bool {
        let positions = self.positions.read().await;
        let Some(pair) = positions.get(coin) else {
            return false;
        };
        if pair.secondary_position.is_some() {
            return false;
        }
        let Some(main) = &pair.main_position else {
            return false;
        };
        let Some(tracking) = main.tracking_price.filter(|price| !price.is_zero()) else {
            return false;
        };

        match main.core.position_idx {
            PositionIdx::Long => current_price <= tracking,
            PositionIdx::Short => current_price >= tracking,
        }
    }

    pub async fn remove_main_position(&self, coin: &str) -> Result<Option<MainPosition>> {
        self.remove_leg(coin, |pair| pair.main_position.take()).await
    }

    pub async fn remove_secondary_position(&self, coin: &str) -> Result<Option<SecondaryPosition>> {
        self.remove_leg(coin, |pair| pair.secondary_position.take()).await
    }

    pub async fn remove_leg_of_kind(&self, coin: &str, kind: LegKind) -> Result<bool> {
        let removed = match kind {
            LegKind::Main => self.remove_main_position(coin).await?.is_some(),
            LegKind::Secondary => self.remove_secondary_position(coin).await?.is_some(),
        };
        Ok(removed)
    }

    async fn remove_leg<T>(
        &self,
        coin: &str,
        take: impl FnOnce(&mut HedgePosition) -> Option<T>,
    ) -> Result<Option<T>> {
        let mut positions = self.positions.write().await;
        let Some(pair) = positions.get_mut(coin) else {
            return Ok(None);
        };
        let removed = take(pair);
        if pair.is_empty() {
            positions.remove(coin);
        }
        self.persist(coin, positions.get(coin)).await?;
        Ok(removed)
    }

    pub async fn remove_all(&self, coin: &str) -> Result<Option<HedgePosition>> {
        let mut positions = self.positions.write().await;
        let removed = positions.remove(coin);
        if removed.is_some() {
            self.persist(coin, None).await?;
        }
        Ok(removed)
    }

    pub async fn main_position(&self, coin: &str) -> Option<MainPosition> {
        let positions = self.positions.read().await;
        positions.get(coin)?.main_position.clone()
    }

    pub async fn secondary_position(&self, coin: &str) -> Option<SecondaryPosition> {
        let positions = self.positions.read().await;
        positions.get(coin)?.secondary_position.clone()
    }

    pub async fn position(&self, coin: &str) -> Option<HedgePosition> {
        self.positions.read().await.get(coin).cloned()
    }

    pub async fn tp_order(&self, coin: &str) -> Option<String> {
        self.main_position(coin).await.map(|main| main.core.tpsl_order_id)
    }

    pub async fn sl_order(&self, coin: &str) -> Option<String> {
        self.secondary_position(coin)
            .await
            .map(|secondary| secondary.core.tpsl_order_id)
    }

    pub async fn tracking_price(&self, coin: &str) -> Option<Decimal> {
        self.main_position(coin).await?.tracking_price
    }

    pub async fn all_coins(&self) -> Vec<String> {
        let mut coins: Vec<String> = self.positions.read().await.keys().cloned().collect();
        coins.sort();
        coins
    }

    /// Coins whose main leg is still open
    pub async fn coins_with_main(&self) -> Vec<String> {
        let positions = self.positions.read().await;
        let mut coins: Vec<String> = positions
            .iter()
            .filter(|(_, pair)| pair.main_position.is_some())
            .map(|(coin, _)| coin.clone())
            .collect();
        coins.sort();
        coins
    }

    pub async fn has_any_position(&self, coin: &str) -> bool {
        self.positions.read().await.contains_key(coin)
    }

    pub async fn has_main_position(&self, coin: &str) -> bool {
        self.main_position(coin).await.is_some()
    }

    pub async fn has_secondary_position(&self, coin: &str) -> bool {
        self.secondary_position(coin).await.is_some()
    }

    pub async fn len(&self) -> usize {
        self.positions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.positions.read().await.is_empty()
    }

    /// Every leg across all coins, sorted by symbol with the main leg first
    pub async fn all_legs(&self) -> Vec<TrackedLeg> {
        let positions = self.positions.read().await;
        let mut legs = Vec::with_capacity(positions.len() * 2);
        for (coin, pair) in positions.iter() {
            if let Some(main) = &pair.main_position {
                legs.push(TrackedLeg {
                    symbol: coin.clone(),
                    kind: LegKind::Main,
                    core: main.core.clone(),
                });
            }
            if let Some(secondary) = &pair.secondary_position {
                legs.push(TrackedLeg {
                    symbol: coin.clone(),
                    kind: LegKind::Secondary,
                    core: secondary.core.clone(),
                });
            }
        }
        legs.sort_by_key(|leg| (leg.symbol.clone(), !leg.kind.is_main()));
        legs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::str::FromStr;

    fn dec(value: &str) -> Decimal {
        Decimal::from_str(value).unwrap()
    }

    fn manager_with(hedge_pct: &str) -> (HedgePositionManager, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let settings = TradeSettings {
            hedge_percentage: dec(hedge_pct),
            ..TradeSettings::default()
        };
        let (_tx, rx) = watch::channel(settings);
        (HedgePositionManager::new(9, store.clone(), rx), store)
    }

    fn position(symbol: &str, side: &str, idx: u8, price: &str) -> PositionInfo {
        serde_json::from_value(json!({
            "symbol": symbol,
            "side": side,
            "size": "1",
            "avgPrice": price,
            "positionValue": price,
            "leverage": "10",
            "takeProfit": "110",
            "stopLoss": "94.5",
            "positionIdx": idx,
            "updatedTime": "1700000000000"
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn long_main_leg_triggers_below_tracking_price() {
        let (manager, _) = manager_with("5");
        let long = position("BTCUSDT", "Buy", 1, "100");
        assert!(manager.set_main_position(&long, "tp").await.unwrap());

        assert_eq!(manager.tracking_price("BTCUSDT").await, Some(dec("95")));
        assert!(manager.should_create_hedge("BTCUSDT", dec("94")).await);
        assert!(manager.should_create_hedge("BTCUSDT", dec("95")).await);
        assert!(!manager.should_create_hedge("BTCUSDT", dec("96")).await);
        assert!(!manager.should_create_hedge("ETHUSDT", dec("1")).await);
    }

    #[tokio::test]
    async fn short_main_leg_triggers_above_tracking_price() {
        let (manager, _) = manager_with("5");
        manager
            .set_main_position(&position("ETHUSDT", "Sell", 2, "100"), "tp")
            .await
            .unwrap();

        assert!(manager.should_create_hedge("ETHUSDT", dec("106")).await);
        assert!(!manager.should_create_hedge("ETHUSDT", dec("104")).await);
    }

    #[tokio::test]
    async fn existing_hedge_leg_blocks_another() {
        let (manager, _) = manager_with("5");
        manager
            .set_main_position(&position("BTCUSDT", "Buy", 1, "100"), "tp")
            .await
            .unwrap();
        assert!(
            manager
                .set_secondary_position(&position("BTCUSDT", "Sell", 2, "94"), "sl")
                .await
                .unwrap()
        );

        assert!(!manager.should_create_hedge("BTCUSDT", dec("90")).await);
        assert_eq!(manager.sl_order("BTCUSDT").await.as_deref(), Some("sl"));
        assert_eq!(
            manager.secondary_position("BTCUSDT").await.unwrap().stop_loss_price,
            dec("94.5")
        );
    }

    #[tokio::test]
    async fn orphan_hedge_leg_is_ignored() {
        let (manager, store) = manager_with("5");
        let applied = manager
            .set_secondary_position(&position("BTCUSDT", "Sell", 2, "94"), "sl")
            .await
            .unwrap();

        assert!(!applied);
        assert!(manager.is_empty().await);
        assert!(!store.exists("hedge_positions:9").await.unwrap());
    }

    #[tokio::test]
    async fn pair_is_deleted_once_both_legs_are_gone() {
        let (manager, store) = manager_with("5");
        manager
            .set_main_position(&position("BTCUSDT", "Buy", 1, "100"), "tp")
            .await
            .unwrap();
        manager
            .set_secondary_position(&position("BTCUSDT", "Sell", 2, "94"), "sl")
            .await
            .unwrap();

        assert!(manager.remove_main_position("BTCUSDT").await.unwrap().is_some());
        assert!(manager.has_any_position("BTCUSDT").await);
        assert!(store.hget("hedge_positions:9", "BTCUSDT").await.unwrap().is_some());

        assert!(manager.remove_secondary_position("BTCUSDT").await.unwrap().is_some());
        assert!(!manager.has_any_position("BTCUSDT").await);
        assert!(store.hget("hedge_positions:9", "BTCUSDT").await.unwrap().is_none());
        assert!(manager.remove_main_position("BTCUSDT").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn registry_survives_reload() {
        let (manager, store) = manager_with("5");
        manager
            .set_main_position(&position("BTCUSDT", "Buy", 1, "100"), "tp")
            .await
            .unwrap();
        manager
            .set_main_position(&position("SOLUSDT", "Sell", 2, "20"), "tp2")
            .await
            .unwrap();
        manager.save_all().await.unwrap();

        let (_tx, rx) = watch::channel(TradeSettings::default());
        let reloaded = HedgePositionManager::new(9, store, rx);
        assert_eq!(reloaded.load().await.unwrap(), 2);
        assert_eq!(reloaded.all_coins().await, vec!["BTCUSDT", "SOLUSDT"]);
        assert_eq!(reloaded.tp_order("SOLUSDT").await.as_deref(), Some("tp2"));
        assert_eq!(reloaded.tracking_price("SOLUSDT").await, Some(dec("21")));

        let legs = reloaded.all_legs().await;
        assert_eq!(legs.len(), 2);
        assert!(legs.iter().all(|leg| leg.kind == LegKind::Main));
    }

    #[tokio::test]
    async fn remove_all_drops_both_legs() {
        let (manager, _) = manager_with("5");
        manager
            .set_main_position(&position("BTCUSDT", "Buy", 1, "100"), "tp")
            .await
            .unwrap();
        manager
            .set_secondary_position(&position("BTCUSDT", "Sell", 2, "94"), "sl")
            .await
            .unwrap();

        let removed = manager.remove_all("BTCUSDT").await.unwrap().unwrap();
        assert!(removed.main_position.is_some() && removed.secondary_position.is_some());
        assert!(manager.all_legs().await.is_empty());
    }
}
