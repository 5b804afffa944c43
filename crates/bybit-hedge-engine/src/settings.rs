/*
[INPUT]:  Shared key-value store written by the operator front end and screening feeder
[OUTPUT]: Typed trade/coin settings, per-user run flag, screening feed and mark prices
[POS]:    Storage layer - typed views over the shared external keys
[UPDATE]: When the external key layout or settings fields change
*/

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use bybit_hedge_adapter::InstrumentFilters;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::store::KeyValueStore;

pub const TRADE_SETTINGS_KEY: &str = "global_trade_settings";
pub const COIN_SETTINGS_KEY: &str = "global_coin_settings";
pub const COINS_KEY: &str = "coins";
pub const COINS_INFO_KEY: &str = "coins_info";
pub const PRICES_KEY: &str = "prices";
const RUN_STATE_PREFIX: &str = "is_run";

/// Global trading parameters, all expressed as percentages except leverage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeSettings {
    /// Share of the margin balance committed per entry
    pub size: Decimal,
    pub balance: Decimal,
    pub take_profit: Decimal,
    /// Adverse move from entry that arms the hedge leg
    pub hedge_percentage: Decimal,
    pub hedge_stop_loss_percentage: Decimal,
    pub leverage: Decimal,
}

impl Default for TradeSettings {
    fn default() -> Self {
        Self {
            size: Decimal::ONE,
            balance: Decimal::from(80),
            take_profit: Decimal::from(3),
            hedge_percentage: Decimal::from(3),
            hedge_stop_loss_percentage: Decimal::new(5, 1),
            leverage: Decimal::from(10),
        }
    }
}

impl TradeSettings {
    pub const FIELDS: [&'static str; 6] = [
        "size",
        "balance",
        "take_profit",
        "hedge_percentage",
        "hedge_stop_loss_percentage",
        "leverage",
    ];

    fn slot(&mut self, field: &str) -> Option<&mut Decimal> {
        match field {
            "size" => Some(&mut self.size),
            "balance" => Some(&mut self.balance),
            "take_profit" => Some(&mut self.take_profit),
            "hedge_percentage" => Some(&mut self.hedge_percentage),
            "hedge_stop_loss_percentage" => Some(&mut self.hedge_stop_loss_percentage),
            "leverage" => Some(&mut self.leverage),
            _ => None,
        }
    }

    pub fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            ("size".into(), self.size.to_string()),
            ("balance".into(), self.balance.to_string()),
            ("take_profit".into(), self.take_profit.to_string()),
            ("hedge_percentage".into(), self.hedge_percentage.to_string()),
            (
                "hedge_stop_loss_percentage".into(),
                self.hedge_stop_loss_percentage.to_string(),
            ),
            ("leverage".into(), self.leverage.to_string()),
        ]
    }

    /// Overlay stored hash fields; unknown or unparsable fields are skipped
    pub fn apply_fields(&mut self, fields: &HashMap<String, String>) {
        for (field, raw) in fields {
            apply_field(field, raw, self.slot(field));
        }
    }
}

/// Thresholds consumed by the screening feeder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoinSettings {
    pub volume_long: Decimal,
    pub volume_short: Decimal,
    pub long_percentage: Decimal,
    pub short_percentage: Decimal,
}

impl Default for CoinSettings {
    fn default() -> Self {
        Self {
            volume_long: Decimal::from(300_000_000),
            volume_short: Decimal::from(300_000_000),
            long_percentage: Decimal::from(90),
            short_percentage: Decimal::from(10),
        }
    }
}

impl CoinSettings {
    pub const FIELDS: [&'static str; 4] = [
        "volume_long",
        "volume_short",
        "long_percentage",
        "short_percentage",
    ];

    fn slot(&mut self, field: &str) -> Option<&mut Decimal> {
        match field {
            "volume_long" => Some(&mut self.volume_long),
            "volume_short" => Some(&mut self.volume_short),
            "long_percentage" => Some(&mut self.long_percentage),
            "short_percentage" => Some(&mut self.short_percentage),
            _ => None,
        }
    }

    pub fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            ("volume_long".into(), self.volume_long.to_string()),
            ("volume_short".into(), self.volume_short.to_string()),
            ("long_percentage".into(), self.long_percentage.to_string()),
            ("short_percentage".into(), self.short_percentage.to_string()),
        ]
    }

    pub fn apply_fields(&mut self, fields: &HashMap<String, String>) {
        for (field, raw) in fields {
            apply_field(field, raw, self.slot(field));
        }
    }
}

fn apply_field(field: &str, raw: &str, slot: Option<&mut Decimal>) {
    let Some(slot) = slot else {
        return;
    };
    match parse_decimal(raw) {
        Some(value) => *slot = value,
        None => warn!(field, raw, "ignoring unparsable setting"),
    }
}

/// Stored numbers may be written as `3`, `3.0` or `3e0`
fn parse_decimal(raw: &str) -> Option<Decimal> {
    let raw = raw.trim();
    Decimal::from_str(raw)
        .or_else(|_| Decimal::from_scientific(raw))
        .ok()
}

/// Externally controlled per-user switch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    /// Entries, hedges and reconciliation all run
    Active,
    /// No new entries; existing legs are still hedged and reconciled
    Hedge,
    #[default]
    Off,
}

impl RunState {
    pub fn is_off(self) -> bool {
        self == RunState::Off
    }
}

impl FromStr for RunState {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(RunState::Active),
            "hedge" => Ok(RunState::Hedge),
            "off" => Ok(RunState::Off),
            other => bail!("unknown run state {other:?}, expected active|hedge|off"),
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            RunState::Active => "active",
            RunState::Hedge => "hedge",
            RunState::Off => "off",
        };
        f.write_str(label)
    }
}

/// Direction flags published per symbol by the screening feeder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScreeningFlags {
    #[serde(rename = "Long", default)]
    pub long: bool,
    #[serde(rename = "Short", default)]
    pub short: bool,
}

/// Typed access to the shared settings and feed keys
#[derive(Clone)]
pub struct SettingsStore {
    store: Arc<dyn KeyValueStore>,
}

impl SettingsStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    /// Write default settings hashes that do not exist yet
    pub async fn initialize(&self) -> Result<()> {
        if !self.store.exists(TRADE_SETTINGS_KEY).await? {
            self.store
                .hset_multiple(TRADE_SETTINGS_KEY, &TradeSettings::default().to_fields())
                .await?;
        }
        if !self.store.exists(COIN_SETTINGS_KEY).await? {
            self.store
                .hset_multiple(COIN_SETTINGS_KEY, &CoinSettings::default().to_fields())
                .await?;
        }
        Ok(())
    }

    pub async fn trade_settings(&self) -> Result<TradeSettings> {
        let fields = self.store.hgetall(TRADE_SETTINGS_KEY).await?;
        let mut settings = TradeSettings::default();
        settings.apply_fields(&fields);
        Ok(settings)
    }

    pub async fn coin_settings(&self) -> Result<CoinSettings> {
        let fields = self.store.hgetall(COIN_SETTINGS_KEY).await?;
        let mut settings = CoinSettings::default();
        settings.apply_fields(&fields);
        Ok(settings)
    }

    fn settings_key(field: &str) -> Option<&'static str> {
        if CoinSettings::FIELDS.contains(&field) {
            Some(COIN_SETTINGS_KEY)
        } else if TradeSettings::FIELDS.contains(&field) {
            Some(TRADE_SETTINGS_KEY)
        } else {
            None
        }
    }

    /// Single setting by field name; unparsable values read as zero
    pub async fn setting(&self, field: &str) -> Result<Decimal> {
        let Some(key) = Self::settings_key(field) else {
            bail!("unknown setting {field:?}");
        };
        let raw = self.store.hget(key, field).await?;
        Ok(raw.as_deref().and_then(parse_decimal).unwrap_or_default())
    }

    /// Write one setting into whichever global hash owns the field
    pub async fn set_setting(&self, field: &str, value: Decimal) -> Result<()> {
        let Some(key) = Self::settings_key(field) else {
            bail!("unknown setting {field:?}");
        };
        self.store.hset(key, field, &value.to_string()).await
    }

    pub async fn run_state(&self, user_id: i64) -> Result<RunState> {
        let key = run_state_key(user_id);
        match self.store.get(&key).await? {
            Some(raw) => serde_json::from_str(&raw)
                .with_context(|| format!("parse run state {key}={raw}")),
            None => Ok(RunState::Off),
        }
    }

    pub async fn set_run_state(&self, user_id: i64, state: RunState) -> Result<()> {
        let raw = serde_json::to_string(&state)?;
        self.store.set(&run_state_key(user_id), &raw).await
    }

    /// Current screening flags per symbol; malformed entries are skipped
    pub async fn coins(&self) -> Result<HashMap<String, ScreeningFlags>> {
        let raw = self.store.hgetall(COINS_KEY).await?;
        Ok(decode_entries(COINS_KEY, raw))
    }

    pub async fn coins_info(&self) -> Result<HashMap<String, InstrumentFilters>> {
        let raw = self.store.hgetall(COINS_INFO_KEY).await?;
        Ok(decode_entries(COINS_INFO_KEY, raw))
    }

    pub async fn coin_info(&self, symbol: &str) -> Result<Option<InstrumentFilters>> {
        let Some(raw) = self.store.hget(COINS_INFO_KEY, symbol).await? else {
            return Ok(None);
        };
        let filters = serde_json::from_str(&raw)
            .with_context(|| format!("parse {COINS_INFO_KEY}[{symbol}]"))?;
        Ok(Some(filters))
    }

    pub async fn save_coins_info(
        &self,
        filters: &HashMap<String, InstrumentFilters>,
    ) -> Result<()> {
        let entries = filters
            .iter()
            .map(|(symbol, filters)| -> Result<(String, String)> {
                Ok((symbol.clone(), serde_json::to_string(filters)?))
            })
            .collect::<Result<Vec<_>>>()?;
        self.store.hset_multiple(COINS_INFO_KEY, &entries).await
    }

    /// Latest mark price from the feeder hash; zero when absent or unreadable
    pub async fn mark_price(&self, symbol: &str) -> Result<Decimal> {
        let Some(raw) = self.store.hget(PRICES_KEY, symbol).await? else {
            return Ok(Decimal::ZERO);
        };
        match parse_decimal(&raw) {
            Some(price) => Ok(price),
            None => {
                warn!(symbol, raw, "mark price is not a number");
                Ok(Decimal::ZERO)
            }
        }
    }
}

pub fn run_state_key(user_id: i64) -> String {
    format!("{RUN_STATE_PREFIX}:{user_id}")
}

fn decode_entries<T: serde::de::DeserializeOwned>(
    key: &str,
    raw: HashMap<String, String>,
) -> HashMap<String, T> {
    raw.into_iter()
        .filter_map(|(symbol, value)| match serde_json::from_str(&value) {
            Ok(decoded) => Some((symbol, decoded)),
            Err(err) => {
                warn!(key, symbol = %symbol, error = %err, "skipping malformed feed entry");
                None
            }
        })
        .collect()
}
