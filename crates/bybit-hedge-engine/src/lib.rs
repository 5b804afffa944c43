/*
[INPUT]:  Crate modules
[OUTPUT]: Public hedge engine surface for the binary and integration tests
[POS]:    Crate root - module wiring
[UPDATE]: When public modules or exports change
*/

pub mod config;
pub mod engine;
pub mod hedge;
pub mod market_data;
pub mod position;
pub mod reconcile;
pub mod screening;
pub mod settings;
pub mod sizing;
pub mod store;
pub mod supervisor;

pub use config::{EngineConfig, EngineTuning, PriceSource, UserConfig};
pub use engine::TradeEngine;
pub use hedge::{HedgePositionManager, hedge_positions_key};
pub use market_data::{MarkPriceHub, PriceFeed, StreamFeed};
pub use position::{
    HedgePosition, LegKind, MainPosition, PositionCore, SecondaryPosition, TrackedLeg,
};
pub use settings::{CoinSettings, RunState, ScreeningFlags, SettingsStore, TradeSettings};
pub use store::{KeyValueStore, MemoryStore, RedisStore};
pub use supervisor::EngineSupervisor;
