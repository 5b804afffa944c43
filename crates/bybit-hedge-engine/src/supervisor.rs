/*
[INPUT]:  Engine configuration, shared key-value store, shutdown token
[OUTPUT]: One running trade engine per configured user whose run flag is on
[POS]:    Orchestration layer - engine lifecycle across users
[UPDATE]: When user onboarding or process-level shutdown changes
*/

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use bybit_hedge_adapter::BybitClient;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{EngineConfig, PriceSource, UserConfig};
use crate::engine::TradeEngine;
use crate::market_data::{MarkPriceHub, PriceFeed};
use crate::settings::SettingsStore;
use crate::store::KeyValueStore;

/// Starts an engine for each user whose run flag leaves OFF and reaps it
/// once the flag returns to OFF.
pub struct EngineSupervisor {
    config: EngineConfig,
    settings: SettingsStore,
    prices: PriceFeed,
    shutdown: CancellationToken,
    engines: HashMap<i64, JoinHandle<Result<()>>>,
}

impl EngineSupervisor {
    pub fn new(config: EngineConfig, store: Arc<dyn KeyValueStore>) -> Self {
        let settings = SettingsStore::new(store);
        let prices = match config.engine.price_source {
            PriceSource::Store => PriceFeed::Store(settings.clone()),
            PriceSource::Stream => PriceFeed::stream(Arc::new(MarkPriceHub::new(
                config.stream.stream_config(config.environment()),
            ))),
        };

        Self {
            config,
            settings,
            prices,
            shutdown: CancellationToken::new(),
            engines: HashMap::new(),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn running_users(&self) -> Vec<i64> {
        let mut users: Vec<i64> = self
            .engines
            .iter()
            .filter(|(_, handle)| !handle.is_finished())
            .map(|(user_id, _)| *user_id)
            .collect();
        users.sort_unstable();
        users
    }

    /// Seed default settings and open the price stream if configured
    pub async fn prepare(&self) -> Result<()> {
        self.settings
            .initialize()
            .await
            .context("initialize settings")?;
        if let PriceFeed::Stream(feed) = &self.prices {
            feed.hub().start().await.context("connect price stream")?;
        }
        Ok(())
    }

    /// Poll run flags until shutdown, starting and reaping engines
    pub async fn run(&mut self) -> Result<()> {
        self.prepare().await?;
        info!(users = self.config.users.len(), "supervisor started");

        let poll = self.config.engine.run_state_poll();
        loop {
            self.reap_finished().await;
            self.start_pending().await;
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = sleep(poll) => {}
            }
        }

        self.shutdown_and_wait().await
    }

    async fn start_pending(&mut self) {
        let users: Vec<UserConfig> = self
            .config
            .users
            .iter()
            .filter(|user| !self.engines.contains_key(&user.user_id))
            .cloned()
            .collect();

        for user in users {
            match self.settings.run_state(user.user_id).await {
                Ok(state) if !state.is_off() => {
                    if let Err(err) = self.start_engine(&user) {
                        error!(user_id = user.user_id, error = %err, "engine start failed");
                    }
                }
                Ok(_) => {}
                Err(err) => warn!(user_id = user.user_id, error = %err, "read run state failed"),
            }
        }
    }

    fn start_engine(&mut self, user: &UserConfig) -> Result<()> {
        let client = BybitClient::with_config(
            self.config.http.client_config(),
            self.config.environment(),
            Some(user.credentials()),
        )?;
        let engine = TradeEngine::new(
            user.user_id,
            client,
            self.settings.clone(),
            self.prices.clone(),
            self.config.engine.clone(),
            &self.shutdown,
        );
        self.engines.insert(user.user_id, tokio::spawn(engine.run()));
        info!(user_id = user.user_id, "engine spawned");
        Ok(())
    }

    async fn reap_finished(&mut self) {
        let finished: Vec<i64> = self
            .engines
            .iter()
            .filter(|(_, handle)| handle.is_finished())
            .map(|(user_id, _)| *user_id)
            .collect();

        for user_id in finished {
            let Some(handle) = self.engines.remove(&user_id) else {
                continue;
            };
            match handle.await {
                Ok(Ok(())) => info!(user_id, "engine finished"),
                Ok(Err(err)) => error!(user_id, error = %err, "engine returned error"),
                Err(join_err) => error!(user_id, error = %join_err, "engine task failed"),
            }
        }
    }

    /// Cancel every engine and wait up to the shutdown timeout
    pub async fn shutdown_and_wait(&mut self) -> Result<()> {
        self.shutdown.cancel();
        let deadline = Instant::now() + self.config.engine.shutdown_timeout();
        let mut engines: Vec<(i64, JoinHandle<Result<()>>)> = self.engines.drain().collect();
        let mut failures = 0usize;

        while let Some((user_id, mut handle)) = engines.pop() {
            tokio::select! {
                res = &mut handle => match res {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        failures += 1;
                        error!(user_id, error = %err, "engine returned error during shutdown");
                    }
                    Err(join_err) => {
                        failures += 1;
                        error!(user_id, error = %join_err, "engine task failed during shutdown");
                    }
                },
                _ = sleep_until(deadline) => {
                    handle.abort();
                    for (_, remaining) in engines.drain(..) {
                        remaining.abort();
                    }
                    self.prices.shutdown().await;
                    return Err(anyhow!("engine shutdown timed out user_id={user_id}"));
                }
            }
        }

        self.prices.shutdown().await;
        info!(failures, "all engines stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::RunState;
    use crate::store::MemoryStore;
    use std::time::Duration;

    fn config() -> EngineConfig {
        let mut config = EngineConfig::from_yaml_str(
            r#"
users:
  - { user_id: 1, api_key: "k1", api_secret: "s1" }
  - { user_id: 2, api_key: "k2", api_secret: "s2" }
engine:
  run_state_poll_ms: 20
"#,
        )
        .unwrap();
        config.testnet = true;
        config
    }

    #[tokio::test]
    async fn only_users_with_run_flag_get_engines() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let settings = SettingsStore::new(store.clone());
        settings.set_run_state(2, RunState::Hedge).await.unwrap();

        let mut supervisor = EngineSupervisor::new(config(), store);
        supervisor.prepare().await.unwrap();
        supervisor.start_pending().await;

        assert_eq!(supervisor.engines.len(), 1);
        assert!(supervisor.engines.contains_key(&2));

        tokio::time::timeout(Duration::from_secs(10), supervisor.shutdown_and_wait())
            .await
            .expect("bounded shutdown")
            .unwrap();
        assert!(supervisor.running_users().is_empty());
    }
}
