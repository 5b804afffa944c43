/*
[INPUT]:  YAML configuration file, HEDGE__* environment overrides
[OUTPUT]: Parsed engine configuration
[POS]:    Configuration layer - users, transport and loop tuning
[UPDATE]: When adding new configuration options
*/

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use bybit_hedge_adapter::{ClientConfig, Credentials, Environment, RetryPolicy, StreamConfig};
use config::{Config, Environment as EnvSource, File, FileFormat};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

const ENV_PREFIX: &str = "HEDGE";
const ENV_SEPARATOR: &str = "__";

/// Top-level configuration for the hedge engine
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Use the exchange sandbox endpoints
    #[serde(default)]
    pub testnet: bool,
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    /// Accounts to run one engine each for
    #[serde(default)]
    pub users: Vec<UserConfig>,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub engine: EngineTuning,
    #[serde(default)]
    pub stream: StreamSettings,
    /// Directory for the rotating `trading.log`
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
}

#[derive(Clone, Deserialize, Serialize)]
pub struct UserConfig {
    pub user_id: i64,
    pub api_key: String,
    pub api_secret: String,
}

impl UserConfig {
    pub fn credentials(&self) -> Credentials {
        Credentials::new(&self.api_key, &self.api_secret)
    }
}

impl std::fmt::Debug for UserConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserConfig")
            .field("user_id", &self.user_id)
            .field("api_key", &self.api_key)
            .field("api_secret", &"<redacted>")
            .finish()
    }
}

/// REST transport options
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpConfig {
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub recv_window_ms: u64,
    pub max_retries: u32,
    pub max_transient_retries: u32,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            connect_timeout_secs: 10,
            recv_window_ms: 5000,
            max_retries: 1,
            max_transient_retries: 3,
        }
    }
}

impl HttpConfig {
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            timeout: Duration::from_secs(self.timeout_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            recv_window: self.recv_window_ms,
            retry: RetryPolicy {
                max_retries: self.max_retries,
                max_transient_retries: self.max_transient_retries,
            },
        }
    }
}

/// Where the hedge scan reads mark prices from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceSource {
    /// The shared `prices` hash kept fresh by an external feeder
    #[default]
    Store,
    /// The engine's own ticker subscription
    Stream,
}

/// Loop intervals and limits for one engine
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineTuning {
    pub run_state_poll_ms: u64,
    pub settings_refresh_ms: u64,
    pub hedge_scan_secs: u64,
    pub hedge_coin_stagger_ms: u64,
    pub reconcile_scan_secs: u64,
    pub entry_scan_secs: u64,
    pub entry_stagger_min_ms: u64,
    pub entry_stagger_max_ms: u64,
    pub entry_concurrency: usize,
    pub max_tracked_coins: usize,
    pub min_available_ratio: Decimal,
    pub low_balance_backoff_secs: u64,
    pub fill_confirm_delay_ms: u64,
    pub shutdown_timeout_secs: u64,
    pub price_source: PriceSource,
}

impl Default for EngineTuning {
    fn default() -> Self {
        Self {
            run_state_poll_ms: 1000,
            settings_refresh_ms: 1000,
            hedge_scan_secs: 5,
            hedge_coin_stagger_ms: 100,
            reconcile_scan_secs: 5,
            entry_scan_secs: 10,
            entry_stagger_min_ms: 1000,
            entry_stagger_max_ms: 3000,
            entry_concurrency: 8,
            max_tracked_coins: 80,
            min_available_ratio: Decimal::new(45, 2),
            low_balance_backoff_secs: 120,
            fill_confirm_delay_ms: 1000,
            shutdown_timeout_secs: 20,
            price_source: PriceSource::Store,
        }
    }
}

impl EngineTuning {
    pub fn run_state_poll(&self) -> Duration {
        Duration::from_millis(self.run_state_poll_ms)
    }

    pub fn settings_refresh(&self) -> Duration {
        Duration::from_millis(self.settings_refresh_ms)
    }

    pub fn hedge_scan(&self) -> Duration {
        Duration::from_secs(self.hedge_scan_secs)
    }

    pub fn hedge_coin_stagger(&self) -> Duration {
        Duration::from_millis(self.hedge_coin_stagger_ms)
    }

    pub fn reconcile_scan(&self) -> Duration {
        Duration::from_secs(self.reconcile_scan_secs)
    }

    pub fn entry_scan(&self) -> Duration {
        Duration::from_secs(self.entry_scan_secs)
    }

    pub fn low_balance_backoff(&self) -> Duration {
        Duration::from_secs(self.low_balance_backoff_secs)
    }

    pub fn fill_confirm_delay(&self) -> Duration {
        Duration::from_millis(self.fill_confirm_delay_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Market stream options
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StreamSettings {
    pub ping_interval_secs: u64,
    pub reconnect_delay_ms: u64,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            ping_interval_secs: 20,
            reconnect_delay_ms: 1000,
        }
    }
}

impl StreamSettings {
    pub fn stream_config(&self, environment: Environment) -> StreamConfig {
        let mut config = StreamConfig::new(environment);
        config.ping_interval = Duration::from_secs(self.ping_interval_secs);
        config.reconnect_delay = Duration::from_millis(self.reconnect_delay_ms);
        config
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

impl EngineConfig {
    /// Load configuration from a YAML file, then apply `HEDGE__*` overrides
    pub fn from_file(path: &Path) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::from(path).format(FileFormat::Yaml))
            .add_source(
                EnvSource::with_prefix(ENV_PREFIX)
                    .prefix_separator(ENV_SEPARATOR)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("read config {}", path.display()))?;
        let parsed: Self = config.try_deserialize().context("parse config")?;
        parsed.validate()?;
        Ok(parsed)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::from_str(content, FileFormat::Yaml))
            .build()
            .context("read config")?;
        let parsed: Self = config.try_deserialize().context("parse config")?;
        parsed.validate()?;
        Ok(parsed)
    }

    pub fn environment(&self) -> Environment {
        Environment::from_testnet(self.testnet)
    }

    pub fn user(&self, user_id: i64) -> Option<&UserConfig> {
        self.users.iter().find(|user| user.user_id == user_id)
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for user in &self.users {
            if !seen.insert(user.user_id) {
                bail!("duplicate user_id in config: {}", user.user_id);
            }
            if user.api_key.is_empty() || user.api_secret.is_empty() {
                bail!("user_id={} is missing api credentials", user.user_id);
            }
        }

        let engine = &self.engine;
        if engine.entry_concurrency == 0 {
            bail!("engine.entry_concurrency must be at least 1");
        }
        if engine.entry_stagger_min_ms > engine.entry_stagger_max_ms {
            bail!("engine.entry_stagger_min_ms must not exceed entry_stagger_max_ms");
        }
        if self.stream.ping_interval_secs == 0 {
            bail!("stream.ping_interval_secs must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
testnet: true
redis_url: "redis://cache:6379/2"
users:
  - user_id: 7
    api_key: "key-7"
    api_secret: "secret-7"
engine:
  entry_concurrency: 3
  price_source: stream
"#;

    #[test]
    fn parses_yaml_with_defaults() {
        let config = EngineConfig::from_yaml_str(SAMPLE).unwrap();

        assert!(config.testnet);
        assert_eq!(config.redis_url, "redis://cache:6379/2");
        assert_eq!(config.user(7).map(|u| u.api_key.as_str()), Some("key-7"));
        assert_eq!(config.engine.entry_concurrency, 3);
        assert_eq!(config.engine.price_source, PriceSource::Stream);
        assert_eq!(config.engine.hedge_scan(), Duration::from_secs(5));
        assert_eq!(config.engine.min_available_ratio, Decimal::new(45, 2));
        assert_eq!(config.http.recv_window_ms, 5000);
        assert_eq!(config.stream.reconnect_delay_ms, 1000);
        assert_eq!(config.log_dir, PathBuf::from("logs"));
    }

    #[test]
    fn rejects_duplicate_users() {
        let yaml = r#"
users:
  - { user_id: 1, api_key: "a", api_secret: "b" }
  - { user_id: 1, api_key: "c", api_secret: "d" }
"#;
        let err = EngineConfig::from_yaml_str(yaml).unwrap_err();
        assert!(err.to_string().contains("duplicate user_id"));
    }

    #[test]
    fn rejects_inverted_stagger() {
        let yaml = r#"
engine:
  entry_stagger_min_ms: 5000
  entry_stagger_max_ms: 1000
"#;
        assert!(EngineConfig::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn http_block_maps_to_client_config() {
        let http = HttpConfig {
            max_retries: 3,
            ..HttpConfig::default()
        };
        let client = http.client_config();
        assert_eq!(client.retry.max_retries, 3);
        assert_eq!(client.retry.max_transient_retries, 3);
        assert_eq!(client.timeout, Duration::from_secs(30));
    }

    #[test]
    fn debug_redacts_secret() {
        let user = UserConfig {
            user_id: 1,
            api_key: "key".into(),
            api_secret: "hunter2".into(),
        };
        assert!(!format!("{user:?}").contains("hunter2"));
    }
}
