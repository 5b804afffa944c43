/*
[INPUT]:  CLI arguments, YAML configuration file, OS shutdown signals
[OUTPUT]: Running hedge engines or one-shot account operations
[POS]:    Binary entry point
[UPDATE]: When changing CLI commands, startup flow, or shutdown handling
*/

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use bybit_hedge_adapter::{BybitClient, split_into_weeks};
use chrono::{Duration as ChronoDuration, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use bybit_hedge_engine::{
    EngineConfig, EngineSupervisor, HedgePositionManager, KeyValueStore, RedisStore, RunState,
    SettingsStore, TrackedLeg, UserConfig,
};

const LOG_FILE_NAME: &str = "trading.log";

#[derive(Parser, Debug)]
#[command(name = "bybit-hedge-engine", version, about = "Perpetual futures hedge engine")]
struct Cli {
    #[arg(long = "config", value_name = "PATH")]
    config_path: PathBuf,
    #[arg(long = "log-level", value_name = "LEVEL", default_value = "info")]
    log_level: String,
    /// Validate configuration and exit
    #[arg(long = "dry-run")]
    dry_run: bool,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run engines for every configured user (default)
    Run,
    /// Print a user's run state and tracked legs
    Status {
        #[arg(long)]
        user: i64,
    },
    /// Write a user's run flag
    SetState {
        #[arg(long)]
        user: i64,
        #[arg(long, value_parser = parse_run_state)]
        state: RunState,
    },
    /// Close every open position of a user
    Flatten {
        #[arg(long)]
        user: i64,
    },
    /// Realized PnL over the last N days
    Pnl {
        #[arg(long)]
        user: i64,
        #[arg(long, default_value_t = 7)]
        days: i64,
    },
    /// Check whether a user's API key can drive the engine
    Permissions {
        #[arg(long)]
        user: i64,
    },
}

fn parse_run_state(raw: &str) -> Result<RunState, String> {
    raw.parse().map_err(|err: anyhow::Error| err.to_string())
}

#[derive(Serialize)]
struct StatusReport {
    user_id: i64,
    run_state: RunState,
    legs: Vec<TrackedLeg>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    let config = load_config(&args.config_path)?;
    let _guard = init_tracing(&args.log_level, &config.log_dir)?;

    info!(
        config_path = %args.config_path.display(),
        users = config.users.len(),
        testnet = config.testnet,
        dry_run = args.dry_run,
        "configuration loaded"
    );

    if args.dry_run {
        info!("dry-run requested; configuration validated");
        return Ok(());
    }

    match args.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::Status { user } => status(&config, user).await,
        Command::SetState { user, state } => set_state(&config, user, state).await,
        Command::Flatten { user } => flatten(&config, user).await,
        Command::Pnl { user, days } => pnl(&config, user, days).await,
        Command::Permissions { user } => permissions(&config, user).await,
    }
}

async fn run(config: EngineConfig) -> Result<()> {
    let store = connect_store(&config).await?;
    let mut supervisor = EngineSupervisor::new(config, store);
    setup_signal_handlers(supervisor.shutdown_token());

    supervisor.run().await.context("run engines")?;
    info!("shutdown complete");
    Ok(())
}

async fn status(config: &EngineConfig, user_id: i64) -> Result<()> {
    let store = connect_store(config).await?;
    let settings = SettingsStore::new(store.clone());
    let (_tx, settings_rx) = watch::channel(settings.trade_settings().await?);
    let manager = HedgePositionManager::new(user_id, store, settings_rx);
    manager.load().await?;

    let report = StatusReport {
        user_id,
        run_state: settings.run_state(user_id).await?,
        legs: manager.all_legs().await,
    };
    print!("{}", serde_yaml::to_string(&report)?);
    Ok(())
}

async fn set_state(config: &EngineConfig, user_id: i64, state: RunState) -> Result<()> {
    let store = connect_store(config).await?;
    SettingsStore::new(store).set_run_state(user_id, state).await?;
    info!(user_id, %state, "run state written");
    Ok(())
}

async fn flatten(config: &EngineConfig, user_id: i64) -> Result<()> {
    let client = user_client(config, user_id)?;
    let closed = client.close_all_positions().await;
    for position in &closed {
        info!(
            symbol = %position.symbol,
            side = %position.side,
            size = %position.size,
            "close requested"
        );
    }
    println!("close requested for {} positions", closed.len());
    client.close().await;
    Ok(())
}

async fn pnl(config: &EngineConfig, user_id: i64, days: i64) -> Result<()> {
    let client = user_client(config, user_id)?;
    let end = Utc::now();
    let windows = split_into_weeks(end - ChronoDuration::days(days.max(1)), end);
    let total = client.total_closed_pnl(&windows).await;
    println!("closed pnl over {days} days: {total}");
    client.close().await;
    Ok(())
}

async fn permissions(config: &EngineConfig, user_id: i64) -> Result<()> {
    let client = user_client(config, user_id)?;
    let permissions = client
        .get_api_permissions()
        .await
        .ok_or_else(|| anyhow!("api permissions unavailable for user_id={user_id}"))?;
    print!("{}", serde_yaml::to_string(&permissions.automation_status())?);
    client.close().await;
    Ok(())
}

fn find_user(config: &EngineConfig, user_id: i64) -> Result<&UserConfig> {
    config
        .user(user_id)
        .ok_or_else(|| anyhow!("user_id={user_id} is not configured"))
}

fn user_client(config: &EngineConfig, user_id: i64) -> Result<BybitClient> {
    let user = find_user(config, user_id)?;
    BybitClient::with_config(
        config.http.client_config(),
        config.environment(),
        Some(user.credentials()),
    )
    .context("build exchange client")
}

async fn connect_store(config: &EngineConfig) -> Result<Arc<dyn KeyValueStore>> {
    let store = RedisStore::connect(&config.redis_url).await?;
    Ok(Arc::new(store))
}

fn init_tracing(log_level: &str, log_dir: &Path) -> Result<WorkerGuard> {
    let filter = EnvFilter::try_new(log_level).context("invalid log level")?;
    let appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_NAME);
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(fmt::layer().with_ansi(false).with_writer(file_writer))
        .try_init()
        .map_err(|err| anyhow!(err))
        .context("initialize tracing subscriber")?;
    Ok(guard)
}

fn load_config(path: &Path) -> Result<EngineConfig> {
    EngineConfig::from_file(path).context("load config")
}

fn setup_signal_handlers(shutdown: CancellationToken) {
    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to install SIGINT handler");
            return;
        }
        info!("received SIGINT");
        shutdown_clone.cancel();
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let shutdown_clone = shutdown.clone();
        tokio::spawn(async move {
            match signal(SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                    info!("received SIGTERM");
                    shutdown_clone.cancel();
                }
                Err(err) => {
                    warn!(error = %err, "failed to install SIGTERM handler");
                }
            }
        });
    }
}
