/*
[INPUT]:  Exchange client, shared settings store, price feed, loop tuning
[OUTPUT]: Entry/hedge orders and a reconciled hedge registry for one user
[POS]:    Orchestration layer - background loops and shutdown sequence
[UPDATE]: When loop cadence, entry flow or hedge flow changes
*/

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bybit_hedge_adapter::{BybitClient, OrderStatus, PositionIdx, PositionInfo};
use rand::Rng;
use rust_decimal::Decimal;
use tokio::sync::{Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::config::EngineTuning;
use crate::hedge::HedgePositionManager;
use crate::market_data::PriceFeed;
use crate::position::LegKind;
use crate::reconcile::stale_legs;
use crate::screening::{Candidate, eligible};
use crate::settings::{RunState, SettingsStore, TradeSettings};
use crate::sizing;

const ORDER_LOOKUP_LIMIT: u32 = 5;
const IDLE_POLL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryOutcome {
    Opened,
    Skipped,
}

#[derive(Debug, Default)]
struct EntryTally {
    opened: usize,
    skipped: usize,
    failed: usize,
}

/// One user's trading session.
///
/// `run` drives the entry scan on the calling task and the run-state,
/// settings, hedge and reconciliation loops on spawned tasks. Everything
/// stops when the user's run flag reads OFF or the parent token is cancelled.
pub struct TradeEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    user_id: i64,
    client: BybitClient,
    settings: SettingsStore,
    prices: PriceFeed,
    tuning: EngineTuning,
    manager: Arc<HedgePositionManager>,
    trade_settings: watch::Sender<TradeSettings>,
    run_state: watch::Sender<RunState>,
    stop: CancellationToken,
}

impl TradeEngine {
    pub fn new(
        user_id: i64,
        client: BybitClient,
        settings: SettingsStore,
        prices: PriceFeed,
        tuning: EngineTuning,
        shutdown: &CancellationToken,
    ) -> Self {
        let (trade_settings, settings_rx) = watch::channel(TradeSettings::default());
        let (run_state, _) = watch::channel(RunState::Off);
        let manager = Arc::new(HedgePositionManager::new(
            user_id,
            settings.store().clone(),
            settings_rx,
        ));

        Self {
            inner: Arc::new(EngineInner {
                user_id,
                client,
                settings,
                prices,
                tuning,
                manager,
                trade_settings,
                run_state,
                stop: shutdown.child_token(),
            }),
        }
    }

    pub fn user_id(&self) -> i64 {
        self.inner.user_id
    }

    pub fn manager(&self) -> Arc<HedgePositionManager> {
        self.inner.manager.clone()
    }

    pub fn run_state(&self) -> watch::Receiver<RunState> {
        self.inner.run_state.subscribe()
    }

    pub fn stop_token(&self) -> CancellationToken {
        self.inner.stop.clone()
    }

    /// Run until the user's run flag is OFF or shutdown is requested
    pub async fn run(self) -> Result<()> {
        let span = info_span!("engine", user_id = self.inner.user_id);
        self.run_inner().instrument(span).await
    }

    async fn run_inner(self) -> Result<()> {
        let inner = self.inner;
        inner.refresh_settings().await.context("load trade settings")?;
        inner.manager.load().await?;

        let state = inner
            .settings
            .run_state(inner.user_id)
            .await
            .context("read run state")?;
        inner.run_state.send_replace(state);
        if state.is_off() {
            info!("run state is off; engine not started");
            inner.client.close().await;
            return Ok(());
        }
        let tracked = inner.manager.len().await;
        info!(run_state = %state, tracked, "engine started");

        let span = tracing::Span::current();
        let tasks: Vec<(&'static str, JoinHandle<()>)> = vec![
            (
                "run_state",
                spawn_loop(&inner, &span, |inner| async move {
                    inner.run_state_loop().await
                }),
            ),
            (
                "settings",
                spawn_loop(&inner, &span, |inner| async move {
                    inner.settings_loop().await
                }),
            ),
            (
                "hedge",
                spawn_loop(&inner, &span, |inner| async move { inner.hedge_loop().await }),
            ),
            (
                "reconcile",
                spawn_loop(&inner, &span, |inner| async move {
                    inner.reconcile_loop().await
                }),
            ),
        ];

        inner.clone().entry_loop().await;

        inner.stop.cancel();
        inner.join_with_deadline(tasks).await;
        inner.client.close().await;
        info!("engine stopped");
        Ok(())
    }
}

fn spawn_loop<F, Fut>(inner: &Arc<EngineInner>, span: &tracing::Span, body: F) -> JoinHandle<()>
where
    F: FnOnce(Arc<EngineInner>) -> Fut,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(body(inner.clone()).instrument(span.clone()))
}

impl EngineInner {
    /// Sleep unless stopped first; `false` means the engine is stopping
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.stop.cancelled() => false,
            _ = sleep(duration) => true,
        }
    }

    fn current_settings(&self) -> TradeSettings {
        self.trade_settings.borrow().clone()
    }

    fn current_state(&self) -> RunState {
        *self.run_state.borrow()
    }

    async fn refresh_settings(&self) -> Result<()> {
        let latest = self.settings.trade_settings().await?;
        self.trade_settings.send_if_modified(|current| {
            if *current == latest {
                return false;
            }
            *current = latest;
            true
        });
        Ok(())
    }

    async fn run_state_loop(self: Arc<Self>) {
        while self.pause(self.tuning.run_state_poll()).await {
            match self.settings.run_state(self.user_id).await {
                Ok(state) => {
                    let previous = self.run_state.send_replace(state);
                    if previous != state {
                        info!(from = %previous, to = %state, "run state changed");
                    }
                    if state.is_off() {
                        self.stop.cancel();
                        break;
                    }
                }
                Err(err) => warn!(error = %err, "read run state failed"),
            }
        }
    }

    async fn settings_loop(self: Arc<Self>) {
        while self.pause(self.tuning.settings_refresh()).await {
            if let Err(err) = self.refresh_settings().await {
                warn!(error = %err, "refresh trade settings failed");
            }
        }
    }

    async fn hedge_loop(self: Arc<Self>) {
        loop {
            for coin in self.manager.coins_with_main().await {
                if self.stop.is_cancelled() {
                    return;
                }
                if let Err(err) = self.check_hedge(&coin).await {
                    error!(symbol = %coin, error = %err, "hedge check failed");
                }
                if !self.pause(self.tuning.hedge_coin_stagger()).await {
                    return;
                }
            }
            if !self.pause(self.tuning.hedge_scan()).await {
                return;
            }
        }
    }

    async fn reconcile_loop(self: Arc<Self>) {
        loop {
            if let Err(err) = self.reconcile_once().await {
                error!(error = %err, "reconciliation failed");
            }
            if !self.pause(self.tuning.reconcile_scan()).await {
                return;
            }
        }
    }

    async fn entry_loop(self: Arc<Self>) {
        while !self.stop.is_cancelled() {
            if self.current_state() != RunState::Active {
                if !self.pause(IDLE_POLL).await {
                    break;
                }
                continue;
            }

            if let Err(err) = self.clone().entry_scan().await {
                error!(error = %err, "entry scan failed");
            }
            if !self.pause(self.tuning.entry_scan()).await {
                break;
            }
        }
    }

    /// Free margin share above the configured floor
    async fn have_balance(&self) -> bool {
        match self.client.get_balance().await {
            Some(balance) => balance.available_ratio() > self.tuning.min_available_ratio,
            None => {
                warn!("wallet balance unavailable");
                false
            }
        }
    }

    /// An unreadable position list counts as "in trade"
    async fn coin_in_trade(&self, symbol: &str) -> bool {
        let positions = self.client.get_positions(symbol).await;
        positions.is_empty() || positions.iter().any(PositionInfo::is_open)
    }

    /// An unreadable position list counts as "both sides open"
    async fn have_both_side_position(&self, symbol: &str) -> bool {
        let positions = self.client.get_positions(symbol).await;
        if positions.is_empty() {
            warn!(symbol, "position list unavailable");
            return true;
        }
        positions.len() == 2 && positions.iter().all(PositionInfo::is_open)
    }

    async fn entry_scan(self: Arc<Self>) -> Result<()> {
        self.client.switch_position_mode().await;

        let tracked = self.manager.len().await;
        if tracked > self.tuning.max_tracked_coins || !self.have_balance().await {
            warn!(tracked, "low balance or too many tracked coins; backing off");
            self.pause(self.tuning.low_balance_backoff()).await;
            return Ok(());
        }

        let flags = self.settings.coins().await?;
        let filters = self.settings.coins_info().await?;
        let tracked: HashSet<String> = self.manager.all_coins().await.into_iter().collect();
        let candidates = eligible(&flags, &filters, &tracked);
        debug!(candidates = candidates.len(), "entry candidates");

        let semaphore = Arc::new(Semaphore::new(self.tuning.entry_concurrency));
        let mut workers = JoinSet::new();

        for candidate in candidates {
            if self.current_state() != RunState::Active {
                break;
            }
            if self.manager.has_any_position(&candidate.symbol).await {
                continue;
            }
            if !self.pause(self.entry_stagger()).await {
                break;
            }

            let permit = tokio::select! {
                _ = self.stop.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => permit?,
            };
            let engine = self.clone();
            let span = info_span!("entry", symbol = %candidate.symbol);
            workers.spawn(
                async move {
                    let _permit = permit;
                    let outcome = engine.open_entry(&candidate).await;
                    (candidate.symbol, outcome)
                }
                .instrument(span),
            );
        }

        let tally = self.drain_entries(&mut workers).await;
        info!(
            opened = tally.opened,
            skipped = tally.skipped,
            failed = tally.failed,
            "entry scan finished"
        );
        Ok(())
    }

    fn entry_stagger(&self) -> Duration {
        let min = self.tuning.entry_stagger_min_ms;
        let max = self.tuning.entry_stagger_max_ms.max(min);
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }

    async fn drain_entries(
        &self,
        workers: &mut JoinSet<(String, Result<EntryOutcome>)>,
    ) -> EntryTally {
        let mut tally = EntryTally::default();
        loop {
            let joined = tokio::select! {
                _ = self.stop.cancelled() => {
                    if !workers.is_empty() {
                        warn!(pending = workers.len(), "aborting entry workers");
                    }
                    workers.abort_all();
                    break;
                }
                joined = workers.join_next() => joined,
            };
            match joined {
                None => break,
                Some(Ok((_, Ok(EntryOutcome::Opened)))) => tally.opened += 1,
                Some(Ok((_, Ok(EntryOutcome::Skipped)))) => tally.skipped += 1,
                Some(Ok((symbol, Err(err)))) => {
                    tally.failed += 1;
                    error!(symbol = %symbol, error = %err, "entry failed");
                }
                Some(Err(join_err)) => {
                    tally.failed += 1;
                    error!(error = %join_err, "entry worker crashed");
                }
            }
        }
        tally
    }

    async fn open_entry(&self, candidate: &Candidate) -> Result<EntryOutcome> {
        let symbol = candidate.symbol.as_str();
        if self.coin_in_trade(symbol).await {
            debug!(symbol, "already in trade; skipping");
            return Ok(EntryOutcome::Skipped);
        }

        let settings = self.current_settings();
        self.client.set_leverage(symbol, settings.leverage).await;

        let balance = self.client.get_balance().await;
        let price = self.client.get_mark_price(symbol).await;
        let Some(balance) = balance.filter(|_| price > Decimal::ZERO) else {
            warn!(symbol, %price, "balance or price unavailable");
            return Ok(EntryOutcome::Skipped);
        };

        let Some(quantity) = sizing::entry_quantity(
            &settings,
            balance.total_margin_balance,
            price,
            &candidate.filters,
        ) else {
            return Ok(EntryOutcome::Skipped);
        };
        let is_long = candidate.is_long();
        let take_profit = sizing::take_profit_price(
            price,
            settings.take_profit,
            is_long,
            candidate.filters.tick_size,
        );

        let Some(ack) = self
            .client
            .place_order(symbol, quantity, is_long, Some(take_profit), None)
            .await?
        else {
            return Ok(EntryOutcome::Skipped);
        };

        if !self.pause(self.tuning.fill_confirm_delay()).await {
            return Ok(EntryOutcome::Skipped);
        }
        if self.confirm_fill(symbol, &ack.order_id, LegKind::Main).await? {
            Ok(EntryOutcome::Opened)
        } else {
            Ok(EntryOutcome::Skipped)
        }
    }

    /// Open the hedge leg when price has crossed the tracking price
    async fn check_hedge(&self, symbol: &str) -> Result<bool> {
        let price = self.prices.mark_price(symbol).await;
        if price <= Decimal::ZERO {
            debug!(symbol, "no mark price; skipping hedge check");
            return Ok(false);
        }
        if !self.manager.should_create_hedge(symbol, price).await {
            return Ok(false);
        }
        if self.have_both_side_position(symbol).await {
            debug!(symbol, "both sides already open");
            return Ok(false);
        }
        info!(symbol, %price, "hedge trigger reached");
        self.open_hedge(symbol).await
    }

    async fn open_hedge(&self, symbol: &str) -> Result<bool> {
        let Some(filters) = self.settings.coin_info(symbol).await? else {
            warn!(symbol, "no instrument filters; cannot size hedge");
            return Ok(false);
        };
        let price = self.client.get_mark_price(symbol).await;
        if price <= Decimal::ZERO {
            return Ok(false);
        }
        let Some(main) = self.manager.main_position(symbol).await else {
            return Ok(false);
        };

        let settings = self.current_settings();
        let hedge_is_buy = main.core.position_idx == PositionIdx::Short;
        let stop_loss = sizing::hedge_stop_loss_price(
            price,
            settings.hedge_stop_loss_percentage,
            hedge_is_buy,
            filters.tick_size,
        );

        let Some(ack) = self
            .client
            .place_order(symbol, main.core.size, hedge_is_buy, None, Some(stop_loss))
            .await?
        else {
            return Ok(false);
        };

        if !self.pause(self.tuning.fill_confirm_delay()).await {
            return Ok(false);
        }
        self.confirm_fill(symbol, &ack.order_id, LegKind::Secondary).await
    }

    /// Look the order up in history, find its attached TP/SL on the open
    /// order list and record the resulting position as a leg.
    async fn confirm_fill(&self, symbol: &str, order_id: &str, kind: LegKind) -> Result<bool> {
        let entry = self
            .client
            .get_order(symbol, Some(order_id), true, ORDER_LOOKUP_LIMIT)
            .await
            .into_iter()
            .find(|order| order.order_id == order_id);
        let Some(entry) = entry.filter(|order| order.order_status != OrderStatus::Cancelled) else {
            debug!(symbol, order_id, "order missing or cancelled");
            return Ok(false);
        };

        let conditional = self
            .client
            .get_order(symbol, None, false, ORDER_LOOKUP_LIMIT)
            .await
            .into_iter()
            .find(|order| order.side != entry.side && order.stop_order_type.is_tpsl());
        let Some(conditional) = conditional else {
            warn!(
                symbol,
                order_id,
                status = ?entry.order_status,
                leg = ?kind,
                "filled order has no attached tp/sl"
            );
            return Ok(false);
        };

        let position = self
            .client
            .get_positions(symbol)
            .await
            .into_iter()
            .find(|position| position.side() == Some(entry.side) && position.is_open());
        let Some(position) = position else {
            warn!(symbol, order_id, "no open position for filled order");
            return Ok(false);
        };

        match kind {
            LegKind::Main => {
                self.manager
                    .set_main_position(&position, &conditional.order_id)
                    .await
            }
            LegKind::Secondary => {
                self.manager
                    .set_secondary_position(&position, &conditional.order_id)
                    .await
            }
        }
    }

    /// Drop legs the exchange no longer reports
    async fn reconcile_once(&self) -> Result<usize> {
        let legs = self.manager.all_legs().await;
        if legs.is_empty() {
            return Ok(0);
        }

        let live = self
            .client
            .fetch_all_positions()
            .await
            .context("fetch live positions")?;

        let stale = stale_legs(&legs, &live);
        for leg in &stale {
            self.manager.remove_leg_of_kind(&leg.symbol, leg.kind).await?;
            info!(symbol = %leg.symbol, leg = ?leg.kind, "leg closed on exchange");
            if !self.manager.has_any_position(&leg.symbol).await {
                self.prices.release(&leg.symbol);
            }
        }
        Ok(stale.len())
    }

    async fn join_with_deadline(&self, tasks: Vec<(&'static str, JoinHandle<()>)>) {
        let deadline = Instant::now() + self.tuning.shutdown_timeout();
        for (name, mut handle) in tasks {
            tokio::select! {
                res = &mut handle => {
                    if let Err(join_err) = res
                        && join_err.is_panic()
                    {
                        error!(task = name, error = %join_err, "engine task panicked");
                    }
                }
                _ = sleep_until(deadline) => {
                    error!(task = name, "engine task did not stop in time; aborting");
                    handle.abort();
                }
            }
        }
    }
}
