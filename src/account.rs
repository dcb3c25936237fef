// =============================================================================
// Account Runtime — one event loop, one mutex, one margin pool
// =============================================================================
//
// Owns the risk controller, one grid strategy per symbol, and the account's
// private stream. Every stream callback enqueues onto the account channel;
// the single consumer task acquires the account mutex and dispatches, which
// makes every AccountState mutation serialized by construction.
//
// Fatal conditions (restore failure, stream loss, TP placement failure,
// MM-rate breach) converge on the emergency stop: flag file on disk, loop
// stopped, startup barred until an operator removes the flag.
// =============================================================================

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, warn};

use crate::bybit::client::BybitClient;
use crate::config::AccountConfig;
use crate::ledger::PositionLedger;
use crate::persistence::{self, StateStore};
use crate::reconcile::Reconciler;
use crate::risk::{RiskAction, RiskController, SymbolRisk};
use crate::strategy::GridStrategy;
use crate::stream::hub::TickerSubscription;
use crate::stream::private::{PrivateCallbacks, PrivateDispatcher};
use crate::stream::StreamHub;
use crate::types::{
    ExecutionEvent, OrderEvent, PositionEvent, PriceCell, Side, TickerEvent, WalletSnapshot,
};
use crate::wallet::WalletCache;

/// Periodic sync cadence.
const SYNC_INTERVAL_SECS: u64 = 60;
/// Risk tick cadence (ATR refresh + full risk evaluation).
const RISK_TICK_SECS: u64 = 60;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Everything the account loop reacts to.
pub enum AccountEvent {
    Ticker(TickerEvent),
    Position(PositionEvent),
    Wallet(WalletSnapshot),
    Order(OrderEvent),
    Execution(ExecutionEvent),
    SyncTick,
    RiskTick,
    StreamFatal(String),
    Shutdown,
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

pub struct AccountRuntime {
    cfg: AccountConfig,
    tag: String,
    data_dir: PathBuf,
    client: Arc<BybitClient>,
    wallet: Arc<WalletCache>,
    risk: Arc<RiskController>,
    reconciler: Arc<Reconciler>,
    strategies: HashMap<String, Arc<GridStrategy>>,

    /// The account serializing mutex. Held across every dispatch, including
    /// the exchange commands a dispatch issues.
    lock: tokio::sync::Mutex<()>,
    stopped: Arc<AtomicBool>,

    tx: UnboundedSender<AccountEvent>,
    rx: Mutex<Option<UnboundedReceiver<AccountEvent>>>,
    ticker_subs: Mutex<Vec<TickerSubscription>>,
    dispatcher: Mutex<Option<Arc<PrivateDispatcher>>>,
}

impl AccountRuntime {
    /// Build the runtime: credentials, client, persisted state, strategies.
    /// Refuses to build when the account's emergency-stop flag is present.
    pub fn build(cfg: AccountConfig, data_dir: &Path) -> Result<Self> {
        let tag = cfg.tag();

        if persistence::emergency_stop_present(data_dir, &tag) {
            let record = persistence::read_emergency_stop(data_dir, &tag);
            anyhow::bail!(
                "account {tag}: emergency-stop flag present (reason: {}) — remove {} to restart",
                record.map(|r| r.reason).unwrap_or_else(|| "unreadable".into()),
                persistence::emergency_stop_path(data_dir, &tag).display()
            );
        }

        let (api_key, api_secret) = cfg.credentials()?;
        let client = Arc::new(BybitClient::new(
            api_key,
            api_secret,
            cfg.demo_trading,
            cfg.dry_run,
        ));

        let wallet = Arc::new(WalletCache::new());
        let risk = Arc::new(RiskController::new(
            &tag,
            cfg.risk_management.mm_rate_threshold,
            client.clone(),
            wallet.clone(),
        ));

        let store = Arc::new(StateStore::open(data_dir, &tag)?);

        let mut strategies = HashMap::new();
        for strat_cfg in &cfg.strategies {
            let ledger = Arc::new(PositionLedger::new(&tag, &strat_cfg.symbol, store.clone()));
            let price = Arc::new(PriceCell::new());

            risk.register_symbol(
                &strat_cfg.symbol,
                SymbolRisk {
                    ledger: ledger.clone(),
                    price: price.clone(),
                    leverage: strat_cfg.leverage,
                    initial_position_size_usd: strat_cfg.initial_position_size_usd,
                    averaging_multiplier: strat_cfg.averaging_multiplier,
                    max_grid_levels_per_side: strat_cfg.max_grid_levels_per_side,
                },
            );

            let strategy = GridStrategy::new(
                &tag,
                strat_cfg.clone(),
                client.clone(),
                risk.clone(),
                ledger,
                price,
            );
            strategies.insert(strat_cfg.symbol.clone(), strategy);
        }

        let reconciler = Arc::new(Reconciler::new(
            &tag,
            cfg.id,
            data_dir.to_path_buf(),
            client.clone(),
            risk.clone(),
        ));

        let (tx, rx) = mpsc::unbounded_channel();

        info!(
            account = %tag,
            name = %cfg.name,
            symbols = strategies.len(),
            demo = cfg.demo_trading,
            dry_run = cfg.dry_run,
            "account runtime built"
        );

        Ok(Self {
            cfg,
            tag,
            data_dir: data_dir.to_path_buf(),
            client,
            wallet,
            risk,
            reconciler,
            strategies,
            lock: tokio::sync::Mutex::new(()),
            stopped: Arc::new(AtomicBool::new(false)),
            tx,
            rx: Mutex::new(Some(rx)),
            ticker_subs: Mutex::new(Vec::new()),
            dispatcher: Mutex::new(None),
        })
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    // -------------------------------------------------------------------------
    // Startup
    // -------------------------------------------------------------------------

    /// Wire the streams, prepare the exchange (hedge mode + leverage), seed
    /// the wallet, and launch the event loop and timers.
    pub async fn start(self: Arc<Self>, hub: &StreamHub) -> Result<()> {
        // REST wallet seed so the first risk checks see real numbers.
        let snapshot = self
            .client
            .get_wallet()
            .await
            .context("initial wallet fetch failed")?;
        self.wallet.seed(snapshot);

        // Hedge mode and leverage are idempotent per symbol.
        for strategy in self.strategies.values() {
            let cfg = strategy.config();
            self.client
                .set_position_mode(&cfg.symbol, true)
                .await
                .with_context(|| format!("failed to enable hedge mode for {}", cfg.symbol))?;
            self.client
                .set_leverage(&cfg.symbol, cfg.leverage)
                .await
                .with_context(|| format!("failed to set leverage for {}", cfg.symbol))?;
        }

        // Shared ticker subscriptions: forward into the account channel.
        for symbol in self.strategies.keys() {
            let tx = self.tx.clone();
            let sub = hub.subscribe_ticker(symbol, self.cfg.demo_trading, move |event| {
                let _ = tx.send(AccountEvent::Ticker(event.clone()));
            });
            self.ticker_subs.lock().push(sub);
        }

        // Private stream with typed forwarding callbacks.
        let (api_key, api_secret) = self.cfg.credentials()?;
        let dispatcher = hub.open_private(
            &self.tag,
            api_key,
            api_secret,
            self.cfg.demo_trading,
            self.private_callbacks(),
        );
        *self.dispatcher.lock() = Some(dispatcher);

        // Timers.
        let sync_tx = self.tx.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(SYNC_INTERVAL_SECS));
            interval.tick().await; // skip the immediate tick; restore runs first
            loop {
                interval.tick().await;
                if sync_tx.send(AccountEvent::SyncTick).is_err() {
                    return;
                }
            }
        });
        let risk_tx = self.tx.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(RISK_TICK_SECS));
            interval.tick().await;
            loop {
                interval.tick().await;
                if risk_tx.send(AccountEvent::RiskTick).is_err() {
                    return;
                }
            }
        });

        // Event loop.
        let this = self.clone();
        tokio::spawn(async move {
            this.run().await;
        });

        Ok(())
    }

    fn private_callbacks(&self) -> PrivateCallbacks {
        let position_tx = self.tx.clone();
        let wallet_tx = self.tx.clone();
        let order_tx = self.tx.clone();
        let execution_tx = self.tx.clone();
        let fatal_tx = self.tx.clone();

        // The resync flag must be raised from the dispatch thread itself:
        // while a restore pass holds the account mutex, queued events cannot
        // mark the window as dirty in time.
        let position_strategies = self.strategies.clone();
        let execution_strategies = self.strategies.clone();

        PrivateCallbacks {
            position: Box::new(move |event| {
                if let Some(strategy) = position_strategies.get(&event.symbol) {
                    if strategy.is_syncing() && event.size > 0.0 {
                        strategy.flag_resync();
                    }
                }
                let _ = position_tx.send(AccountEvent::Position(event));
            }),
            wallet: Box::new(move |snapshot| {
                let _ = wallet_tx.send(AccountEvent::Wallet(snapshot));
            }),
            order: Box::new(move |event| {
                let _ = order_tx.send(AccountEvent::Order(event));
            }),
            execution: Box::new(move |event| {
                if let Some(strategy) = execution_strategies.get(&event.symbol) {
                    if strategy.is_syncing()
                        && !event.reduce_only
                        && !strategy.is_expected_fill(&event.order_id)
                    {
                        strategy.flag_resync();
                    }
                }
                let _ = execution_tx.send(AccountEvent::Execution(event));
            }),
            fatal: Box::new(move |reason| {
                let _ = fatal_tx.send(AccountEvent::StreamFatal(reason));
            }),
        }
    }

    // -------------------------------------------------------------------------
    // Event loop
    // -------------------------------------------------------------------------

    async fn run(self: Arc<Self>) {
        let mut rx = match self.rx.lock().take() {
            Some(rx) => rx,
            None => {
                error!(account = %self.tag, "event loop started twice");
                return;
            }
        };

        // Startup restore for every symbol, serialized under the mutex. The
        // command echoes of the restore itself must not storm the handlers.
        {
            let _guard = self.lock.lock().await;
            self.pause_private_callbacks(true);
            for strategy in self.strategies.values() {
                if let Err(e) = self.reconciler.startup_restore(strategy).await {
                    error!(
                        account = %self.tag,
                        symbol = %strategy.symbol(),
                        error = %e,
                        "startup restore failed — stopping account"
                    );
                    self.pause_private_callbacks(false);
                    self.emergency_stop("RESTORE_FAILED", None).await;
                    return;
                }
            }
            self.pause_private_callbacks(false);
        }

        info!(account = %self.tag, "account live");

        while let Some(event) = rx.recv().await {
            if self.is_stopped() {
                break;
            }
            let _guard = self.lock.lock().await;
            match event {
                AccountEvent::Ticker(ev) => {
                    if let Some(strategy) = self.strategies.get(&ev.symbol) {
                        if let Err(e) = strategy.on_price(ev.last_price).await {
                            self.fatal_strategy_error(&ev.symbol, e).await;
                            break;
                        }
                    }
                }
                AccountEvent::Position(ev) => {
                    if let Some(strategy) = self.strategies.get(&ev.symbol) {
                        if let Err(e) = strategy.on_position(&ev).await {
                            self.fatal_strategy_error(&ev.symbol, e).await;
                            break;
                        }
                    }
                }
                AccountEvent::Execution(ev) => {
                    if let Some(strategy) = self.strategies.get(&ev.symbol) {
                        if let Err(e) = strategy.on_execution(&ev).await {
                            self.fatal_strategy_error(&ev.symbol, e).await;
                            break;
                        }
                    }
                }
                AccountEvent::Order(ev) => {
                    if let Some(strategy) = self.strategies.get(&ev.symbol) {
                        strategy.on_order(&ev);
                    }
                }
                AccountEvent::Wallet(snapshot) => {
                    self.wallet.apply(snapshot);
                    let actions = self.risk.evaluate();
                    if self.execute_risk_actions(actions).await {
                        break;
                    }
                }
                AccountEvent::SyncTick => {
                    self.pause_private_callbacks(true);
                    for strategy in self.strategies.values() {
                        if let Err(e) = self.reconciler.periodic_sync(strategy).await {
                            warn!(
                                account = %self.tag,
                                symbol = %strategy.symbol(),
                                error = %e,
                                "periodic sync failed — will retry next tick"
                            );
                        }
                    }
                    self.pause_private_callbacks(false);
                    // A sync pass may have written the stop flag.
                    if persistence::emergency_stop_present(&self.data_dir, &self.tag) {
                        self.stopped.store(true, Ordering::SeqCst);
                        break;
                    }
                }
                AccountEvent::RiskTick => {
                    self.risk.refresh_atr().await;
                    let actions = self.risk.evaluate();
                    if self.execute_risk_actions(actions).await {
                        break;
                    }
                }
                AccountEvent::StreamFatal(reason) => {
                    error!(account = %self.tag, reason = %reason, "fatal stream event");
                    self.emergency_stop("STREAM_LOST", Some(reason)).await;
                    break;
                }
                AccountEvent::Shutdown => {
                    info!(account = %self.tag, "shutdown event received");
                    break;
                }
            }
        }

        self.ticker_subs.lock().clear();
        info!(account = %self.tag, "account event loop stopped");
    }

    /// Gate the private stream's non-essential callbacks around reconciler
    /// critical sections. CLOSE events and wallet updates always flow.
    fn pause_private_callbacks(&self, paused: bool) {
        if let Some(dispatcher) = self.dispatcher.lock().as_ref() {
            if paused {
                dispatcher.pause_callbacks();
            } else {
                dispatcher.resume_callbacks();
            }
        }
    }

    async fn fatal_strategy_error(&self, symbol: &str, error: anyhow::Error) {
        error!(
            account = %self.tag,
            symbol,
            error = %format!("{error:#}"),
            "fatal strategy error"
        );
        self.emergency_stop("STRATEGY_FAILURE", Some(format!("{symbol}: {error:#}")))
            .await;
    }

    // -------------------------------------------------------------------------
    // Risk action execution
    // -------------------------------------------------------------------------

    /// Execute controller decisions. Returns `true` when the account stopped.
    async fn execute_risk_actions(&self, actions: Vec<RiskAction>) -> bool {
        for action in actions {
            match action {
                RiskAction::CancelTp { symbol, side } => {
                    if let Some(strategy) = self.strategies.get(&symbol) {
                        if let Err(e) = strategy.cancel_tp(side).await {
                            warn!(
                                account = %self.tag,
                                symbol = %symbol,
                                side = %side,
                                error = %e,
                                "panic TP cancel failed"
                            );
                        }
                    }
                }
                RiskAction::Balance(orders) => {
                    for order in orders {
                        let Some(strategy) = self.strategies.get(&order.symbol) else {
                            continue;
                        };
                        if let Err(e) = strategy.balance_increase(order.side, order.qty).await {
                            warn!(
                                account = %self.tag,
                                symbol = %order.symbol,
                                side = %order.side,
                                qty = order.qty,
                                error = %e,
                                "balancer order failed"
                            );
                        }
                    }
                }
                RiskAction::EmergencyClose { reason } => {
                    self.emergency_close_all(&reason).await;
                    return true;
                }
            }
        }
        false
    }

    /// MM-rate breach: flatten every leg of every symbol with market
    /// reduce-only orders, then stop the account for good.
    async fn emergency_close_all(&self, reason: &str) {
        error!(account = %self.tag, reason, "EMERGENCY CLOSE — flattening all positions");

        for strategy in self.strategies.values() {
            let symbol = strategy.symbol();
            for side in Side::BOTH {
                let size = match self.client.get_active_position(symbol, side).await {
                    Ok(snap) => snap.size,
                    Err(e) => {
                        warn!(
                            account = %self.tag,
                            symbol,
                            side = %side,
                            error = %e,
                            "emergency close: snapshot failed — falling back to ledger qty"
                        );
                        strategy.ledger().total_qty(side)
                    }
                };
                if size <= 0.0 {
                    continue;
                }
                match self
                    .client
                    .place_order(
                        symbol,
                        side.close_order_side(),
                        size,
                        crate::types::OrderType::Market,
                        None,
                        true,
                        side.position_idx(),
                        None,
                    )
                    .await
                {
                    Ok(order_id) => info!(
                        account = %self.tag,
                        symbol,
                        side = %side,
                        size,
                        order_id = %order_id,
                        "emergency close order placed"
                    ),
                    Err(e) => error!(
                        account = %self.tag,
                        symbol,
                        side = %side,
                        size,
                        error = %e,
                        "emergency close order FAILED"
                    ),
                }
                strategy.ledger().clear_side(side);
            }
        }

        self.emergency_stop(reason, None).await;
    }

    /// Write the stop flag and halt the loop. The flag is the authoritative
    /// do-not-start signal for future runs.
    async fn emergency_stop(&self, reason: &str, detail: Option<String>) {
        let diagnostic = detail.map(|d| serde_json::json!({ "detail": d }));
        if let Err(e) = persistence::write_emergency_stop(
            &self.data_dir,
            &self.tag,
            self.cfg.id,
            None,
            reason,
            diagnostic,
        ) {
            error!(account = %self.tag, error = %e, "failed to write emergency-stop flag");
        }
        self.stopped.store(true, Ordering::SeqCst);
    }

    // -------------------------------------------------------------------------
    // Shutdown
    // -------------------------------------------------------------------------

    /// Graceful shutdown: stop the loop and release subscriptions. Ledger
    /// state is already on disk — every mutation persisted when it happened.
    pub fn shutdown(&self) {
        debug!(account = %self.tag, "shutdown requested");
        self.stopped.store(true, Ordering::SeqCst);
        let _ = self.tx.send(AccountEvent::Shutdown);
    }
}

impl std::fmt::Debug for AccountRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountRuntime")
            .field("account", &self.tag)
            .field("symbols", &self.strategies.len())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
