// =============================================================================
// Grid Strategy — price-driven state machine for one (account, symbol) pair
// =============================================================================
//
// Martingale hedged grid: both legs hold positions at all times; each leg
// averages down (up) on adverse moves and exits the whole leg through a
// single reduce-only take-profit at a fee-adjusted distance from the average
// entry. When a TP fires, the closed leg reopens sized against the surviving
// leg's margin.
//
// Every handler runs on the account event loop under the account mutex; the
// only work spawned off it is limit-entry placement through the tracker
// (fills come back through the execution stream).
//
// CLOSE events (position size 0) are processed unconditionally, including
// while the reconciler is mid-sync. Everything else defers to the sync pass
// via the needs_resync flag.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::bybit::client::BybitClient;
use crate::config::StrategyConfig;
use crate::ledger::{FillOutcome, PositionLedger, TpSlot};
use crate::limit_tracker::LimitOrderTracker;
use crate::risk::RiskController;
use crate::types::{ExecutionEvent, OrderEvent, OrderStatus, PositionEvent, PriceCell, Side};

// ---------------------------------------------------------------------------
// Tunables
// ---------------------------------------------------------------------------

/// Bybit linear taker fee, percent. TP pricing covers the taker cost of every
/// entry plus the TP itself.
pub const TAKER_FEE_PERCENT: f64 = 0.055;
/// Pending reservation orders are re-priced after this much drift.
const PENDING_DRIFT_PERCENT: f64 = 5.0;
/// Minimum spacing between adaptive reopens of the same symbol.
const REOPEN_DEBOUNCE_SECS: u64 = 3;
/// Position snapshot polling after a market open: attempts and spacing.
const FILL_POLL_ATTEMPTS: u32 = 10;
const FILL_POLL_DELAY_MS: u64 = 300;

// ---------------------------------------------------------------------------
// Pure grid math (unit-tested)
// ---------------------------------------------------------------------------

/// Price that triggers the entry opening `next_level` on a side: one step
/// factor per level away from the current average entry.
pub fn averaging_trigger_price(avg: f64, step_percent: f64, next_level: u32, side: Side) -> f64 {
    let factor = match side {
        Side::Long => 1.0 - step_percent / 100.0,
        Side::Short => 1.0 + step_percent / 100.0,
    };
    avg * factor.powi(next_level as i32)
}

/// Fee allowance baked into the TP price: taker cost of `n_entries` opens
/// plus the closing taker fill, as a price fraction.
pub fn fee_adjust(n_entries: usize) -> f64 {
    (n_entries as f64 * TAKER_FEE_PERCENT + TAKER_FEE_PERCENT) / 100.0
}

/// Take-profit price for a side given its average entry and entry count.
pub fn tp_price(avg: f64, take_profit_percent: f64, n_entries: usize, side: Side) -> f64 {
    let distance = take_profit_percent / 100.0 + fee_adjust(n_entries);
    match side {
        Side::Long => avg * (1.0 + distance),
        Side::Short => avg * (1.0 - distance),
    }
}

/// Fraction of the surviving leg's margin used to reopen the closed leg.
/// `None` means the ratio is too small for proportional sizing — reopen at
/// the initial size instead.
pub fn reopen_coefficient(ratio: f64) -> Option<f64> {
    if ratio >= 16.0 {
        Some(1.0)
    } else if ratio >= 8.0 {
        Some(0.5)
    } else if ratio >= 4.0 {
        Some(0.25)
    } else {
        None
    }
}

/// Base-asset quantity bought by `margin_usd` at `price` with `leverage`.
pub fn qty_from_margin(margin_usd: f64, price: f64, leverage: u32) -> f64 {
    margin_usd * leverage as f64 / price
}

// ---------------------------------------------------------------------------
// Strategy
// ---------------------------------------------------------------------------

/// One symbol's grid state machine.
pub struct GridStrategy {
    account_tag: String,
    cfg: StrategyConfig,
    client: Arc<BybitClient>,
    risk: Arc<RiskController>,
    ledger: Arc<PositionLedger>,
    tracker: Arc<LimitOrderTracker>,
    price: Arc<PriceCell>,

    /// Unfilled reservation orders per side (ids).
    pending: Mutex<HashMap<Side, Vec<String>>>,
    /// Price at which the side's reservations were last (re)placed.
    pending_anchor: Mutex<HashMap<Side, f64>>,
    /// Sides with an averaging order currently working.
    averaging_in_flight: Mutex<HashSet<Side>>,
    /// Sides whose TP panic mode cancelled; recreation is suppressed while
    /// panic holds.
    tp_suppressed: Mutex<HashSet<Side>>,
    /// Order ids this strategy itself placed during a sync window; their
    /// executions must not flag a resync.
    expected_fills: Mutex<HashSet<String>>,

    is_syncing: AtomicBool,
    needs_resync: AtomicBool,
    last_reopen: Mutex<Option<Instant>>,

    /// Self-handle for spawning fill tasks off the account loop.
    weak_self: Weak<GridStrategy>,
}

impl GridStrategy {
    pub fn new(
        account_tag: &str,
        cfg: StrategyConfig,
        client: Arc<BybitClient>,
        risk: Arc<RiskController>,
        ledger: Arc<PositionLedger>,
        price: Arc<PriceCell>,
    ) -> Arc<Self> {
        let tracker = Arc::new(LimitOrderTracker::new(account_tag, &cfg.symbol, client.clone()));
        Arc::new_cyclic(|weak_self| Self {
            account_tag: account_tag.to_string(),
            cfg,
            client,
            risk,
            ledger,
            tracker,
            price,
            pending: Mutex::new(HashMap::new()),
            pending_anchor: Mutex::new(HashMap::new()),
            averaging_in_flight: Mutex::new(HashSet::new()),
            tp_suppressed: Mutex::new(HashSet::new()),
            expected_fills: Mutex::new(HashSet::new()),
            is_syncing: AtomicBool::new(false),
            needs_resync: AtomicBool::new(false),
            last_reopen: Mutex::new(None),
            weak_self: weak_self.clone(),
        })
    }

    pub fn symbol(&self) -> &str {
        &self.cfg.symbol
    }

    pub fn config(&self) -> &StrategyConfig {
        &self.cfg
    }

    pub fn ledger(&self) -> &Arc<PositionLedger> {
        &self.ledger
    }

    pub fn price_cell(&self) -> &Arc<PriceCell> {
        &self.price
    }

    // -------------------------------------------------------------------------
    // Sync window flags (driven by the reconciler)
    // -------------------------------------------------------------------------

    pub fn set_syncing(&self, syncing: bool) {
        self.is_syncing.store(syncing, Ordering::SeqCst);
    }

    pub fn is_syncing(&self) -> bool {
        self.is_syncing.load(Ordering::SeqCst)
    }

    /// Read and clear the resync flag. The reconciler polls this after each
    /// restore pass.
    pub fn take_needs_resync(&self) -> bool {
        self.needs_resync.swap(false, Ordering::SeqCst)
    }

    /// Flag that exchange state moved under an in-progress sync. Safe to call
    /// from stream dispatch threads.
    pub fn flag_resync(&self) {
        self.needs_resync.store(true, Ordering::SeqCst);
    }

    /// Mark an order this strategy just placed so its own fill events are not
    /// mistaken for foreign activity during a sync window.
    pub fn expect_fill(&self, order_id: &str) {
        self.expected_fills.lock().insert(order_id.to_string());
    }

    /// Whether `order_id` is a fill this strategy is expecting.
    pub fn is_expected_fill(&self, order_id: &str) -> bool {
        self.expected_fills.lock().contains(order_id)
    }

    // -------------------------------------------------------------------------
    // Stream handlers
    // -------------------------------------------------------------------------

    /// Price tick pipeline: averaging → TP verification → pending symmetry.
    pub async fn on_price(&self, price: f64) -> Result<()> {
        self.price.set(price);

        if self.is_syncing() {
            return Ok(());
        }

        for side in Side::BOTH {
            self.check_averaging(side, price);
        }

        self.verify_tp_presence().await?;
        self.ensure_pending_symmetry(price).await;
        Ok(())
    }

    /// Position stream: CLOSE events are handled unconditionally; resizes
    /// during a sync window set the resync flag instead of mutating.
    pub async fn on_position(&self, event: &PositionEvent) -> Result<()> {
        if event.size == 0.0 {
            if self.ledger.total_qty(event.side) > 0.0 {
                info!(
                    account = %self.account_tag,
                    symbol = %self.cfg.symbol,
                    side = %event.side,
                    "CLOSE event from position stream"
                );
                self.handle_close(event.side).await?;
            }
            return Ok(());
        }

        if self.is_syncing() {
            debug!(
                account = %self.account_tag,
                symbol = %self.cfg.symbol,
                side = %event.side,
                size = event.size,
                "position delta during sync window — flagging resync"
            );
            self.needs_resync.store(true, Ordering::SeqCst);
        }
        // Non-close resizes carry no information the execution stream does
        // not deliver with better granularity.
        Ok(())
    }

    /// Execution stream: opening fills extend the grid; reduce-only fills are
    /// TP closes and trigger the adaptive reopen.
    pub async fn on_execution(&self, event: &ExecutionEvent) -> Result<()> {
        if let Some(side) = event.closing_side() {
            info!(
                account = %self.account_tag,
                symbol = %self.cfg.symbol,
                side = %side,
                exec_qty = event.exec_qty,
                exec_price = event.exec_price,
                "TP execution"
            );
            if self.ledger.total_qty(side) > 0.0 {
                self.handle_close(side).await?;
            }
            return Ok(());
        }

        let side = match event.opening_side() {
            Some(s) => s,
            None => return Ok(()),
        };

        if self.is_syncing() {
            // Reconstruction owns the ledger during the sync window; unknown
            // opening fills force another pass.
            if self
                .ledger
                .entries(side)
                .iter()
                .all(|e| e.order_id.as_deref() != Some(event.order_id.as_str()))
            {
                self.needs_resync.store(true, Ordering::SeqCst);
            }
            return Ok(());
        }

        self.averaging_in_flight.lock().remove(&side);
        self.tracker.notify_fill(&event.order_id);
        self.remove_pending(&event.order_id);

        match self
            .ledger
            .apply_fill(side, &event.order_id, event.exec_qty, event.exec_price)
        {
            FillOutcome::Duplicate => Ok(()),
            FillOutcome::NewEntry(_) | FillOutcome::Accumulated => {
                // Any quantity change invalidates the TP.
                self.create_tp(side, false).await
            }
        }
    }

    /// Order stream: resolves tracker waits, pending reservations, TP slots,
    /// and pins reference quantities once opening orders terminally fill.
    pub fn on_order(&self, event: &OrderEvent) {
        if event.order_status == OrderStatus::Filled {
            self.tracker.notify_fill(&event.order_id);
        }
        if event.order_status.is_terminal() {
            self.remove_pending(&event.order_id);
        }

        // Reference qty is pinned when an opening order finishes filling.
        if event.order_status == OrderStatus::Filled && !event.reduce_only {
            if let Some(side) = Side::from_position_idx(event.position_idx) {
                if let Some(entry) = self
                    .ledger
                    .entries(side)
                    .iter()
                    .find(|e| e.order_id.as_deref() == Some(event.order_id.as_str()))
                {
                    self.ledger
                        .set_reference_qty(entry.grid_level, entry.qty_coins);
                }
            }
        }

        // TP slot bookkeeping. Updates while the slot is Pending carry an id
        // we do not know yet and fall through harmlessly.
        if let Some(side) = Side::from_position_idx(event.position_idx) {
            if self.ledger.tp(side).live_id() == Some(event.order_id.as_str()) {
                match event.order_status {
                    OrderStatus::Cancelled | OrderStatus::Rejected => {
                        warn!(
                            account = %self.account_tag,
                            symbol = %self.cfg.symbol,
                            side = %side,
                            status = %event.order_status,
                            "tracked TP left the book — slot cleared for recreation"
                        );
                        self.ledger.clear_tp(side);
                    }
                    OrderStatus::Filled => {
                        // The close arrives through position/execution.
                        debug!(
                            account = %self.account_tag,
                            symbol = %self.cfg.symbol,
                            side = %side,
                            "TP order filled"
                        );
                    }
                    _ => {}
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Averaging
    // -------------------------------------------------------------------------

    /// Check and (if triggered and permitted) dispatch one averaging entry.
    fn check_averaging(&self, side: Side, price: f64) {
        let next_level = self.ledger.grid_level(side);
        if next_level == 0 {
            return; // nothing to average against
        }
        if next_level >= self.cfg.max_grid_levels_per_side {
            debug!(
                account = %self.account_tag,
                symbol = %self.cfg.symbol,
                side = %side,
                next_level,
                "averaging refused — level cap reached"
            );
            return;
        }
        if self.averaging_in_flight.lock().contains(&side) {
            return;
        }

        let avg = self.ledger.avg_entry(side);
        let trigger = averaging_trigger_price(avg, self.cfg.grid_step_percent, next_level, side);
        let triggered = match side {
            Side::Long => price <= trigger,
            Side::Short => price >= trigger,
        };
        if !triggered {
            return;
        }

        let last_margin = self
            .ledger
            .last_entry_margin(side, self.cfg.leverage)
            .unwrap_or(self.cfg.initial_position_size_usd);
        let next_margin = last_margin * self.cfg.averaging_multiplier;

        if !self.risk.check_reserve(&self.cfg.symbol, side, next_margin) {
            // Denied averaging is silent beyond the risk controller's log.
            return;
        }

        let qty = qty_from_margin(next_margin, price, self.cfg.leverage);
        info!(
            account = %self.account_tag,
            symbol = %self.cfg.symbol,
            side = %side,
            next_level,
            avg,
            trigger,
            price,
            next_margin,
            qty,
            "averaging triggered"
        );

        let Some(this) = self.weak_self.upgrade() else {
            return;
        };
        self.averaging_in_flight.lock().insert(side);
        tokio::spawn(async move {
            let result = this.tracker.place(side, qty, price, "averaging").await;
            if let Err(e) = result {
                warn!(
                    account = %this.account_tag,
                    symbol = %this.cfg.symbol,
                    side = %side,
                    error = %e,
                    "averaging entry failed — attempt abandoned"
                );
                this.averaging_in_flight.lock().remove(&side);
            }
            // On success the in-flight flag clears when the fill arrives.
        });
    }

    // -------------------------------------------------------------------------
    // Take-profit maintenance
    // -------------------------------------------------------------------------

    /// Recreate a side's TP so it always covers the side's full quantity.
    ///
    /// `force_cancel` lists the book and removes *every* reduce-only order in
    /// the side's closing direction first — used after restarts when local TP
    /// tracking is presumed stale.
    ///
    /// A placement failure is fatal for the side: an uncovered position is
    /// the one state this engine refuses to run in.
    pub async fn create_tp(&self, side: Side, force_cancel: bool) -> Result<()> {
        let qty = self.ledger.total_qty(side);
        if qty <= 0.0 {
            self.ledger.clear_tp(side);
            return Ok(());
        }

        if force_cancel {
            let open = self
                .client
                .get_open_orders(&self.cfg.symbol)
                .await
                .context("force-cancel: failed to list open orders")?;
            for order in open {
                let is_side_tp = order.reduce_only
                    && order.side == side.close_order_side()
                    && order.position_idx == side.position_idx();
                if is_side_tp {
                    if let Err(e) = self.client.cancel_order(&self.cfg.symbol, &order.order_id).await
                    {
                        warn!(
                            account = %self.account_tag,
                            symbol = %self.cfg.symbol,
                            order_id = %order.order_id,
                            error = %e,
                            "force-cancel of reduce-only order failed"
                        );
                    }
                }
            }
        } else if let Some(id) = self.ledger.tp(side).live_id() {
            let id = id.to_string();
            if let Err(e) = self.client.cancel_order(&self.cfg.symbol, &id).await {
                // Usually means the order just filled or was already gone.
                debug!(
                    account = %self.account_tag,
                    symbol = %self.cfg.symbol,
                    side = %side,
                    order_id = %id,
                    error = %e,
                    "previous TP cancel failed — continuing"
                );
            }
        }

        let avg = self.ledger.avg_entry(side);
        let n_entries = self.ledger.grid_level(side) as usize;
        let price = tp_price(avg, self.cfg.take_profit_percent, n_entries, side);

        // Mark the slot before dispatching so a faster order-stream update
        // cannot be mistaken for a stale TP.
        self.ledger.set_tp_pending(side);
        self.tp_suppressed.lock().remove(&side);

        let placed = self
            .client
            .place_order(
                &self.cfg.symbol,
                side.close_order_side(),
                qty,
                crate::types::OrderType::Limit,
                Some(price),
                true,
                side.position_idx(),
                None,
            )
            .await;

        match placed {
            Ok(order_id) => {
                info!(
                    account = %self.account_tag,
                    symbol = %self.cfg.symbol,
                    side = %side,
                    qty,
                    avg,
                    tp = price,
                    order_id = %order_id,
                    "take-profit placed"
                );
                self.ledger.set_tp_live(side, order_id);
                Ok(())
            }
            Err(e) => {
                self.ledger.clear_tp(side);
                Err(e).with_context(|| {
                    format!(
                        "[{}][{}] TP placement failed on {side} — position is uncovered",
                        self.account_tag, self.cfg.symbol
                    )
                })
            }
        }
    }

    /// Cheap presence check run on every tick: a side with quantity must have
    /// its TP slot set unless panic mode is deliberately holding it open.
    async fn verify_tp_presence(&self) -> Result<()> {
        for side in Side::BOTH {
            if self.ledger.total_qty(side) <= 0.0 {
                continue;
            }
            if self.ledger.tp(side).is_set() {
                continue;
            }
            if self.tp_suppressed.lock().contains(&side) && self.risk.is_panic() {
                continue;
            }
            warn!(
                account = %self.account_tag,
                symbol = %self.cfg.symbol,
                side = %side,
                "side has quantity but no TP — recreating"
            );
            self.create_tp(side, false).await?;
        }
        Ok(())
    }

    /// Panic action: drop a side's TP and keep it down while panic holds.
    pub async fn cancel_tp(&self, side: Side) -> Result<()> {
        if let Some(id) = self.ledger.tp(side).live_id() {
            let id = id.to_string();
            self.client
                .cancel_order(&self.cfg.symbol, &id)
                .await
                .with_context(|| {
                    format!(
                        "[{}][{}] panic TP cancel failed on {side}",
                        self.account_tag, self.cfg.symbol
                    )
                })?;
        }
        self.ledger.clear_tp(side);
        self.tp_suppressed.lock().insert(side);
        info!(
            account = %self.account_tag,
            symbol = %self.cfg.symbol,
            side = %side,
            "TP cancelled and suppressed (panic)"
        );
        Ok(())
    }

    // -------------------------------------------------------------------------
    // TP close and adaptive reopen
    // -------------------------------------------------------------------------

    /// A side closed via TP (or an untracked close was discovered): clear it,
    /// cancel reservations, and reopen it sized against the surviving leg.
    pub async fn handle_close(&self, side: Side) -> Result<()> {
        {
            let mut last = self.last_reopen.lock();
            if let Some(at) = *last {
                if at.elapsed().as_secs() < REOPEN_DEBOUNCE_SECS {
                    debug!(
                        account = %self.account_tag,
                        symbol = %self.cfg.symbol,
                        side = %side,
                        "close debounced — reopen already in progress"
                    );
                    return Ok(());
                }
            }
            *last = Some(Instant::now());
        }

        self.risk.notify_close_event(&self.cfg.symbol);

        // Both sides' reservations go before the reopen so no orphan limit
        // order can fill into the fresh grid.
        self.cancel_all_pending().await;
        self.tp_suppressed.lock().remove(&side);
        self.ledger.clear_side(side);

        let opposite = side.opposite();
        let opp_qty = self.ledger.total_qty(opposite);
        if opp_qty <= 0.0 {
            warn!(
                account = %self.account_tag,
                symbol = %self.cfg.symbol,
                "both sides flat after close — periodic sync will reinitialise"
            );
            return Ok(());
        }

        let price = self.current_price().await?;
        let opposite_margin = self
            .ledger
            .total_margin_at(opposite, price, self.cfg.leverage);
        let ratio = opposite_margin / self.cfg.initial_position_size_usd;

        let reopen_margin = match reopen_coefficient(ratio) {
            None => {
                info!(
                    account = %self.account_tag,
                    symbol = %self.cfg.symbol,
                    side = %side,
                    ratio,
                    "adaptive reopen: ratio below proportional band — initial size"
                );
                self.cfg.initial_position_size_usd
            }
            Some(coefficient) => {
                let wanted = opposite_margin * coefficient;
                let cap = self.risk.available_for_trading();
                let margin = if wanted <= cap {
                    wanted
                } else if cap > 0.0 {
                    info!(
                        account = %self.account_tag,
                        symbol = %self.cfg.symbol,
                        wanted,
                        cap,
                        "adaptive reopen capped by safety reserve"
                    );
                    cap
                } else if self.risk.is_panic() {
                    // Panic may consume the reserve to restore the hedge.
                    warn!(
                        account = %self.account_tag,
                        symbol = %self.cfg.symbol,
                        wanted,
                        "adaptive reopen consuming safety reserve (panic)"
                    );
                    wanted.min(self.risk_free_balance())
                } else {
                    warn!(
                        account = %self.account_tag,
                        symbol = %self.cfg.symbol,
                        "no headroom for proportional reopen — initial size"
                    );
                    self.cfg.initial_position_size_usd
                };
                info!(
                    account = %self.account_tag,
                    symbol = %self.cfg.symbol,
                    side = %side,
                    ratio,
                    coefficient,
                    opposite_margin,
                    reopen_margin = margin,
                    "adaptive reopen sizing"
                );
                margin
            }
        };

        self.market_open_and_record(side, reopen_margin, "adaptive reopen")
            .await?;
        self.create_tp(side, false).await?;
        self.ensure_pending_symmetry(price).await;
        Ok(())
    }

    fn risk_free_balance(&self) -> f64 {
        // Raw wallet availability, reserve ignored. Panic-only path.
        self.risk.available_for_trading() + self.risk.safety_reserve()
    }

    /// Place a market order for `margin_usd` on `side` and record the fill
    /// from the authoritative position snapshot.
    pub async fn market_open_and_record(
        &self,
        side: Side,
        margin_usd: f64,
        reason: &str,
    ) -> Result<()> {
        let price = self.current_price().await?;
        let qty = qty_from_margin(margin_usd, price, self.cfg.leverage);

        let before = self
            .client
            .get_active_position(&self.cfg.symbol, side)
            .await
            .context("pre-open position snapshot failed")?;

        let order_id = self
            .client
            .place_order(
                &self.cfg.symbol,
                side.open_order_side(),
                qty,
                crate::types::OrderType::Market,
                None,
                false,
                side.position_idx(),
                None,
            )
            .await
            .with_context(|| format!("market open failed ({reason})"))?;

        // Our own fill racing a sync window must not look like foreign
        // exchange activity.
        self.expect_fill(&order_id);

        // The snapshot is authoritative for qty and average price; the
        // ledger marks the order so its execution events are replays.
        let mut recorded = false;
        for _ in 0..FILL_POLL_ATTEMPTS {
            tokio::time::sleep(std::time::Duration::from_millis(FILL_POLL_DELAY_MS)).await;
            let snap = self
                .client
                .get_active_position(&self.cfg.symbol, side)
                .await
                .context("post-open position snapshot failed")?;
            if snap.size > before.size + f64::EPSILON {
                let fill_qty = snap.size - before.size;
                let fill_price = if before.size > 0.0 {
                    // Leg already had quantity; price the delta at market.
                    price
                } else {
                    snap.avg_price
                };
                let level = self.ledger.grid_level(side);
                self.ledger
                    .add_entry(side, fill_price, fill_qty, level, Some(order_id.clone()));
                recorded = true;
                break;
            }
        }

        if !recorded {
            // Dry-run mode never moves the snapshot; record the request as
            // sized. Live mode treats a missing fill as a real failure.
            if self.client.is_dry_run() {
                let level = self.ledger.grid_level(side);
                self.ledger.add_entry(side, price, qty, level, Some(order_id));
                return Ok(());
            }
            anyhow::bail!(
                "[{}][{}] market open ({reason}) on {side} did not appear in position snapshot",
                self.account_tag,
                self.cfg.symbol
            );
        }

        Ok(())
    }

    /// Balancer path: market-buy `qty` on the lagging side and refresh its TP.
    /// Bypasses the limit tracker by design.
    pub async fn balance_increase(&self, side: Side, qty: f64) -> Result<()> {
        let price = self.current_price().await?;
        let order_id = self
            .client
            .place_order(
                &self.cfg.symbol,
                side.open_order_side(),
                qty,
                crate::types::OrderType::Market,
                None,
                false,
                side.position_idx(),
                None,
            )
            .await
            .context("balancer market order failed")?;

        let level = self.ledger.grid_level(side);
        self.ledger.add_entry(side, price, qty, level, Some(order_id));
        self.create_tp(side, false).await?;
        info!(
            account = %self.account_tag,
            symbol = %self.cfg.symbol,
            side = %side,
            qty,
            price,
            "balancer entry recorded"
        );
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Pending-entry symmetry
    // -------------------------------------------------------------------------

    /// Keep a limit reservation working for an empty side while the other
    /// side holds positions, re-priced when the market drifts.
    pub async fn ensure_pending_symmetry(&self, price: f64) {
        for side in Side::BOTH {
            let opposite = side.opposite();
            let needs_reservation =
                self.ledger.total_qty(side) > 0.0 && self.ledger.total_qty(opposite) == 0.0;

            if !needs_reservation {
                continue;
            }

            let existing: Vec<String> = self
                .pending
                .lock()
                .get(&opposite)
                .cloned()
                .unwrap_or_default();

            if !existing.is_empty() {
                let anchor = self
                    .pending_anchor
                    .lock()
                    .get(&opposite)
                    .copied()
                    .unwrap_or(price);
                let drift = ((price - anchor) / anchor).abs() * 100.0;
                if drift <= PENDING_DRIFT_PERCENT {
                    continue;
                }
                info!(
                    account = %self.account_tag,
                    symbol = %self.cfg.symbol,
                    side = %opposite,
                    drift_pct = drift,
                    "pending reservation drifted — re-placing"
                );
                for id in &existing {
                    if let Err(e) = self.client.cancel_order(&self.cfg.symbol, id).await {
                        debug!(
                            account = %self.account_tag,
                            symbol = %self.cfg.symbol,
                            order_id = %id,
                            error = %e,
                            "pending cancel failed (likely already gone)"
                        );
                    }
                }
                self.pending.lock().remove(&opposite);
            }

            // Reservation sits one grid step into the direction the empty
            // side would enter on.
            let step = self.cfg.grid_step_percent / 100.0;
            let limit_price = match opposite {
                Side::Long => price * (1.0 - step),
                Side::Short => price * (1.0 + step),
            };
            let qty = qty_from_margin(
                self.cfg.initial_position_size_usd,
                limit_price,
                self.cfg.leverage,
            );

            match self
                .client
                .place_order(
                    &self.cfg.symbol,
                    opposite.open_order_side(),
                    qty,
                    crate::types::OrderType::Limit,
                    Some(limit_price),
                    false,
                    opposite.position_idx(),
                    None,
                )
                .await
            {
                Ok(order_id) => {
                    info!(
                        account = %self.account_tag,
                        symbol = %self.cfg.symbol,
                        side = %opposite,
                        qty,
                        limit_price,
                        order_id = %order_id,
                        "pending reservation placed"
                    );
                    self.pending
                        .lock()
                        .entry(opposite)
                        .or_default()
                        .push(order_id);
                    self.pending_anchor.lock().insert(opposite, price);
                }
                Err(e) => warn!(
                    account = %self.account_tag,
                    symbol = %self.cfg.symbol,
                    side = %opposite,
                    error = %e,
                    "pending reservation placement failed"
                ),
            }
        }
    }

    /// Cancel every reservation on both sides (before reopen, during sync).
    pub async fn cancel_all_pending(&self) {
        let all: Vec<(Side, Vec<String>)> = {
            let mut pending = self.pending.lock();
            let drained = pending.drain().collect();
            self.pending_anchor.lock().clear();
            drained
        };
        for (side, ids) in all {
            for id in ids {
                if let Err(e) = self.client.cancel_order(&self.cfg.symbol, &id).await {
                    debug!(
                        account = %self.account_tag,
                        symbol = %self.cfg.symbol,
                        side = %side,
                        order_id = %id,
                        error = %e,
                        "pending cancel failed (likely already filled or gone)"
                    );
                }
            }
        }
    }

    /// Drop local tracking of pending and TP order ids without touching the
    /// exchange. Used by the first sync pass after a cancel-all.
    pub fn forget_tracked_orders(&self) {
        self.pending.lock().clear();
        self.pending_anchor.lock().clear();
        for side in Side::BOTH {
            if matches!(self.ledger.tp(side), TpSlot::Live(_)) {
                self.ledger.clear_tp(side);
            }
        }
    }

    fn remove_pending(&self, order_id: &str) {
        let mut pending = self.pending.lock();
        for ids in pending.values_mut() {
            ids.retain(|id| id != order_id);
        }
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    /// Last stream price, falling back to REST when no tick has landed yet.
    pub async fn current_price(&self) -> Result<f64> {
        let cached = self.price.get();
        if cached > 0.0 {
            return Ok(cached);
        }
        let price = self
            .client
            .get_ticker(&self.cfg.symbol)
            .await
            .context("ticker fallback failed")?;
        self.price.set(price);
        Ok(price)
    }
}

impl std::fmt::Debug for GridStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GridStrategy")
            .field("symbol", &self.cfg.symbol)
            .field("long_level", &self.ledger.grid_level(Side::Long))
            .field("short_level", &self.ledger.grid_level(Side::Short))
            .field("syncing", &self.is_syncing())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn averaging_trigger_steps_compound() {
        // Long, 1% step: level-1 trigger one step below avg, level-3 three.
        let avg = 0.25;
        let t1 = averaging_trigger_price(avg, 1.0, 1, Side::Long);
        let t3 = averaging_trigger_price(avg, 1.0, 3, Side::Long);
        assert!((t1 - 0.25 * 0.99).abs() < 1e-12);
        assert!((t3 - 0.25 * 0.99f64.powi(3)).abs() < 1e-12);
        assert!(t3 < t1);

        // Short mirrors upward.
        let s2 = averaging_trigger_price(avg, 1.0, 2, Side::Short);
        assert!((s2 - 0.25 * 1.01f64.powi(2)).abs() < 1e-12);
    }

    #[test]
    fn fee_adjust_covers_entries_plus_close() {
        // n entries + the TP itself, as a price fraction.
        assert!((fee_adjust(1) - 2.0 * TAKER_FEE_PERCENT / 100.0).abs() < 1e-15);
        assert!((fee_adjust(6) - 7.0 * TAKER_FEE_PERCENT / 100.0).abs() < 1e-15);
    }

    #[test]
    fn tp_price_directions() {
        let long_tp = tp_price(0.25, 1.0, 1, Side::Long);
        let short_tp = tp_price(0.25, 1.0, 1, Side::Short);
        let distance = 0.01 + fee_adjust(1);
        assert!((long_tp - 0.25 * (1.0 + distance)).abs() < 1e-12);
        assert!((short_tp - 0.25 * (1.0 - distance)).abs() < 1e-12);
        assert!(long_tp > 0.25 && short_tp < 0.25);
    }

    #[test]
    fn tp_price_six_level_grid() {
        // Reconstructed six-entry long at avg 0.1994: TP covers six opening
        // taker fills plus the close.
        let tp = tp_price(0.1994, 1.0, 6, Side::Long);
        let expected = 0.1994 * (1.0 + 0.01 + 7.0 * TAKER_FEE_PERCENT / 100.0);
        assert!((tp - expected).abs() < 1e-12);
        assert!(tp > 0.1994 * 1.01);
    }

    #[test]
    fn reopen_coefficient_bands_and_boundaries() {
        assert_eq!(reopen_coefficient(20.0), Some(1.0));
        assert_eq!(reopen_coefficient(16.0), Some(1.0));
        assert_eq!(reopen_coefficient(16.0 - 1e-9), Some(0.5));
        assert_eq!(reopen_coefficient(8.0), Some(0.5));
        assert_eq!(reopen_coefficient(7.999), Some(0.25));
        assert_eq!(reopen_coefficient(4.0), Some(0.25));
        assert_eq!(reopen_coefficient(3.999), None);
        assert_eq!(reopen_coefficient(0.0), None);
    }

    #[test]
    fn qty_from_margin_matches_initial_open_example() {
        // $1 margin, 75x leverage, $0.25 price => 300 coins.
        let qty = qty_from_margin(1.0, 0.25, 75);
        assert!((qty - 300.0).abs() < 1e-12);
    }
}
