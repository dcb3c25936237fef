// =============================================================================
// Reconciliation Engine — authoritative restore and invariant maintenance
// =============================================================================
//
// The exchange is the source of truth. At startup every side of every symbol
// is matched against the live position snapshot and, when the local ledger is
// empty, rebuilt from paginated filled-order history (everything after the
// last TP close on that leg). The whole restore is wrapped in a bounded retry
// loop; stream updates racing the restore set a resync flag and force another
// pass. Exhaustion writes the emergency-stop flag and refuses to trade.
//
// After startup a 60-second sync pass keeps the invariants honest: the first
// pass cancels every open order (stale TP ids from before the restart must
// not be trusted), later passes repair untracked closes, missing TPs, severe
// grid imbalance, and lost pending reservations.
// =============================================================================

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::bybit::client::{BybitClient, HistoricalOrder};
use crate::ledger::TpSlot;
use crate::persistence;
use crate::risk::RiskController;
use crate::strategy::GridStrategy;
use crate::types::Side;

/// Restore retry budget.
const RESTORE_MAX_ATTEMPTS: u32 = 3;
/// Hard ceiling over all restore attempts.
const RESTORE_TIMEOUT_SECS: u64 = 30;
/// Quantity comparison tolerance (exchange lot rounding).
const QTY_TOLERANCE: f64 = 1e-3;
/// Order-history pagination: page size and page cap.
const HISTORY_PAGE_LIMIT: u32 = 200;
const HISTORY_MAX_PAGES: u32 = 10;
/// How long to wait for the first stream tick before REST fallback.
const INITIAL_PRICE_WAIT_SECS: u64 = 30;

// ---------------------------------------------------------------------------
// Pure reconstruction (unit-tested)
// ---------------------------------------------------------------------------

/// One reconstructed grid entry, oldest first.
#[derive(Debug, Clone, PartialEq)]
pub struct RebuiltEntry {
    pub order_id: String,
    pub qty: f64,
    pub price: f64,
}

/// Result of analysing one side's order history.
#[derive(Debug, Clone, PartialEq)]
pub struct RebuildPlan {
    /// Opening fills since the last TP close, oldest first.
    pub entries: Vec<RebuiltEntry>,
    /// Whether the last TP close was actually located (history not truncated).
    pub found_tp_close: bool,
}

/// Analyse filled-order history (newest first, as the exchange returns it)
/// for one side and extract the opening fills since the last TP close.
pub fn rebuild_side_from_history(side: Side, orders: &[HistoricalOrder]) -> RebuildPlan {
    // Only this leg's filled orders matter.
    let relevant: Vec<&HistoricalOrder> = orders
        .iter()
        .filter(|o| o.position_idx == side.position_idx() && o.order_status == "Filled")
        .collect();

    // Newest-first: the first reduce-only close encountered is the most
    // recent TP close; everything before it (newer) is the live grid.
    let close_idx = relevant
        .iter()
        .position(|o| o.reduce_only && o.side == side.close_order_side());

    let opens_newest_first: Vec<&HistoricalOrder> = match close_idx {
        Some(idx) => relevant[..idx].to_vec(),
        None => relevant.clone(),
    };

    let mut entries: Vec<RebuiltEntry> = opens_newest_first
        .into_iter()
        .filter(|o| !o.reduce_only && o.side == side.open_order_side() && o.cum_exec_qty > 0.0)
        .map(|o| RebuiltEntry {
            order_id: o.order_id.clone(),
            qty: o.cum_exec_qty,
            price: o.avg_price,
        })
        .collect();
    entries.reverse(); // chronological: level 0 first

    RebuildPlan {
        entries,
        found_tp_close: close_idx.is_some(),
    }
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

/// Per-account reconciler shared by every symbol's strategy.
pub struct Reconciler {
    account_tag: String,
    account_id: u16,
    data_dir: PathBuf,
    client: Arc<BybitClient>,
    risk: Arc<RiskController>,
    /// Symbols whose first post-start sync already ran.
    first_sync_done: Mutex<HashSet<String>>,
}

impl Reconciler {
    pub fn new(
        account_tag: &str,
        account_id: u16,
        data_dir: PathBuf,
        client: Arc<BybitClient>,
        risk: Arc<RiskController>,
    ) -> Self {
        Self {
            account_tag: account_tag.to_string(),
            account_id,
            data_dir,
            client,
            risk,
            first_sync_done: Mutex::new(HashSet::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Startup restore
    // -------------------------------------------------------------------------

    /// Restore one symbol to a verified state. Runs before the strategy
    /// starts acting on prices; the sync window stays open throughout.
    pub async fn startup_restore(&self, strategy: &Arc<GridStrategy>) -> Result<()> {
        if persistence::emergency_stop_present(&self.data_dir, &self.account_tag) {
            anyhow::bail!(
                "account {} has an emergency-stop flag — refusing to restore",
                self.account_tag
            );
        }

        strategy.set_syncing(true);
        let result = self.restore_with_retries(strategy).await;
        strategy.set_syncing(false);
        result
    }

    async fn restore_with_retries(&self, strategy: &Arc<GridStrategy>) -> Result<()> {
        let symbol = strategy.symbol().to_string();
        let started = Instant::now();

        // Give the ticker stream a chance before falling back to REST.
        self.wait_for_initial_price(strategy).await?;

        let mut triggers: Vec<String> = Vec::new();
        let mut attempts_used = 0;

        for attempt in 1..=RESTORE_MAX_ATTEMPTS {
            attempts_used = attempt;

            if started.elapsed().as_secs() >= RESTORE_TIMEOUT_SECS {
                triggers.push(format!("attempt {attempt}: restore timeout ceiling hit"));
                break;
            }

            info!(
                account = %self.account_tag,
                symbol = %symbol,
                attempt,
                "restore pass starting"
            );

            // Clear any stale flag before the pass so only updates racing
            // *this* pass count.
            strategy.take_needs_resync();

            let mut pass_retry = false;
            let mut pass_failed = false;
            for side in Side::BOTH {
                match self.restore_side(strategy, side).await {
                    Ok(retry) => pass_retry |= retry,
                    Err(e) => {
                        warn!(
                            account = %self.account_tag,
                            symbol = %symbol,
                            side = %side,
                            attempt,
                            error = %e,
                            "restore side failed"
                        );
                        triggers.push(format!("attempt {attempt} {side}: {e}"));
                        pass_failed = true;
                        break;
                    }
                }
            }

            let raced = strategy.take_needs_resync();
            if raced {
                triggers.push(format!("attempt {attempt}: stream updates during restore"));
            }

            if !pass_retry && !pass_failed && !raced {
                info!(
                    account = %self.account_tag,
                    symbol = %symbol,
                    attempt,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "restore verified"
                );
                return Ok(());
            }

            if pass_retry {
                triggers.push(format!("attempt {attempt}: reconstruction under exchange qty"));
            }

            // Start the next pass from a clean slate.
            warn!(
                account = %self.account_tag,
                symbol = %symbol,
                attempt,
                "restore pass inconclusive — clearing local state and retrying"
            );
            strategy.ledger().clear_side(Side::Long);
            strategy.ledger().clear_side(Side::Short);
        }

        // Exhausted: capture a diagnostic and stop the account.
        let diagnostic = self.restore_diagnostic(strategy, attempts_used, started, &triggers).await;
        persistence::write_emergency_stop(
            &self.data_dir,
            &self.account_tag,
            self.account_id,
            Some(symbol.as_str()),
            "RESTORE_FAILED",
            Some(diagnostic),
        )?;
        anyhow::bail!(
            "[{}][{}] restore failed after {} attempts — emergency stop written",
            self.account_tag,
            symbol,
            attempts_used
        );
    }

    /// Restore one side. `Ok(true)` asks for another pass (reconstruction
    /// came in under the exchange quantity).
    async fn restore_side(&self, strategy: &Arc<GridStrategy>, side: Side) -> Result<bool> {
        let symbol = strategy.symbol();
        let ledger = strategy.ledger();

        let exchange = self
            .client
            .get_active_position(symbol, side)
            .await
            .context("restore: position snapshot failed")?;
        let local_qty = ledger.total_qty(side);
        let diff = (exchange.size - local_qty).abs();

        debug!(
            account = %self.account_tag,
            symbol,
            side = %side,
            exchange_qty = exchange.size,
            local_qty,
            "restore side comparison"
        );

        // Scenario 1: flat on both ends — open the initial position.
        if exchange.size <= QTY_TOLERANCE && local_qty <= QTY_TOLERANCE {
            let initial = strategy.config().initial_position_size_usd;
            let available = self.risk.available_for_trading();
            if available < initial {
                anyhow::bail!(
                    "insufficient balance for initial open: available {available:.2} < {initial:.2}"
                );
            }

            if local_qty > 0.0 {
                ledger.clear_side(side);
            }
            strategy
                .market_open_and_record(side, initial, "initial open")
                .await?;
            if let Some(entry) = ledger.entries(side).first() {
                ledger.set_reference_qty(0, entry.qty_coins);
            }
            strategy.create_tp(side, false).await?;
            return Ok(false);
        }

        // Scenario 2: in sync — make sure the TP is real.
        if diff <= QTY_TOLERANCE {
            let tp_ok = match ledger.tp(side) {
                TpSlot::Live(id) => self
                    .client
                    .order_exists(symbol, &id)
                    .await
                    .unwrap_or(false),
                _ => false,
            };
            if !tp_ok {
                info!(
                    account = %self.account_tag,
                    symbol,
                    side = %side,
                    "restore: synced but TP missing — recreating in force-cancel mode"
                );
                strategy.create_tp(side, true).await?;
            }
            return Ok(false);
        }

        // Scenario 3: exchange holds a position we know nothing about.
        if local_qty <= QTY_TOLERANCE {
            return self
                .reconstruct_side(strategy, side, exchange.size, exchange.avg_price)
                .await;
        }

        // Scenario 4: anything else is an unexplainable mismatch.
        let diagnostic = serde_json::json!({
            "side": side.to_string(),
            "exchange_qty": exchange.size,
            "local_qty": local_qty,
            "diff": diff,
        });
        persistence::write_emergency_stop(
            &self.data_dir,
            &self.account_tag,
            self.account_id,
            Some(symbol),
            "STATE_MISMATCH",
            Some(diagnostic),
        )?;
        anyhow::bail!(
            "[{}][{symbol}] {side} mismatch: exchange {} vs local {local_qty}",
            self.account_tag,
            exchange.size
        );
    }

    /// Rebuild a side's grid from filled-order history. `Ok(true)` requests
    /// another restore pass.
    async fn reconstruct_side(
        &self,
        strategy: &Arc<GridStrategy>,
        side: Side,
        exchange_qty: f64,
        exchange_avg: f64,
    ) -> Result<bool> {
        let symbol = strategy.symbol();
        let ledger = strategy.ledger();

        // Paginate until the last TP close shows up or the page cap is hit.
        let mut history: Vec<HistoricalOrder> = Vec::new();
        let mut cursor: Option<String> = None;
        let mut plan = RebuildPlan { entries: Vec::new(), found_tp_close: false };

        for page in 1..=HISTORY_MAX_PAGES {
            let (orders, next) = self
                .client
                .get_order_history(symbol, HISTORY_PAGE_LIMIT, cursor.as_deref())
                .await
                .context("reconstruction: order history fetch failed")?;
            let page_len = orders.len();
            history.extend(orders);

            plan = rebuild_side_from_history(side, &history);
            if plan.found_tp_close {
                debug!(
                    account = %self.account_tag,
                    symbol,
                    side = %side,
                    page,
                    "last TP close located in history"
                );
                break;
            }
            cursor = next;
            if cursor.is_none() || page_len == 0 {
                break;
            }
        }

        if !plan.found_tp_close {
            warn!(
                account = %self.account_tag,
                symbol,
                side = %side,
                pages = HISTORY_MAX_PAGES,
                "history truncated before last TP close"
            );
        }

        // No opening fills to rebuild from: partial close suspected or the
        // history is gone. Reset the grid to a single entry at the exchange
        // average — a safe baseline, not a failure.
        if plan.entries.is_empty() {
            warn!(
                account = %self.account_tag,
                symbol,
                side = %side,
                exchange_qty,
                exchange_avg,
                "grid state reset: single level-0 entry at exchange average"
            );
            ledger.add_entry(side, exchange_avg, exchange_qty, 0, None);
            ledger.set_reference_qty(0, exchange_qty);
            strategy.create_tp(side, true).await?;
            return Ok(false);
        }

        // Validate reconstruction against the authoritative quantity.
        let reconstructed: f64 = plan.entries.iter().map(|e| e.qty).sum();
        if reconstructed > exchange_qty + QTY_TOLERANCE {
            // More opens than coins on the exchange: the split point is
            // wrong, and acting on it would oversize every TP.
            let diagnostic = serde_json::json!({
                "side": side.to_string(),
                "reconstructed_qty": reconstructed,
                "exchange_qty": exchange_qty,
                "entries": plan.entries.len(),
            });
            persistence::write_emergency_stop(
                &self.data_dir,
                &self.account_tag,
                self.account_id,
                Some(symbol),
                "RECONSTRUCTION_OVERSHOOT",
                Some(diagnostic),
            )?;
            anyhow::bail!(
                "[{}][{symbol}] reconstruction {reconstructed} exceeds exchange {exchange_qty}",
                self.account_tag
            );
        }
        if reconstructed < exchange_qty - QTY_TOLERANCE {
            // Coins on the exchange we cannot account for yet — likely a fill
            // racing this restore. Another pass will see it.
            warn!(
                account = %self.account_tag,
                symbol,
                side = %side,
                reconstructed,
                exchange_qty,
                "reconstruction under exchange qty — retrying"
            );
            return Ok(true);
        }

        // Verify surviving order ids; clear the stale ones.
        let mut verified = plan.entries.clone();
        for entry in &mut verified {
            let exists = self
                .client
                .order_exists(symbol, &entry.order_id)
                .await
                .unwrap_or(false);
            if !exists {
                debug!(
                    account = %self.account_tag,
                    symbol,
                    order_id = %entry.order_id,
                    "reconstructed order id not found on exchange — clearing"
                );
                entry.order_id.clear();
            }
        }

        info!(
            account = %self.account_tag,
            symbol,
            side = %side,
            entries = verified.len(),
            total_qty = reconstructed,
            "grid reconstructed from order history"
        );

        for (level, entry) in verified.iter().enumerate() {
            let order_id = if entry.order_id.is_empty() {
                None
            } else {
                Some(entry.order_id.clone())
            };
            ledger.add_entry(side, entry.price, entry.qty, level as u32, order_id);
            ledger.set_reference_qty(level as u32, entry.qty);
        }

        strategy.create_tp(side, true).await?;
        Ok(false)
    }

    async fn restore_diagnostic(
        &self,
        strategy: &Arc<GridStrategy>,
        attempts: u32,
        started: Instant,
        triggers: &[String],
    ) -> serde_json::Value {
        let symbol = strategy.symbol();
        let mut exchange = serde_json::Map::new();
        for side in Side::BOTH {
            if let Ok(snap) = self.client.get_active_position(symbol, side).await {
                exchange.insert(
                    side.to_string(),
                    serde_json::json!({ "qty": snap.size, "avg_price": snap.avg_price }),
                );
            }
        }
        serde_json::json!({
            "retry_count": attempts,
            "elapsed_ms": started.elapsed().as_millis() as u64,
            "triggers": triggers,
            "exchange": exchange,
            "local": {
                "long_qty": strategy.ledger().total_qty(Side::Long),
                "short_qty": strategy.ledger().total_qty(Side::Short),
            },
            "current_price": strategy.price_cell().get(),
        })
    }

    async fn wait_for_initial_price(&self, strategy: &Arc<GridStrategy>) -> Result<()> {
        let deadline = Instant::now() + std::time::Duration::from_secs(INITIAL_PRICE_WAIT_SECS);
        while strategy.price_cell().get() <= 0.0 && Instant::now() < deadline {
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        }
        if strategy.price_cell().get() <= 0.0 {
            warn!(
                account = %self.account_tag,
                symbol = %strategy.symbol(),
                "no stream price after {INITIAL_PRICE_WAIT_SECS}s — REST ticker fallback"
            );
            strategy.current_price().await?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Periodic sync
    // -------------------------------------------------------------------------

    /// The 60-second invariant-maintenance pass for one symbol. Runs under
    /// the account mutex.
    pub async fn periodic_sync(&self, strategy: &Arc<GridStrategy>) -> Result<()> {
        let symbol = strategy.symbol().to_string();
        let first = self.first_sync_done.lock().insert(symbol.clone());

        strategy.set_syncing(true);
        let result = self.sync_pass(strategy, first).await;
        strategy.set_syncing(false);
        strategy.take_needs_resync();
        result
    }

    async fn sync_pass(&self, strategy: &Arc<GridStrategy>, first: bool) -> Result<()> {
        let symbol = strategy.symbol();
        let ledger = strategy.ledger();

        // First pass after start: every open order predates this process.
        // Cancel them all and drop local TP tracking — a stale id that still
        // verifies would otherwise mask a missing TP forever.
        if first {
            info!(
                account = %self.account_tag,
                symbol,
                "first sync: cancelling all open orders and clearing TP tracking"
            );
            let open = self
                .client
                .get_open_orders(symbol)
                .await
                .context("first sync: open-order listing failed")?;
            for order in &open {
                if let Err(e) = self.client.cancel_order(symbol, &order.order_id).await {
                    warn!(
                        account = %self.account_tag,
                        symbol,
                        order_id = %order.order_id,
                        error = %e,
                        "first-sync cancel failed"
                    );
                }
            }
            strategy.forget_tracked_orders();
        }

        for side in Side::BOTH {
            let exchange = self
                .client
                .get_active_position(symbol, side)
                .await
                .context("sync: position snapshot failed")?;
            let local_qty = ledger.total_qty(side);

            // Untracked close: the stream missed a TP fill.
            if exchange.size <= QTY_TOLERANCE && local_qty > QTY_TOLERANCE {
                warn!(
                    account = %self.account_tag,
                    symbol,
                    side = %side,
                    local_qty,
                    "untracked close detected — running close path"
                );
                strategy.handle_close(side).await?;
                continue;
            }

            // Missing TP on a live side.
            if local_qty > QTY_TOLERANCE && !ledger.tp(side).is_set() {
                let suppressed_by_panic = self.risk.is_panic();
                if !suppressed_by_panic || first {
                    info!(
                        account = %self.account_tag,
                        symbol,
                        side = %side,
                        "sync: recreating missing TP"
                    );
                    strategy.create_tp(side, first).await?;
                }
            }
        }

        // Recovery mode: one leg empty while the other is levels deep.
        let long_level = ledger.grid_level(Side::Long);
        let short_level = ledger.grid_level(Side::Short);
        let imbalance = long_level.abs_diff(short_level);
        if imbalance >= 2 && (long_level == 0 || short_level == 0) {
            let missing = if long_level == 0 { Side::Long } else { Side::Short };
            warn!(
                account = %self.account_tag,
                symbol,
                long_level,
                short_level,
                missing = %missing,
                "recovery mode: reopening missing side adaptively"
            );
            strategy.handle_close(missing).await?;
        }

        // Reservations lost to cancels or restarts.
        if let Ok(price) = strategy.current_price().await {
            strategy.ensure_pending_symmetry(price).await;
        }

        Ok(())
    }
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("account", &self.account_tag)
            .field("synced_symbols", &self.first_sync_done.lock().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    /// History rows arrive newest first, as the exchange returns them.
    fn order(
        id: &str,
        side: &str,
        reduce_only: bool,
        position_idx: u8,
        qty: f64,
        price: f64,
    ) -> HistoricalOrder {
        HistoricalOrder {
            order_id: id.to_string(),
            side: side.to_string(),
            order_status: "Filled".to_string(),
            reduce_only,
            position_idx,
            cum_exec_qty: qty,
            avg_price: price,
            created_time: 0,
        }
    }

    #[test]
    fn rebuild_six_level_long_grid() {
        // Newest-first history: six Buy opens since the last TP close (a
        // reduce-only Sell on positionIdx 1), older grid beyond it.
        let history = vec![
            order("b6", "Buy", false, 1, 11648.0, 0.1970),
            order("b5", "Buy", false, 1, 5824.0, 0.1980),
            order("b4", "Buy", false, 1, 2912.0, 0.1990),
            order("b3", "Buy", false, 1, 1456.0, 0.2000),
            order("b2", "Buy", false, 1, 728.0, 0.2010),
            order("b1", "Buy", false, 1, 364.0, 0.2020),
            order("tp-old", "Sell", true, 1, 5000.0, 0.2100), // last TP close
            order("older", "Buy", false, 1, 5000.0, 0.2050),
        ];

        let plan = rebuild_side_from_history(Side::Long, &history);
        assert!(plan.found_tp_close);
        assert_eq!(plan.entries.len(), 6);
        // Chronological order: level 0 = oldest open after the close.
        assert_eq!(plan.entries[0].order_id, "b1");
        assert_eq!(plan.entries[0].qty, 364.0);
        assert_eq!(plan.entries[5].order_id, "b6");
        assert_eq!(plan.entries[5].qty, 11648.0);

        let total: f64 = plan.entries.iter().map(|e| e.qty).sum();
        assert!((total - 22932.0).abs() < 1e-9);
    }

    #[test]
    fn rebuild_ignores_other_leg_and_unfilled() {
        let history = vec![
            order("s1", "Sell", false, 2, 100.0, 0.20), // short leg open
            order("b1", "Buy", false, 1, 50.0, 0.20),
            {
                let mut o = order("b0", "Buy", false, 1, 70.0, 0.20);
                o.order_status = "Cancelled".to_string();
                o
            },
        ];
        let plan = rebuild_side_from_history(Side::Long, &history);
        assert_eq!(plan.entries.len(), 1);
        assert_eq!(plan.entries[0].order_id, "b1");
        assert!(!plan.found_tp_close);
    }

    #[test]
    fn rebuild_without_tp_close_takes_all_opens() {
        let history = vec![
            order("b2", "Buy", false, 1, 200.0, 0.24),
            order("b1", "Buy", false, 1, 100.0, 0.25),
        ];
        let plan = rebuild_side_from_history(Side::Long, &history);
        assert!(!plan.found_tp_close, "truncated history must be flagged");
        assert_eq!(plan.entries.len(), 2);
        assert_eq!(plan.entries[0].order_id, "b1");
    }

    #[test]
    fn rebuild_with_no_opens_after_close_is_empty() {
        // Partial-close signature: the newest relevant row is already the TP
        // close — a grid reset, not a rebuild.
        let history = vec![
            order("tp", "Sell", true, 1, 500.0, 0.26),
            order("b1", "Buy", false, 1, 500.0, 0.25),
        ];
        let plan = rebuild_side_from_history(Side::Long, &history);
        assert!(plan.found_tp_close);
        assert!(plan.entries.is_empty());
    }

    #[test]
    fn rebuild_short_side_mirrors_directions() {
        let history = vec![
            order("s2", "Sell", false, 2, 200.0, 0.26),
            order("s1", "Sell", false, 2, 100.0, 0.25),
            order("tp", "Buy", true, 2, 400.0, 0.24), // short TP = reduce-only Buy
            order("s0", "Sell", false, 2, 400.0, 0.25),
        ];
        let plan = rebuild_side_from_history(Side::Short, &history);
        assert!(plan.found_tp_close);
        assert_eq!(plan.entries.len(), 2);
        assert_eq!(plan.entries[0].order_id, "s1");
        assert_eq!(plan.entries[1].order_id, "s2");
    }
}
