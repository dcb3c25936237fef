// =============================================================================
// Position Ledger — per-symbol grid entries for both hedge legs
// =============================================================================
//
// The ledger is the local source of truth for what the grid believes it owns:
// ordered entries per side (insertion order == grid level), the take-profit
// order slot for each side, and the reference-qty table that pins per-level
// quantities across restarts.
//
// Every committed mutation persists atomically through the account state
// store *while the ledger lock is held*, so concurrent writers can never
// interleave snapshots.
//
// Invariants enforced here (violations are logic errors and fail fast):
//   - entry levels are contiguous from 0 in insertion order
//   - quantities and prices are strictly positive
// =============================================================================

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::persistence::{GridEntry, StateStore, SymbolStateSnapshot};
use crate::types::Side;

/// Tolerance for reference-qty comparisons; exchange rounding may diverge.
const REFERENCE_QTY_TOLERANCE: f64 = 1e-9;

// ---------------------------------------------------------------------------
// Take-profit slot
// ---------------------------------------------------------------------------

/// State of a side's take-profit order slot.
///
/// `Pending` marks the window between dispatching the place-order command and
/// receiving the exchange's id, so the order-stream handler does not treat an
/// unknown id as a stale TP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TpSlot {
    Unset,
    Pending,
    Live(String),
}

impl TpSlot {
    pub fn live_id(&self) -> Option<&str> {
        match self {
            Self::Live(id) => Some(id),
            _ => None,
        }
    }

    pub fn is_set(&self) -> bool {
        !matches!(self, Self::Unset)
    }
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct SideState {
    entries: Vec<GridEntry>,
    tp: TpSlot,
}

impl Default for TpSlot {
    fn default() -> Self {
        Self::Unset
    }
}

#[derive(Debug, Default)]
struct LedgerInner {
    long: SideState,
    short: SideState,
    reference_qty: BTreeMap<u32, f64>,
    /// Dedupe keys for applied executions: (order_id, qty bit pattern).
    seen_fills: HashSet<(String, u64)>,
    /// Orders whose entries were recorded from a REST snapshot; their
    /// execution events must not be applied on top.
    snapshot_recorded: HashSet<String>,
}

impl LedgerInner {
    fn side(&self, side: Side) -> &SideState {
        match side {
            Side::Long => &self.long,
            Side::Short => &self.short,
        }
    }

    fn side_mut(&mut self, side: Side) -> &mut SideState {
        match side {
            Side::Long => &mut self.long,
            Side::Short => &mut self.short,
        }
    }
}

/// Outcome of applying an execution event to the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillOutcome {
    /// A new grid entry was created at the contained level.
    NewEntry(u32),
    /// An existing entry absorbed another partial fill.
    Accumulated,
    /// The execution was already applied (stream replay).
    Duplicate,
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

/// Thread-safe grid ledger for one (account, symbol) pair.
pub struct PositionLedger {
    account_tag: String,
    symbol: String,
    inner: Mutex<LedgerInner>,
    store: Arc<StateStore>,
}

impl PositionLedger {
    /// Create the ledger, restoring any state persisted for this symbol.
    pub fn new(account_tag: &str, symbol: &str, store: Arc<StateStore>) -> Self {
        let ledger = Self {
            account_tag: account_tag.to_string(),
            symbol: symbol.to_string(),
            inner: Mutex::new(LedgerInner::default()),
            store,
        };

        if let Some(snapshot) = ledger.store.symbol_snapshot(symbol) {
            ledger.restore(snapshot);
            let inner = ledger.inner.lock();
            info!(
                account = %ledger.account_tag,
                symbol,
                long_levels = inner.long.entries.len(),
                short_levels = inner.short.entries.len(),
                "ledger restored from persisted state"
            );
        }
        ledger
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    // -------------------------------------------------------------------------
    // Entries
    // -------------------------------------------------------------------------

    /// Append a confirmed entry at `level`. The level must equal the side's
    /// current grid level (entries are contiguous by construction).
    pub fn add_entry(
        &self,
        side: Side,
        price: f64,
        qty: f64,
        level: u32,
        order_id: Option<String>,
    ) {
        let mut inner = self.inner.lock();

        let current = inner.side(side).entries.len() as u32;
        assert_eq!(
            level, current,
            "[{}][{}] add_entry level {} out of order (current grid level {})",
            self.account_tag, self.symbol, level, current
        );
        assert!(
            qty > 0.0 && price > 0.0,
            "[{}][{}] add_entry requires positive qty/price, got qty={qty} price={price}",
            self.account_tag,
            self.symbol
        );

        if let Some(reference) = inner.reference_qty.get(&level).copied() {
            if (reference - qty).abs() > REFERENCE_QTY_TOLERANCE {
                warn!(
                    account = %self.account_tag,
                    symbol = %self.symbol,
                    level,
                    reference,
                    qty,
                    "entry qty deviates from reference table — accepting (exchange rounding)"
                );
            }
        }

        // Entries recorded here come from REST snapshots or reconstruction;
        // the matching execution events (if any still arrive) are replays.
        if let Some(id) = &order_id {
            inner.snapshot_recorded.insert(id.clone());
        }

        inner.side_mut(side).entries.push(GridEntry {
            grid_level: level,
            qty_coins: qty,
            entry_price: price,
            order_id,
            opened_at: Utc::now().to_rfc3339(),
        });

        info!(
            account = %self.account_tag,
            symbol = %self.symbol,
            side = %side,
            level,
            qty,
            price,
            "grid entry recorded"
        );
        self.persist_locked(&inner);
    }

    /// Apply an opening execution: create a new entry at the next level, or
    /// fold another partial fill into the entry already tracking `order_id`.
    /// Replayed events are dropped by the (order_id, qty) dedupe key.
    pub fn apply_fill(
        &self,
        side: Side,
        order_id: &str,
        exec_qty: f64,
        exec_price: f64,
    ) -> FillOutcome {
        assert!(
            exec_qty > 0.0 && exec_price > 0.0,
            "[{}][{}] apply_fill requires positive qty/price",
            self.account_tag,
            self.symbol
        );

        let mut inner = self.inner.lock();

        if inner.snapshot_recorded.contains(order_id) {
            debug!(
                account = %self.account_tag,
                symbol = %self.symbol,
                order_id,
                "execution for snapshot-recorded order dropped"
            );
            return FillOutcome::Duplicate;
        }

        let dedupe_key = (order_id.to_string(), exec_qty.to_bits());
        if !inner.seen_fills.insert(dedupe_key) {
            debug!(
                account = %self.account_tag,
                symbol = %self.symbol,
                order_id,
                exec_qty,
                "duplicate execution dropped"
            );
            return FillOutcome::Duplicate;
        }

        // Partial-fill continuation: fold into the tracked entry and keep the
        // entry price quantity-weighted.
        let existing = inner
            .side_mut(side)
            .entries
            .iter_mut()
            .find(|e| e.order_id.as_deref() == Some(order_id));
        if let Some(entry) = existing {
            let total = entry.qty_coins + exec_qty;
            entry.entry_price =
                (entry.entry_price * entry.qty_coins + exec_price * exec_qty) / total;
            entry.qty_coins = total;
            debug!(
                account = %self.account_tag,
                symbol = %self.symbol,
                side = %side,
                order_id,
                exec_qty,
                total_qty = total,
                "partial fill accumulated"
            );
            self.persist_locked(&inner);
            return FillOutcome::Accumulated;
        }

        let level = inner.side(side).entries.len() as u32;
        inner.side_mut(side).entries.push(GridEntry {
            grid_level: level,
            qty_coins: exec_qty,
            entry_price: exec_price,
            order_id: Some(order_id.to_string()),
            opened_at: Utc::now().to_rfc3339(),
        });

        info!(
            account = %self.account_tag,
            symbol = %self.symbol,
            side = %side,
            level,
            qty = exec_qty,
            price = exec_price,
            order_id,
            "fill recorded as new grid entry"
        );
        self.persist_locked(&inner);
        FillOutcome::NewEntry(level)
    }

    /// Drop every entry and the TP slot for a side (TP close or grid reset).
    /// When both sides end up empty the reference table is cleared too.
    pub fn clear_side(&self, side: Side) {
        let mut inner = self.inner.lock();
        let removed = inner.side(side).entries.len();
        inner.side_mut(side).entries.clear();
        inner.side_mut(side).tp = TpSlot::Unset;

        if inner.long.entries.is_empty() && inner.short.entries.is_empty() {
            inner.reference_qty.clear();
            inner.seen_fills.clear();
            inner.snapshot_recorded.clear();
        }

        info!(
            account = %self.account_tag,
            symbol = %self.symbol,
            side = %side,
            removed_entries = removed,
            "side cleared"
        );
        self.persist_locked(&inner);
    }

    /// Clear a stale order id discovered missing on the exchange.
    pub fn clear_entry_order_id(&self, side: Side, level: u32) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner
            .side_mut(side)
            .entries
            .iter_mut()
            .find(|e| e.grid_level == level)
        {
            entry.order_id = None;
            self.persist_locked(&inner);
        }
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn total_qty(&self, side: Side) -> f64 {
        self.inner
            .lock()
            .side(side)
            .entries
            .iter()
            .map(|e| e.qty_coins)
            .sum()
    }

    /// Quantity-weighted average entry price. Zero when the side is empty.
    pub fn avg_entry(&self, side: Side) -> f64 {
        let inner = self.inner.lock();
        let entries = &inner.side(side).entries;
        let qty: f64 = entries.iter().map(|e| e.qty_coins).sum();
        if qty <= 0.0 {
            return 0.0;
        }
        entries
            .iter()
            .map(|e| e.entry_price * e.qty_coins)
            .sum::<f64>()
            / qty
    }

    /// Number of entries on a side (== the next level to be opened).
    pub fn grid_level(&self, side: Side) -> u32 {
        self.inner.lock().side(side).entries.len() as u32
    }

    /// Margin of the whole side valued at `price`.
    pub fn total_margin_at(&self, side: Side, price: f64, leverage: u32) -> f64 {
        let qty = self.total_qty(side);
        qty * price / leverage as f64
    }

    /// Margin committed by the most recent entry, valued at its entry price.
    /// `None` when the side is empty.
    pub fn last_entry_margin(&self, side: Side, leverage: u32) -> Option<f64> {
        let inner = self.inner.lock();
        inner
            .side(side)
            .entries
            .last()
            .map(|e| e.qty_coins * e.entry_price / leverage as f64)
    }

    pub fn entries(&self, side: Side) -> Vec<GridEntry> {
        self.inner.lock().side(side).entries.clone()
    }

    pub fn is_flat(&self) -> bool {
        let inner = self.inner.lock();
        inner.long.entries.is_empty() && inner.short.entries.is_empty()
    }

    // -------------------------------------------------------------------------
    // Take-profit slot
    // -------------------------------------------------------------------------

    pub fn tp(&self, side: Side) -> TpSlot {
        self.inner.lock().side(side).tp.clone()
    }

    /// Mark the slot as awaiting an exchange id. Not persisted — the window
    /// is transient by design.
    pub fn set_tp_pending(&self, side: Side) {
        self.inner.lock().side_mut(side).tp = TpSlot::Pending;
    }

    pub fn set_tp_live(&self, side: Side, order_id: String) {
        let mut inner = self.inner.lock();
        inner.side_mut(side).tp = TpSlot::Live(order_id);
        self.persist_locked(&inner);
    }

    pub fn clear_tp(&self, side: Side) {
        let mut inner = self.inner.lock();
        inner.side_mut(side).tp = TpSlot::Unset;
        self.persist_locked(&inner);
    }

    // -------------------------------------------------------------------------
    // Reference-qty table
    // -------------------------------------------------------------------------

    /// Pin the canonical qty for a level. A conflicting existing value is
    /// logged and kept (first write wins; later sides replay the same grid).
    pub fn set_reference_qty(&self, level: u32, qty: f64) {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.reference_qty.get(&level).copied() {
            if (existing - qty).abs() > REFERENCE_QTY_TOLERANCE {
                warn!(
                    account = %self.account_tag,
                    symbol = %self.symbol,
                    level,
                    existing,
                    qty,
                    "reference qty conflict — keeping first value"
                );
            }
            return;
        }
        inner.reference_qty.insert(level, qty);
        self.persist_locked(&inner);
    }

    pub fn reference_qty(&self, level: u32) -> Option<f64> {
        self.inner.lock().reference_qty.get(&level).copied()
    }

    // -------------------------------------------------------------------------
    // Snapshot / restore
    // -------------------------------------------------------------------------

    /// Copy out the full grid state (the persisted shape).
    pub fn snapshot(&self) -> SymbolStateSnapshot {
        let inner = self.inner.lock();
        Self::snapshot_locked(&inner)
    }

    /// Replace the full grid state from a snapshot.
    pub fn restore(&self, snapshot: SymbolStateSnapshot) {
        let mut inner = self.inner.lock();
        inner.long.entries = snapshot.long;
        inner.short.entries = snapshot.short;
        inner.long.tp = match snapshot.tp_long {
            Some(id) => TpSlot::Live(id),
            None => TpSlot::Unset,
        };
        inner.short.tp = match snapshot.tp_short {
            Some(id) => TpSlot::Live(id),
            None => TpSlot::Unset,
        };
        inner.reference_qty = snapshot.reference_qty_per_level;
        inner.seen_fills.clear();
        inner.snapshot_recorded = inner
            .long
            .entries
            .iter()
            .chain(inner.short.entries.iter())
            .filter_map(|e| e.order_id.clone())
            .collect();
        self.persist_locked(&inner);
    }

    fn snapshot_locked(inner: &LedgerInner) -> SymbolStateSnapshot {
        SymbolStateSnapshot {
            long: inner.long.entries.clone(),
            short: inner.short.entries.clone(),
            tp_long: inner.long.tp.live_id().map(|s| s.to_string()),
            tp_short: inner.short.tp.live_id().map(|s| s.to_string()),
            reference_qty_per_level: inner.reference_qty.clone(),
            timestamp: String::new(),
        }
    }

    /// Persist the current state. Must be called with the ledger lock held so
    /// the on-disk snapshot always matches one committed mutation.
    fn persist_locked(&self, inner: &LedgerInner) {
        let snapshot = Self::snapshot_locked(inner);
        if let Err(e) = self.store.persist_symbol(&self.symbol, snapshot) {
            // Persistence failure must be loud: a stale file means a wrong
            // restore after the next crash.
            warn!(
                account = %self.account_tag,
                symbol = %self.symbol,
                error = %e,
                "FAILED to persist ledger state"
            );
        }
    }
}

impl std::fmt::Debug for PositionLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("PositionLedger")
            .field("symbol", &self.symbol)
            .field("long_levels", &inner.long.entries.len())
            .field("short_levels", &inner.short.entries.len())
            .field("tp_long", &inner.long.tp)
            .field("tp_short", &inner.short.tp)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn test_ledger(name: &str) -> (PositionLedger, std::path::PathBuf) {
        let dir = std::env::temp_dir().join(format!("lattice-ledger-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let store = Arc::new(StateStore::open(&dir, "001").unwrap());
        (PositionLedger::new("001", "DOGEUSDT", store), dir)
    }

    #[test]
    fn entries_accumulate_with_contiguous_levels() {
        let (ledger, dir) = test_ledger("levels");

        ledger.add_entry(Side::Long, 0.25, 300.0, 0, Some("a".into()));
        ledger.add_entry(Side::Long, 0.2475, 600.0, 1, Some("b".into()));

        assert_eq!(ledger.grid_level(Side::Long), 2);
        assert_eq!(ledger.total_qty(Side::Long), 900.0);
        assert_eq!(ledger.grid_level(Side::Short), 0);

        // Quantity-weighted average.
        let avg = ledger.avg_entry(Side::Long);
        let expected = (0.25 * 300.0 + 0.2475 * 600.0) / 900.0;
        assert!((avg - expected).abs() < 1e-12);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    #[should_panic(expected = "out of order")]
    fn out_of_order_level_fails_fast() {
        let (ledger, _dir) = test_ledger("badlevel");
        ledger.add_entry(Side::Long, 0.25, 300.0, 1, None);
    }

    #[test]
    #[should_panic(expected = "positive qty")]
    fn non_positive_qty_fails_fast() {
        let (ledger, _dir) = test_ledger("badqty");
        ledger.add_entry(Side::Long, 0.25, 0.0, 0, None);
    }

    #[test]
    fn snapshot_restore_roundtrip_is_identical() {
        let (ledger, dir) = test_ledger("roundtrip");

        ledger.add_entry(Side::Long, 0.25, 300.0, 0, Some("a".into()));
        ledger.add_entry(Side::Short, 0.25, 300.0, 0, Some("b".into()));
        ledger.set_tp_live(Side::Long, "tp-1".into());
        ledger.set_reference_qty(0, 300.0);

        let before = ledger.snapshot();
        ledger.clear_side(Side::Long);
        assert_eq!(ledger.total_qty(Side::Long), 0.0);

        ledger.restore(before.clone());
        let after = ledger.snapshot();
        assert_eq!(before.long, after.long);
        assert_eq!(before.short, after.short);
        assert_eq!(before.tp_long, after.tp_long);
        assert_eq!(before.reference_qty_per_level, after.reference_qty_per_level);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn duplicate_execution_is_dropped() {
        let (ledger, dir) = test_ledger("dedupe");

        assert_eq!(
            ledger.apply_fill(Side::Long, "oid-1", 300.0, 0.25),
            FillOutcome::NewEntry(0)
        );
        assert_eq!(
            ledger.apply_fill(Side::Long, "oid-1", 300.0, 0.25),
            FillOutcome::Duplicate
        );
        assert_eq!(ledger.total_qty(Side::Long), 300.0);
        assert_eq!(ledger.grid_level(Side::Long), 1);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn execution_for_snapshot_recorded_entry_is_dropped() {
        let (ledger, dir) = test_ledger("snapdedupe");

        // Entry recorded from a REST snapshot after a market open.
        ledger.add_entry(Side::Long, 0.25, 300.0, 0, Some("mkt-1".into()));

        // The late execution event for the same order must not double it.
        assert_eq!(
            ledger.apply_fill(Side::Long, "mkt-1", 300.0, 0.2501),
            FillOutcome::Duplicate
        );
        assert_eq!(ledger.total_qty(Side::Long), 300.0);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn partial_fills_accumulate_into_one_entry() {
        let (ledger, dir) = test_ledger("partial");

        assert_eq!(
            ledger.apply_fill(Side::Short, "oid-2", 100.0, 0.25),
            FillOutcome::NewEntry(0)
        );
        assert_eq!(
            ledger.apply_fill(Side::Short, "oid-2", 200.0, 0.2501),
            FillOutcome::Accumulated
        );

        assert_eq!(ledger.grid_level(Side::Short), 1);
        assert!((ledger.total_qty(Side::Short) - 300.0).abs() < 1e-12);
        let avg = ledger.avg_entry(Side::Short);
        let expected = (100.0 * 0.25 + 200.0 * 0.2501) / 300.0;
        assert!((avg - expected).abs() < 1e-12);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn clearing_both_sides_clears_reference_table() {
        let (ledger, dir) = test_ledger("refclear");

        ledger.add_entry(Side::Long, 0.25, 300.0, 0, None);
        ledger.add_entry(Side::Short, 0.25, 300.0, 0, None);
        ledger.set_reference_qty(0, 300.0);

        ledger.clear_side(Side::Long);
        assert_eq!(ledger.reference_qty(0), Some(300.0), "one side still open");

        ledger.clear_side(Side::Short);
        assert_eq!(ledger.reference_qty(0), None, "flat symbol resets references");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn reference_mismatch_is_accepted_with_first_value_kept() {
        let (ledger, dir) = test_ledger("refmismatch");

        ledger.set_reference_qty(0, 300.0);
        ledger.set_reference_qty(0, 300.5);
        assert_eq!(ledger.reference_qty(0), Some(300.0));

        // A mismatching add is accepted (logged), not rejected.
        ledger.add_entry(Side::Long, 0.25, 300.5, 0, None);
        assert_eq!(ledger.total_qty(Side::Long), 300.5);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn tp_slot_transitions() {
        let (ledger, dir) = test_ledger("tpslot");

        assert_eq!(ledger.tp(Side::Long), TpSlot::Unset);
        ledger.set_tp_pending(Side::Long);
        assert_eq!(ledger.tp(Side::Long), TpSlot::Pending);
        assert!(ledger.tp(Side::Long).live_id().is_none());

        ledger.set_tp_live(Side::Long, "tp-9".into());
        assert_eq!(ledger.tp(Side::Long).live_id(), Some("tp-9"));

        // Pending is transient and must not be persisted as a live id.
        ledger.set_tp_pending(Side::Short);
        let snap = ledger.snapshot();
        assert_eq!(snap.tp_long.as_deref(), Some("tp-9"));
        assert_eq!(snap.tp_short, None);

        ledger.clear_tp(Side::Long);
        assert_eq!(ledger.tp(Side::Long), TpSlot::Unset);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn margins() {
        let (ledger, dir) = test_ledger("margin");

        ledger.add_entry(Side::Long, 0.25, 300.0, 0, None);
        ledger.add_entry(Side::Long, 0.2475, 600.0, 1, None);

        // total margin at price 0.25 with 75x: 900 * 0.25 / 75 = 3.0
        assert!((ledger.total_margin_at(Side::Long, 0.25, 75) - 3.0).abs() < 1e-12);
        // last entry margin: 600 * 0.2475 / 75 = 1.98
        assert!((ledger.last_entry_margin(Side::Long, 75).unwrap() - 1.98).abs() < 1e-12);
        assert!(ledger.last_entry_margin(Side::Short, 75).is_none());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
