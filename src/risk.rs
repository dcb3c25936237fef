// =============================================================================
// Risk Controller — safety reserve, early freeze, panic mode, emergency close
// =============================================================================
//
// One controller per account, shared by every symbol's strategy. Four layers
// of defence, softest first:
//
//   1. Safety reserve  — USD cushion sized to the cross-symbol coin imbalance
//                        times a volatility-adjusted factor. Averaging that
//                        would eat into the cushion is refused.
//   2. Early freeze    — soft gate that blocks new averaging when available
//                        funds fall under 1.5x the worst-case next entries.
//                        Take-profits keep working.
//   3. Panic mode      — hard containment: freeze, cancel the trend side's
//                        TP (keep the counter-trend exit), and rebalance the
//                        legs with market orders.
//   4. Emergency close — MM-rate breach closes everything and writes the
//                        emergency-stop flag.
//
// The controller only *decides*; commands implied by its decisions are
// returned as `RiskAction`s and executed by the account runtime under the
// account mutex.
// =============================================================================

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::bybit::client::{BybitClient, Kline};
use crate::ledger::PositionLedger;
use crate::types::{PriceCell, Side, WalletSnapshot};
use crate::wallet::WalletCache;

// ---------------------------------------------------------------------------
// Tunables
// ---------------------------------------------------------------------------

/// Base component of the safety factor.
const BASE_SAFETY_BUFFER: f64 = 0.10;
/// Flat buffer compensating margin-tier non-linearity.
const TIER_SAFETY_BUFFER: f64 = 0.05;
/// Early freeze trips when available < worst-case * this factor.
const COMFORT_FACTOR: f64 = 1.5;
/// Panic trips when available < worst-case * this factor.
const PANIC_LOW_IM_FACTOR: f64 = 3.0;
/// Panic imbalance trigger: max/min leg quantity ratio.
const PANIC_IMBALANCE_RATIO: f64 = 10.0;
/// ...combined with available falling under this fraction of the balance.
const PANIC_AVAILABLE_FRACTION: f64 = 0.30;
/// Panic trips outright at this account MM rate (percent).
const PANIC_MM_RATE_PERCENT: f64 = 70.0;
/// Balancer does nothing below this much available USD.
const BALANCER_MIN_AVAILABLE_USD: f64 = 1.0;
/// ATR cache lifetime.
const ATR_CACHE_SECS: u64 = 60;
/// Volatility look-back: 20 one-minute bars.
const ATR_PERIOD: usize = 20;
/// 1-minute bars fetched per ATR refresh (the period needs a previous bar
/// per true range, plus headroom for the smoothing tail).
const ATR_KLINE_LIMIT: u32 = 40;

// ---------------------------------------------------------------------------
// Pure pieces (unit-tested)
// ---------------------------------------------------------------------------

/// Volatility read feeding the gap buffer: ATR over the last 1-minute bars,
/// as a percentage of the latest close.
///
/// Single pass over consecutive bar pairs. The true range of each pair is
/// `max(H−L, |H−prevClose|, |L−prevClose|)` so inter-minute gaps count; the
/// first `ATR_PERIOD` ranges seed a plain average and the rest fold in with
/// Wilder's smoothing. `None` until a full window is available or when the
/// feed is degenerate (non-finite bars, zero close).
pub fn atr_percent(klines: &[Kline]) -> Option<f64> {
    // A true range needs a previous close, so a 20-range window takes 21 bars.
    if klines.len() <= ATR_PERIOD {
        return None;
    }

    let period = ATR_PERIOD as f64;
    let mut atr = 0.0;
    let mut seeded = 0usize;
    for pair in klines.windows(2) {
        let (prev, bar) = (&pair[0], &pair[1]);
        let tr = (bar.high - bar.low)
            .max((bar.high - prev.close).abs())
            .max((bar.low - prev.close).abs());
        if !tr.is_finite() {
            return None;
        }
        if seeded < ATR_PERIOD {
            atr += tr / period;
            seeded += 1;
        } else {
            atr = (atr * (period - 1.0) + tr) / period;
        }
    }

    let close = klines.last()?.close;
    if close <= 0.0 || !atr.is_finite() {
        return None;
    }
    Some(atr / close * 100.0)
}

/// Volatility buffer keyed off the worst per-symbol ATR percent.
pub fn gap_buffer(atr_max_pct: f64) -> f64 {
    if atr_max_pct < 1.0 {
        0.02
    } else if atr_max_pct < 2.0 {
        0.05
    } else {
        0.10
    }
}

/// Full safety factor: 1.0 + base + gap + tier.
pub fn safety_factor(atr_max_pct: f64) -> f64 {
    1.0 + BASE_SAFETY_BUFFER + gap_buffer(atr_max_pct) + TIER_SAFETY_BUFFER
}

/// Per-symbol imbalance sample, recomputed from the ledgers on every check.
#[derive(Debug, Clone)]
pub struct ImbalanceSample {
    pub symbol: String,
    pub long_qty: f64,
    pub short_qty: f64,
    pub price: f64,
    pub leverage: u32,
}

impl ImbalanceSample {
    pub fn imbalance_coins(&self) -> f64 {
        (self.long_qty - self.short_qty).abs()
    }

    pub fn imbalance_usd(&self) -> f64 {
        self.imbalance_coins() * self.price
    }

    /// The leg holding fewer coins, with the coin gap. `None` when balanced
    /// or when one leg having zero coins makes balancing meaningless here
    /// (the reconciler's recovery path owns that case).
    pub fn lagging_side(&self) -> Option<(Side, f64)> {
        let diff = self.long_qty - self.short_qty;
        if diff.abs() < f64::EPSILON {
            return None;
        }
        if diff > 0.0 {
            Some((Side::Short, diff))
        } else {
            Some((Side::Long, -diff))
        }
    }
}

/// Safety reserve over a set of samples: Σ imbalance_usd × safety_factor.
pub fn compute_safety_reserve(samples: &[ImbalanceSample], atr_max_pct: f64) -> f64 {
    let base: f64 = samples.iter().map(|s| s.imbalance_usd()).sum();
    base * safety_factor(atr_max_pct)
}

/// One market order the balancer wants to send.
#[derive(Debug, Clone)]
pub struct BalanceOrder {
    pub symbol: String,
    pub side: Side,
    pub qty: f64,
    pub price: f64,
    pub margin_needed: f64,
}

/// Plan the balancing orders for the given samples and available funds.
/// Scales every order down proportionally when funds only cover part of the
/// total; returns nothing when available is below the $1 floor.
pub fn plan_balance_orders(samples: &[ImbalanceSample], available: f64) -> Vec<BalanceOrder> {
    let mut orders: Vec<BalanceOrder> = Vec::new();
    for sample in samples {
        if let Some((side, qty)) = sample.lagging_side() {
            if qty <= 0.0 || sample.price <= 0.0 {
                continue;
            }
            orders.push(BalanceOrder {
                symbol: sample.symbol.clone(),
                side,
                qty,
                price: sample.price,
                margin_needed: qty * sample.price / sample.leverage as f64,
            });
        }
    }

    let total_needed: f64 = orders.iter().map(|o| o.margin_needed).sum();
    if orders.is_empty() || total_needed <= 0.0 {
        return Vec::new();
    }

    if available >= total_needed {
        return orders;
    }
    if available > BALANCER_MIN_AVAILABLE_USD {
        let scale = available / total_needed;
        for order in &mut orders {
            order.qty *= scale;
            order.margin_needed *= scale;
        }
        return orders;
    }

    Vec::new()
}

/// The side whose deeper grid shows it averaged *against* the move — the
/// trend side whose TP panic mode cancels. `None` when the legs are level.
pub fn trend_side(long_level: u32, short_level: u32) -> Option<Side> {
    match long_level.cmp(&short_level) {
        std::cmp::Ordering::Greater => Some(Side::Long),
        std::cmp::Ordering::Less => Some(Side::Short),
        std::cmp::Ordering::Equal => None,
    }
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

/// Command implied by a risk decision, executed by the account runtime.
#[derive(Debug, Clone)]
pub enum RiskAction {
    /// Cancel the trend side's take-profit (panic entry).
    CancelTp { symbol: String, side: Side },
    /// Equalise the legs with market orders.
    Balance(Vec<BalanceOrder>),
    /// Close everything and write the emergency-stop flag.
    EmergencyClose { reason: String },
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// Everything the risk model needs to know about one symbol.
pub struct SymbolRisk {
    pub ledger: Arc<PositionLedger>,
    pub price: Arc<PriceCell>,
    pub leverage: u32,
    pub initial_position_size_usd: f64,
    pub averaging_multiplier: f64,
    pub max_grid_levels_per_side: u32,
}

#[derive(Debug, Default, Clone)]
struct Flags {
    averaging_frozen: bool,
    freeze_reason: Option<String>,
    panic_mode: bool,
    panic_reason: Option<String>,
    panic_entered_at: Option<String>,
}

/// Account-level risk controller.
pub struct RiskController {
    account_tag: String,
    mm_rate_threshold: f64,
    client: Arc<BybitClient>,
    wallet: Arc<WalletCache>,
    symbols: RwLock<BTreeMap<String, SymbolRisk>>,
    flags: RwLock<Flags>,
    atr_cache: Mutex<HashMap<String, (f64, Instant)>>,
}

impl RiskController {
    pub fn new(
        account_tag: &str,
        mm_rate_threshold: f64,
        client: Arc<BybitClient>,
        wallet: Arc<WalletCache>,
    ) -> Self {
        Self {
            account_tag: account_tag.to_string(),
            mm_rate_threshold,
            client,
            wallet,
            symbols: RwLock::new(BTreeMap::new()),
            flags: RwLock::new(Flags::default()),
            atr_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Install a symbol's ledger and price cell. Called once per strategy at
    /// account build time.
    pub fn register_symbol(&self, symbol: &str, risk: SymbolRisk) {
        self.symbols.write().insert(symbol.to_string(), risk);
    }

    // -------------------------------------------------------------------------
    // Flag queries
    // -------------------------------------------------------------------------

    pub fn is_frozen(&self) -> bool {
        self.flags.read().averaging_frozen
    }

    pub fn is_panic(&self) -> bool {
        self.flags.read().panic_mode
    }

    /// A counter-trend TP fired; the next evaluation decides whether the
    /// triggers have cleared.
    pub fn notify_close_event(&self, symbol: &str) {
        if self.is_panic() {
            info!(
                account = %self.account_tag,
                symbol,
                "TP close during panic — recovery will be re-evaluated"
            );
        }
    }

    // -------------------------------------------------------------------------
    // Reserve math
    // -------------------------------------------------------------------------

    /// Fresh imbalance samples straight from the ledgers. Never cached.
    pub fn imbalance_samples(&self) -> Vec<ImbalanceSample> {
        self.symbols
            .read()
            .iter()
            .map(|(symbol, risk)| ImbalanceSample {
                symbol: symbol.clone(),
                long_qty: risk.ledger.total_qty(Side::Long),
                short_qty: risk.ledger.total_qty(Side::Short),
                price: risk.price.get(),
                leverage: risk.leverage,
            })
            .collect()
    }

    /// Worst cached ATR percent across symbols (0 until the first refresh).
    pub fn atr_max_pct(&self) -> f64 {
        self.atr_cache
            .lock()
            .values()
            .map(|(pct, _)| *pct)
            .fold(0.0, f64::max)
    }

    /// Refresh stale ATR entries from 1-minute klines. Runs on the risk tick,
    /// off the account mutex.
    pub async fn refresh_atr(&self) {
        let symbols: Vec<String> = self.symbols.read().keys().cloned().collect();
        for symbol in symbols {
            let stale = {
                let cache = self.atr_cache.lock();
                cache
                    .get(&symbol)
                    .map(|(_, at)| at.elapsed().as_secs() >= ATR_CACHE_SECS)
                    .unwrap_or(true)
            };
            if !stale {
                continue;
            }

            match self.client.get_klines(&symbol, "1", ATR_KLINE_LIMIT).await {
                Ok(klines) => {
                    if let Some(pct) = atr_percent(&klines) {
                        debug!(account = %self.account_tag, symbol = %symbol, atr_pct = pct, "ATR refreshed");
                        self.atr_cache.lock().insert(symbol, (pct, Instant::now()));
                    }
                }
                Err(e) => warn!(
                    account = %self.account_tag,
                    symbol = %symbol,
                    error = %e,
                    "ATR refresh failed — keeping previous value"
                ),
            }
        }
    }

    /// Current safety reserve in USD.
    pub fn safety_reserve(&self) -> f64 {
        compute_safety_reserve(&self.imbalance_samples(), self.atr_max_pct())
    }

    /// Funds the grid may spend. `totalAvailableBalance` already excludes
    /// initial margin — subtracting IM again would strand funds.
    pub fn available_for_trading(&self) -> f64 {
        self.wallet.snapshot().total_available_balance - self.safety_reserve()
    }

    /// Sum over every side of the margin its *next* averaging entry would
    /// commit. Sides at their level cap contribute nothing.
    pub fn next_worst_case(&self) -> f64 {
        let symbols = self.symbols.read();
        let mut total = 0.0;
        for risk in symbols.values() {
            for side in Side::BOTH {
                let level = risk.ledger.grid_level(side);
                if level >= risk.max_grid_levels_per_side {
                    continue;
                }
                total += match risk.ledger.last_entry_margin(side, risk.leverage) {
                    Some(margin) => margin * risk.averaging_multiplier,
                    None => risk.initial_position_size_usd,
                };
            }
        }
        total
    }

    // -------------------------------------------------------------------------
    // Averaging gate
    // -------------------------------------------------------------------------

    /// Called (under the account mutex) before every averaging order.
    pub fn check_reserve(&self, symbol: &str, side: Side, next_margin: f64) -> bool {
        if self.is_frozen() {
            info!(
                account = %self.account_tag,
                symbol,
                side = %side,
                "averaging denied — frozen ({})",
                self.flags.read().freeze_reason.as_deref().unwrap_or("?")
            );
            return false;
        }

        let reserve = self.safety_reserve();
        let available = self.wallet.snapshot().total_available_balance - reserve;
        if available < next_margin {
            info!(
                account = %self.account_tag,
                symbol,
                side = %side,
                next_margin,
                available,
                reserve,
                "averaging denied — would breach safety reserve"
            );
            return false;
        }

        debug!(
            account = %self.account_tag,
            symbol,
            side = %side,
            next_margin,
            available,
            "averaging permitted"
        );
        true
    }

    // -------------------------------------------------------------------------
    // Periodic evaluation
    // -------------------------------------------------------------------------

    /// Run the full risk pass: emergency close gate, early freeze, panic
    /// entry/exit. Invoked on wallet updates and the 60s tick, under the
    /// account mutex. Returns commands for the runtime to execute.
    pub fn evaluate(&self) -> Vec<RiskAction> {
        let wallet = self.wallet.snapshot();

        // --- 4. Emergency close gate (hardest, checked first) ---------------
        if wallet.account_mm_rate_percent >= self.mm_rate_threshold {
            warn!(
                account = %self.account_tag,
                mm_rate = wallet.account_mm_rate_percent,
                threshold = self.mm_rate_threshold,
                "MM RATE BREACH — emergency close"
            );
            return vec![RiskAction::EmergencyClose {
                reason: "MM_RATE_BREACH".to_string(),
            }];
        }

        let samples = self.imbalance_samples();
        let atr_max = self.atr_max_pct();
        let reserve = compute_safety_reserve(&samples, atr_max);
        let available = wallet.total_available_balance - reserve;
        let worst_case = self.next_worst_case();

        debug!(
            account = %self.account_tag,
            available,
            reserve,
            atr_max,
            worst_case,
            mm_rate = wallet.account_mm_rate_percent,
            "risk tick"
        );

        // --- 2. Early freeze -------------------------------------------------
        self.update_freeze(available, worst_case);

        // --- 3. Panic entry / exit -------------------------------------------
        let trigger = self.panic_trigger(&wallet, &samples, available, worst_case);
        let mut actions = Vec::new();

        let panicking = self.is_panic();
        match (panicking, trigger) {
            (false, Some(reason)) => {
                actions = self.enter_panic(reason, &samples, available);
            }
            (true, None) => {
                self.exit_panic();
            }
            _ => {}
        }

        actions
    }

    fn update_freeze(&self, available: f64, worst_case: f64) {
        let comfort_threshold = worst_case * COMFORT_FACTOR;
        let mut flags = self.flags.write();

        if available < comfort_threshold && !flags.averaging_frozen {
            let reason = format!(
                "available {available:.2} < comfort threshold {comfort_threshold:.2}"
            );
            warn!(account = %self.account_tag, %reason, "EARLY FREEZE — averaging halted, TPs unaffected");
            flags.averaging_frozen = true;
            flags.freeze_reason = Some(reason);
        } else if available >= comfort_threshold && flags.averaging_frozen && !flags.panic_mode {
            info!(account = %self.account_tag, available, comfort_threshold, "early freeze cleared");
            flags.averaging_frozen = false;
            flags.freeze_reason = None;
        }
    }

    fn panic_trigger(
        &self,
        wallet: &WalletSnapshot,
        samples: &[ImbalanceSample],
        available: f64,
        worst_case: f64,
    ) -> Option<String> {
        if wallet.account_mm_rate_percent >= PANIC_MM_RATE_PERCENT {
            return Some(format!(
                "account MM rate {:.1}% >= {PANIC_MM_RATE_PERCENT}%",
                wallet.account_mm_rate_percent
            ));
        }

        if worst_case > 0.0 && available < worst_case * PANIC_LOW_IM_FACTOR {
            return Some(format!(
                "available {available:.2} < {PANIC_LOW_IM_FACTOR}x worst case {worst_case:.2}"
            ));
        }

        if wallet.total_available_balance > 0.0
            && available / wallet.total_available_balance < PANIC_AVAILABLE_FRACTION
        {
            for sample in samples {
                let max_qty = sample.long_qty.max(sample.short_qty);
                let min_qty = sample.long_qty.min(sample.short_qty);
                if min_qty > 0.0 && max_qty / min_qty > PANIC_IMBALANCE_RATIO {
                    return Some(format!(
                        "{} leg ratio {:.1} with thin cushion",
                        sample.symbol,
                        max_qty / min_qty
                    ));
                }
            }
        }

        None
    }

    /// Panic entry: freeze, cancel trend-side TPs, plan the balance orders.
    fn enter_panic(
        &self,
        reason: String,
        samples: &[ImbalanceSample],
        available: f64,
    ) -> Vec<RiskAction> {
        warn!(account = %self.account_tag, %reason, "ENTERING PANIC MODE");

        {
            let mut flags = self.flags.write();
            flags.panic_mode = true;
            flags.panic_reason = Some(reason.clone());
            flags.panic_entered_at = Some(Utc::now().to_rfc3339());
            flags.averaging_frozen = true;
            flags.freeze_reason = Some(format!("panic: {reason}"));
        }

        let mut actions = Vec::new();

        // Cancel the TP on the side that averaged against the move; keep the
        // counter-trend TP as the natural exit on reversal.
        let symbols = self.symbols.read();
        for (symbol, risk) in symbols.iter() {
            let long_level = risk.ledger.grid_level(Side::Long);
            let short_level = risk.ledger.grid_level(Side::Short);
            if let Some(side) = trend_side(long_level, short_level) {
                info!(
                    account = %self.account_tag,
                    symbol = %symbol,
                    trend_side = %side,
                    long_level,
                    short_level,
                    "panic: cancelling trend-side TP, keeping counter-trend TP"
                );
                actions.push(RiskAction::CancelTp {
                    symbol: symbol.clone(),
                    side,
                });
            }
        }
        drop(symbols);

        let orders = plan_balance_orders(samples, available);
        if orders.is_empty() {
            warn!(
                account = %self.account_tag,
                available,
                "panic balancer has no funds to work with"
            );
        } else {
            actions.push(RiskAction::Balance(orders));
        }

        actions
    }

    fn exit_panic(&self) {
        let mut flags = self.flags.write();
        if !flags.panic_mode {
            return;
        }
        info!(
            account = %self.account_tag,
            entered_at = flags.panic_entered_at.as_deref().unwrap_or("?"),
            "panic triggers cleared — leaving panic mode"
        );
        flags.panic_mode = false;
        flags.panic_reason = None;
        flags.panic_entered_at = None;
        flags.averaging_frozen = false;
        flags.freeze_reason = None;
    }
}

impl std::fmt::Debug for RiskController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let flags = self.flags.read().clone();
        f.debug_struct("RiskController")
            .field("account", &self.account_tag)
            .field("symbols", &self.symbols.read().len())
            .field("frozen", &flags.averaging_frozen)
            .field("panic", &flags.panic_mode)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::StateStore;

    fn sample(symbol: &str, long: f64, short: f64, price: f64, leverage: u32) -> ImbalanceSample {
        ImbalanceSample {
            symbol: symbol.to_string(),
            long_qty: long,
            short_qty: short,
            price,
            leverage,
        }
    }

    #[test]
    fn gap_buffer_tiers() {
        assert_eq!(gap_buffer(0.5), 0.02);
        assert_eq!(gap_buffer(1.0), 0.05);
        assert_eq!(gap_buffer(1.5), 0.05);
        assert_eq!(gap_buffer(2.0), 0.10);
        assert_eq!(gap_buffer(5.0), 0.10);
    }

    // -- ATR feed ------------------------------------------------------------

    /// A 1-minute DOGE-like bar: `range` is the full high-low spread around
    /// `close`, timestamps one minute apart.
    fn minute_bars(count: usize, close: f64, range: f64) -> Vec<Kline> {
        (0..count)
            .map(|i| Kline {
                start: 1_700_000_000_000 + i as i64 * 60_000,
                open: close,
                high: close + range / 2.0,
                low: close - range / 2.0,
                close,
            })
            .collect()
    }

    #[test]
    fn atr_needs_a_previous_bar_per_range() {
        // 20 true ranges need 21 bars: one short of that is no reading.
        assert!(atr_percent(&minute_bars(20, 0.25, 0.0025)).is_none());
        assert!(atr_percent(&minute_bars(21, 0.25, 0.0025)).is_some());
        assert!(atr_percent(&[]).is_none());
    }

    #[test]
    fn quiet_tape_lands_in_the_low_gap_tier() {
        // 0.4% spread on a $0.25 perp: ATR% = 0.4, factor 1.0+0.10+0.02+0.05.
        let pct = atr_percent(&minute_bars(40, 0.25, 0.001)).unwrap();
        assert!((pct - 0.4).abs() < 1e-9, "got {pct}");
        assert_eq!(gap_buffer(pct), 0.02);
        assert!((safety_factor(pct) - 1.17).abs() < 1e-12);
    }

    #[test]
    fn normal_tape_lands_in_the_mid_gap_tier() {
        // 1.2% spread => the 1.20 factor the two-symbol reserve example uses.
        let pct = atr_percent(&minute_bars(40, 0.25, 0.003)).unwrap();
        assert!((pct - 1.2).abs() < 1e-9, "got {pct}");
        assert_eq!(gap_buffer(pct), 0.05);
        assert!((safety_factor(pct) - 1.20).abs() < 1e-12);
    }

    #[test]
    fn wild_tape_lands_in_the_top_gap_tier() {
        let pct = atr_percent(&minute_bars(40, 0.25, 0.006)).unwrap();
        assert!((pct - 2.4).abs() < 1e-9, "got {pct}");
        assert_eq!(gap_buffer(pct), 0.10);
        assert!((safety_factor(pct) - 1.25).abs() < 1e-12);
    }

    #[test]
    fn inter_minute_moves_widen_the_reading() {
        // Bar-local spreads stay tiny, but the tape staircases 3% per minute
        // over the last ten bars. Only the prev-close leg of the true range
        // sees that, and it has to lift the reserve into the next gap tier.
        let calm = minute_bars(40, 0.25, 0.001);
        let mut trending = calm.clone();
        for (step, bar) in trending.iter_mut().skip(30).enumerate() {
            let shift = 0.0075 * (step + 1) as f64;
            bar.open += shift;
            bar.high += shift;
            bar.low += shift;
            bar.close += shift;
        }

        let calm_pct = atr_percent(&calm).unwrap();
        let trending_pct = atr_percent(&trending).unwrap();
        assert!(
            trending_pct > calm_pct * 2.0,
            "staircase not reflected: calm {calm_pct}, trending {trending_pct}"
        );
        assert_eq!(gap_buffer(calm_pct), 0.02);
        assert_eq!(gap_buffer(trending_pct), 0.05);
    }

    #[test]
    fn degenerate_feed_yields_no_reading() {
        let mut bars = minute_bars(40, 0.25, 0.0025);
        bars[25].high = f64::NAN;
        assert!(atr_percent(&bars).is_none());

        let mut zeroed = minute_bars(40, 0.25, 0.0025);
        zeroed.last_mut().unwrap().close = 0.0;
        assert!(atr_percent(&zeroed).is_none());
    }

    #[test]
    fn reserve_matches_two_symbol_example() {
        // DOGE: |100-500| * 0.15 = 60; TON: |10-50| * 5 = 200; ATR 1.5% => 1.20
        let samples = vec![
            sample("DOGEUSDT", 100.0, 500.0, 0.15, 75),
            sample("TONUSDT", 10.0, 50.0, 5.0, 75),
        ];
        let reserve = compute_safety_reserve(&samples, 1.5);
        assert!((reserve - 312.0).abs() < 1e-9, "got {reserve}");
    }

    #[test]
    fn reserve_is_pure() {
        let samples = vec![sample("DOGEUSDT", 100.0, 500.0, 0.15, 75)];
        let a = compute_safety_reserve(&samples, 1.5);
        let b = compute_safety_reserve(&samples, 1.5);
        assert_eq!(a, b);
    }

    #[test]
    fn balanced_book_needs_no_reserve() {
        let samples = vec![sample("DOGEUSDT", 300.0, 300.0, 0.25, 75)];
        assert_eq!(compute_safety_reserve(&samples, 3.0), 0.0);
    }

    #[test]
    fn trend_side_is_deeper_grid() {
        assert_eq!(trend_side(0, 8), Some(Side::Short));
        assert_eq!(trend_side(8, 0), Some(Side::Long));
        assert_eq!(trend_side(3, 3), None);
    }

    #[test]
    fn balancer_full_when_funded() {
        let samples = vec![sample("DOGEUSDT", 100.0, 500.0, 0.15, 10)];
        // margin needed: 400 * 0.15 / 10 = 6.0
        let orders = plan_balance_orders(&samples, 10.0);
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].side, Side::Long);
        assert!((orders[0].qty - 400.0).abs() < 1e-9);
        assert!((orders[0].margin_needed - 6.0).abs() < 1e-9);
    }

    #[test]
    fn balancer_scales_when_short_of_funds() {
        let samples = vec![
            sample("DOGEUSDT", 100.0, 500.0, 0.15, 10), // needs 6.0
            sample("TONUSDT", 50.0, 10.0, 5.0, 10),     // needs 20.0
        ];
        let orders = plan_balance_orders(&samples, 13.0); // half of 26 total
        assert_eq!(orders.len(), 2);
        assert!((orders[0].qty - 200.0).abs() < 1e-9, "DOGE scaled to half");
        assert_eq!(orders[1].side, Side::Short, "TON short leg lags");
        assert!((orders[1].qty - 20.0).abs() < 1e-9, "TON scaled to half");
    }

    #[test]
    fn balancer_stands_down_below_floor() {
        let samples = vec![sample("DOGEUSDT", 100.0, 500.0, 0.15, 10)];
        assert!(plan_balance_orders(&samples, 0.5).is_empty());
        assert!(plan_balance_orders(&samples, -10.0).is_empty());
    }

    // -- controller-level tests over real ledgers ----------------------------

    fn controller_with_doge_ton(
        name: &str,
        available: f64,
    ) -> (RiskController, std::path::PathBuf) {
        let dir = std::env::temp_dir().join(format!("lattice-risk-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let store = Arc::new(StateStore::open(&dir, "001").unwrap());

        let client = Arc::new(BybitClient::new("k", "s", true, true));
        let wallet = Arc::new(WalletCache::new());
        wallet.seed(WalletSnapshot {
            total_equity: available + 100.0,
            total_available_balance: available,
            total_initial_margin: 50.0,
            total_order_im: 0.0,
            total_maintenance_margin: 10.0,
            account_mm_rate_percent: 2.0,
        });

        let controller = RiskController::new("001", 90.0, client, wallet);

        // DOGE: Long 100 @ 0.15, Short 500 @ 0.15 (level 5 ladder collapsed
        // into totals for the reserve math).
        let doge = Arc::new(PositionLedger::new("001", "DOGEUSDT", store.clone()));
        doge.add_entry(Side::Long, 0.15, 100.0, 0, None);
        doge.add_entry(Side::Short, 0.15, 500.0, 0, None);
        let doge_price = Arc::new(PriceCell::new());
        doge_price.set(0.15);
        controller.register_symbol(
            "DOGEUSDT",
            SymbolRisk {
                ledger: doge,
                price: doge_price,
                leverage: 75,
                initial_position_size_usd: 1.0,
                averaging_multiplier: 2.0,
                max_grid_levels_per_side: 10,
            },
        );

        // TON: Long 10 @ 5.0, Short 50 @ 5.0
        let ton = Arc::new(PositionLedger::new("001", "TONUSDT", store));
        ton.add_entry(Side::Long, 5.0, 10.0, 0, None);
        ton.add_entry(Side::Short, 5.0, 50.0, 0, None);
        let ton_price = Arc::new(PriceCell::new());
        ton_price.set(5.0);
        controller.register_symbol(
            "TONUSDT",
            SymbolRisk {
                ledger: ton,
                price: ton_price,
                leverage: 75,
                initial_position_size_usd: 1.0,
                averaging_multiplier: 2.0,
                max_grid_levels_per_side: 10,
            },
        );

        // Pin ATR at 1.5% => factor 1.20.
        controller
            .atr_cache
            .lock()
            .insert("DOGEUSDT".to_string(), (1.5, Instant::now()));

        (controller, dir)
    }

    #[test]
    fn averaging_permitted_against_reserve() {
        let (controller, dir) = controller_with_doge_ton("permit", 400.0);
        // reserve = (60 + 200) * 1.20 = 312; available = 88 >= 32
        assert!((controller.safety_reserve() - 312.0).abs() < 1e-9);
        assert!(controller.check_reserve("DOGEUSDT", Side::Short, 32.0));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn averaging_denied_against_reserve() {
        let (controller, dir) = controller_with_doge_ton("deny", 310.0);
        // available = 310 - 312 = -2 < 32
        assert!(!controller.check_reserve("DOGEUSDT", Side::Short, 32.0));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn frozen_denies_regardless_of_funds() {
        let (controller, dir) = controller_with_doge_ton("frozen", 10_000.0);
        controller.flags.write().averaging_frozen = true;
        assert!(!controller.check_reserve("DOGEUSDT", Side::Short, 1.0));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn imbalance_samples_are_fresh_each_call() {
        let (controller, dir) = controller_with_doge_ton("fresh", 400.0);
        let before = controller.safety_reserve();

        // Grow the DOGE long leg; the next reserve call must see it.
        {
            let symbols = controller.symbols.read();
            let risk = symbols.get("DOGEUSDT").unwrap();
            risk.ledger.add_entry(Side::Long, 0.15, 400.0, 1, None);
        }
        let after = controller.safety_reserve();
        assert!(after < before, "DOGE is now balanced, reserve must shrink");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn mm_breach_emits_emergency_close() {
        let (controller, dir) = controller_with_doge_ton("mmbreach", 400.0);
        controller.wallet.apply(WalletSnapshot {
            account_mm_rate_percent: 92.0,
            total_available_balance: 400.0,
            ..Default::default()
        });
        let actions = controller.evaluate();
        assert!(matches!(
            actions.as_slice(),
            [RiskAction::EmergencyClose { reason }] if reason == "MM_RATE_BREACH"
        ));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn panic_entry_cancels_trend_tp_and_balances() {
        let (controller, dir) = controller_with_doge_ton("panic", 5.0);
        // available = 5 - 312 < 0 => low-IM panic trigger.
        let actions = controller.evaluate();
        assert!(controller.is_panic());
        assert!(controller.is_frozen());

        let cancels: Vec<_> = actions
            .iter()
            .filter_map(|a| match a {
                RiskAction::CancelTp { symbol, side } => Some((symbol.clone(), *side)),
                _ => None,
            })
            .collect();
        // Short legs are deeper on both symbols (level comparison is by
        // entry count; both sides have one entry here, so no cancel).
        assert!(cancels.is_empty());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn panic_trend_cancel_follows_grid_depth() {
        let (controller, dir) = controller_with_doge_ton("panictrend", 5.0);
        {
            let symbols = controller.symbols.read();
            let risk = symbols.get("DOGEUSDT").unwrap();
            // Deepen the short ladder: it averaged against an uptrend.
            risk.ledger.add_entry(Side::Short, 0.15, 1000.0, 1, None);
        }
        let actions = controller.evaluate();
        let cancel = actions.iter().find_map(|a| match a {
            RiskAction::CancelTp { symbol, side } => Some((symbol.clone(), *side)),
            _ => None,
        });
        assert_eq!(cancel, Some(("DOGEUSDT".to_string(), Side::Short)));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn panic_exits_when_triggers_clear() {
        let (controller, dir) = controller_with_doge_ton("panicexit", 5.0);
        let _ = controller.evaluate();
        assert!(controller.is_panic());

        // Funds recover far above every threshold.
        controller.wallet.apply(WalletSnapshot {
            total_available_balance: 100_000.0,
            account_mm_rate_percent: 1.0,
            ..Default::default()
        });
        let actions = controller.evaluate();
        assert!(actions.is_empty());
        assert!(!controller.is_panic());
        assert!(!controller.is_frozen());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn early_freeze_sets_and_clears() {
        let (controller, dir) = controller_with_doge_ton("freeze", 400.0);
        // worst_case: DOGE last margins 100*0.15/75=0.2 and 500*0.15/75=1.0
        // doubled => 0.4 + 2.0; TON 10*5/75=0.667, 50*5/75=3.333 doubled =>
        // 1.333 + 6.667. Total 10.4; comfort = 15.6. available = 88 => clear.
        let _ = controller.evaluate();
        assert!(!controller.is_frozen());

        // Drop funds so available (= 320 - 312 = 8) < 15.6 but still above
        // panic (needs < 3x10.4 = 31.2... that would panic too). Use a
        // direct freeze-path check instead:
        controller.update_freeze(12.0, 10.4);
        assert!(controller.is_frozen());
        controller.update_freeze(20.0, 10.4);
        assert!(!controller.is_frozen());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
