// =============================================================================
// Limit Order Tracker — protected limit entries with market fallback
// =============================================================================
//
// Grid entries go out as aggressive limit orders shaded a fraction of a
// percent through the book (Buy above market, Sell below), so they fill like
// market orders but carry a price ceiling/floor. If the order has not filled
// within the timeout it is cancelled and re-priced; after the retry budget is
// spent the entry falls back to a plain market order.
//
// Emergency closes and balancer orders bypass this tracker entirely.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::bybit::client::BybitClient;
use crate::types::{OrderType, Side};

/// Shade applied to the limit price, percent of current price.
pub const LIMIT_ORDER_PRICE_OFFSET_PERCENT: f64 = 0.03;
/// How long to wait for a fill before cancel-and-retry.
pub const LIMIT_ORDER_TIMEOUT_SECS: u64 = 10;
/// Limit attempts before the market fallback.
pub const LIMIT_ORDER_MAX_RETRIES: u32 = 3;

/// Compute the shaded limit price for an entry order. Buys shade up through
/// the ask, sells shade down through the bid.
pub fn limit_entry_price(order_side: &str, current_price: f64, offset_percent: f64) -> f64 {
    match order_side {
        "Buy" => current_price * (1.0 + offset_percent / 100.0),
        _ => current_price * (1.0 - offset_percent / 100.0),
    }
}

/// Per-symbol tracker for in-flight limit entries.
pub struct LimitOrderTracker {
    account_tag: String,
    symbol: String,
    client: Arc<BybitClient>,
    /// Order ids awaiting a fill notification from the order stream.
    waiting: Mutex<HashMap<String, Arc<Notify>>>,
}

impl LimitOrderTracker {
    pub fn new(account_tag: &str, symbol: &str, client: Arc<BybitClient>) -> Self {
        Self {
            account_tag: account_tag.to_string(),
            symbol: symbol.to_string(),
            client,
            waiting: Mutex::new(HashMap::new()),
        }
    }

    /// Wake a `place` call whose order just filled. Invoked by the strategy's
    /// order-stream handler; unknown ids are ignored.
    pub fn notify_fill(&self, order_id: &str) {
        if let Some(notify) = self.waiting.lock().get(order_id) {
            notify.notify_one();
        }
    }

    /// Whether `order_id` belongs to an in-flight tracked entry.
    pub fn is_tracking(&self, order_id: &str) -> bool {
        self.waiting.lock().contains_key(order_id)
    }

    /// Place an opening entry for `side`, retrying with fresh prices until the
    /// retry budget is spent, then falling back to a market order.
    ///
    /// Returns the order id that (eventually) fills; the fill itself arrives
    /// through the execution stream.
    pub async fn place(
        &self,
        side: Side,
        qty: f64,
        current_price: f64,
        reason: &str,
    ) -> Result<String> {
        let order_side = side.open_order_side();

        for attempt in 1..=LIMIT_ORDER_MAX_RETRIES {
            let price = limit_entry_price(order_side, current_price, LIMIT_ORDER_PRICE_OFFSET_PERCENT);
            let link_id = format!("lat-{}", uuid::Uuid::new_v4().simple());

            let order_id = self
                .client
                .place_order(
                    &self.symbol,
                    order_side,
                    qty,
                    OrderType::Limit,
                    Some(price),
                    false,
                    side.position_idx(),
                    Some(&link_id),
                )
                .await
                .with_context(|| {
                    format!(
                        "[{}][{}] limit entry placement failed ({reason})",
                        self.account_tag, self.symbol
                    )
                })?;

            info!(
                account = %self.account_tag,
                symbol = %self.symbol,
                side = %side,
                qty,
                price,
                attempt,
                reason,
                order_id = %order_id,
                "limit entry placed"
            );

            let notify = Arc::new(Notify::new());
            self.waiting.lock().insert(order_id.clone(), notify.clone());

            let filled = tokio::time::timeout(
                std::time::Duration::from_secs(LIMIT_ORDER_TIMEOUT_SECS),
                notify.notified(),
            )
            .await
            .is_ok();

            self.waiting.lock().remove(&order_id);

            if filled {
                return Ok(order_id);
            }

            // Timed out: cancel and retry at a fresh price. A failing cancel
            // almost always means the order filled while we were waiting.
            match self.client.cancel_order(&self.symbol, &order_id).await {
                Ok(()) => {
                    warn!(
                        account = %self.account_tag,
                        symbol = %self.symbol,
                        side = %side,
                        attempt,
                        "limit entry timed out — cancelled, retrying"
                    );
                }
                Err(e) => {
                    warn!(
                        account = %self.account_tag,
                        symbol = %self.symbol,
                        order_id = %order_id,
                        error = %e,
                        "cancel after timeout failed — assuming the order filled"
                    );
                    return Ok(order_id);
                }
            }
        }

        // Retry budget spent: take the fill at market.
        warn!(
            account = %self.account_tag,
            symbol = %self.symbol,
            side = %side,
            qty,
            reason,
            "limit retries exhausted — falling back to market order"
        );
        let order_id = self
            .client
            .place_order(
                &self.symbol,
                order_side,
                qty,
                OrderType::Market,
                None,
                false,
                side.position_idx(),
                None,
            )
            .await
            .with_context(|| {
                format!(
                    "[{}][{}] market fallback failed ({reason})",
                    self.account_tag, self.symbol
                )
            })?;

        Ok(order_id)
    }
}

impl std::fmt::Debug for LimitOrderTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LimitOrderTracker")
            .field("symbol", &self.symbol)
            .field("in_flight", &self.waiting.lock().len())
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
    fn buy_shades_up_sell_shades_down() {
        let buy = limit_entry_price("Buy", 0.25, LIMIT_ORDER_PRICE_OFFSET_PERCENT);
        let sell = limit_entry_price("Sell", 0.25, LIMIT_ORDER_PRICE_OFFSET_PERCENT);
        assert!(buy > 0.25, "buy limit crosses the ask: {buy}");
        assert!(sell < 0.25, "sell limit crosses the bid: {sell}");
        assert!((buy - 0.25 * 1.0003).abs() < 1e-12);
        assert!((sell - 0.25 * 0.9997).abs() < 1e-12);
    }

    #[tokio::test]
    async fn notify_fill_wakes_waiters() {
        let client = Arc::new(BybitClient::new("k", "s", true, true));
        let tracker = LimitOrderTracker::new("001", "DOGEUSDT", client);

        let notify = Arc::new(Notify::new());
        tracker
            .waiting
            .lock()
            .insert("oid-1".to_string(), notify.clone());
        assert!(tracker.is_tracking("oid-1"));

        tracker.notify_fill("oid-1");
        // The permit is stored, so a subsequent wait resolves immediately.
        tokio::time::timeout(std::time::Duration::from_millis(50), notify.notified())
            .await
            .expect("notified() should resolve after notify_fill");

        // Unknown ids are a no-op.
        tracker.notify_fill("unknown");
    }
}
