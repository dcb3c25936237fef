// =============================================================================
// Rate-Limit Tracker — monitors Bybit API usage to avoid 403/10006 bans
// =============================================================================
//
// Bybit v5 returns the per-endpoint budget in response headers:
//   X-Bapi-Limit         — allowed requests in the current window
//   X-Bapi-Limit-Status  — requests remaining in the current window
//
// The tracker keeps atomic counters that any task may query lock-free. Order
// submission additionally passes a local per-second pacing check so a burst
// of grid events cannot exhaust the budget before headers catch up.
// =============================================================================

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use tracing::{debug, warn};

/// Remaining-budget floor below which requests are refused.
const REMAINING_HARD_FLOOR: u32 = 2;
/// Remaining-budget level that triggers a warning.
const REMAINING_WARN_THRESHOLD: u32 = 10;

/// Local ceiling on orders per second, independent of headers.
const ORDERS_PER_SECOND_LIMIT: u32 = 8;

/// Thread-safe rate-limit tracker backed by atomic counters.
pub struct RateLimitTracker {
    limit: AtomicU32,
    remaining: AtomicU32,
    orders_this_second: AtomicU32,
    current_second: AtomicI64,
}

impl RateLimitTracker {
    /// Create a new tracker with an optimistic full budget.
    pub fn new() -> Self {
        Self {
            limit: AtomicU32::new(100),
            remaining: AtomicU32::new(100),
            orders_this_second: AtomicU32::new(0),
            current_second: AtomicI64::new(0),
        }
    }

    // -------------------------------------------------------------------------
    // Header-based updates
    // -------------------------------------------------------------------------

    /// Update internal counters from Bybit response headers.
    pub fn update_from_headers(&self, headers: &reqwest::header::HeaderMap) {
        if let Some(val) = headers.get("X-Bapi-Limit") {
            if let Ok(s) = val.to_str() {
                if let Ok(limit) = s.parse::<u32>() {
                    self.limit.store(limit, Ordering::Relaxed);
                }
            }
        }

        if let Some(val) = headers.get("X-Bapi-Limit-Status") {
            if let Ok(s) = val.to_str() {
                if let Ok(remaining) = s.parse::<u32>() {
                    let prev = self.remaining.swap(remaining, Ordering::Relaxed);
                    if remaining <= REMAINING_WARN_THRESHOLD && prev > REMAINING_WARN_THRESHOLD {
                        warn!(
                            remaining,
                            limit = self.limit.load(Ordering::Relaxed),
                            "rate-limit budget crossed warning threshold"
                        );
                    }
                    debug!(remaining, "rate-limit budget updated from header");
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Pre-flight checks
    // -------------------------------------------------------------------------

    /// Return `true` if an order may be submitted without risking a ban.
    pub fn can_place_order(&self) -> bool {
        let remaining = self.remaining.load(Ordering::Relaxed);
        if remaining <= REMAINING_HARD_FLOOR {
            warn!(
                remaining,
                floor = REMAINING_HARD_FLOOR,
                "order blocked — exchange budget exhausted"
            );
            return false;
        }

        let now_second = chrono::Utc::now().timestamp();
        let tracked = self.current_second.swap(now_second, Ordering::Relaxed);
        if tracked != now_second {
            self.orders_this_second.store(0, Ordering::Relaxed);
        }

        let in_window = self.orders_this_second.load(Ordering::Relaxed);
        if in_window >= ORDERS_PER_SECOND_LIMIT {
            warn!(
                in_window,
                limit = ORDERS_PER_SECOND_LIMIT,
                "order blocked — local per-second pacing limit reached"
            );
            return false;
        }
        true
    }

    /// Record a submitted order against the local pacing window.
    pub fn record_order_sent(&self) {
        self.orders_this_second.fetch_add(1, Ordering::Relaxed);
    }

    /// Remaining exchange budget as last reported by headers.
    pub fn remaining(&self) -> u32 {
        self.remaining.load(Ordering::Relaxed)
    }
}

impl Default for RateLimitTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RateLimitTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitTracker")
            .field("limit", &self.limit.load(Ordering::Relaxed))
            .field("remaining", &self.remaining.load(Ordering::Relaxed))
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
    fn fresh_tracker_allows_orders() {
        let tracker = RateLimitTracker::new();
        assert!(tracker.can_place_order());
    }

    #[test]
    fn exhausted_budget_blocks_orders() {
        let tracker = RateLimitTracker::new();
        tracker.remaining.store(REMAINING_HARD_FLOOR, Ordering::Relaxed);
        assert!(!tracker.can_place_order());
    }

    #[test]
    fn header_update_feeds_counters() {
        let tracker = RateLimitTracker::new();
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert("X-Bapi-Limit", "50".parse().unwrap());
        headers.insert("X-Bapi-Limit-Status", "7".parse().unwrap());
        tracker.update_from_headers(&headers);
        assert_eq!(tracker.remaining(), 7);
        assert_eq!(tracker.limit.load(Ordering::Relaxed), 50);
    }

    #[test]
    fn per_second_pacing_blocks_bursts() {
        let tracker = RateLimitTracker::new();
        for _ in 0..ORDERS_PER_SECOND_LIMIT {
            assert!(tracker.can_place_order());
            tracker.record_order_sent();
        }
        assert!(!tracker.can_place_order());
    }
}
