// =============================================================================
// Wallet Cache — real-time mirror of unified-account margin figures
// =============================================================================
//
// Single writer (the private-stream dispatch task), many readers. Seeded once
// from REST at startup so risk checks never run against a zeroed snapshot.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::types::WalletSnapshot;

/// Thread-safe cache of the latest wallet totals.
pub struct WalletCache {
    inner: RwLock<WalletSnapshot>,
    seeded: AtomicBool,
}

impl WalletCache {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(WalletSnapshot::default()),
            seeded: AtomicBool::new(false),
        }
    }

    /// Seed the cache from a REST snapshot. Stream updates that arrived
    /// before the seed win; the seed only fills an empty cache.
    pub fn seed(&self, snapshot: WalletSnapshot) {
        if self.seeded.swap(true, Ordering::SeqCst) {
            debug!("wallet cache already live — REST seed ignored");
            return;
        }
        *self.inner.write() = snapshot;
        info!(
            equity = snapshot.total_equity,
            available = snapshot.total_available_balance,
            "wallet cache seeded from REST"
        );
    }

    /// Apply a stream update. Called only from the private-stream dispatcher.
    pub fn apply(&self, snapshot: WalletSnapshot) {
        self.seeded.store(true, Ordering::SeqCst);
        *self.inner.write() = snapshot;
        debug!(
            equity = snapshot.total_equity,
            available = snapshot.total_available_balance,
            mm_rate_pct = snapshot.account_mm_rate_percent,
            "wallet updated from stream"
        );
    }

    /// Copy out the latest snapshot.
    pub fn snapshot(&self) -> WalletSnapshot {
        *self.inner.read()
    }

    /// Whether any data (REST or stream) has landed yet.
    pub fn is_seeded(&self) -> bool {
        self.seeded.load(Ordering::SeqCst)
    }
}

impl Default for WalletCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for WalletCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snap = self.snapshot();
        f.debug_struct("WalletCache")
            .field("total_equity", &snap.total_equity)
            .field("total_available_balance", &snap.total_available_balance)
            .field("seeded", &self.is_seeded())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn snap(available: f64) -> WalletSnapshot {
        WalletSnapshot {
            total_equity: available + 100.0,
            total_available_balance: available,
            total_initial_margin: 50.0,
            total_order_im: 5.0,
            total_maintenance_margin: 10.0,
            account_mm_rate_percent: 1.5,
        }
    }

    #[test]
    fn seed_fills_empty_cache() {
        let cache = WalletCache::new();
        assert!(!cache.is_seeded());
        cache.seed(snap(400.0));
        assert!(cache.is_seeded());
        assert_eq!(cache.snapshot().total_available_balance, 400.0);
    }

    #[test]
    fn stream_update_beats_late_seed() {
        let cache = WalletCache::new();
        cache.apply(snap(300.0));
        cache.seed(snap(999.0));
        // The REST seed arrived after a live update and must not clobber it.
        assert_eq!(cache.snapshot().total_available_balance, 300.0);
    }

    #[test]
    fn apply_overwrites() {
        let cache = WalletCache::new();
        cache.seed(snap(400.0));
        cache.apply(snap(350.0));
        assert_eq!(cache.snapshot().total_available_balance, 350.0);
    }
}
