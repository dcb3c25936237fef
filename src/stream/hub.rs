// =============================================================================
// Stream Hub — connection sharing and supervision
// =============================================================================
//
// One public ticker connection per (symbol, env) shared by every account that
// subscribes to it; a reference count tied to subscription guards governs the
// connection lifetime. One private connection per account.
//
// Supervision: each connection task reconnects with exponential backoff
// `min(1s * 2^n, 60s)`. A private connection that exhausts its attempts
// surfaces a fatal event to the owning account (which emergency-stops).
// Shared ticker connections keep retrying at the capped delay — accounts can
// fall back to REST tickers and other subscribers must not be taken down by
// one symbol's outage.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{error, info, warn};

use crate::stream::private::{run_private_stream, PrivateCallbacks, PrivateDispatcher};
use crate::stream::public::{run_ticker_stream, TickerCallback};
use crate::stream::{backoff_delay, MAX_RECONNECT_ATTEMPTS};
use crate::types::TickerEvent;

/// A connection is considered healthy if it survived this long; the reconnect
/// attempt counter resets afterwards.
const HEALTHY_CONNECTION_SECS: u64 = 30;

// ---------------------------------------------------------------------------
// Shared ticker state
// ---------------------------------------------------------------------------

struct TickerShare {
    symbol: String,
    demo: bool,
    subscribers: Arc<RwLock<Vec<(u64, TickerCallback)>>>,
    refcount: AtomicUsize,
    running: AtomicBool,
    next_id: AtomicU64,
}

/// RAII subscription guard. Dropping it removes the callback and releases the
/// connection reference.
pub struct TickerSubscription {
    share: Arc<TickerShare>,
    id: u64,
}

impl Drop for TickerSubscription {
    fn drop(&mut self) {
        self.share.subscribers.write().retain(|(id, _)| *id != self.id);
        let remaining = self.share.refcount.fetch_sub(1, Ordering::SeqCst) - 1;
        info!(
            symbol = %self.share.symbol,
            remaining,
            "ticker subscription dropped"
        );
    }
}

// ---------------------------------------------------------------------------
// Hub
// ---------------------------------------------------------------------------

/// Owns every WebSocket connection of the process.
pub struct StreamHub {
    tickers: Mutex<HashMap<(String, bool), Arc<TickerShare>>>,
}

impl StreamHub {
    pub fn new() -> Self {
        Self {
            tickers: Mutex::new(HashMap::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Public tickers
    // -------------------------------------------------------------------------

    /// Subscribe to a symbol's ticker stream. The connection is shared across
    /// accounts; the first subscription spawns it, the last drop retires it.
    ///
    /// The callback runs on the stream task — enqueue, never block.
    pub fn subscribe_ticker(
        &self,
        symbol: &str,
        demo: bool,
        callback: impl Fn(&TickerEvent) + Send + Sync + 'static,
    ) -> TickerSubscription {
        let share = {
            let mut tickers = self.tickers.lock();
            tickers
                .entry((symbol.to_string(), demo))
                .or_insert_with(|| {
                    Arc::new(TickerShare {
                        symbol: symbol.to_string(),
                        demo,
                        subscribers: Arc::new(RwLock::new(Vec::new())),
                        refcount: AtomicUsize::new(0),
                        running: AtomicBool::new(false),
                        next_id: AtomicU64::new(0),
                    })
                })
                .clone()
        };

        let id = share.next_id.fetch_add(1, Ordering::SeqCst);
        share.subscribers.write().push((id, Arc::new(callback)));
        let count = share.refcount.fetch_add(1, Ordering::SeqCst) + 1;
        info!(symbol, demo, subscribers = count, "ticker subscription added");

        if !share.running.swap(true, Ordering::SeqCst) {
            Self::spawn_ticker_task(share.clone());
        }

        TickerSubscription { share, id }
    }

    fn spawn_ticker_task(share: Arc<TickerShare>) {
        tokio::spawn(async move {
            let mut attempt: u32 = 0;
            loop {
                if share.refcount.load(Ordering::SeqCst) == 0 {
                    info!(symbol = %share.symbol, "no subscribers left — ticker connection retired");
                    share.running.store(false, Ordering::SeqCst);
                    return;
                }

                let started = tokio::time::Instant::now();
                let result =
                    run_ticker_stream(&share.symbol, share.demo, share.subscribers.clone())
                        .await;

                if started.elapsed().as_secs() >= HEALTHY_CONNECTION_SECS {
                    attempt = 0;
                }
                attempt += 1;

                match result {
                    Ok(()) => warn!(symbol = %share.symbol, attempt, "ticker stream closed — reconnecting"),
                    Err(e) => warn!(symbol = %share.symbol, attempt, error = %e, "ticker stream error — reconnecting"),
                }

                if attempt >= MAX_RECONNECT_ATTEMPTS {
                    // Shared connection: keep limping at the max delay instead
                    // of taking every subscribing account down.
                    error!(
                        symbol = %share.symbol,
                        attempt,
                        "ticker reconnect attempts exhausted — continuing at capped delay"
                    );
                    attempt = MAX_RECONNECT_ATTEMPTS;
                }

                tokio::time::sleep(backoff_delay(attempt)).await;
            }
        });
    }

    // -------------------------------------------------------------------------
    // Private streams
    // -------------------------------------------------------------------------

    /// Open the authenticated stream for one account. Returns the dispatcher,
    /// which carries the `pause_callbacks`/`resume_callbacks` gate used by the
    /// reconciler during critical sections.
    pub fn open_private(
        &self,
        account_tag: &str,
        api_key: String,
        secret: String,
        demo: bool,
        callbacks: PrivateCallbacks,
    ) -> Arc<PrivateDispatcher> {
        let dispatcher = Arc::new(PrivateDispatcher::new(account_tag, callbacks));

        let task_dispatcher = dispatcher.clone();
        let tag = account_tag.to_string();
        tokio::spawn(async move {
            let mut attempt: u32 = 0;
            loop {
                let started = tokio::time::Instant::now();
                let result =
                    run_private_stream(&api_key, &secret, demo, task_dispatcher.clone()).await;

                if started.elapsed().as_secs() >= HEALTHY_CONNECTION_SECS {
                    attempt = 0;
                }
                attempt += 1;

                match result {
                    Ok(()) => warn!(account = %tag, attempt, "private stream closed — reconnecting"),
                    Err(e) => warn!(account = %tag, attempt, error = %e, "private stream error — reconnecting"),
                }

                if attempt >= MAX_RECONNECT_ATTEMPTS {
                    error!(
                        account = %tag,
                        attempt,
                        "private stream reconnect attempts exhausted — surfacing fatal"
                    );
                    task_dispatcher.fatal(format!(
                        "private stream lost after {attempt} reconnect attempts"
                    ));
                    return;
                }

                tokio::time::sleep(backoff_delay(attempt)).await;
            }
        });

        dispatcher
    }
}

impl Default for StreamHub {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StreamHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHub")
            .field("ticker_connections", &self.tickers.lock().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscription_refcount_lifecycle() {
        let hub = StreamHub::new();

        let sub_a = hub.subscribe_ticker("DOGEUSDT", true, |_| {});
        let sub_b = hub.subscribe_ticker("DOGEUSDT", true, |_| {});

        {
            let tickers = hub.tickers.lock();
            let share = tickers.get(&("DOGEUSDT".to_string(), true)).unwrap();
            assert_eq!(share.refcount.load(Ordering::SeqCst), 2);
            assert_eq!(share.subscribers.read().len(), 2);
        }

        drop(sub_a);
        drop(sub_b);

        let tickers = hub.tickers.lock();
        let share = tickers.get(&("DOGEUSDT".to_string(), true)).unwrap();
        assert_eq!(share.refcount.load(Ordering::SeqCst), 0);
        assert!(share.subscribers.read().is_empty());
    }

    #[tokio::test]
    async fn separate_envs_get_separate_connections() {
        let hub = StreamHub::new();
        let _a = hub.subscribe_ticker("DOGEUSDT", true, |_| {});
        let _b = hub.subscribe_ticker("DOGEUSDT", false, |_| {});
        assert_eq!(hub.tickers.lock().len(), 2);
    }
}
