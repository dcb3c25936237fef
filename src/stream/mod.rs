// =============================================================================
// Stream Module — real-time WebSocket plumbing
// =============================================================================
//
// `hub` owns connection sharing and supervision; `public` and `private` hold
// the per-connection read loops and message parsing. Dispatch callbacks run
// on the connection tasks and must never issue REST calls directly — they
// enqueue events for the account runtime.
// =============================================================================

pub mod hub;
pub mod private;
pub mod public;

pub use hub::StreamHub;

use std::time::Duration;

/// Reconnect attempts before a connection is declared dead.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Interval between protocol pings.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 20;

/// Silence window after which the connection is forced down. Bybit answers
/// every ping, so a quiet socket is a dead socket.
pub const HEARTBEAT_TIMEOUT_SECS: u64 = 30;

/// Exponential reconnect backoff: `min(1s * 2^attempt, 60s)`.
pub fn backoff_delay(attempt: u32) -> Duration {
    let exp = attempt.min(6); // 2^6 = 64 already exceeds the cap
    Duration::from_secs((1u64 << exp).min(60))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_delay(0), Duration::from_secs(1));
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(5), Duration::from_secs(32));
        assert_eq!(backoff_delay(6), Duration::from_secs(60));
        assert_eq!(backoff_delay(100), Duration::from_secs(60));
    }
}
