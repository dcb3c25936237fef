// =============================================================================
// Public Ticker Stream — one shared connection per (symbol, env)
// =============================================================================
//
// Bybit v5 public linear stream. Ticker frames come as a snapshot followed by
// deltas; `lastPrice` may be absent from a delta, in which case the previous
// value carries forward.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::stream::{HEARTBEAT_INTERVAL_SECS, HEARTBEAT_TIMEOUT_SECS};
use crate::types::TickerEvent;

/// Shared fan-out list for one ticker connection.
pub type TickerCallback = Arc<dyn Fn(&TickerEvent) + Send + Sync>;

fn public_ws_url(demo: bool) -> &'static str {
    if demo {
        "wss://stream-demo.bybit.com/v5/public/linear"
    } else {
        "wss://stream.bybit.com/v5/public/linear"
    }
}

/// A parsed ticker frame. `last_price` is `None` for deltas that did not
/// touch the price.
#[derive(Debug, Clone, PartialEq)]
pub struct TickerFrame {
    pub symbol: String,
    pub last_price: Option<f64>,
    pub ts: i64,
}

/// Run one connection lifetime for a symbol's ticker stream. Returns when the
/// stream drops or goes silent so the hub can reconnect with backoff.
///
/// `subscribers` is the hub's live list; entries carry their subscription id.
pub async fn run_ticker_stream(
    symbol: &str,
    demo: bool,
    subscribers: Arc<parking_lot::RwLock<Vec<(u64, TickerCallback)>>>,
) -> Result<()> {
    let url = public_ws_url(demo);
    info!(symbol, url, "connecting to public ticker stream");

    let (ws_stream, _response) = connect_async(url)
        .await
        .context("failed to connect to public ticker stream")?;
    let (mut write, mut read) = ws_stream.split();

    let sub = serde_json::json!({ "op": "subscribe", "args": [format!("tickers.{symbol}")] });
    write
        .send(Message::Text(sub.to_string()))
        .await
        .context("failed to subscribe to ticker topic")?;

    info!(symbol, "ticker stream connected");

    let mut ping = tokio::time::interval(std::time::Duration::from_secs(HEARTBEAT_INTERVAL_SECS));
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_message = tokio::time::Instant::now();
    let mut last_price = 0.0_f64;

    loop {
        tokio::select! {
            _ = ping.tick() => {
                if last_message.elapsed().as_secs() > HEARTBEAT_TIMEOUT_SECS {
                    warn!(symbol, "ticker stream silent — forcing reconnect");
                    return Ok(());
                }
                let ping_msg = serde_json::json!({ "op": "ping" });
                write
                    .send(Message::Text(ping_msg.to_string()))
                    .await
                    .context("failed to send ping")?;
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        last_message = tokio::time::Instant::now();
                        if let Some(frame) = parse_ticker_frame(&text) {
                            if let Some(price) = frame.last_price {
                                last_price = price;
                            }
                            if last_price > 0.0 {
                                let event = TickerEvent {
                                    symbol: frame.symbol,
                                    last_price,
                                    ts: frame.ts,
                                };
                                // Copy callbacks out so downstream work never
                                // runs under the subscriber lock.
                                let callbacks: Vec<TickerCallback> = subscribers
                                    .read()
                                    .iter()
                                    .map(|(_, cb)| cb.clone())
                                    .collect();
                                for cb in callbacks {
                                    cb(&event);
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        last_message = tokio::time::Instant::now();
                        write.send(Message::Pong(payload)).await.ok();
                    }
                    Some(Ok(_)) => {
                        last_message = tokio::time::Instant::now();
                    }
                    Some(Err(e)) => {
                        warn!(symbol, error = %e, "ticker stream read error");
                        return Err(e.into());
                    }
                    None => {
                        warn!(symbol, "ticker stream ended");
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Parse a Bybit ticker frame.
///
/// Expected shape:
/// ```json
/// { "topic": "tickers.DOGEUSDT", "ts": 1700000000000,
///   "data": { "symbol": "DOGEUSDT", "lastPrice": "0.25" } }
/// ```
pub fn parse_ticker_frame(text: &str) -> Option<TickerFrame> {
    let root: serde_json::Value = serde_json::from_str(text).ok()?;

    let topic = root["topic"].as_str()?;
    if !topic.starts_with("tickers.") {
        debug!(topic, "ignoring non-ticker frame");
        return None;
    }

    let data = &root["data"];
    let symbol = data["symbol"]
        .as_str()
        .unwrap_or_else(|| topic.trim_start_matches("tickers."))
        .to_string();

    let last_price = data["lastPrice"]
        .as_str()
        .and_then(|s| s.parse::<f64>().ok())
        .filter(|p| *p > 0.0);

    Some(TickerFrame {
        symbol,
        last_price,
        ts: root["ts"].as_i64().unwrap_or(0),
    })
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_snapshot_frame() {
        let text = r#"{
            "topic": "tickers.DOGEUSDT",
            "type": "snapshot",
            "ts": 1700000000000,
            "data": { "symbol": "DOGEUSDT", "lastPrice": "0.25000" }
        }"#;
        let frame = parse_ticker_frame(text).unwrap();
        assert_eq!(frame.symbol, "DOGEUSDT");
        assert_eq!(frame.last_price, Some(0.25));
        assert_eq!(frame.ts, 1_700_000_000_000);
    }

    #[test]
    fn parse_delta_without_price() {
        let text = r#"{
            "topic": "tickers.DOGEUSDT",
            "type": "delta",
            "ts": 1700000001000,
            "data": { "symbol": "DOGEUSDT", "openInterest": "123" }
        }"#;
        let frame = parse_ticker_frame(text).unwrap();
        assert_eq!(frame.last_price, None, "delta without price carries forward");
    }

    #[test]
    fn non_ticker_frames_ignored() {
        assert!(parse_ticker_frame(r#"{"op":"pong"}"#).is_none());
        assert!(parse_ticker_frame(r#"{"success":true,"op":"subscribe"}"#).is_none());
        assert!(parse_ticker_frame("not json").is_none());
    }
}
