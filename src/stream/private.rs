// =============================================================================
// Private Stream — authenticated position/wallet/order/execution feed
// =============================================================================
//
// One connection per account. Authentication signs `GET/realtime{expires}`
// with the account secret; after auth the four topics are subscribed in one
// frame. Parsed events are handed to the dispatcher, which enqueues them for
// the account runtime — no exchange commands run on this task.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::stream::{HEARTBEAT_INTERVAL_SECS, HEARTBEAT_TIMEOUT_SECS};
use crate::types::{ExecutionEvent, OrderEvent, OrderStatus, PositionEvent, Side, WalletSnapshot};

type HmacSha256 = Hmac<Sha256>;

fn private_ws_url(demo: bool) -> &'static str {
    if demo {
        "wss://stream-demo.bybit.com/v5/private"
    } else {
        "wss://stream.bybit.com/v5/private"
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Typed callbacks installed by the account runtime.
pub struct PrivateCallbacks {
    pub position: Box<dyn Fn(PositionEvent) + Send + Sync>,
    pub wallet: Box<dyn Fn(WalletSnapshot) + Send + Sync>,
    pub order: Box<dyn Fn(OrderEvent) + Send + Sync>,
    pub execution: Box<dyn Fn(ExecutionEvent) + Send + Sync>,
    /// Invoked once when reconnection attempts are exhausted.
    pub fatal: Box<dyn Fn(String) + Send + Sync>,
}

/// Routes parsed frames into the account callbacks, honouring the pause gate.
///
/// While paused, order updates and non-close position deltas are suppressed
/// so a reconciler critical section is not disturbed by its own command
/// echoes. CLOSE events (size == 0), wallet updates, and executions always
/// go through.
pub struct PrivateDispatcher {
    account_tag: String,
    callbacks: PrivateCallbacks,
    paused: AtomicBool,
}

impl PrivateDispatcher {
    pub fn new(account_tag: &str, callbacks: PrivateCallbacks) -> Self {
        Self {
            account_tag: account_tag.to_string(),
            callbacks,
            paused: AtomicBool::new(false),
        }
    }

    pub fn pause_callbacks(&self) {
        self.paused.store(true, Ordering::SeqCst);
        debug!(account = %self.account_tag, "private callbacks paused");
    }

    pub fn resume_callbacks(&self) {
        self.paused.store(false, Ordering::SeqCst);
        debug!(account = %self.account_tag, "private callbacks resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn dispatch_position(&self, event: PositionEvent) {
        if self.is_paused() && event.size > 0.0 {
            debug!(
                account = %self.account_tag,
                symbol = %event.symbol,
                "position delta suppressed during pause"
            );
            return;
        }
        (self.callbacks.position)(event);
    }

    fn dispatch_order(&self, event: OrderEvent) {
        if self.is_paused() {
            debug!(
                account = %self.account_tag,
                order_id = %event.order_id,
                "order update suppressed during pause"
            );
            return;
        }
        (self.callbacks.order)(event);
    }

    pub fn fatal(&self, reason: String) {
        (self.callbacks.fatal)(reason);
    }
}

// ---------------------------------------------------------------------------
// Connection lifetime
// ---------------------------------------------------------------------------

/// Auth signature for the private stream: HMAC-SHA256 of `GET/realtime{expires}`.
pub fn auth_signature(secret: &str, expires: u64) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(format!("GET/realtime{expires}").as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Run one connection lifetime. Returns on disconnect/silence so the hub can
/// reconnect with backoff.
pub async fn run_private_stream(
    api_key: &str,
    secret: &str,
    demo: bool,
    dispatcher: Arc<PrivateDispatcher>,
) -> Result<()> {
    let url = private_ws_url(demo);
    info!(account = %dispatcher.account_tag, url, "connecting to private stream");

    let (ws_stream, _response) = connect_async(url)
        .await
        .context("failed to connect to private stream")?;
    let (mut write, mut read) = ws_stream.split();

    let expires = chrono::Utc::now().timestamp_millis() as u64 + 10_000;
    let auth = serde_json::json!({
        "op": "auth",
        "args": [api_key, expires, auth_signature(secret, expires)],
    });
    write
        .send(Message::Text(auth.to_string()))
        .await
        .context("failed to send auth frame")?;

    let sub = serde_json::json!({
        "op": "subscribe",
        "args": ["position", "wallet", "order", "execution"],
    });
    write
        .send(Message::Text(sub.to_string()))
        .await
        .context("failed to subscribe to private topics")?;

    info!(account = %dispatcher.account_tag, "private stream connected");

    let mut ping = tokio::time::interval(std::time::Duration::from_secs(HEARTBEAT_INTERVAL_SECS));
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_message = tokio::time::Instant::now();

    loop {
        tokio::select! {
            _ = ping.tick() => {
                if last_message.elapsed().as_secs() > HEARTBEAT_TIMEOUT_SECS {
                    warn!(account = %dispatcher.account_tag, "private stream silent — forcing reconnect");
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
                        handle_frame(&dispatcher, &text);
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        last_message = tokio::time::Instant::now();
                        write.send(Message::Pong(payload)).await.ok();
                    }
                    Some(Ok(_)) => {
                        last_message = tokio::time::Instant::now();
                    }
                    Some(Err(e)) => {
                        warn!(account = %dispatcher.account_tag, error = %e, "private stream read error");
                        return Err(e.into());
                    }
                    None => {
                        warn!(account = %dispatcher.account_tag, "private stream ended");
                        return Ok(());
                    }
                }
            }
        }
    }
}

fn handle_frame(dispatcher: &PrivateDispatcher, text: &str) {
    let root: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "failed to parse private frame");
            return;
        }
    };

    // Control frames: auth/subscribe acks and pongs.
    if let Some(op) = root["op"].as_str() {
        if op == "auth" && !root["success"].as_bool().unwrap_or(true) {
            warn!(frame = %root, "private stream auth rejected");
        }
        return;
    }

    let topic = match root["topic"].as_str() {
        Some(t) => t,
        None => return,
    };

    match topic {
        "position" => {
            for event in parse_position_frame(&root) {
                dispatcher.dispatch_position(event);
            }
        }
        "wallet" => {
            if let Some(snapshot) = parse_wallet_frame(&root) {
                (dispatcher.callbacks.wallet)(snapshot);
            }
        }
        "order" => {
            for event in parse_order_frame(&root) {
                dispatcher.dispatch_order(event);
            }
        }
        "execution" => {
            for event in parse_execution_frame(&root) {
                (dispatcher.callbacks.execution)(event);
            }
        }
        other => debug!(topic = other, "ignoring unknown private topic"),
    }
}

// ---------------------------------------------------------------------------
// Frame parsing
// ---------------------------------------------------------------------------

fn str_f64(v: &serde_json::Value) -> f64 {
    v.as_str().and_then(|s| s.parse().ok()).or_else(|| v.as_f64()).unwrap_or(0.0)
}

pub fn parse_position_frame(root: &serde_json::Value) -> Vec<PositionEvent> {
    let mut events = Vec::new();
    for item in root["data"].as_array().map(|a| a.as_slice()).unwrap_or(&[]) {
        let idx = item["positionIdx"].as_u64().unwrap_or(0) as u8;
        let side = match Side::from_position_idx(idx) {
            Some(s) => s,
            // positionIdx 0 is one-way mode, which this engine never runs.
            None => continue,
        };
        events.push(PositionEvent {
            symbol: item["symbol"].as_str().unwrap_or("").to_string(),
            side,
            size: str_f64(&item["size"]),
            avg_price: str_f64(&item["entryPrice"]),
            cum_realised_pnl: str_f64(&item["cumRealisedPnl"]),
        });
    }
    events
}

pub fn parse_wallet_frame(root: &serde_json::Value) -> Option<WalletSnapshot> {
    let item = root["data"].as_array()?.first()?;
    Some(WalletSnapshot {
        total_equity: str_f64(&item["totalEquity"]),
        total_available_balance: str_f64(&item["totalAvailableBalance"]),
        total_initial_margin: str_f64(&item["totalInitialMargin"]),
        total_order_im: str_f64(&item["totalOrderIM"]),
        total_maintenance_margin: str_f64(&item["totalMaintenanceMargin"]),
        account_mm_rate_percent: str_f64(&item["accountMMRate"]) * 100.0,
    })
}

pub fn parse_order_frame(root: &serde_json::Value) -> Vec<OrderEvent> {
    let mut events = Vec::new();
    for item in root["data"].as_array().map(|a| a.as_slice()).unwrap_or(&[]) {
        let status = match item["orderStatus"].as_str().and_then(OrderStatus::parse) {
            Some(s) => s,
            None => continue,
        };
        events.push(OrderEvent {
            order_id: item["orderId"].as_str().unwrap_or("").to_string(),
            symbol: item["symbol"].as_str().unwrap_or("").to_string(),
            side: item["side"].as_str().unwrap_or("").to_string(),
            qty: str_f64(&item["qty"]),
            price: str_f64(&item["price"]),
            order_type: item["orderType"].as_str().unwrap_or("").to_string(),
            order_status: status,
            reduce_only: item["reduceOnly"].as_bool().unwrap_or(false),
            position_idx: item["positionIdx"].as_u64().unwrap_or(0) as u8,
        });
    }
    events
}

pub fn parse_execution_frame(root: &serde_json::Value) -> Vec<ExecutionEvent> {
    let mut events = Vec::new();
    for item in root["data"].as_array().map(|a| a.as_slice()).unwrap_or(&[]) {
        let exec_qty = str_f64(&item["execQty"]);
        if exec_qty <= 0.0 {
            continue;
        }
        // Bybit does not echo reduceOnly on executions; a non-zero closedSize
        // identifies a reducing fill.
        let reduce_only = item["reduceOnly"]
            .as_bool()
            .unwrap_or_else(|| str_f64(&item["closedSize"]) > 0.0);
        events.push(ExecutionEvent {
            order_id: item["orderId"].as_str().unwrap_or("").to_string(),
            symbol: item["symbol"].as_str().unwrap_or("").to_string(),
            side: item["side"].as_str().unwrap_or("").to_string(),
            exec_qty,
            exec_price: str_f64(&item["execPrice"]),
            reduce_only,
        });
    }
    events
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn auth_signature_shape() {
        let sig = auth_signature("secret", 1_700_000_010_000);
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
        // Signature covers expires.
        assert_ne!(sig, auth_signature("secret", 1_700_000_010_001));
    }

    #[test]
    fn parse_position_events() {
        let root: serde_json::Value = serde_json::from_str(
            r#"{
                "topic": "position",
                "data": [
                    { "symbol": "DOGEUSDT", "positionIdx": 1, "size": "300",
                      "entryPrice": "0.25", "cumRealisedPnl": "1.5" },
                    { "symbol": "DOGEUSDT", "positionIdx": 2, "size": "0",
                      "entryPrice": "0", "cumRealisedPnl": "-0.3" },
                    { "symbol": "BTCUSDT", "positionIdx": 0, "size": "1" }
                ]
            }"#,
        )
        .unwrap();
        let events = parse_position_frame(&root);
        assert_eq!(events.len(), 2, "one-way entries are skipped");
        assert_eq!(events[0].side, Side::Long);
        assert_eq!(events[0].size, 300.0);
        assert_eq!(events[1].side, Side::Short);
        assert_eq!(events[1].size, 0.0, "close event");
    }

    #[test]
    fn parse_wallet_event() {
        let root: serde_json::Value = serde_json::from_str(
            r#"{
                "topic": "wallet",
                "data": [{
                    "totalEquity": "500.5", "totalAvailableBalance": "400",
                    "totalInitialMargin": "80", "totalOrderIM": "5",
                    "totalMaintenanceMargin": "12", "accountMMRate": "0.024"
                }]
            }"#,
        )
        .unwrap();
        let snap = parse_wallet_frame(&root).unwrap();
        assert_eq!(snap.total_available_balance, 400.0);
        assert!((snap.account_mm_rate_percent - 2.4).abs() < 1e-12);
    }

    #[test]
    fn parse_order_event_skips_untracked_statuses() {
        let root: serde_json::Value = serde_json::from_str(
            r#"{
                "topic": "order",
                "data": [
                    { "orderId": "o1", "symbol": "DOGEUSDT", "side": "Sell",
                      "qty": "300", "price": "0.2527", "orderType": "Limit",
                      "orderStatus": "Filled", "reduceOnly": true, "positionIdx": 1 },
                    { "orderId": "o2", "symbol": "DOGEUSDT", "side": "Buy",
                      "qty": "300", "price": "0.24", "orderType": "Limit",
                      "orderStatus": "Untriggered", "reduceOnly": false, "positionIdx": 1 }
                ]
            }"#,
        )
        .unwrap();
        let events = parse_order_frame(&root);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].order_status, OrderStatus::Filled);
        assert!(events[0].reduce_only);
    }

    #[test]
    fn parse_execution_infers_reduce_from_closed_size() {
        let root: serde_json::Value = serde_json::from_str(
            r#"{
                "topic": "execution",
                "data": [
                    { "orderId": "o1", "symbol": "DOGEUSDT", "side": "Sell",
                      "execQty": "300", "execPrice": "0.2527", "closedSize": "300" },
                    { "orderId": "o2", "symbol": "DOGEUSDT", "side": "Buy",
                      "execQty": "600", "execPrice": "0.2475", "closedSize": "0" }
                ]
            }"#,
        )
        .unwrap();
        let events = parse_execution_frame(&root);
        assert_eq!(events.len(), 2);
        assert!(events[0].reduce_only);
        assert_eq!(events[0].closing_side(), Some(Side::Long));
        assert!(!events[1].reduce_only);
        assert_eq!(events[1].opening_side(), Some(Side::Long));
    }

    #[test]
    fn pause_gate_suppresses_deltas_but_not_closes() {
        let position_count = Arc::new(AtomicUsize::new(0));
        let order_count = Arc::new(AtomicUsize::new(0));

        let pc = position_count.clone();
        let oc = order_count.clone();
        let dispatcher = PrivateDispatcher::new(
            "001",
            PrivateCallbacks {
                position: Box::new(move |_| {
                    pc.fetch_add(1, Ordering::SeqCst);
                }),
                wallet: Box::new(|_| {}),
                order: Box::new(move |_| {
                    oc.fetch_add(1, Ordering::SeqCst);
                }),
                execution: Box::new(|_| {}),
                fatal: Box::new(|_| {}),
            },
        );

        let delta = PositionEvent {
            symbol: "DOGEUSDT".into(),
            side: Side::Long,
            size: 300.0,
            avg_price: 0.25,
            cum_realised_pnl: 0.0,
        };
        let close = PositionEvent { size: 0.0, ..delta.clone() };
        let order = OrderEvent {
            order_id: "o1".into(),
            symbol: "DOGEUSDT".into(),
            side: "Buy".into(),
            qty: 1.0,
            price: 1.0,
            order_type: "Limit".into(),
            order_status: OrderStatus::New,
            reduce_only: false,
            position_idx: 1,
        };

        dispatcher.pause_callbacks();
        dispatcher.dispatch_position(delta.clone());
        dispatcher.dispatch_position(close.clone());
        dispatcher.dispatch_order(order.clone());
        assert_eq!(position_count.load(Ordering::SeqCst), 1, "only the close passed");
        assert_eq!(order_count.load(Ordering::SeqCst), 0);

        dispatcher.resume_callbacks();
        dispatcher.dispatch_position(delta);
        dispatcher.dispatch_order(order);
        assert_eq!(position_count.load(Ordering::SeqCst), 2);
        assert_eq!(order_count.load(Ordering::SeqCst), 1);
    }
}
