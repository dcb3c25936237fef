// =============================================================================
// Bybit v5 REST API Client — HMAC-SHA256 signed requests
// =============================================================================
//
// SECURITY: The secret key is never logged or serialized. Signed requests
// carry X-BAPI-* headers; the signature covers
// `timestamp + api_key + recv_window + payload` where payload is the query
// string for GET and the JSON body for POST. recvWindow is 5 000 ms to
// tolerate minor clock drift between the bot and Bybit servers.
//
// Dry-run mode short-circuits every mutating endpoint with a synthetic
// response so the decision paths can run against live streams without
// touching the account.
// =============================================================================

use anyhow::{Context, Result};
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, instrument, warn};

use crate::bybit::rate_limit::RateLimitTracker;
use crate::types::{OrderType, Side, WalletSnapshot};

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

const MAINNET_URL: &str = "https://api.bybit.com";
const DEMO_URL: &str = "https://api-demo.bybit.com";

// retCode values Bybit returns for idempotent no-op mutations.
const RET_LEVERAGE_NOT_MODIFIED: i64 = 110_043;
const RET_POSITION_MODE_NOT_MODIFIED: i64 = 110_025;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

/// Position snapshot for one side of a hedged symbol.
#[derive(Debug, Clone, Copy, Default)]
pub struct PositionSnapshot {
    pub size: f64,
    pub avg_price: f64,
}

/// One open order as returned by `/v5/order/realtime`.
#[derive(Debug, Clone)]
pub struct OpenOrder {
    pub order_id: String,
    pub side: String,
    pub qty: f64,
    pub price: f64,
    pub reduce_only: bool,
    pub position_idx: u8,
}

/// One historical order as returned by `/v5/order/history` (newest first).
#[derive(Debug, Clone)]
pub struct HistoricalOrder {
    pub order_id: String,
    pub side: String,
    pub order_status: String,
    pub reduce_only: bool,
    pub position_idx: u8,
    pub cum_exec_qty: f64,
    pub avg_price: f64,
    pub created_time: i64,
}

/// One OHLC bar from `/v5/market/kline`, oldest first after client reordering.
#[derive(Debug, Clone, Copy)]
pub struct Kline {
    pub start: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Bybit v5 REST client with HMAC-SHA256 request signing.
#[derive(Clone)]
pub struct BybitClient {
    api_key: String,
    secret: String,
    base_url: String,
    dry_run: bool,
    client: reqwest::Client,
    rate_limit: Arc<RateLimitTracker>,
}

impl BybitClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Create a new `BybitClient`.
    ///
    /// # Arguments
    /// * `api_key` — Bybit API key (sent as a header, never in query params).
    /// * `secret`  — Bybit secret key used exclusively for HMAC signing.
    /// * `demo`    — route to the demo-trading environment.
    /// * `dry_run` — log mutating calls instead of sending them.
    pub fn new(
        api_key: impl Into<String>,
        secret: impl Into<String>,
        demo: bool,
        dry_run: bool,
    ) -> Self {
        let api_key = api_key.into();
        let secret = secret.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-BAPI-API-KEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        let base_url = if demo { DEMO_URL } else { MAINNET_URL };
        debug!(base_url, dry_run, "BybitClient initialised");

        Self {
            api_key,
            secret,
            base_url: base_url.to_string(),
            dry_run,
            client,
            rate_limit: Arc::new(RateLimitTracker::new()),
        }
    }

    pub fn rate_limit(&self) -> &Arc<RateLimitTracker> {
        &self.rate_limit
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// HMAC-SHA256 hex signature over `timestamp + api_key + recv_window + payload`.
    fn sign(&self, timestamp: u64, payload: &str) -> String {
        let message = format!("{timestamp}{}{RECV_WINDOW}{payload}", self.api_key);
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(message.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Current UNIX timestamp in milliseconds.
    pub fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    fn auth_headers(&self, timestamp: u64, payload: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Ok(v) = HeaderValue::from_str(&timestamp.to_string()) {
            headers.insert("X-BAPI-TIMESTAMP", v);
        }
        if let Ok(v) = HeaderValue::from_str(&RECV_WINDOW.to_string()) {
            headers.insert("X-BAPI-RECV-WINDOW", v);
        }
        if let Ok(v) = HeaderValue::from_str(&self.sign(timestamp, payload)) {
            headers.insert("X-BAPI-SIGN", v);
        }
        headers
    }

    /// GET a signed endpoint and return the `result` object.
    async fn signed_get(&self, path: &str, query: &str) -> Result<serde_json::Value> {
        let ts = Self::timestamp_ms();
        let url = if query.is_empty() {
            format!("{}{path}", self.base_url)
        } else {
            format!("{}{path}?{query}", self.base_url)
        };

        let resp = self
            .client
            .get(&url)
            .headers(self.auth_headers(ts, query))
            .send()
            .await
            .with_context(|| format!("GET {path} request failed"))?;

        self.rate_limit.update_from_headers(resp.headers());
        Self::unwrap_envelope(path, resp).await
    }

    /// POST a signed endpoint with a JSON body and return the `result` object.
    async fn signed_post(&self, path: &str, body: &serde_json::Value) -> Result<serde_json::Value> {
        let ts = Self::timestamp_ms();
        let payload = body.to_string();
        let url = format!("{}{path}", self.base_url);

        let resp = self
            .client
            .post(&url)
            .headers(self.auth_headers(ts, &payload))
            .header("Content-Type", "application/json")
            .body(payload)
            .send()
            .await
            .with_context(|| format!("POST {path} request failed"))?;

        self.rate_limit.update_from_headers(resp.headers());
        Self::unwrap_envelope(path, resp).await
    }

    /// Public (unsigned) GET.
    async fn public_get(&self, path: &str, query: &str) -> Result<serde_json::Value> {
        let url = format!("{}{path}?{query}", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {path} request failed"))?;
        Self::unwrap_envelope(path, resp).await
    }

    /// Every v5 response is `{retCode, retMsg, result}`. Non-zero retCode is
    /// an exchange rejection; idempotent no-ops are tolerated by the callers
    /// that expect them.
    async fn unwrap_envelope(path: &str, resp: reqwest::Response) -> Result<serde_json::Value> {
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse {path} response"))?;

        if !status.is_success() {
            anyhow::bail!("Bybit {path} returned HTTP {status}: {body}");
        }

        let ret_code = body["retCode"].as_i64().unwrap_or(-1);
        if ret_code != 0 {
            anyhow::bail!(
                "Bybit {path} rejected: retCode={} retMsg={} [retCode:{}]",
                ret_code,
                body["retMsg"].as_str().unwrap_or("?"),
                ret_code
            );
        }

        Ok(body["result"].clone())
    }

    fn ret_code_of(err: &anyhow::Error) -> Option<i64> {
        let text = format!("{err}");
        let marker = text.rfind("[retCode:")?;
        let tail = &text[marker + 9..];
        let end = tail.find(']')?;
        tail[..end].parse().ok()
    }

    // -------------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------------

    /// POST /v5/order/create — submit an order and return its orderId.
    ///
    /// `position_idx` addresses the hedge-mode leg (1 = Long, 2 = Short).
    #[instrument(skip(self, price, order_link_id), name = "bybit::place_order")]
    #[allow(clippy::too_many_arguments)]
    pub async fn place_order(
        &self,
        symbol: &str,
        side: &str,
        qty: f64,
        order_type: OrderType,
        price: Option<f64>,
        reduce_only: bool,
        position_idx: u8,
        order_link_id: Option<&str>,
    ) -> Result<String> {
        if self.dry_run {
            let synthetic = format!("dry-{}", uuid::Uuid::new_v4());
            info!(
                symbol,
                side,
                qty,
                order_type = order_type.as_str(),
                price = ?price,
                reduce_only,
                position_idx,
                order_id = %synthetic,
                "[dry-run] order not sent"
            );
            return Ok(synthetic);
        }

        if !self.rate_limit.can_place_order() {
            anyhow::bail!("order rate limit reached for {symbol} {side}");
        }

        let mut body = serde_json::json!({
            "category": "linear",
            "symbol": symbol,
            "side": side,
            "orderType": order_type.as_str(),
            "qty": format!("{qty}"),
            "reduceOnly": reduce_only,
            "positionIdx": position_idx,
        });
        if let Some(p) = price {
            body["price"] = serde_json::json!(format!("{p}"));
            body["timeInForce"] = serde_json::json!("GTC");
        }
        if let Some(link) = order_link_id {
            body["orderLinkId"] = serde_json::json!(link);
        }

        debug!(symbol, side, qty, order_type = order_type.as_str(), "placing order");
        let result = self.signed_post("/v5/order/create", &body).await?;
        self.rate_limit.record_order_sent();

        let order_id = result["orderId"]
            .as_str()
            .context("order response missing orderId")?
            .to_string();

        debug!(symbol, side, order_id = %order_id, "order placed");
        Ok(order_id)
    }

    /// POST /v5/order/cancel.
    #[instrument(skip(self), name = "bybit::cancel_order")]
    pub async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<()> {
        if self.dry_run {
            info!(symbol, order_id, "[dry-run] cancel not sent");
            return Ok(());
        }

        let body = serde_json::json!({
            "category": "linear",
            "symbol": symbol,
            "orderId": order_id,
        });

        debug!(symbol, order_id, "cancelling order");
        self.signed_post("/v5/order/cancel", &body).await?;
        debug!(symbol, order_id, "order cancelled");
        Ok(())
    }

    /// GET /v5/order/realtime — open orders for a symbol.
    #[instrument(skip(self), name = "bybit::get_open_orders")]
    pub async fn get_open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>> {
        let query = format!("category=linear&symbol={symbol}");
        let result = self.signed_get("/v5/order/realtime", &query).await?;

        let list = result["list"].as_array().cloned().unwrap_or_default();
        let mut orders = Vec::with_capacity(list.len());
        for o in &list {
            orders.push(OpenOrder {
                order_id: o["orderId"].as_str().unwrap_or("").to_string(),
                side: o["side"].as_str().unwrap_or("").to_string(),
                qty: Self::parse_str_f64(&o["qty"]).unwrap_or(0.0),
                price: Self::parse_str_f64(&o["price"]).unwrap_or(0.0),
                reduce_only: o["reduceOnly"].as_bool().unwrap_or(false),
                position_idx: o["positionIdx"].as_u64().unwrap_or(0) as u8,
            });
        }

        debug!(symbol, count = orders.len(), "open orders retrieved");
        Ok(orders)
    }

    /// GET /v5/order/history — one page of filled orders, newest first.
    ///
    /// Returns the page plus the cursor for the next one (`None` when
    /// exhausted).
    #[instrument(skip(self, cursor), name = "bybit::get_order_history")]
    pub async fn get_order_history(
        &self,
        symbol: &str,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<(Vec<HistoricalOrder>, Option<String>)> {
        let mut query =
            format!("category=linear&symbol={symbol}&orderStatus=Filled&limit={limit}");
        if let Some(c) = cursor {
            query.push_str(&format!("&cursor={}", urlencode(c)));
        }

        let result = self.signed_get("/v5/order/history", &query).await?;

        let list = result["list"].as_array().cloned().unwrap_or_default();
        let mut orders = Vec::with_capacity(list.len());
        for o in &list {
            orders.push(HistoricalOrder {
                order_id: o["orderId"].as_str().unwrap_or("").to_string(),
                side: o["side"].as_str().unwrap_or("").to_string(),
                order_status: o["orderStatus"].as_str().unwrap_or("").to_string(),
                reduce_only: o["reduceOnly"].as_bool().unwrap_or(false),
                position_idx: o["positionIdx"].as_u64().unwrap_or(0) as u8,
                cum_exec_qty: Self::parse_str_f64(&o["cumExecQty"]).unwrap_or(0.0),
                avg_price: Self::parse_str_f64(&o["avgPrice"]).unwrap_or(0.0),
                created_time: o["createdTime"]
                    .as_str()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0),
            });
        }

        let next = result["nextPageCursor"]
            .as_str()
            .filter(|c| !c.is_empty())
            .map(|c| c.to_string());

        debug!(symbol, count = orders.len(), has_next = next.is_some(), "order history page");
        Ok((orders, next))
    }

    /// Check whether an order id is still known to the exchange (open orders
    /// and recent history).
    #[instrument(skip(self), name = "bybit::order_exists")]
    pub async fn order_exists(&self, symbol: &str, order_id: &str) -> Result<bool> {
        let query = format!("category=linear&symbol={symbol}&orderId={order_id}");

        let open = self.signed_get("/v5/order/realtime", &query).await?;
        if open["list"].as_array().map(|l| !l.is_empty()).unwrap_or(false) {
            return Ok(true);
        }

        let hist = self.signed_get("/v5/order/history", &query).await?;
        Ok(hist["list"].as_array().map(|l| !l.is_empty()).unwrap_or(false))
    }

    // -------------------------------------------------------------------------
    // Positions
    // -------------------------------------------------------------------------

    /// GET /v5/position/list — snapshot of one hedge leg.
    #[instrument(skip(self), name = "bybit::get_active_position")]
    pub async fn get_active_position(&self, symbol: &str, side: Side) -> Result<PositionSnapshot> {
        let query = format!("category=linear&symbol={symbol}");
        let result = self.signed_get("/v5/position/list", &query).await?;

        let list = result["list"].as_array().cloned().unwrap_or_default();
        for p in &list {
            let idx = p["positionIdx"].as_u64().unwrap_or(0) as u8;
            if idx == side.position_idx() {
                return Ok(PositionSnapshot {
                    size: Self::parse_str_f64(&p["size"]).unwrap_or(0.0),
                    avg_price: Self::parse_str_f64(&p["avgPrice"]).unwrap_or(0.0),
                });
            }
        }

        // No entry for the leg means flat.
        Ok(PositionSnapshot::default())
    }

    /// POST /v5/position/set-leverage. "Leverage not modified" is success.
    #[instrument(skip(self), name = "bybit::set_leverage")]
    pub async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()> {
        if self.dry_run {
            info!(symbol, leverage, "[dry-run] set-leverage not sent");
            return Ok(());
        }

        let body = serde_json::json!({
            "category": "linear",
            "symbol": symbol,
            "buyLeverage": format!("{leverage}"),
            "sellLeverage": format!("{leverage}"),
        });

        match self.signed_post("/v5/position/set-leverage", &body).await {
            Ok(_) => Ok(()),
            Err(e) if Self::ret_code_of(&e) == Some(RET_LEVERAGE_NOT_MODIFIED) => {
                debug!(symbol, leverage, "leverage already set");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// POST /v5/position/switch-mode — enable hedge mode (mode 3) for the
    /// symbol. "Position mode not modified" is success.
    #[instrument(skip(self), name = "bybit::set_position_mode")]
    pub async fn set_position_mode(&self, symbol: &str, hedge: bool) -> Result<()> {
        if self.dry_run {
            info!(symbol, hedge, "[dry-run] switch-mode not sent");
            return Ok(());
        }

        let body = serde_json::json!({
            "category": "linear",
            "symbol": symbol,
            "mode": if hedge { 3 } else { 0 },
        });

        match self.signed_post("/v5/position/switch-mode", &body).await {
            Ok(_) => Ok(()),
            Err(e) if Self::ret_code_of(&e) == Some(RET_POSITION_MODE_NOT_MODIFIED) => {
                debug!(symbol, hedge, "position mode already set");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    // -------------------------------------------------------------------------
    // Account
    // -------------------------------------------------------------------------

    /// GET /v5/account/wallet-balance (unified account totals).
    #[instrument(skip(self), name = "bybit::get_wallet")]
    pub async fn get_wallet(&self) -> Result<WalletSnapshot> {
        let result = self
            .signed_get("/v5/account/wallet-balance", "accountType=UNIFIED")
            .await?;

        let account = result["list"]
            .as_array()
            .and_then(|l| l.first().cloned())
            .context("wallet response missing account entry")?;

        let snapshot = WalletSnapshot {
            total_equity: Self::parse_str_f64(&account["totalEquity"]).unwrap_or(0.0),
            total_available_balance: Self::parse_str_f64(&account["totalAvailableBalance"])
                .unwrap_or(0.0),
            total_initial_margin: Self::parse_str_f64(&account["totalInitialMargin"])
                .unwrap_or(0.0),
            total_order_im: Self::parse_str_f64(&account["totalOrderIM"]).unwrap_or(0.0),
            total_maintenance_margin: Self::parse_str_f64(&account["totalMaintenanceMargin"])
                .unwrap_or(0.0),
            // accountMMRate arrives as a ratio string ("0.015").
            account_mm_rate_percent: Self::parse_str_f64(&account["accountMMRate"])
                .unwrap_or(0.0)
                * 100.0,
        };

        debug!(
            equity = snapshot.total_equity,
            available = snapshot.total_available_balance,
            mm_rate_pct = snapshot.account_mm_rate_percent,
            "wallet retrieved"
        );
        Ok(snapshot)
    }

    // -------------------------------------------------------------------------
    // Public market data
    // -------------------------------------------------------------------------

    /// GET /v5/market/tickers — last traded price for a symbol.
    #[instrument(skip(self), name = "bybit::get_ticker")]
    pub async fn get_ticker(&self, symbol: &str) -> Result<f64> {
        let query = format!("category=linear&symbol={symbol}");
        let result = self.public_get("/v5/market/tickers", &query).await?;

        let last = result["list"]
            .as_array()
            .and_then(|l| l.first())
            .map(|t| t["lastPrice"].clone())
            .context("ticker response missing list entry")?;

        let price = Self::parse_str_f64(&last)?;
        debug!(symbol, price, "ticker fetched");
        Ok(price)
    }

    /// GET /v5/market/kline — OHLC bars, reordered oldest-first.
    ///
    /// `interval` uses Bybit notation ("1" = one minute).
    #[instrument(skip(self), name = "bybit::get_klines")]
    pub async fn get_klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Kline>> {
        let query = format!("category=linear&symbol={symbol}&interval={interval}&limit={limit}");
        let result = self.public_get("/v5/market/kline", &query).await?;

        let raw = result["list"].as_array().cloned().unwrap_or_default();
        let mut klines = Vec::with_capacity(raw.len());

        // Bybit returns newest first: [startTime, open, high, low, close, ...]
        for entry in raw.iter().rev() {
            let arr = match entry.as_array() {
                Some(a) if a.len() >= 5 => a,
                _ => {
                    warn!(symbol, "skipping malformed kline entry");
                    continue;
                }
            };
            klines.push(Kline {
                start: arr[0].as_str().and_then(|s| s.parse().ok()).unwrap_or(0),
                open: Self::parse_str_f64(&arr[1])?,
                high: Self::parse_str_f64(&arr[2])?,
                low: Self::parse_str_f64(&arr[3])?,
                close: Self::parse_str_f64(&arr[4])?,
            });
        }

        debug!(symbol, interval, count = klines.len(), "klines fetched");
        Ok(klines)
    }

    // -------------------------------------------------------------------------
    // Internal helpers
    // -------------------------------------------------------------------------

    /// Parse a JSON value that may be either a string or a number into `f64`.
    fn parse_str_f64(val: &serde_json::Value) -> Result<f64> {
        if let Some(s) = val.as_str() {
            if s.is_empty() {
                return Ok(0.0);
            }
            s.parse::<f64>()
                .with_context(|| format!("failed to parse '{s}' as f64"))
        } else if let Some(n) = val.as_f64() {
            Ok(n)
        } else {
            anyhow::bail!("expected string or number, got: {val}")
        }
    }
}

/// Minimal percent-encoding for cursor values embedded in query strings.
fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

impl std::fmt::Debug for BybitClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BybitClient")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("dry_run", &self.dry_run)
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
    fn signature_is_deterministic_hex() {
        let client = BybitClient::new("key", "secret", true, true);
        let a = client.sign(1_700_000_000_000, "category=linear&symbol=DOGEUSDT");
        let b = client.sign(1_700_000_000_000, "category=linear&symbol=DOGEUSDT");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));

        let c = client.sign(1_700_000_000_001, "category=linear&symbol=DOGEUSDT");
        assert_ne!(a, c, "timestamp must be part of the signed message");
    }

    #[test]
    fn parse_str_f64_accepts_both_shapes() {
        assert_eq!(
            BybitClient::parse_str_f64(&serde_json::json!("0.25")).unwrap(),
            0.25
        );
        assert_eq!(
            BybitClient::parse_str_f64(&serde_json::json!(0.25)).unwrap(),
            0.25
        );
        assert_eq!(BybitClient::parse_str_f64(&serde_json::json!("")).unwrap(), 0.0);
        assert!(BybitClient::parse_str_f64(&serde_json::json!("abc")).is_err());
        assert!(BybitClient::parse_str_f64(&serde_json::json!(null)).is_err());
    }

    #[test]
    fn ret_code_extraction() {
        let err = anyhow::anyhow!(
            "Bybit /v5/position/set-leverage rejected: retCode=110043 retMsg=leverage not modified [retCode:110043]"
        );
        assert_eq!(BybitClient::ret_code_of(&err), Some(110_043));

        let other = anyhow::anyhow!("connection reset");
        assert_eq!(BybitClient::ret_code_of(&other), None);
    }

    #[test]
    fn cursor_urlencoding() {
        assert_eq!(urlencode("abc123"), "abc123");
        assert_eq!(urlencode("a%b c"), "a%25b%20c");
    }

    #[test]
    fn debug_redacts_credentials() {
        let client = BybitClient::new("real-key", "real-secret", false, false);
        let debug = format!("{client:?}");
        assert!(!debug.contains("real-key"));
        assert!(!debug.contains("real-secret"));
        assert!(debug.contains("<redacted>"));
    }
}
