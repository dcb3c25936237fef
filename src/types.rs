// =============================================================================
// Shared types used across the Lattice hedge-grid engine
// =============================================================================
//
// Hedge mode: Long and Short positions coexist on the same symbol and are
// addressed by Bybit's positionIdx (1 = Long, 2 = Short). Opening a Long is a
// Buy order; opening a Short is a Sell. Reduce-only orders run the other way.
// =============================================================================

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Position side
// ---------------------------------------------------------------------------

/// One leg of a hedged position pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// Bybit positionIdx for this side in hedge mode.
    pub fn position_idx(self) -> u8 {
        match self {
            Self::Long => 1,
            Self::Short => 2,
        }
    }

    /// Order direction that *opens* (or adds to) this side.
    pub fn open_order_side(self) -> &'static str {
        match self {
            Self::Long => "Buy",
            Self::Short => "Sell",
        }
    }

    /// Order direction that *reduces* this side (take-profit direction).
    pub fn close_order_side(self) -> &'static str {
        match self {
            Self::Long => "Sell",
            Self::Short => "Buy",
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Self::Long => Self::Short,
            Self::Short => Self::Long,
        }
    }

    pub fn from_position_idx(idx: u8) -> Option<Self> {
        match idx {
            1 => Some(Self::Long),
            2 => Some(Self::Short),
            _ => None,
        }
    }

    pub const BOTH: [Side; 2] = [Side::Long, Side::Short];
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "Long"),
            Self::Short => write!(f, "Short"),
        }
    }
}

// ---------------------------------------------------------------------------
// Order enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
}

impl OrderType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Market => "Market",
            Self::Limit => "Limit",
        }
    }
}

/// Exchange order status as reported on the order stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    /// Parse a Bybit v5 `orderStatus` string. Unknown states map to `None`
    /// so callers can ignore intermediate statuses (e.g. "Untriggered").
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "New" => Some(Self::New),
            "PartiallyFilled" => Some(Self::PartiallyFilled),
            "Filled" => Some(Self::Filled),
            "Cancelled" | "Deactivated" => Some(Self::Cancelled),
            "Rejected" => Some(Self::Rejected),
            _ => None,
        }
    }

    /// Whether the order can no longer fill.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Filled | Self::Cancelled | Self::Rejected)
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::New => "New",
            Self::PartiallyFilled => "PartiallyFilled",
            Self::Filled => "Filled",
            Self::Cancelled => "Cancelled",
            Self::Rejected => "Rejected",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Typed stream events
// ---------------------------------------------------------------------------

/// Last-price update from the public ticker stream.
#[derive(Debug, Clone)]
pub struct TickerEvent {
    pub symbol: String,
    pub last_price: f64,
    pub ts: i64,
}

/// Position update from the private stream. `size == 0.0` is a CLOSE event.
#[derive(Debug, Clone)]
pub struct PositionEvent {
    pub symbol: String,
    pub side: Side,
    pub size: f64,
    pub avg_price: f64,
    pub cum_realised_pnl: f64,
}

/// Wallet update from the private stream (unified account totals).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct WalletSnapshot {
    pub total_equity: f64,
    pub total_available_balance: f64,
    pub total_initial_margin: f64,
    pub total_order_im: f64,
    pub total_maintenance_margin: f64,
    /// Maintenance margin / equity, in percent. Liquidation indicator.
    pub account_mm_rate_percent: f64,
}

/// Order update from the private stream.
#[derive(Debug, Clone)]
pub struct OrderEvent {
    pub order_id: String,
    pub symbol: String,
    /// "Buy" or "Sell".
    pub side: String,
    pub qty: f64,
    pub price: f64,
    pub order_type: String,
    pub order_status: OrderStatus,
    pub reduce_only: bool,
    pub position_idx: u8,
}

// ---------------------------------------------------------------------------
// Shared price cell
// ---------------------------------------------------------------------------

/// Last observed price for one symbol, shared between the strategy (writer)
/// and the risk controller (reader).
#[derive(Debug, Default)]
pub struct PriceCell(parking_lot::RwLock<f64>);

impl PriceCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, price: f64) {
        *self.0.write() = price;
    }

    /// Zero until the first tick lands.
    pub fn get(&self) -> f64 {
        *self.0.read()
    }
}

/// Fill confirmation from the private execution stream.
#[derive(Debug, Clone)]
pub struct ExecutionEvent {
    pub order_id: String,
    pub symbol: String,
    /// "Buy" or "Sell".
    pub side: String,
    pub exec_qty: f64,
    pub exec_price: f64,
    pub reduce_only: bool,
}

impl ExecutionEvent {
    /// The position side this execution *opens*, or `None` for reduce-only
    /// executions. In hedge mode a non-reduce-only Buy adds to the Long leg
    /// and a Sell adds to the Short leg.
    pub fn opening_side(&self) -> Option<Side> {
        if self.reduce_only {
            return None;
        }
        match self.side.as_str() {
            "Buy" => Some(Side::Long),
            "Sell" => Some(Side::Short),
            _ => None,
        }
    }

    /// The position side this execution *closes* (reduce-only only). A
    /// reduce-only Sell closes the Long leg; a reduce-only Buy closes Short.
    pub fn closing_side(&self) -> Option<Side> {
        if !self.reduce_only {
            return None;
        }
        match self.side.as_str() {
            "Sell" => Some(Side::Long),
            "Buy" => Some(Side::Short),
            _ => None,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_order_direction_mapping() {
        assert_eq!(Side::Long.open_order_side(), "Buy");
        assert_eq!(Side::Long.close_order_side(), "Sell");
        assert_eq!(Side::Short.open_order_side(), "Sell");
        assert_eq!(Side::Short.close_order_side(), "Buy");
        assert_eq!(Side::Long.position_idx(), 1);
        assert_eq!(Side::Short.position_idx(), 2);
        assert_eq!(Side::from_position_idx(2), Some(Side::Short));
        assert_eq!(Side::from_position_idx(0), None);
    }

    #[test]
    fn order_status_parsing() {
        assert_eq!(OrderStatus::parse("Filled"), Some(OrderStatus::Filled));
        assert_eq!(OrderStatus::parse("Deactivated"), Some(OrderStatus::Cancelled));
        assert_eq!(OrderStatus::parse("Untriggered"), None);
        assert!(OrderStatus::Filled.is_terminal());
        assert!(!OrderStatus::PartiallyFilled.is_terminal());
    }

    #[test]
    fn execution_side_resolution() {
        let open_long = ExecutionEvent {
            order_id: "1".into(),
            symbol: "DOGEUSDT".into(),
            side: "Buy".into(),
            exec_qty: 100.0,
            exec_price: 0.15,
            reduce_only: false,
        };
        assert_eq!(open_long.opening_side(), Some(Side::Long));
        assert_eq!(open_long.closing_side(), None);

        let tp_short = ExecutionEvent {
            order_id: "2".into(),
            symbol: "DOGEUSDT".into(),
            side: "Buy".into(),
            exec_qty: 100.0,
            exec_price: 0.15,
            reduce_only: true,
        };
        assert_eq!(tp_short.opening_side(), None);
        assert_eq!(tp_short.closing_side(), Some(Side::Short));
    }
}
