use crate::types::{Price, Size, Symbol};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Exchange identifier (e.g. "binance", "bybit", "kraken")
pub type ExchangeId = String;

/// Venue-assigned order identifier
pub type OrderId = String;

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Direction of an open position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// Side of the order that closes a position in this direction
    pub fn closing_order_side(&self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Sell,
            PositionSide::Short => OrderSide::Buy,
        }
    }

    pub fn entry_order_side(&self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Buy,
            PositionSide::Short => OrderSide::Sell,
        }
    }
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionSide::Long => write!(f, "LONG"),
            PositionSide::Short => write!(f, "SHORT"),
        }
    }
}

/// Order type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
    StopMarket,
}

/// Role an order plays inside a managed position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderKind {
    Entry,
    TakeProfit,
    StopLoss,
    ManualClose,
}

/// Time in force
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    Gtc,
    Ioc,
    Fok,
}

/// Order status as reported by the venue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
    Expired,
}

impl OrderStatus {
    /// Terminal states cannot change again; cancelling a terminal order is a no-op
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected | OrderStatus::Expired
        )
    }
}

/// An order as known to a venue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    /// Venue-assigned order ID
    pub id: OrderId,
    /// Caller-chosen idempotency key, if any
    pub client_order_id: Option<String>,
    /// Exchange this order lives on
    pub exchange: ExchangeId,
    /// Canonical symbol
    pub symbol: Symbol,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub status: OrderStatus,
    /// Requested quantity
    pub quantity: Size,
    /// Quantity filled so far
    pub filled_quantity: Size,
    /// Limit price, if any
    pub price: Option<Price>,
    /// Trigger price for stop orders
    pub trigger_price: Option<Price>,
    /// Average fill price across all executions
    pub avg_fill_price: Option<Price>,
    /// Reduce-only orders can never increase position size
    pub reduce_only: bool,
    pub created_at: DateTime<Utc>,
    /// Set when the order reached Filled
    pub filled_at: Option<DateTime<Utc>>,
}

impl Order {
    pub fn is_filled(&self) -> bool {
        self.status == OrderStatus::Filled
    }

    pub fn is_open(&self) -> bool {
        !self.status.is_terminal()
    }
}

/// An open position as reported by a venue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub exchange: ExchangeId,
    pub symbol: Symbol,
    pub side: PositionSide,
    /// Unsigned contract quantity
    pub quantity: Size,
    pub entry_price: Price,
    pub mark_price: Option<Price>,
    pub liquidation_price: Option<Price>,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    pub fn key(&self) -> PositionKey {
        PositionKey {
            exchange: self.exchange.clone(),
            symbol: self.symbol.clone(),
        }
    }
}

/// Identity of a position within the engine: one venue, one symbol
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PositionKey {
    pub exchange: ExchangeId,
    pub symbol: Symbol,
}

impl fmt::Display for PositionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.exchange, self.symbol)
    }
}

/// Which path produced a sync snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotSource {
    /// Served from the shared cache
    Cache,
    /// Fetched directly from the venue
    Direct,
}

/// Point-in-time view of open positions, tagged with its provenance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSnapshot {
    pub positions: Vec<Position>,
    pub source: SnapshotSource,
    pub fetched_at: DateTime<Utc>,
}

impl SyncSnapshot {
    pub fn find(&self, key: &PositionKey) -> Option<&Position> {
        self.positions
            .iter()
            .find(|p| p.exchange == key.exchange && p.symbol == key.symbol)
    }
}

/// Point-in-time view of open orders, tagged like [`SyncSnapshot`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrdersSnapshot {
    pub orders: Vec<Order>,
    pub source: SnapshotSource,
    pub fetched_at: DateTime<Utc>,
}

/// The two exit legs protecting one position
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BracketPair {
    pub take_profit: Order,
    pub stop_loss: Order,
}

impl BracketPair {
    pub fn leg(&self, kind: OrderKind) -> Option<&Order> {
        match kind {
            OrderKind::TakeProfit => Some(&self.take_profit),
            OrderKind::StopLoss => Some(&self.stop_loss),
            _ => None,
        }
    }

    pub fn other_leg(&self, filled: OrderKind) -> Option<&Order> {
        match filled {
            OrderKind::TakeProfit => Some(&self.stop_loss),
            OrderKind::StopLoss => Some(&self.take_profit),
            _ => None,
        }
    }
}

/// Upstream request to open a bracketed position
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeIntent {
    /// Raw symbol as the signal source spelled it; normalized at the adapter seam
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: Size,
    /// Optional limit for the entry; market entry when absent
    pub limit_price: Option<Price>,
    /// Per-intent overrides for the configured exit distances
    pub take_profit_pct: Option<rust_decimal::Decimal>,
    pub stop_loss_pct: Option<rust_decimal::Decimal>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    #[test]
    fn test_order_side_opposite() {
        assert_eq!(OrderSide::Buy.opposite(), OrderSide::Sell);
        assert_eq!(OrderSide::Sell.opposite(), OrderSide::Buy);
    }

    #[test]
    fn test_position_side_closing_order() {
        assert_eq!(PositionSide::Long.closing_order_side(), OrderSide::Sell);
        assert_eq!(PositionSide::Short.closing_order_side(), OrderSide::Buy);
    }

    #[test]
    fn test_order_status_terminal() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Cancelled.is_terminal());
        assert!(OrderStatus::Rejected.is_terminal());
        assert!(!OrderStatus::New.is_terminal());
        assert!(!OrderStatus::PartiallyFilled.is_terminal());
    }

    #[test]
    fn test_bracket_pair_other_leg() {
        let tp = sample_order("tp-1", OrderType::Limit);
        let sl = sample_order("sl-1", OrderType::StopMarket);
        let pair = BracketPair {
            take_profit: tp,
            stop_loss: sl,
        };

        assert_eq!(pair.other_leg(OrderKind::TakeProfit).unwrap().id, "sl-1");
        assert_eq!(pair.other_leg(OrderKind::StopLoss).unwrap().id, "tp-1");
        assert!(pair.other_leg(OrderKind::Entry).is_none());
    }

    fn sample_order(id: &str, order_type: OrderType) -> Order {
        Order {
            id: id.to_string(),
            client_order_id: None,
            exchange: "sim".to_string(),
            symbol: Symbol::new("BTC/USD"),
            side: OrderSide::Sell,
            order_type,
            status: OrderStatus::New,
            quantity: Size::new(Decimal::ONE),
            filled_quantity: Size::new(Decimal::ZERO),
            price: None,
            trigger_price: None,
            avg_fill_price: None,
            reduce_only: true,
            created_at: Utc::now(),
            filled_at: None,
        }
    }
}
