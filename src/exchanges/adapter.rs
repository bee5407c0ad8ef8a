use crate::core::{ExchangeId, Order, OrderId, OrderKind, OrderSide, OrderStatus, OrderType, Position, TimeInForce};
use crate::exchanges::ExchangeError;
use crate::types::{Price, Size, Symbol};
use async_trait::async_trait;

/// Everything the engine needs to place on a venue
#[derive(Debug, Clone)]
pub struct OrderSpec {
    pub symbol: Symbol,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub kind: OrderKind,
    pub quantity: Size,
    pub price: Option<Price>,
    pub trigger_price: Option<Price>,
    pub time_in_force: TimeInForce,
    pub reduce_only: bool,
    /// Idempotency key; resubmitting the same spec with the same ID must not
    /// create a second order
    pub client_order_id: String,
}

impl OrderSpec {
    pub fn market(symbol: Symbol, side: OrderSide, quantity: Size, kind: OrderKind) -> Self {
        Self {
            symbol,
            side,
            order_type: OrderType::Market,
            kind,
            quantity,
            price: None,
            trigger_price: None,
            time_in_force: TimeInForce::Gtc,
            reduce_only: false,
            client_order_id: crate::core::ids::new_client_id(kind),
        }
    }

    pub fn limit(symbol: Symbol, side: OrderSide, quantity: Size, price: Price, kind: OrderKind) -> Self {
        Self {
            symbol,
            side,
            order_type: OrderType::Limit,
            kind,
            quantity,
            price: Some(price),
            trigger_price: None,
            time_in_force: TimeInForce::Gtc,
            reduce_only: false,
            client_order_id: crate::core::ids::new_client_id(kind),
        }
    }

    pub fn stop_market(symbol: Symbol, side: OrderSide, quantity: Size, trigger: Price, kind: OrderKind) -> Self {
        Self {
            symbol,
            side,
            order_type: OrderType::StopMarket,
            kind,
            quantity,
            price: None,
            trigger_price: Some(trigger),
            time_in_force: TimeInForce::Gtc,
            reduce_only: false,
            client_order_id: crate::core::ids::new_client_id(kind),
        }
    }

    pub fn reduce_only(mut self) -> Self {
        self.reduce_only = true;
        self
    }

    pub fn with_client_order_id(mut self, id: impl Into<String>) -> Self {
        self.client_order_id = id.into();
        self
    }
}

/// Outcome of a cancel request. Venues report "unknown order" when the order
/// already reached a terminal state; that is a signal, not a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    AlreadyTerminal(OrderStatus),
}

/// Uniform surface over one derivatives venue.
///
/// Implementations translate between canonical symbols and venue-native
/// spellings, and between venue error codes and the shared [`ExchangeError`]
/// taxonomy. Everything above this seam is venue-agnostic, which is what
/// lets the test harness swap in a simulated venue.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    fn id(&self) -> ExchangeId;

    /// Open positions, optionally restricted to the given canonical symbols.
    /// Flat symbols (zero quantity) are never included.
    async fn fetch_positions(&self, symbols: Option<&[Symbol]>) -> Result<Vec<Position>, ExchangeError>;

    /// Open orders, optionally restricted to the given canonical symbols
    async fn fetch_open_orders(&self, symbols: Option<&[Symbol]>) -> Result<Vec<Order>, ExchangeError>;

    async fn place_order(&self, spec: &OrderSpec) -> Result<Order, ExchangeError>;

    async fn cancel_order(&self, id: &OrderId, symbol: &Symbol) -> Result<CancelOutcome, ExchangeError>;

    /// Look up an order by its client ID, open or terminal. `Ok(None)` means
    /// the venue has never seen the ID, which after an ambiguous placement
    /// means the order was not created.
    async fn query_order_by_client_id(
        &self,
        client_order_id: &str,
        symbol: &Symbol,
    ) -> Result<Option<Order>, ExchangeError>;

    /// Map a raw upstream symbol to its canonical form if this venue lists it
    fn normalize_symbol(&self, raw: &str) -> Result<Symbol, ExchangeError>;

    /// Venues with native bracket orders do not need the software supervisor
    fn supports_native_bracket(&self) -> bool {
        false
    }
}
