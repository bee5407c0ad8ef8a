//! In-memory venue for tests and the parity harness.
//!
//! Behaves like a real adapter from the engine's point of view: orders get
//! venue IDs, fills move positions, cancels respect terminal states. Tests
//! script fills and inject failures per operation.

use crate::core::{
    ids, ExchangeId, Order, OrderId, OrderKind, OrderStatus, OrderType, Position, PositionSide,
};
use crate::exchanges::{CancelOutcome, ExchangeAdapter, ExchangeError, OrderSpec};
use crate::types::{Price, Size, Symbol};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

const KNOWN_QUOTES: [&str; 3] = ["USDT", "USDC", "USD"];

#[derive(Default)]
struct SimState {
    orders: HashMap<OrderId, Order>,
    client_index: HashMap<String, OrderId>,
    positions: HashMap<Symbol, Position>,
    next_order_id: u64,
    place_count: u64,
    cancel_count: u64,
    fetch_count: u64,
    place_failures: VecDeque<ExchangeError>,
    place_failures_by_kind: HashMap<OrderKind, VecDeque<ExchangeError>>,
    cancel_failures: VecDeque<ExchangeError>,
    fetch_failures: VecDeque<ExchangeError>,
    /// When true, a scripted AmbiguousOutcome on place still creates the
    /// order venue-side, modeling a response lost in transit
    ambiguous_still_creates: bool,
    /// Market orders fill immediately at this price when set
    market_fill_price: Option<Price>,
}

/// Simulated exchange adapter
#[derive(Clone)]
pub struct SimAdapter {
    id: ExchangeId,
    state: Arc<Mutex<SimState>>,
}

impl SimAdapter {
    pub fn new() -> Self {
        Self {
            id: "sim".to_string(),
            state: Arc::new(Mutex::new(SimState::default())),
        }
    }

    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: Arc::new(Mutex::new(SimState::default())),
        }
    }

    /// Queue an error for the next place_order call
    pub fn push_place_failure(&self, err: ExchangeError) {
        self.state.lock().unwrap().place_failures.push_back(err);
    }

    /// Queue an error for the next place_order call of the given kind
    pub fn push_place_failure_for(&self, kind: OrderKind, err: ExchangeError) {
        self.state
            .lock()
            .unwrap()
            .place_failures_by_kind
            .entry(kind)
            .or_default()
            .push_back(err);
    }

    /// Queue an error for the next cancel_order call
    pub fn push_cancel_failure(&self, err: ExchangeError) {
        self.state.lock().unwrap().cancel_failures.push_back(err);
    }

    /// Queue an error for the next fetch_positions / fetch_open_orders call
    pub fn push_fetch_failure(&self, err: ExchangeError) {
        self.state.lock().unwrap().fetch_failures.push_back(err);
    }

    /// Scripted AmbiguousOutcome failures on place still create the order
    pub fn set_ambiguous_still_creates(&self, enabled: bool) {
        self.state.lock().unwrap().ambiguous_still_creates = enabled;
    }

    /// Fill market orders immediately at the given price
    pub fn set_market_fill_price(&self, price: Price) {
        self.state.lock().unwrap().market_fill_price = Some(price);
    }

    /// Mark an order filled at the given price and time, applying its
    /// position effect (entries open, reduce-only exits flatten)
    pub fn fill_order_by_client_id(
        &self,
        client_order_id: &str,
        fill_price: Price,
        at: DateTime<Utc>,
    ) -> bool {
        let mut state = self.state.lock().unwrap();
        let Some(order_id) = state.client_index.get(client_order_id).cloned() else {
            return false;
        };
        let Some(order) = state.orders.get_mut(&order_id) else {
            return false;
        };
        if order.status.is_terminal() {
            return false;
        }
        order.status = OrderStatus::Filled;
        order.filled_quantity = order.quantity;
        order.avg_fill_price = Some(fill_price);
        order.filled_at = Some(at);

        let order = order.clone();
        let kind = order
            .client_order_id
            .as_deref()
            .and_then(ids::parse_client_id);
        match kind {
            Some(OrderKind::Entry) => {
                let side = match order.side {
                    crate::core::OrderSide::Buy => PositionSide::Long,
                    crate::core::OrderSide::Sell => PositionSide::Short,
                };
                state.positions.insert(
                    order.symbol.clone(),
                    Position {
                        exchange: self.id.clone(),
                        symbol: order.symbol.clone(),
                        side,
                        quantity: order.quantity,
                        entry_price: fill_price,
                        mark_price: Some(fill_price),
                        liquidation_price: None,
                        updated_at: at,
                    },
                );
            }
            Some(_) if order.reduce_only => {
                state.positions.remove(&order.symbol);
            }
            _ => {}
        }
        true
    }

    /// Install a venue-side position without going through an order
    pub fn set_position(&self, position: Position) {
        self.state
            .lock()
            .unwrap()
            .positions
            .insert(position.symbol.clone(), position);
    }

    pub fn remove_position(&self, symbol: &Symbol) {
        self.state.lock().unwrap().positions.remove(symbol);
    }

    pub fn place_count(&self) -> u64 {
        self.state.lock().unwrap().place_count
    }

    pub fn cancel_count(&self) -> u64 {
        self.state.lock().unwrap().cancel_count
    }

    pub fn open_order_count(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .orders
            .values()
            .filter(|o| o.is_open())
            .count()
    }

    pub fn order_by_client_id(&self, client_order_id: &str) -> Option<Order> {
        let state = self.state.lock().unwrap();
        let order_id = state.client_index.get(client_order_id)?;
        state.orders.get(order_id).cloned()
    }

    fn build_order(state: &mut SimState, exchange: &str, spec: &OrderSpec) -> Order {
        state.next_order_id += 1;
        Order {
            id: format!("sim-{}", state.next_order_id),
            client_order_id: Some(spec.client_order_id.clone()),
            exchange: exchange.to_string(),
            symbol: spec.symbol.clone(),
            side: spec.side,
            order_type: spec.order_type,
            status: OrderStatus::New,
            quantity: spec.quantity,
            filled_quantity: Size::new(Decimal::ZERO),
            price: spec.price,
            trigger_price: spec.trigger_price,
            avg_fill_price: None,
            reduce_only: spec.reduce_only,
            created_at: Utc::now(),
            filled_at: None,
        }
    }
}

impl Default for SimAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExchangeAdapter for SimAdapter {
    fn id(&self) -> ExchangeId {
        self.id.clone()
    }

    async fn fetch_positions(
        &self,
        symbols: Option<&[Symbol]>,
    ) -> Result<Vec<Position>, ExchangeError> {
        let mut state = self.state.lock().unwrap();
        state.fetch_count += 1;
        if let Some(err) = state.fetch_failures.pop_front() {
            return Err(err);
        }
        Ok(state
            .positions
            .values()
            .filter(|p| !p.quantity.is_zero())
            .filter(|p| symbols.map_or(true, |syms| syms.contains(&p.symbol)))
            .cloned()
            .collect())
    }

    async fn fetch_open_orders(
        &self,
        symbols: Option<&[Symbol]>,
    ) -> Result<Vec<Order>, ExchangeError> {
        let mut state = self.state.lock().unwrap();
        state.fetch_count += 1;
        if let Some(err) = state.fetch_failures.pop_front() {
            return Err(err);
        }
        Ok(state
            .orders
            .values()
            .filter(|o| o.is_open())
            .filter(|o| symbols.map_or(true, |syms| syms.contains(&o.symbol)))
            .cloned()
            .collect())
    }

    async fn place_order(&self, spec: &OrderSpec) -> Result<Order, ExchangeError> {
        let mut state = self.state.lock().unwrap();
        state.place_count += 1;

        // Same client ID twice returns the existing order instead of
        // creating a duplicate
        if let Some(order_id) = state.client_index.get(&spec.client_order_id) {
            let existing = state.orders[order_id].clone();
            return Ok(existing);
        }

        let kind_failure = state
            .place_failures_by_kind
            .get_mut(&spec.kind)
            .and_then(|queue| queue.pop_front());
        if let Some(err) = kind_failure.or_else(|| state.place_failures.pop_front()) {
            let creates = state.ambiguous_still_creates
                && matches!(err, ExchangeError::AmbiguousOutcome { .. });
            if creates {
                let order = Self::build_order(&mut state, &self.id, spec);
                state
                    .client_index
                    .insert(spec.client_order_id.clone(), order.id.clone());
                state.orders.insert(order.id.clone(), order);
            }
            return Err(err);
        }

        let order = Self::build_order(&mut state, &self.id, spec);
        state
            .client_index
            .insert(spec.client_order_id.clone(), order.id.clone());
        state.orders.insert(order.id.clone(), order.clone());

        let fill_price = state.market_fill_price;
        drop(state);
        if order.order_type == OrderType::Market {
            if let Some(price) = fill_price {
                self.fill_order_by_client_id(&spec.client_order_id, price, Utc::now());
                if let Some(filled) = self.order_by_client_id(&spec.client_order_id) {
                    return Ok(filled);
                }
            }
        }
        Ok(order)
    }

    async fn cancel_order(
        &self,
        id: &OrderId,
        _symbol: &Symbol,
    ) -> Result<CancelOutcome, ExchangeError> {
        let mut state = self.state.lock().unwrap();
        state.cancel_count += 1;
        if let Some(err) = state.cancel_failures.pop_front() {
            return Err(err);
        }
        match state.orders.get_mut(id) {
            Some(order) if order.status.is_terminal() => {
                Ok(CancelOutcome::AlreadyTerminal(order.status))
            }
            Some(order) => {
                order.status = OrderStatus::Cancelled;
                Ok(CancelOutcome::Cancelled)
            }
            None => Err(ExchangeError::rejected(format!("unknown order id {}", id))),
        }
    }

    async fn query_order_by_client_id(
        &self,
        client_order_id: &str,
        _symbol: &Symbol,
    ) -> Result<Option<Order>, ExchangeError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .client_index
            .get(client_order_id)
            .and_then(|id| state.orders.get(id))
            .cloned())
    }

    fn normalize_symbol(&self, raw: &str) -> Result<Symbol, ExchangeError> {
        let upper = raw.to_uppercase().replace('-', "/");
        let candidate = if upper.contains('/') {
            Symbol::new(upper)
        } else {
            // Compact spellings like BTCUSDT split on a known quote suffix
            match KNOWN_QUOTES
                .iter()
                .find(|q| upper.ends_with(*q) && upper.len() > q.len())
            {
                Some(quote) => Symbol::new(format!(
                    "{}/{}",
                    &upper[..upper.len() - quote.len()],
                    quote
                )),
                None => Symbol::new(upper),
            }
        };
        if candidate.is_canonical() {
            Ok(candidate)
        } else {
            Err(ExchangeError::UnsupportedSymbol {
                raw: raw.to_string(),
                exchange: self.id.clone(),
            })
        }
    }

    fn supports_native_bracket(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{OrderSide, TimeInForce};

    fn entry_spec(symbol: &str) -> OrderSpec {
        OrderSpec {
            symbol: Symbol::new(symbol),
            side: OrderSide::Buy,
            order_type: OrderType::Market,
            kind: OrderKind::Entry,
            quantity: Size::new(Decimal::ONE),
            price: None,
            trigger_price: None,
            time_in_force: TimeInForce::Gtc,
            reduce_only: false,
            client_order_id: ids::new_client_id(OrderKind::Entry),
        }
    }

    #[tokio::test]
    async fn test_place_and_fill_opens_position() {
        let sim = SimAdapter::new();
        let spec = entry_spec("BTC/USD");
        let order = sim.place_order(&spec).await.unwrap();
        assert_eq!(order.status, OrderStatus::New);

        assert!(sim.fill_order_by_client_id(
            &spec.client_order_id,
            Price::from_str("50000").unwrap(),
            Utc::now(),
        ));

        let positions = sim.fetch_positions(None).await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].symbol, Symbol::new("BTC/USD"));
        assert_eq!(positions[0].side, PositionSide::Long);
    }

    #[tokio::test]
    async fn test_duplicate_client_id_returns_existing_order() {
        let sim = SimAdapter::new();
        let spec = entry_spec("BTC/USD");
        let first = sim.place_order(&spec).await.unwrap();
        let second = sim.place_order(&spec).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(sim.open_order_count(), 1);
    }

    #[tokio::test]
    async fn test_cancel_of_filled_order_is_already_terminal() {
        let sim = SimAdapter::new();
        let spec = entry_spec("BTC/USD");
        let order = sim.place_order(&spec).await.unwrap();
        sim.fill_order_by_client_id(
            &spec.client_order_id,
            Price::from_str("50000").unwrap(),
            Utc::now(),
        );

        let outcome = sim
            .cancel_order(&order.id, &order.symbol)
            .await
            .unwrap();
        assert_eq!(outcome, CancelOutcome::AlreadyTerminal(OrderStatus::Filled));
    }

    #[tokio::test]
    async fn test_symbol_filter_on_fetch_positions() {
        let sim = SimAdapter::new();
        for symbol in ["BTC/USD", "ETH/USD"] {
            let spec = entry_spec(symbol);
            sim.place_order(&spec).await.unwrap();
            sim.fill_order_by_client_id(
                &spec.client_order_id,
                Price::from_str("100").unwrap(),
                Utc::now(),
            );
        }

        let filter = [Symbol::new("ETH/USD")];
        let positions = sim.fetch_positions(Some(&filter)).await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].symbol, Symbol::new("ETH/USD"));
    }

    #[test]
    fn test_normalize_symbol_spellings() {
        let sim = SimAdapter::new();
        assert_eq!(sim.normalize_symbol("btc/usd").unwrap(), Symbol::new("BTC/USD"));
        assert_eq!(sim.normalize_symbol("BTC-USD").unwrap(), Symbol::new("BTC/USD"));
        assert_eq!(sim.normalize_symbol("BTCUSDT").unwrap(), Symbol::new("BTC/USDT"));
        assert!(sim.normalize_symbol("???").is_err());
    }
}
