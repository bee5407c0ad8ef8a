//! Intent-to-bracket orchestrator.
//!
//! Consumes [`TradeIntent`]s, opens the entry, arms the take-profit and
//! stop-loss legs, and hands the armed bracket to the position monitor.
//! An entry that fills while its bracket cannot be completed is never
//! left naked; the partial bracket is rolled back and the position closed.

use crate::config::CroupierConfig;
use crate::core::{BracketPair, Order, OrderKind, Position, PositionKey, TradeIntent};
use crate::exchanges::{
    retry, ExchangeAdapter, ExchangeError, OrderSpec, TokenBucket,
};
use crate::monitoring::{AlertKind, AlertLevel, AlertSink};
use crate::oco::PositionMonitor;
use crate::sync::StateSynchronizer;
use crate::types::{Price, Symbol};
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// Why an intent was not turned into a supervised position
#[derive(Debug)]
pub enum CroupierError {
    /// The intent itself is malformed
    InvalidSignal(String),
    /// The symbol already carries its allowed number of open positions
    PositionLimit { symbol: Symbol, open: usize },
    /// An entry for this symbol is still in flight
    EntryInFlight(Symbol),
    /// The entry order did not fill within the configured window
    EntryUnfilled { symbol: Symbol, client_order_id: String },
    Exchange(ExchangeError),
}

impl fmt::Display for CroupierError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CroupierError::InvalidSignal(reason) => {
                write!(f, "invalid trade intent: {}", reason)
            }
            CroupierError::PositionLimit { symbol, open } => {
                write!(f, "{}: {} open positions, limit reached", symbol, open)
            }
            CroupierError::EntryInFlight(symbol) => {
                write!(f, "{}: entry already in flight", symbol)
            }
            CroupierError::EntryUnfilled {
                symbol,
                client_order_id,
            } => {
                write!(f, "{}: entry {} did not fill in time", symbol, client_order_id)
            }
            CroupierError::Exchange(err) => write!(f, "exchange error: {}", err),
        }
    }
}

impl std::error::Error for CroupierError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CroupierError::Exchange(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ExchangeError> for CroupierError {
    fn from(err: ExchangeError) -> Self {
        CroupierError::Exchange(err)
    }
}

/// The orchestrator
pub struct Croupier {
    adapter: Arc<dyn ExchangeAdapter>,
    synchronizer: Arc<StateSynchronizer>,
    monitor: Arc<PositionMonitor>,
    alerts: Arc<AlertSink>,
    limiter: Arc<TokenBucket>,
    config: CroupierConfig,
    /// Symbols with an entry in flight, guarding against double entry
    /// during placement latency
    pending_symbols: Mutex<HashSet<Symbol>>,
}

impl Croupier {
    pub fn new(
        synchronizer: Arc<StateSynchronizer>,
        monitor: Arc<PositionMonitor>,
        alerts: Arc<AlertSink>,
        limiter: Arc<TokenBucket>,
        config: CroupierConfig,
    ) -> Self {
        Self {
            adapter: synchronizer.adapter(),
            synchronizer,
            monitor,
            alerts,
            limiter,
            config,
            pending_symbols: Mutex::new(HashSet::new()),
        }
    }

    /// Consume intents until the channel closes
    pub fn spawn(self: Arc<Self>, mut intents: mpsc::Receiver<TradeIntent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(intent) = intents.recv().await {
                let raw_symbol = intent.symbol.clone();
                match self.handle_intent(intent).await {
                    Ok(key) => log::info!("opened bracketed position {}", key),
                    Err(err) => log::warn!("intent for {} dropped: {}", raw_symbol, err),
                }
            }
            log::info!("intent channel closed, orchestrator stopping");
        })
    }

    /// Turn one intent into a supervised bracketed position
    pub async fn handle_intent(&self, intent: TradeIntent) -> Result<PositionKey, CroupierError> {
        validate(&intent)?;
        let symbol = self.adapter.normalize_symbol(&intent.symbol)?;

        {
            let mut pending = self.pending_symbols.lock().await;
            if !pending.insert(symbol.clone()) {
                return Err(CroupierError::EntryInFlight(symbol));
            }
        }
        let result = self.open_bracketed(&symbol, &intent).await;
        self.pending_symbols.lock().await.remove(&symbol);
        result
    }

    async fn open_bracketed(
        &self,
        symbol: &Symbol,
        intent: &TradeIntent,
    ) -> Result<PositionKey, CroupierError> {
        let snapshot = self
            .synchronizer
            .sync_positions(Some(std::slice::from_ref(symbol)))
            .await?;
        let open = snapshot
            .positions
            .iter()
            .filter(|p| p.symbol == *symbol)
            .count();
        if open >= self.config.max_positions_per_symbol {
            return Err(CroupierError::PositionLimit {
                symbol: symbol.clone(),
                open,
            });
        }

        let entry_side = intent.side.entry_order_side();
        let entry_spec = match intent.limit_price {
            Some(price) => OrderSpec::limit(
                symbol.clone(),
                entry_side,
                intent.quantity,
                price,
                OrderKind::Entry,
            ),
            None => OrderSpec::market(symbol.clone(), entry_side, intent.quantity, OrderKind::Entry),
        };

        let entry = self.place_idempotent(&entry_spec).await?;
        let entry = self.await_entry_fill(entry, &entry_spec).await?;
        let fill_price = entry
            .avg_fill_price
            .or(entry.price)
            .ok_or_else(|| CroupierError::EntryUnfilled {
                symbol: symbol.clone(),
                client_order_id: entry_spec.client_order_id.clone(),
            })?;

        let tp_pct = intent.take_profit_pct.unwrap_or(self.config.take_profit_pct);
        let sl_pct = intent.stop_loss_pct.unwrap_or(self.config.stop_loss_pct);
        let (tp_price, sl_price) = bracket_prices(intent.side, fill_price, tp_pct, sl_pct);
        let closing_side = intent.side.closing_order_side();

        let tp_spec = OrderSpec::limit(
            symbol.clone(),
            closing_side,
            intent.quantity,
            tp_price,
            OrderKind::TakeProfit,
        )
        .reduce_only();
        let take_profit = match self.place_idempotent(&tp_spec).await {
            Ok(order) => order,
            Err(err) => {
                self.rollback_partial_bracket(symbol, intent, &[], &entry).await;
                return Err(err.into());
            }
        };

        let sl_spec = OrderSpec::stop_market(
            symbol.clone(),
            closing_side,
            intent.quantity,
            sl_price,
            OrderKind::StopLoss,
        )
        .reduce_only();
        let stop_loss = match self.place_idempotent(&sl_spec).await {
            Ok(order) => order,
            Err(err) => {
                self.rollback_partial_bracket(symbol, intent, &[&take_profit], &entry)
                    .await;
                return Err(err.into());
            }
        };

        let position = Position {
            exchange: self.adapter.id(),
            symbol: symbol.clone(),
            side: intent.side,
            quantity: intent.quantity,
            entry_price: fill_price,
            mark_price: Some(fill_price),
            liquidation_price: None,
            updated_at: Utc::now(),
        };
        let key = position.key();
        log::info!(
            "{}: entry filled at {}, bracket armed (tp {} / sl {})",
            key,
            fill_price,
            tp_price,
            sl_price
        );
        self.monitor.watch(
            position,
            BracketPair {
                take_profit,
                stop_loss,
            },
        );
        Ok(key)
    }

    /// Place an order without ever double-submitting: transient failures are
    /// retried under the shared policy, and an ambiguous outcome is resolved
    /// by querying the client ID before any resubmit.
    async fn place_idempotent(&self, spec: &OrderSpec) -> Result<Order, ExchangeError> {
        let policy = self.config.retry_policy();
        let adapter = self.adapter.clone();
        let limiter = self.limiter.clone();
        let attempt_spec = spec.clone();
        let result = retry(&policy, "order placement", move || {
            let adapter = adapter.clone();
            let limiter = limiter.clone();
            let spec = attempt_spec.clone();
            async move {
                limiter.acquire().await;
                adapter.place_order(&spec).await
            }
        })
        .await;

        match result {
            Ok(order) => Ok(order),
            Err(ExchangeError::AmbiguousOutcome { .. }) => {
                match self
                    .adapter
                    .query_order_by_client_id(&spec.client_order_id, &spec.symbol)
                    .await?
                {
                    Some(order) => {
                        log::info!(
                            "ambiguous placement of {} resolved: order exists as {}",
                            spec.client_order_id,
                            order.id
                        );
                        Ok(order)
                    }
                    None => {
                        self.limiter.acquire().await;
                        self.adapter.place_order(spec).await
                    }
                }
            }
            Err(err) => Err(err),
        }
    }

    /// Poll the entry until it fills or the window closes. A timed-out entry
    /// is cancelled; a cancel racing a fill falls through to the fill.
    async fn await_entry_fill(
        &self,
        entry: Order,
        spec: &OrderSpec,
    ) -> Result<Order, CroupierError> {
        if entry.is_filled() {
            return Ok(entry);
        }
        let unfilled = || CroupierError::EntryUnfilled {
            symbol: spec.symbol.clone(),
            client_order_id: spec.client_order_id.clone(),
        };

        let deadline = tokio::time::Instant::now() + self.config.entry_fill_timeout;
        while tokio::time::Instant::now() < deadline {
            tokio::time::sleep(self.config.leg_poll_interval).await;
            let current = self
                .adapter
                .query_order_by_client_id(&spec.client_order_id, &spec.symbol)
                .await?;
            match current {
                Some(order) if order.is_filled() => return Ok(order),
                Some(order) if !order.is_open() => {
                    log::warn!(
                        "{}: entry {} reached {:?} without filling",
                        spec.symbol,
                        spec.client_order_id,
                        order.status
                    );
                    return Err(unfilled());
                }
                _ => {}
            }
        }

        self.limiter.acquire().await;
        match self.adapter.cancel_order(&entry.id, &spec.symbol).await {
            Ok(crate::exchanges::CancelOutcome::AlreadyTerminal(status))
                if status == crate::core::OrderStatus::Filled =>
            {
                let order = self
                    .adapter
                    .query_order_by_client_id(&spec.client_order_id, &spec.symbol)
                    .await?;
                order.ok_or_else(unfilled)
            }
            Ok(_) => Err(unfilled()),
            Err(err) => {
                log::warn!(
                    "{}: cancel of timed-out entry failed: {}",
                    spec.symbol,
                    err
                );
                Err(unfilled())
            }
        }
    }

    /// The entry filled but its bracket could not be completed. Cancel any
    /// legs that were created, then flatten the naked entry at market.
    async fn rollback_partial_bracket(
        &self,
        symbol: &Symbol,
        intent: &TradeIntent,
        created_legs: &[&Order],
        entry: &Order,
    ) {
        for leg in created_legs {
            self.limiter.acquire().await;
            if let Err(err) = self.adapter.cancel_order(&leg.id, symbol).await {
                log::error!("{}: rollback cancel of leg {} failed: {}", symbol, leg.id, err);
            }
        }

        let close_spec = OrderSpec::market(
            symbol.clone(),
            intent.side.closing_order_side(),
            entry.quantity,
            OrderKind::ManualClose,
        )
        .reduce_only();
        let policy = self.config.retry_policy();
        let adapter = self.adapter.clone();
        let limiter = self.limiter.clone();
        let close_result = retry(&policy, "rollback close", move || {
            let adapter = adapter.clone();
            let limiter = limiter.clone();
            let spec = close_spec.clone();
            async move {
                limiter.acquire().await;
                adapter.place_order(&spec).await
            }
        })
        .await;

        let detail = match &close_result {
            Ok(order) => format!("naked entry closed by {}", order.id),
            Err(err) => format!("naked entry close FAILED: {}", err),
        };
        let level = if close_result.is_ok() {
            AlertLevel::Error
        } else {
            AlertLevel::Critical
        };
        self.alerts
            .emit(
                level,
                AlertKind::PartialBracketRollback,
                "croupier",
                format!("{}: bracket incomplete, rolled back; {}", symbol, detail),
            )
            .await;
    }
}

fn validate(intent: &TradeIntent) -> Result<(), CroupierError> {
    if intent.symbol.trim().is_empty() {
        return Err(CroupierError::InvalidSignal("empty symbol".to_string()));
    }
    if intent.quantity.is_zero() || intent.quantity.value().is_sign_negative() {
        return Err(CroupierError::InvalidSignal(format!(
            "non-positive quantity {}",
            intent.quantity
        )));
    }
    if let Some(price) = intent.limit_price {
        if price.is_zero() || price.value().is_sign_negative() {
            return Err(CroupierError::InvalidSignal(format!(
                "non-positive limit price {}",
                price
            )));
        }
    }
    Ok(())
}

/// Exit prices from the realized entry, side-aware
fn bracket_prices(
    side: crate::core::PositionSide,
    fill_price: Price,
    tp_pct: Decimal,
    sl_pct: Decimal,
) -> (Price, Price) {
    match side {
        crate::core::PositionSide::Long => (
            fill_price * (Decimal::ONE + tp_pct),
            fill_price * (Decimal::ONE - sl_pct),
        ),
        crate::core::PositionSide::Short => (
            fill_price * (Decimal::ONE - tp_pct),
            fill_price * (Decimal::ONE + sl_pct),
        ),
    }
}
