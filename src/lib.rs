//! Croupier: multi-exchange derivatives execution engine with software
//! OCO brackets.
//!
//! Venues without native one-cancels-other support get their brackets
//! emulated here: every position carries a take-profit and a stop-loss
//! leg, a supervisor task watches both, and the fill of one cancels the
//! other. Venue state is read through a prefer-cache synchronizer, and a
//! monitor keeps the set of supervisors consistent with what the
//! exchange actually reports.

pub mod config;
pub mod core;
pub mod croupier;
pub mod exchanges;
pub mod logging;
pub mod monitoring;
pub mod oco;
pub mod sync;
pub mod types;

pub use config::CroupierConfig;
pub use core::{
    BracketPair, Order, OrderKind, OrderSide, OrderStatus, OrdersSnapshot, Position, PositionKey,
    PositionSide, SnapshotSource, SyncSnapshot, TradeIntent,
};
pub use croupier::{Croupier, CroupierError};
pub use exchanges::{
    BinanceAdapter, BybitAdapter, CancelOutcome, ExchangeAdapter, ExchangeError, KrakenAdapter,
    OrderSpec, RetryPolicy, SimAdapter, TokenBucket,
};
pub use monitoring::{Alert, AlertKind, AlertLevel, AlertSink};
pub use oco::{ClosedPosition, ExitKind, OcoSupervisor, PositionMonitor, SupervisorState};
pub use sync::StateSynchronizer;
pub use types::{Price, Size, Symbol};
