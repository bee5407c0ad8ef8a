pub mod adapter;
pub mod binance;
pub mod bybit;
pub mod error;
pub mod kraken;
pub mod retry;
pub mod sim;

pub use adapter::{CancelOutcome, ExchangeAdapter, OrderSpec};
pub use binance::BinanceAdapter;
pub use bybit::BybitAdapter;
pub use error::ExchangeError;
pub use kraken::KrakenAdapter;
pub use retry::{retry, RetryPolicy, TokenBucket};
pub use sim::SimAdapter;
