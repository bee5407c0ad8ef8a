//! Venue-state synchronization.
//!
//! All position reads go through [`StateSynchronizer::sync_positions`], which
//! prefers the shared cache and silently falls back to a direct venue fetch
//! when the cache is empty or stale. Failures on the preferred path are
//! logged and swallowed; failures on the fallback path are the caller's
//! problem.

pub mod cache;

pub use cache::SyncCache;

use crate::core::{Order, OrdersSnapshot, Position, SnapshotSource, SyncSnapshot};
use crate::exchanges::{ExchangeAdapter, ExchangeError};
use crate::types::Symbol;
use chrono::{Duration, Utc};
use std::sync::Arc;
use tokio::task::JoinHandle;

pub struct StateSynchronizer {
    adapter: Arc<dyn ExchangeAdapter>,
    cache: Arc<SyncCache>,
    staleness_window: Duration,
}

impl StateSynchronizer {
    pub fn new(adapter: Arc<dyn ExchangeAdapter>, staleness_window: std::time::Duration) -> Self {
        Self {
            adapter,
            cache: Arc::new(SyncCache::new()),
            staleness_window: Duration::from_std(staleness_window)
                .unwrap_or_else(|_| Duration::seconds(1)),
        }
    }

    pub fn cache(&self) -> Arc<SyncCache> {
        self.cache.clone()
    }

    pub fn adapter(&self) -> Arc<dyn ExchangeAdapter> {
        self.adapter.clone()
    }

    /// Current open positions, preferring the cache.
    ///
    /// A stale or empty cache falls through to a direct fetch whose errors
    /// propagate. The symbol filter is applied the same way on both paths,
    /// so callers see identical shapes regardless of provenance.
    pub async fn sync_positions(
        &self,
        symbols: Option<&[Symbol]>,
    ) -> Result<SyncSnapshot, ExchangeError> {
        if let Some((positions, refreshed_at)) = self.cache.positions().await {
            let age = Utc::now() - refreshed_at;
            if age <= self.staleness_window {
                return Ok(SyncSnapshot {
                    positions: filter_positions(positions, symbols),
                    source: SnapshotSource::Cache,
                    fetched_at: refreshed_at,
                });
            }
            log::debug!(
                "{}: cached positions are {}ms old, fetching directly",
                self.adapter.id(),
                age.num_milliseconds()
            );
        }

        let positions = self.adapter.fetch_positions(symbols).await?;
        Ok(SyncSnapshot {
            positions: filter_positions(positions, symbols),
            source: SnapshotSource::Direct,
            fetched_at: Utc::now(),
        })
    }

    /// Current open orders, same two-path shape as positions
    pub async fn sync_open_orders(
        &self,
        symbols: Option<&[Symbol]>,
    ) -> Result<OrdersSnapshot, ExchangeError> {
        if let Some((orders, refreshed_at)) = self.cache.orders().await {
            if Utc::now() - refreshed_at <= self.staleness_window {
                return Ok(OrdersSnapshot {
                    orders: filter_orders(orders, symbols),
                    source: SnapshotSource::Cache,
                    fetched_at: refreshed_at,
                });
            }
        }
        let orders = self.adapter.fetch_open_orders(symbols).await?;
        Ok(OrdersSnapshot {
            orders: filter_orders(orders, symbols),
            source: SnapshotSource::Direct,
            fetched_at: Utc::now(),
        })
    }

    /// Spawn the cache updater. It is the sole writer; a failed poll leaves
    /// the previous snapshot in place to age out naturally.
    pub fn spawn_updater(&self, interval: std::time::Duration) -> JoinHandle<()> {
        let adapter = self.adapter.clone();
        let cache = self.cache.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match adapter.fetch_positions(None).await {
                    Ok(positions) => cache.store_positions(positions).await,
                    Err(err) => {
                        log::warn!("{}: position cache refresh failed: {}", adapter.id(), err)
                    }
                }
                match adapter.fetch_open_orders(None).await {
                    Ok(orders) => cache.store_orders(orders).await,
                    Err(err) => {
                        log::warn!("{}: order cache refresh failed: {}", adapter.id(), err)
                    }
                }
            }
        })
    }
}

fn filter_positions(positions: Vec<Position>, symbols: Option<&[Symbol]>) -> Vec<Position> {
    match symbols {
        Some(filter) => positions
            .into_iter()
            .filter(|p| filter.contains(&p.symbol))
            .collect(),
        None => positions,
    }
}

fn filter_orders(orders: Vec<Order>, symbols: Option<&[Symbol]>) -> Vec<Order> {
    match symbols {
        Some(filter) => orders
            .into_iter()
            .filter(|o| filter.contains(&o.symbol))
            .collect(),
        None => orders,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{PositionSide, SnapshotSource};
    use crate::exchanges::SimAdapter;
    use crate::types::{Price, Size};
    use rust_decimal::Decimal;

    fn position(symbol: &str) -> Position {
        Position {
            exchange: "sim".to_string(),
            symbol: Symbol::new(symbol),
            side: PositionSide::Long,
            quantity: Size::new(Decimal::ONE),
            entry_price: Price::new(Decimal::new(100, 0)),
            mark_price: None,
            liquidation_price: None,
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_fresh_cache_is_preferred() {
        let sim = Arc::new(SimAdapter::new());
        let synchronizer =
            StateSynchronizer::new(sim.clone(), std::time::Duration::from_secs(60));
        synchronizer
            .cache()
            .store_positions(vec![position("BTC/USD")])
            .await;
        // The venue disagrees with the cache; the fresh cache wins
        sim.set_position(position("ETH/USD"));

        let snapshot = synchronizer.sync_positions(None).await.unwrap();
        assert_eq!(snapshot.source, SnapshotSource::Cache);
        assert_eq!(snapshot.positions.len(), 1);
        assert_eq!(snapshot.positions[0].symbol, Symbol::new("BTC/USD"));
    }

    #[tokio::test]
    async fn test_stale_cache_falls_back_to_direct() {
        let sim = Arc::new(SimAdapter::new());
        let synchronizer =
            StateSynchronizer::new(sim.clone(), std::time::Duration::from_millis(500));
        synchronizer
            .cache()
            .store_positions_at(
                vec![position("BTC/USD")],
                Utc::now() - Duration::seconds(10),
            )
            .await;
        sim.set_position(position("ETH/USD"));

        let snapshot = synchronizer.sync_positions(None).await.unwrap();
        assert_eq!(snapshot.source, SnapshotSource::Direct);
        assert_eq!(snapshot.positions[0].symbol, Symbol::new("ETH/USD"));
    }

    #[tokio::test]
    async fn test_empty_cache_direct_errors_propagate() {
        let sim = Arc::new(SimAdapter::new());
        sim.push_fetch_failure(ExchangeError::Auth {
            message: "bad key".to_string(),
        });
        let synchronizer =
            StateSynchronizer::new(sim.clone(), std::time::Duration::from_secs(1));

        let result = synchronizer.sync_positions(None).await;
        assert!(matches!(result, Err(ExchangeError::Auth { .. })));
    }

    #[tokio::test]
    async fn test_order_snapshots_carry_provenance() {
        let sim = Arc::new(SimAdapter::new());
        let synchronizer =
            StateSynchronizer::new(sim.clone(), std::time::Duration::from_secs(60));

        // Nothing cached yet: the direct path answers and says so
        let snapshot = synchronizer.sync_open_orders(None).await.unwrap();
        assert_eq!(snapshot.source, SnapshotSource::Direct);
        assert!(snapshot.orders.is_empty());

        synchronizer.cache().store_orders(Vec::new()).await;
        let snapshot = synchronizer.sync_open_orders(None).await.unwrap();
        assert_eq!(snapshot.source, SnapshotSource::Cache);
    }

    #[tokio::test]
    async fn test_filter_applied_on_cache_path() {
        let sim = Arc::new(SimAdapter::new());
        let synchronizer =
            StateSynchronizer::new(sim.clone(), std::time::Duration::from_secs(60));
        synchronizer
            .cache()
            .store_positions(vec![position("BTC/USD"), position("ETH/USD")])
            .await;

        let filter = [Symbol::new("BTC/USD")];
        let snapshot = synchronizer.sync_positions(Some(&filter)).await.unwrap();
        assert_eq!(snapshot.source, SnapshotSource::Cache);
        assert_eq!(snapshot.positions.len(), 1);
        assert_eq!(snapshot.positions[0].symbol, Symbol::new("BTC/USD"));
    }
}
