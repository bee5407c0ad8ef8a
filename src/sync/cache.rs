use crate::core::{Order, Position};
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

struct Stamped<T> {
    value: T,
    refreshed_at: DateTime<Utc>,
}

/// Shared venue-state cache. The background updater is the only writer;
/// readers get a cloned snapshot plus its refresh time and decide for
/// themselves whether it is fresh enough.
#[derive(Default)]
pub struct SyncCache {
    positions: RwLock<Option<Stamped<Vec<Position>>>>,
    orders: RwLock<Option<Stamped<Vec<Order>>>>,
}

impl SyncCache {
    pub fn new() -> Self {
        Self {
            positions: RwLock::new(None),
            orders: RwLock::new(None),
        }
    }

    pub async fn store_positions(&self, positions: Vec<Position>) {
        self.store_positions_at(positions, Utc::now()).await;
    }

    /// Store with an explicit refresh time. Tests use this to age the cache.
    pub async fn store_positions_at(&self, positions: Vec<Position>, at: DateTime<Utc>) {
        *self.positions.write().await = Some(Stamped {
            value: positions,
            refreshed_at: at,
        });
    }

    pub async fn positions(&self) -> Option<(Vec<Position>, DateTime<Utc>)> {
        self.positions
            .read()
            .await
            .as_ref()
            .map(|s| (s.value.clone(), s.refreshed_at))
    }

    pub async fn store_orders(&self, orders: Vec<Order>) {
        *self.orders.write().await = Some(Stamped {
            value: orders,
            refreshed_at: Utc::now(),
        });
    }

    pub async fn orders(&self) -> Option<(Vec<Order>, DateTime<Utc>)> {
        self.orders
            .read()
            .await
            .as_ref()
            .map(|s| (s.value.clone(), s.refreshed_at))
    }

    /// Drop cached state, forcing the next sync onto the direct path
    pub async fn invalidate(&self) {
        *self.positions.write().await = None;
        *self.orders.write().await = None;
    }
}
