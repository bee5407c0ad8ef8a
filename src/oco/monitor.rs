use crate::config::CroupierConfig;
use crate::core::{ids, BracketPair, Order, OrderKind, Position, PositionKey};
use crate::exchanges::{ExchangeAdapter, ExchangeError};
use crate::monitoring::{AlertKind, AlertLevel, AlertSink};
use crate::oco::supervisor::{ClosedPosition, OcoSupervisor, SupervisorHandle};
use crate::sync::StateSynchronizer;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Owns the arena of bracket supervisors and keeps it consistent with the
/// venue. Supervisors are created and destroyed here and nowhere else.
pub struct PositionMonitor {
    adapter: Arc<dyn ExchangeAdapter>,
    synchronizer: Arc<StateSynchronizer>,
    alerts: Arc<AlertSink>,
    config: CroupierConfig,
    supervisors: DashMap<PositionKey, SupervisorHandle>,
    /// Client order IDs of legs belonging to supervised positions
    tracked_legs: DashMap<String, PositionKey>,
    closed: Mutex<Vec<ClosedPosition>>,
}

impl PositionMonitor {
    pub fn new(
        synchronizer: Arc<StateSynchronizer>,
        alerts: Arc<AlertSink>,
        config: CroupierConfig,
    ) -> Self {
        Self {
            adapter: synchronizer.adapter(),
            synchronizer,
            alerts,
            config,
            supervisors: DashMap::new(),
            tracked_legs: DashMap::new(),
            closed: Mutex::new(Vec::new()),
        }
    }

    /// Put a freshly armed bracket under supervision
    pub fn watch(&self, position: Position, bracket: BracketPair) {
        let key = position.key();
        for leg in [&bracket.take_profit, &bracket.stop_loss] {
            if let Some(client_id) = &leg.client_order_id {
                self.tracked_legs.insert(client_id.clone(), key.clone());
            }
        }
        let handle = OcoSupervisor::spawn(
            self.adapter.clone(),
            self.alerts.clone(),
            position,
            bracket,
            &self.config,
        );
        self.supervisors.insert(key, handle);
    }

    pub fn is_supervised(&self, key: &PositionKey) -> bool {
        self.supervisors.contains_key(key)
    }

    pub fn supervised_count(&self) -> usize {
        self.supervisors.len()
    }

    /// Ask one supervisor to close its position
    pub fn request_close(&self, key: &PositionKey) -> bool {
        match self.supervisors.get(key) {
            Some(handle) => {
                handle.manual_close();
                true
            }
            None => false,
        }
    }

    /// Drain the record of positions that finished since the last call
    pub async fn take_closed(&self) -> Vec<ClosedPosition> {
        std::mem::take(&mut *self.closed.lock().await)
    }

    /// One reconcile cycle: reap finished supervisors, adopt venue positions
    /// nobody watches, investigate supervised positions the venue no longer
    /// shows, and sweep orphaned engine orders.
    pub async fn reconcile_once(&self) -> Result<(), ExchangeError> {
        self.reap_finished().await;

        let snapshot = self.synchronizer.sync_positions(None).await?;

        for position in &snapshot.positions {
            if !self.supervisors.contains_key(&position.key()) {
                self.try_adopt(position).await?;
            }
        }

        let missing: Vec<PositionKey> = self
            .supervisors
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|key| snapshot.find(key).is_none())
            .collect();
        for key in missing {
            self.investigate_ghost(&key).await?;
        }

        self.sweep_orphan_orders().await?;
        Ok(())
    }

    /// Run reconcile cycles forever
    pub fn spawn_reconcile_loop(self: Arc<Self>, interval: std::time::Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(err) = self.reconcile_once().await {
                    log::warn!("reconcile cycle failed: {}", err);
                }
            }
        })
    }

    /// Detach every supervisor without touching the venue (process drain)
    pub async fn shutdown_all(&self) {
        let keys: Vec<PositionKey> = self
            .supervisors
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for key in keys {
            if let Some((_, handle)) = self.supervisors.remove(&key) {
                handle.shutdown();
                handle.wait().await;
            }
        }
    }

    async fn reap_finished(&self) {
        let finished: Vec<PositionKey> = self
            .supervisors
            .iter()
            .filter(|entry| entry.value().is_finished())
            .map(|entry| entry.key().clone())
            .collect();
        for key in finished {
            let Some((_, handle)) = self.supervisors.remove(&key) else {
                continue;
            };
            self.tracked_legs.retain(|_, v| *v != key);
            if let Some(closed) = handle.wait().await {
                log::info!("{}: position resolved via {:?}", key, closed.exit_kind);
                self.closed.lock().await.push(closed);
            }
        }
    }

    /// A venue position nobody supervises: find its exit legs and put it
    /// back under management. Restart recovery rides this path.
    async fn try_adopt(&self, position: &Position) -> Result<(), ExchangeError> {
        let symbols = [position.symbol.clone()];
        let open_orders = self.adapter.fetch_open_orders(Some(&symbols)).await?;

        // Legs we tagged ourselves are always reattached; foreign legs only
        // when heuristic adoption is enabled
        let bracket = find_bracket_by_client_ids(&open_orders).or_else(|| {
            if self.config.adopt_unknown_positions {
                find_bracket_by_shape(position, &open_orders)
            } else {
                None
            }
        });

        match bracket {
            Some(bracket) => {
                log::info!("{}: adopting position with existing exit legs", position.key());
                self.watch(position.clone(), bracket);
            }
            None => {
                self.alerts
                    .emit(
                        AlertLevel::Warning,
                        AlertKind::General,
                        "monitor",
                        format!(
                            "{}: open position has no recognizable exit legs, \
                             leaving unsupervised",
                            position.key()
                        ),
                    )
                    .await;
            }
        }
        Ok(())
    }

    /// A supervised position the venue stopped reporting. Confirm with a
    /// direct fetch before tearing anything down; a stale cache read must
    /// never kill a live supervisor.
    async fn investigate_ghost(&self, key: &PositionKey) -> Result<(), ExchangeError> {
        let symbols = [key.symbol.clone()];
        let direct = self.adapter.fetch_positions(Some(&symbols)).await?;
        if direct.iter().any(|p| p.key() == *key) {
            return Ok(());
        }

        // Gone for real. If a leg filled, the supervisor resolves on its
        // own; otherwise the close happened behind our back and the legs
        // need sweeping.
        let open_orders = self.adapter.fetch_open_orders(Some(&symbols)).await?;
        let legs_still_open = open_orders.iter().any(|o| {
            o.client_order_id
                .as_deref()
                .map(|id| self.tracked_legs.contains_key(id))
                .unwrap_or(false)
        });
        if legs_still_open {
            self.alerts
                .emit(
                    AlertLevel::Error,
                    AlertKind::GhostPosition,
                    "monitor",
                    format!("{}: position closed externally, sweeping exit legs", key),
                )
                .await;
            if let Some(handle) = self.supervisors.get(key) {
                handle.manual_close();
            }
        }
        Ok(())
    }

    /// Cancel open engine-tagged orders that belong to no supervised
    /// position
    async fn sweep_orphan_orders(&self) -> Result<(), ExchangeError> {
        let open_orders = self.adapter.fetch_open_orders(None).await?;
        let mut swept = 0usize;
        for order in open_orders {
            let Some(client_id) = order.client_order_id.as_deref() else {
                continue;
            };
            let Some(kind) = ids::parse_client_id(client_id) else {
                continue;
            };
            if kind == OrderKind::Entry {
                continue;
            }
            if self.tracked_legs.contains_key(client_id) {
                continue;
            }
            match self.adapter.cancel_order(&order.id, &order.symbol).await {
                Ok(_) => swept += 1,
                Err(err) => log::warn!("orphan cancel of {} failed: {}", order.id, err),
            }
        }
        if swept > 0 {
            self.alerts
                .emit(
                    AlertLevel::Warning,
                    AlertKind::OrphanOrders,
                    "monitor",
                    format!("cancelled {} orphaned exit orders", swept),
                )
                .await;
        }
        Ok(())
    }
}

/// Match exit legs by the engine's own client ID tags
fn find_bracket_by_client_ids(open_orders: &[Order]) -> Option<BracketPair> {
    let find = |kind: OrderKind| {
        open_orders.iter().find(|o| {
            o.client_order_id
                .as_deref()
                .and_then(ids::parse_client_id)
                == Some(kind)
        })
    };
    Some(BracketPair {
        take_profit: find(OrderKind::TakeProfit)?.clone(),
        stop_loss: find(OrderKind::StopLoss)?.clone(),
    })
}

/// Fall back to order shape: reduce-only closers on the right side, limit
/// for the profit leg and stop for the protective leg
fn find_bracket_by_shape(position: &Position, open_orders: &[Order]) -> Option<BracketPair> {
    let closing_side = position.side.closing_order_side();
    let closers: Vec<&Order> = open_orders
        .iter()
        .filter(|o| o.side == closing_side && o.reduce_only && o.is_open())
        .collect();

    let take_profit = closers
        .iter()
        .find(|o| o.order_type == crate::core::OrderType::Limit)?;
    let stop_loss = closers
        .iter()
        .find(|o| o.order_type == crate::core::OrderType::StopMarket)?;
    Some(BracketPair {
        take_profit: (*take_profit).clone(),
        stop_loss: (*stop_loss).clone(),
    })
}
