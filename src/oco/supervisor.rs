use crate::config::CroupierConfig;
use crate::core::{BracketPair, Order, OrderKind, OrderStatus, Position, PositionKey};
use crate::exchanges::{retry, CancelOutcome, ExchangeAdapter, ExchangeError, OrderSpec, RetryPolicy};
use crate::monitoring::{AlertKind, AlertLevel, AlertSink};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Supervisor lifecycle. Every uncertain path leads to Reconciling, never
/// back to Armed and never silently to Settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Armed,
    Triggered,
    Reconciling,
    Settled,
}

#[derive(Debug)]
pub enum SupervisorCommand {
    ManualClose,
    Shutdown,
}

/// How the position left the book
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    TakeProfit,
    StopLoss,
    Manual,
    /// Closed on the venue without either leg filling (liquidation,
    /// external interference)
    External,
}

/// Both exit legs filled. The authoritative leg is the economically
/// realized exit; the other fill flipped the position and needs an operator.
#[derive(Debug, Clone)]
pub struct OverExit {
    pub authoritative: OrderKind,
    pub take_profit_fill: Order,
    pub stop_loss_fill: Order,
}

/// Final report a supervisor hands back to the monitor
#[derive(Debug, Clone)]
pub struct ClosedPosition {
    pub key: PositionKey,
    pub exit_kind: ExitKind,
    pub exit_order: Option<Order>,
    pub over_exit: Option<OverExit>,
    pub closed_at: chrono::DateTime<chrono::Utc>,
}

/// Monitor-facing handle to a running supervisor task
pub struct SupervisorHandle {
    pub key: PositionKey,
    cmd_tx: mpsc::Sender<SupervisorCommand>,
    state_rx: watch::Receiver<SupervisorState>,
    task: JoinHandle<Option<ClosedPosition>>,
}

impl SupervisorHandle {
    pub fn state(&self) -> SupervisorState {
        *self.state_rx.borrow()
    }

    /// Wait until the supervisor reports the given state
    pub async fn wait_for_state(&mut self, state: SupervisorState) {
        while *self.state_rx.borrow() != state {
            if self.state_rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Non-blocking; a full command queue means the supervisor is already
    /// busy resolving, and the request is dropped
    pub fn manual_close(&self) {
        let _ = self.cmd_tx.try_send(SupervisorCommand::ManualClose);
    }

    pub fn shutdown(&self) {
        let _ = self.cmd_tx.try_send(SupervisorCommand::Shutdown);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Join the task. None means the supervisor was shut down without
    /// resolving the position.
    pub async fn wait(self) -> Option<ClosedPosition> {
        match self.task.await {
            Ok(result) => result,
            Err(err) => {
                log::error!("supervisor task panicked: {}", err);
                None
            }
        }
    }
}

/// Watches one position's bracket: on one leg's fill, cancels the other;
/// drives every uncertain outcome through reconciliation.
pub struct OcoSupervisor {
    adapter: Arc<dyn ExchangeAdapter>,
    alerts: Arc<AlertSink>,
    position: Position,
    bracket: BracketPair,
    leg_poll_interval: Duration,
    cancel_policy: RetryPolicy,
    stuck_threshold: Duration,
    state_tx: watch::Sender<SupervisorState>,
    cmd_rx: mpsc::Receiver<SupervisorCommand>,
    manual_requested: bool,
    broken_leg_alerted: bool,
}

impl OcoSupervisor {
    pub fn spawn(
        adapter: Arc<dyn ExchangeAdapter>,
        alerts: Arc<AlertSink>,
        position: Position,
        bracket: BracketPair,
        config: &CroupierConfig,
    ) -> SupervisorHandle {
        let key = position.key();
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let (state_tx, state_rx) = watch::channel(SupervisorState::Armed);

        let supervisor = OcoSupervisor {
            adapter,
            alerts,
            position,
            bracket,
            leg_poll_interval: config.leg_poll_interval,
            cancel_policy: config.cancel_retry_policy(),
            stuck_threshold: config.stuck_reconcile_threshold,
            state_tx,
            cmd_rx,
            manual_requested: false,
            broken_leg_alerted: false,
        };
        let task = tokio::spawn(supervisor.run());

        SupervisorHandle {
            key,
            cmd_tx,
            state_rx,
            task,
        }
    }

    fn set_state(&self, state: SupervisorState) {
        let _ = self.state_tx.send(state);
    }

    async fn run(mut self) -> Option<ClosedPosition> {
        log::info!(
            "supervising {} bracket: tp {} / sl {}",
            self.position.key(),
            self.bracket.take_profit.id,
            self.bracket.stop_loss.id
        );

        let mut ticker = tokio::time::interval(self.leg_poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        // Armed: watch both legs until something happens
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(SupervisorCommand::ManualClose) => {
                        self.manual_requested = true;
                        self.cancel_both_legs().await;
                        return self.reconcile().await;
                    }
                    Some(SupervisorCommand::Shutdown) | None => return None,
                },
                _ = ticker.tick() => {
                    let (tp, sl) = match self.query_legs().await {
                        Ok(pair) => pair,
                        Err(err) => {
                            log::debug!("{}: leg poll failed: {}", self.position.key(), err);
                            continue;
                        }
                    };
                    self.bracket.take_profit = tp.clone();
                    self.bracket.stop_loss = sl.clone();

                    match (tp.is_filled(), sl.is_filled()) {
                        (true, true) => {
                            return Some(self.settle_over_exit(tp, sl, None).await);
                        }
                        (true, false) => {
                            return self.on_leg_filled(OrderKind::TakeProfit, tp, sl).await;
                        }
                        (false, true) => {
                            return self.on_leg_filled(OrderKind::StopLoss, sl, tp).await;
                        }
                        (false, false) => {
                            if tp.status.is_terminal() && sl.status.is_terminal() {
                                // Both legs gone without a fill: someone else
                                // took the bracket apart
                                return self.reconcile().await;
                            }
                            if !self.broken_leg_alerted
                                && (tp.status.is_terminal() || sl.status.is_terminal())
                            {
                                self.broken_leg_alerted = true;
                                self.alerts
                                    .emit(
                                        AlertLevel::Warning,
                                        AlertKind::General,
                                        "supervisor",
                                        format!(
                                            "{}: one exit leg was cancelled externally, \
                                             position is half-protected",
                                            self.position.key()
                                        ),
                                    )
                                    .await;
                            }
                        }
                    }
                }
            }
        }
    }

    /// One leg filled while the other was last seen open: cancel the
    /// survivor with a bounded retry budget
    async fn on_leg_filled(
        &mut self,
        filled_kind: OrderKind,
        filled: Order,
        other: Order,
    ) -> Option<ClosedPosition> {
        self.set_state(SupervisorState::Triggered);
        log::info!(
            "{}: {:?} leg filled at {:?}, cancelling the other leg",
            self.position.key(),
            filled_kind,
            filled.avg_fill_price
        );

        let adapter = self.adapter.clone();
        let other_id = other.id.clone();
        let other_symbol = other.symbol.clone();
        let outcome = retry(&self.cancel_policy, "cancel surviving leg", move || {
            let adapter = adapter.clone();
            let id = other_id.clone();
            let symbol = other_symbol.clone();
            async move { adapter.cancel_order(&id, &symbol).await }
        })
        .await;

        match outcome {
            Ok(CancelOutcome::Cancelled)
            | Ok(CancelOutcome::AlreadyTerminal(OrderStatus::Cancelled))
            | Ok(CancelOutcome::AlreadyTerminal(OrderStatus::Rejected))
            | Ok(CancelOutcome::AlreadyTerminal(OrderStatus::Expired)) => {
                Some(self.settle(exit_kind_for(filled_kind), Some(filled)))
            }
            Ok(CancelOutcome::AlreadyTerminal(_)) => {
                // The survivor left the book before the cancel landed.
                // Venues that only report "unknown order" cannot say how, so
                // re-query: an over-exit needs a confirmed fill, anything
                // else settles like a clean single-leg exit.
                match self.query_leg(&other).await {
                    Ok(other_final) if other_final.is_filled() => {
                        let (tp, sl) = if filled_kind == OrderKind::TakeProfit {
                            (filled, other_final)
                        } else {
                            (other_final, filled)
                        };
                        Some(self.settle_over_exit(tp, sl, Some(filled_kind)).await)
                    }
                    Ok(_) => Some(self.settle(exit_kind_for(filled_kind), Some(filled))),
                    Err(_) => self.reconcile().await,
                }
            }
            Err(err) => {
                log::warn!(
                    "{}: could not cancel surviving leg: {}",
                    self.position.key(),
                    err
                );
                self.reconcile().await
            }
        }
    }

    /// Reconciling: re-derive the truth from the venue until the position
    /// resolves. Only a Shutdown command leaves this loop unresolved.
    async fn reconcile(&mut self) -> Option<ClosedPosition> {
        self.set_state(SupervisorState::Reconciling);
        let entered = tokio::time::Instant::now();
        let mut stuck_alerted = false;
        let mut ticker = tokio::time::interval(self.leg_poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(SupervisorCommand::ManualClose) => {
                        self.manual_requested = true;
                    }
                    Some(SupervisorCommand::Shutdown) | None => return None,
                },
                _ = ticker.tick() => {
                    if !stuck_alerted && entered.elapsed() > self.stuck_threshold {
                        stuck_alerted = true;
                        self.alerts
                            .emit(
                                AlertLevel::Critical,
                                AlertKind::StuckReconciling,
                                "supervisor",
                                format!(
                                    "{}: reconciling for over {:?} without resolution",
                                    self.position.key(),
                                    self.stuck_threshold
                                ),
                            )
                            .await;
                    }

                    let (tp, sl) = match self.query_legs().await {
                        Ok(pair) => pair,
                        Err(err) => {
                            log::debug!(
                                "{}: reconcile poll failed: {}",
                                self.position.key(),
                                err
                            );
                            continue;
                        }
                    };
                    self.bracket.take_profit = tp.clone();
                    self.bracket.stop_loss = sl.clone();

                    match (tp.is_filled(), sl.is_filled()) {
                        (true, true) => {
                            return Some(self.settle_over_exit(tp, sl, None).await);
                        }
                        (true, false) if sl.status.is_terminal() => {
                            return Some(self.settle(ExitKind::TakeProfit, Some(tp)));
                        }
                        (false, true) if tp.status.is_terminal() => {
                            return Some(self.settle(ExitKind::StopLoss, Some(sl)));
                        }
                        (true, false) => {
                            // Single cancel attempt per cycle; the loop is
                            // the retry budget here
                            let _ = self.adapter.cancel_order(&sl.id, &sl.symbol).await;
                        }
                        (false, true) => {
                            let _ = self.adapter.cancel_order(&tp.id, &tp.symbol).await;
                        }
                        (false, false) => {
                            if self.manual_requested {
                                if !tp.status.is_terminal() || !sl.status.is_terminal() {
                                    self.cancel_both_legs().await;
                                    continue;
                                }
                                match self.close_remaining_position().await {
                                    Ok(exit_order) => {
                                        return Some(self.settle(ExitKind::Manual, exit_order));
                                    }
                                    Err(err) => {
                                        log::warn!(
                                            "{}: manual close attempt failed: {}",
                                            self.position.key(),
                                            err
                                        );
                                        continue;
                                    }
                                }
                            }
                            if tp.status.is_terminal() && sl.status.is_terminal() {
                                return Some(self.settle(ExitKind::External, None));
                            }
                        }
                    }
                }
            }
        }
    }

    async fn query_legs(&self) -> Result<(Order, Order), ExchangeError> {
        let tp = self.query_leg(&self.bracket.take_profit).await?;
        let sl = self.query_leg(&self.bracket.stop_loss).await?;
        Ok((tp, sl))
    }

    async fn query_leg(&self, leg: &Order) -> Result<Order, ExchangeError> {
        let client_id = leg.client_order_id.as_deref().ok_or_else(|| {
            ExchangeError::transient(format!("leg {} has no client id to poll by", leg.id))
        })?;
        self.adapter
            .query_order_by_client_id(client_id, &leg.symbol)
            .await?
            .ok_or_else(|| {
                ExchangeError::transient(format!("venue does not know leg {}", client_id))
            })
    }

    async fn cancel_both_legs(&self) {
        let tp = &self.bracket.take_profit;
        let sl = &self.bracket.stop_loss;
        let (tp_result, sl_result) = futures_util::join!(
            self.adapter.cancel_order(&tp.id, &tp.symbol),
            self.adapter.cancel_order(&sl.id, &sl.symbol),
        );
        for (leg, result) in [("tp", tp_result), ("sl", sl_result)] {
            if let Err(err) = result {
                log::warn!("{}: {} cancel failed: {}", self.position.key(), leg, err);
            }
        }
    }

    /// Direct position check, then a reduce-only market order for whatever
    /// quantity is still open. Ok(None) when the venue shows nothing left.
    async fn close_remaining_position(&self) -> Result<Option<Order>, ExchangeError> {
        let symbols = [self.position.symbol.clone()];
        let open = self.adapter.fetch_positions(Some(&symbols)).await?;
        let Some(remaining) = open.iter().find(|p| p.symbol == self.position.symbol) else {
            return Ok(None);
        };

        let spec = OrderSpec::market(
            remaining.symbol.clone(),
            remaining.side.closing_order_side(),
            remaining.quantity,
            OrderKind::ManualClose,
        )
        .reduce_only();
        let order = self.adapter.place_order(&spec).await?;
        Ok(Some(order))
    }

    async fn settle_over_exit(
        &mut self,
        tp: Order,
        sl: Order,
        first_seen: Option<OrderKind>,
    ) -> ClosedPosition {
        let authoritative = match (tp.filled_at, sl.filled_at) {
            (Some(a), Some(b)) if a < b => OrderKind::TakeProfit,
            (Some(a), Some(b)) if b < a => OrderKind::StopLoss,
            // Identical or missing timestamps: the fill observed first wins
            _ => first_seen.unwrap_or(OrderKind::TakeProfit),
        };

        self.alerts
            .emit(
                AlertLevel::Critical,
                AlertKind::OverExit,
                "supervisor",
                format!(
                    "{}: both exit legs filled; {:?} treated as the realized exit, \
                     the other fill opened an unintended position",
                    self.position.key(),
                    authoritative
                ),
            )
            .await;

        let exit_order = match authoritative {
            OrderKind::TakeProfit => tp.clone(),
            _ => sl.clone(),
        };
        let mut closed = self.settle(exit_kind_for(authoritative), Some(exit_order));
        closed.over_exit = Some(OverExit {
            authoritative,
            take_profit_fill: tp,
            stop_loss_fill: sl,
        });
        closed
    }

    fn settle(&mut self, exit_kind: ExitKind, exit_order: Option<Order>) -> ClosedPosition {
        self.set_state(SupervisorState::Settled);
        log::info!("{}: settled via {:?}", self.position.key(), exit_kind);
        ClosedPosition {
            key: self.position.key(),
            exit_kind,
            exit_order,
            over_exit: None,
            closed_at: Utc::now(),
        }
    }
}

fn exit_kind_for(kind: OrderKind) -> ExitKind {
    match kind {
        OrderKind::TakeProfit => ExitKind::TakeProfit,
        OrderKind::StopLoss => ExitKind::StopLoss,
        OrderKind::ManualClose => ExitKind::Manual,
        OrderKind::Entry => ExitKind::External,
    }
}
