//! End-to-end bracket supervision scenarios against the simulated venue.

use chrono::Utc;
use croupier::core::{BracketPair, OrderKind, Position};
use croupier::monitoring::{AlertKind, AlertLevel, AlertSink};
use croupier::oco::{OcoSupervisor, PositionMonitor, SupervisorState};
use croupier::{
    CroupierConfig, ExchangeAdapter, ExchangeError, ExitKind, OrderSide, OrderSpec, OrderStatus,
    Price, SimAdapter, Size, StateSynchronizer, Symbol,
};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;

fn test_config() -> CroupierConfig {
    CroupierConfig {
        leg_poll_interval: Duration::from_millis(10),
        ..CroupierConfig::default()
    }
}

/// Open a long position on the venue and rest both exit legs
async fn armed_bracket(sim: &SimAdapter) -> (Position, BracketPair, String, String) {
    let symbol = Symbol::new("BTC/USD");
    let entry = OrderSpec::market(
        symbol.clone(),
        OrderSide::Buy,
        Size::new(Decimal::ONE),
        OrderKind::Entry,
    );
    sim.place_order(&entry).await.unwrap();
    sim.fill_order_by_client_id(
        &entry.client_order_id,
        Price::from_str("100").unwrap(),
        Utc::now(),
    );

    let tp_spec = OrderSpec::limit(
        symbol.clone(),
        OrderSide::Sell,
        Size::new(Decimal::ONE),
        Price::from_str("102").unwrap(),
        OrderKind::TakeProfit,
    )
    .reduce_only();
    let sl_spec = OrderSpec::stop_market(
        symbol.clone(),
        OrderSide::Sell,
        Size::new(Decimal::ONE),
        Price::from_str("99").unwrap(),
        OrderKind::StopLoss,
    )
    .reduce_only();
    let take_profit = sim.place_order(&tp_spec).await.unwrap();
    let stop_loss = sim.place_order(&sl_spec).await.unwrap();
    let position = sim.fetch_positions(None).await.unwrap().remove(0);

    (
        position,
        BracketPair {
            take_profit,
            stop_loss,
        },
        tp_spec.client_order_id,
        sl_spec.client_order_id,
    )
}

#[tokio::test(start_paused = true)]
async fn test_take_profit_fill_cancels_stop_and_settles() {
    let sim = Arc::new(SimAdapter::new());
    let alerts = Arc::new(AlertSink::default());
    let (position, bracket, tp_id, sl_id) = armed_bracket(&sim).await;

    let handle = OcoSupervisor::spawn(
        sim.clone(),
        alerts.clone(),
        position,
        bracket,
        &test_config(),
    );

    sim.fill_order_by_client_id(&tp_id, Price::from_str("102").unwrap(), Utc::now());

    let closed = handle.wait().await.unwrap();
    assert_eq!(closed.exit_kind, ExitKind::TakeProfit);
    assert!(closed.over_exit.is_none());
    assert_eq!(
        sim.order_by_client_id(&sl_id).unwrap().status,
        OrderStatus::Cancelled
    );
    // The reduce-only fill flattened the venue position
    assert!(sim.fetch_positions(None).await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_double_fill_earlier_timestamp_is_authoritative() {
    let sim = Arc::new(SimAdapter::new());
    let alerts = Arc::new(AlertSink::default());
    let (position, bracket, tp_id, sl_id) = armed_bracket(&sim).await;

    // Both legs fill before the supervisor can react, stop first by 10ms
    let stop_fill_at = Utc::now();
    sim.fill_order_by_client_id(&sl_id, Price::from_str("99").unwrap(), stop_fill_at);
    sim.fill_order_by_client_id(
        &tp_id,
        Price::from_str("102").unwrap(),
        stop_fill_at + chrono::Duration::milliseconds(10),
    );

    let handle = OcoSupervisor::spawn(
        sim.clone(),
        alerts.clone(),
        position,
        bracket,
        &test_config(),
    );

    let closed = handle.wait().await.unwrap();
    assert_eq!(closed.exit_kind, ExitKind::StopLoss);
    let over_exit = closed.over_exit.expect("both fills must be recorded");
    assert_eq!(over_exit.authoritative, OrderKind::StopLoss);
    assert!(over_exit.take_profit_fill.is_filled());
    assert!(over_exit.stop_loss_fill.is_filled());

    let raised = alerts.by_kind(AlertKind::OverExit).await;
    assert_eq!(raised.len(), 1);
    assert_eq!(raised[0].level, AlertLevel::Critical);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_exhaustion_reconciles_and_later_resolves() {
    let sim = Arc::new(SimAdapter::new());
    let alerts = Arc::new(AlertSink::default());
    let (position, bracket, tp_id, sl_id) = armed_bracket(&sim).await;

    // First attempt plus the full retry budget all fail
    for _ in 0..4 {
        sim.push_cancel_failure(ExchangeError::transient("venue unavailable"));
    }

    let mut handle = OcoSupervisor::spawn(
        sim.clone(),
        alerts.clone(),
        position,
        bracket,
        &test_config(),
    );

    sim.fill_order_by_client_id(&tp_id, Price::from_str("102").unwrap(), Utc::now());
    handle.wait_for_state(SupervisorState::Reconciling).await;

    // The venue recovers and the reconcile loop finishes the cancel
    let closed = handle.wait().await.unwrap();
    assert_eq!(closed.exit_kind, ExitKind::TakeProfit);
    assert_eq!(
        sim.order_by_client_id(&sl_id).unwrap().status,
        OrderStatus::Cancelled
    );
}

#[tokio::test(start_paused = true)]
async fn test_externally_closed_position_sweeps_legs_via_monitor() {
    let sim = Arc::new(SimAdapter::new());
    let alerts = Arc::new(AlertSink::default());
    let synchronizer = Arc::new(StateSynchronizer::new(
        sim.clone(),
        Duration::from_millis(50),
    ));
    let monitor = PositionMonitor::new(synchronizer, alerts.clone(), test_config());

    let (position, bracket, tp_id, sl_id) = armed_bracket(&sim).await;
    let symbol = position.symbol.clone();
    monitor.watch(position, bracket);

    // Someone flattens the position on the venue behind the engine's back
    sim.remove_position(&symbol);
    monitor.reconcile_once().await.unwrap();
    assert_eq!(alerts.by_kind(AlertKind::GhostPosition).await.len(), 1);

    // The requested sweep cancels both legs and the supervisor resolves
    tokio::time::sleep(Duration::from_secs(2)).await;
    monitor.reconcile_once().await.unwrap();
    assert_eq!(monitor.supervised_count(), 0);
    for leg_id in [&tp_id, &sl_id] {
        assert_eq!(
            sim.order_by_client_id(leg_id).unwrap().status,
            OrderStatus::Cancelled
        );
    }
}
