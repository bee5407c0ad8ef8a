use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Alert level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AlertLevel {
    Info,
    Warning,
    Error,
    Critical,
}

/// What the alert is about. Over-exits and stuck reconciliations require an
/// operator; they are never just log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertKind {
    OverExit,
    StuckReconciling,
    OrphanOrders,
    GhostPosition,
    PartialBracketRollback,
    General,
}

/// An alert
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub level: AlertLevel,
    pub kind: AlertKind,
    pub message: String,
    pub component: String,
    pub timestamp: DateTime<Utc>,
}

/// Bounded in-memory alert buffer with subscriber callbacks
pub struct AlertSink {
    alerts: Arc<RwLock<VecDeque<Alert>>>,
    max_alerts: usize,
    callbacks: Arc<RwLock<Vec<Box<dyn Fn(&Alert) + Send + Sync>>>>,
}

impl AlertSink {
    pub fn new(max_alerts: usize) -> Self {
        Self {
            alerts: Arc::new(RwLock::new(VecDeque::new())),
            max_alerts,
            callbacks: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Emit an alert
    pub async fn emit(&self, level: AlertLevel, kind: AlertKind, component: &str, message: String) {
        let alert = Alert {
            level,
            kind,
            message,
            component: component.to_string(),
            timestamp: Utc::now(),
        };

        let mut alerts = self.alerts.write().await;
        alerts.push_back(alert.clone());
        while alerts.len() > self.max_alerts {
            alerts.pop_front();
        }
        drop(alerts);

        let callbacks = self.callbacks.read().await;
        for callback in callbacks.iter() {
            callback(&alert);
        }

        match level {
            AlertLevel::Info => log::info!("[{}] {}", alert.component, alert.message),
            AlertLevel::Warning => log::warn!("[{}] {}", alert.component, alert.message),
            AlertLevel::Error => log::error!("[{}] {}", alert.component, alert.message),
            AlertLevel::Critical => {
                log::error!("[CRITICAL] [{}] {}", alert.component, alert.message)
            }
        }
    }

    /// Register an alert callback
    pub async fn register_callback<F>(&self, callback: F)
    where
        F: Fn(&Alert) + Send + Sync + 'static,
    {
        self.callbacks.write().await.push(Box::new(callback));
    }

    /// Most recent alerts, newest first
    pub async fn recent(&self, count: usize) -> Vec<Alert> {
        let alerts = self.alerts.read().await;
        alerts.iter().rev().take(count).cloned().collect()
    }

    pub async fn by_kind(&self, kind: AlertKind) -> Vec<Alert> {
        let alerts = self.alerts.read().await;
        alerts.iter().filter(|a| a.kind == kind).cloned().collect()
    }

    pub async fn clear(&self) {
        *self.alerts.write().await = VecDeque::new();
    }
}

impl Default for AlertSink {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_emit_and_query_by_kind() {
        let sink = AlertSink::new(10);
        sink.emit(
            AlertLevel::Critical,
            AlertKind::OverExit,
            "supervisor",
            "both exit legs filled for binance:BTC/USDT".to_string(),
        )
        .await;
        sink.emit(
            AlertLevel::Info,
            AlertKind::General,
            "croupier",
            "startup".to_string(),
        )
        .await;

        let over_exits = sink.by_kind(AlertKind::OverExit).await;
        assert_eq!(over_exits.len(), 1);
        assert_eq!(over_exits[0].level, AlertLevel::Critical);
    }

    #[tokio::test]
    async fn test_buffer_is_bounded() {
        let sink = AlertSink::new(3);
        for i in 0..5 {
            sink.emit(
                AlertLevel::Info,
                AlertKind::General,
                "test",
                format!("alert {}", i),
            )
            .await;
        }
        let recent = sink.recent(10).await;
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].message, "alert 4");
    }

    #[tokio::test]
    async fn test_callbacks_fire_on_emit() {
        let sink = AlertSink::new(10);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        sink.register_callback(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .await;

        sink.emit(
            AlertLevel::Warning,
            AlertKind::OrphanOrders,
            "monitor",
            "cancelled 2 orphan orders".to_string(),
        )
        .await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
