use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Engine tuning knobs. Credentials live on the adapter constructors, not
/// here; this struct is safe to log and serialize.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CroupierConfig {
    /// Cached venue state older than this is treated as absent
    #[serde(with = "duration_ms")]
    pub staleness_window: Duration,
    /// Background cache refresh interval
    #[serde(with = "duration_ms")]
    pub cache_poll_interval: Duration,
    /// Supervisor leg-poll interval
    #[serde(with = "duration_ms")]
    pub leg_poll_interval: Duration,
    /// Monitor reconcile cycle interval
    #[serde(with = "duration_ms")]
    pub reconcile_interval: Duration,
    /// Retry budget for cancelling the surviving bracket leg
    pub cancel_max_retries: u32,
    #[serde(with = "duration_ms")]
    pub retry_base_delay: Duration,
    pub retry_factor: u32,
    #[serde(with = "duration_ms")]
    pub retry_max_delay: Duration,
    /// Retry budget for everything except leg cancels
    pub max_retries: u32,
    /// How long to wait for the entry order to fill before aborting the
    /// bracket
    #[serde(with = "duration_ms")]
    pub entry_fill_timeout: Duration,
    /// Open positions allowed per symbol per venue
    pub max_positions_per_symbol: usize,
    /// Default exit distances, as fractions of entry price
    pub take_profit_pct: Decimal,
    pub stop_loss_pct: Decimal,
    /// A supervisor reconciling longer than this raises an operator alert
    #[serde(with = "duration_ms")]
    pub stuck_reconcile_threshold: Duration,
    /// Adopt venue positions whose exit legs carry no engine tags, matching
    /// legs by side and order type instead
    pub adopt_unknown_positions: bool,
}

impl Default for CroupierConfig {
    fn default() -> Self {
        Self {
            staleness_window: Duration::from_secs(1),
            cache_poll_interval: Duration::from_millis(500),
            leg_poll_interval: Duration::from_millis(250),
            reconcile_interval: Duration::from_secs(30),
            cancel_max_retries: 3,
            retry_base_delay: Duration::from_millis(200),
            retry_factor: 2,
            retry_max_delay: Duration::from_secs(10),
            max_retries: 3,
            entry_fill_timeout: Duration::from_secs(10),
            max_positions_per_symbol: 1,
            take_profit_pct: Decimal::new(2, 2),
            stop_loss_pct: Decimal::new(1, 2),
            stuck_reconcile_threshold: Duration::from_secs(120),
            adopt_unknown_positions: true,
        }
    }
}

impl CroupierConfig {
    pub fn retry_policy(&self) -> crate::exchanges::RetryPolicy {
        crate::exchanges::RetryPolicy {
            max_retries: self.max_retries,
            base_delay: self.retry_base_delay,
            factor: self.retry_factor,
            max_delay: self.retry_max_delay,
        }
    }

    pub fn cancel_retry_policy(&self) -> crate::exchanges::RetryPolicy {
        crate::exchanges::RetryPolicy {
            max_retries: self.cancel_max_retries,
            base_delay: self.retry_base_delay,
            factor: self.retry_factor,
            max_delay: self.retry_max_delay,
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CroupierConfig::default();
        assert_eq!(config.staleness_window, Duration::from_secs(1));
        assert_eq!(config.max_positions_per_symbol, 1);
        assert_eq!(config.cancel_max_retries, 3);
    }

    #[test]
    fn test_deserialization_with_partial_overrides() {
        let config: CroupierConfig = serde_json::from_str(
            r#"{"staleness_window": 2500, "max_positions_per_symbol": 2}"#,
        )
        .unwrap();
        assert_eq!(config.staleness_window, Duration::from_millis(2500));
        assert_eq!(config.max_positions_per_symbol, 2);
        // Untouched fields keep their defaults
        assert_eq!(config.cancel_max_retries, 3);
    }

    #[test]
    fn test_retry_policy_mapping() {
        let config = CroupierConfig::default();
        let policy = config.cancel_retry_policy();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.base_delay, Duration::from_millis(200));
    }
}
