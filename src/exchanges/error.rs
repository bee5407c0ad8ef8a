use std::fmt;
use std::time::Duration;

/// Error taxonomy shared by every exchange adapter.
///
/// Adapters translate venue-specific failures (HTTP status codes, venue error
/// codes, transport errors) into these classes so the layers above can apply
/// one retry and reconciliation policy across venues.
#[derive(Debug, Clone)]
pub enum ExchangeError {
    /// Timeouts, connection resets, 5xx responses. Safe to retry.
    Transient { message: String },
    /// Venue asked us to slow down. Retry after backing off.
    RateLimited {
        message: String,
        /// Venue-provided wait hint, when the response carried one
        retry_after: Option<Duration>,
    },
    /// Bad or expired credentials. Never retried.
    Auth { message: String },
    /// Symbol has no mapping on this venue. Never retried.
    UnsupportedSymbol { raw: String, exchange: String },
    /// The request may or may not have taken effect (timeout after send,
    /// ambiguous venue response). Callers must query before resubmitting.
    AmbiguousOutcome {
        message: String,
        client_order_id: Option<String>,
    },
    /// Venue understood and refused the request (bad params, closed market).
    /// Never retried.
    Rejected { message: String },
}

impl ExchangeError {
    pub fn transient(message: impl Into<String>) -> Self {
        ExchangeError::Transient {
            message: message.into(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        ExchangeError::Rejected {
            message: message.into(),
        }
    }

    /// Whether the shared retry helper may replay the request as-is.
    /// AmbiguousOutcome is deliberately not retriable: resubmitting without
    /// querying first risks a duplicate order.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ExchangeError::Transient { .. } | ExchangeError::RateLimited { .. }
        )
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ExchangeError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl fmt::Display for ExchangeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeError::Transient { message } => {
                write!(f, "transient network error: {}", message)
            }
            ExchangeError::RateLimited {
                message,
                retry_after,
            } => match retry_after {
                Some(d) => write!(f, "rate limited (retry after {:?}): {}", d, message),
                None => write!(f, "rate limited: {}", message),
            },
            ExchangeError::Auth { message } => write!(f, "authentication failed: {}", message),
            ExchangeError::UnsupportedSymbol { raw, exchange } => {
                write!(f, "symbol '{}' not supported on {}", raw, exchange)
            }
            ExchangeError::AmbiguousOutcome {
                message,
                client_order_id,
            } => match client_order_id {
                Some(id) => write!(f, "ambiguous outcome for client id {}: {}", id, message),
                None => write!(f, "ambiguous outcome: {}", message),
            },
            ExchangeError::Rejected { message } => write!(f, "request rejected: {}", message),
        }
    }
}

impl std::error::Error for ExchangeError {}

impl From<reqwest::Error> for ExchangeError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            if status.as_u16() == 429 {
                return ExchangeError::RateLimited {
                    message: err.to_string(),
                    retry_after: None,
                };
            }
            if status.as_u16() == 401 || status.as_u16() == 403 {
                return ExchangeError::Auth {
                    message: err.to_string(),
                };
            }
        }
        // A timeout after the request left the socket means the venue may
        // have acted on it
        if err.is_timeout() {
            return ExchangeError::AmbiguousOutcome {
                message: err.to_string(),
                client_order_id: None,
            };
        }
        ExchangeError::Transient {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_classes() {
        assert!(ExchangeError::transient("reset").is_retriable());
        assert!(ExchangeError::RateLimited {
            message: "slow down".to_string(),
            retry_after: Some(Duration::from_secs(1)),
        }
        .is_retriable());

        assert!(!ExchangeError::Auth {
            message: "bad key".to_string()
        }
        .is_retriable());
        assert!(!ExchangeError::UnsupportedSymbol {
            raw: "DOGE-PERP".to_string(),
            exchange: "kraken".to_string()
        }
        .is_retriable());
        assert!(!ExchangeError::rejected("closed").is_retriable());
    }

    #[test]
    fn test_ambiguous_outcome_not_retriable() {
        let err = ExchangeError::AmbiguousOutcome {
            message: "send timeout".to_string(),
            client_order_id: Some("CR_ENTRY_abc".to_string()),
        };
        assert!(!err.is_retriable());
    }

    #[test]
    fn test_display_includes_wait_hint() {
        let err = ExchangeError::RateLimited {
            message: "1003".to_string(),
            retry_after: Some(Duration::from_millis(500)),
        };
        assert!(err.to_string().contains("500ms"));
    }
}
