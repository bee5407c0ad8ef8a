use serde::{Deserialize, Serialize};
use std::fmt;

/// Canonical trading-pair symbol in `BASE/QUOTE` form (e.g. "BTC/USD").
/// Uses NewType pattern for type safety.
///
/// Only exchange adapters ever see venue-native spellings ("BTCUSDT",
/// "PF_XBTUSD"); everything above the adapter seam speaks canonical symbols.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Symbol(String);

impl Symbol {
    /// Create a new Symbol from a canonical string
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the underlying string value
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Check that the symbol is in canonical `BASE/QUOTE` form
    pub fn is_canonical(&self) -> bool {
        match self.0.split_once('/') {
            Some((base, quote)) => {
                !base.is_empty()
                    && !quote.is_empty()
                    && base.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
                    && quote.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
            }
            None => false,
        }
    }

    /// Base asset of the pair ("BTC" for "BTC/USD")
    pub fn base(&self) -> &str {
        self.0.split_once('/').map(|(b, _)| b).unwrap_or(&self.0)
    }

    /// Quote asset of the pair ("USD" for "BTC/USD")
    pub fn quote(&self) -> &str {
        self.0.split_once('/').map(|(_, q)| q).unwrap_or("")
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Symbol {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Symbol {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<Symbol> for String {
    fn from(s: Symbol) -> String {
        s.0
    }
}

impl AsRef<str> for Symbol {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::borrow::Borrow<str> for Symbol {
    fn borrow(&self) -> &str {
        &self.0
    }
}
