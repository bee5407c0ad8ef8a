use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Size type using NewType pattern for type safety
/// Represents position/order quantity and is distinct from Price
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Size(pub Decimal);

impl Size {
    /// Create a new Size from a Decimal
    pub fn new(value: Decimal) -> Self {
        Self(value)
    }

    /// Get the underlying Decimal value
    pub fn value(&self) -> Decimal {
        self.0
    }

    /// Create a Size from a string
    pub fn from_str(s: &str) -> Result<Self, rust_decimal::Error> {
        let decimal = Decimal::from_str(s)?;
        Ok(Self(decimal))
    }

    /// Check if the size is zero
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Size quantities from venue position feeds can be signed; exits always
    /// work with magnitudes
    pub fn abs(&self) -> Self {
        Self(self.0.abs())
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// Serialize as string to preserve precision on the wire
impl Serialize for Size {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for Size {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let decimal = Decimal::from_str(&s).map_err(serde::de::Error::custom)?;
        Ok(Size(decimal))
    }
}

impl std::ops::Add for Size {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self(self.0 + other.0)
    }
}

impl std::ops::Sub for Size {
    type Output = Self;

    fn sub(self, other: Self) -> Self {
        Self(self.0 - other.0)
    }
}

impl std::ops::Mul<Decimal> for Size {
    type Output = Self;

    fn mul(self, rhs: Decimal) -> Self {
        Self(self.0 * rhs)
    }
}

// Size * Price -> notional value
impl std::ops::Mul<crate::types::Price> for Size {
    type Output = Decimal;

    fn mul(self, rhs: crate::types::Price) -> Decimal {
        self.0 * rhs.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Price;
    use rust_decimal::Decimal;

    #[test]
    fn test_size_creation() {
        let size = Size::new(Decimal::new(1500, 2)); // 15.00
        assert_eq!(size.value(), Decimal::new(1500, 2));
    }

    #[test]
    fn test_size_arithmetic() {
        let size1 = Size::new(Decimal::new(1000, 2)); // 10.00
        let size2 = Size::new(Decimal::new(500, 2)); // 5.00

        assert_eq!((size1 + size2).value(), Decimal::new(1500, 2));
        assert_eq!((size1 - size2).value(), Decimal::new(500, 2));
    }

    #[test]
    fn test_size_abs_of_signed_quantity() {
        // Short positions report negative contracts on some venues
        let size = Size::new(Decimal::new(-250, 2));
        assert_eq!(size.abs().value(), Decimal::new(250, 2));
    }

    #[test]
    fn test_size_notional() {
        let price = Price::new(Decimal::new(10000, 2)); // 100.00
        let size = Size::new(Decimal::new(1500, 2)); // 15.00
        assert_eq!(size * price, Decimal::new(150000, 2)); // 1500.00
    }

    #[test]
    fn test_size_is_zero() {
        assert!(Size::new(Decimal::ZERO).is_zero());
        assert!(!Size::new(Decimal::new(100, 2)).is_zero());
    }

    #[test]
    fn test_size_serialization() {
        let size = Size::new(Decimal::new(1500, 2)); // 15.00

        let json = serde_json::to_string(&size).unwrap();
        assert_eq!(json, "\"15.00\"");

        let deserialized: Size = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, size);
    }
}
