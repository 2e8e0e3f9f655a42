//! Fixed-point budget amounts.
//!
//! Budgets travel on the wire as decimal strings with exactly two fraction
//! digits (`"100.00"`). Internally they are integer cents so arithmetic is
//! exact; no floating point is involved anywhere in budget accounting.

use std::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// A non-negative monetary amount in whole cents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BudgetAmount(u64);

impl BudgetAmount {
    /// Zero amount.
    pub const ZERO: Self = Self(0);

    /// Creates an amount from whole cents.
    #[must_use]
    pub const fn from_cents(cents: u64) -> Self {
        Self(cents)
    }

    /// The amount in whole cents.
    #[must_use]
    pub const fn cents(self) -> u64 {
        self.0
    }

    /// Parses the wire format `"\d+\.\d{2}"`.
    ///
    /// # Errors
    ///
    /// Returns `ShapeInvalid` with reason `BudgetFormat` for anything that
    /// is not digits, a dot, and exactly two fraction digits.
    pub fn parse(s: &str) -> Result<Self> {
        let invalid = || Error::shape("BudgetFormat", format!("invalid budget amount {s:?}"));

        let (whole, frac) = s.split_once('.').ok_or_else(invalid)?;
        if whole.is_empty()
            || frac.len() != 2
            || !whole.bytes().all(|b| b.is_ascii_digit())
            || !frac.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(invalid());
        }

        let whole: u64 = whole.parse().map_err(|_| invalid())?;
        let frac: u64 = frac.parse().map_err(|_| invalid())?;
        whole
            .checked_mul(100)
            .and_then(|c| c.checked_add(frac))
            .map(Self)
            .ok_or_else(invalid)
    }

    /// Saturating subtraction; never goes below zero.
    #[must_use]
    pub const fn saturating_sub(self, other: Self) -> Self {
        Self(self.0.saturating_sub(other.0))
    }

    /// Saturating addition.
    #[must_use]
    pub const fn saturating_add(self, other: Self) -> Self {
        Self(self.0.saturating_add(other.0))
    }

    /// Integer percentage of `self` relative to `total`, clamped to 0..=100
    /// plus overflow headroom (a spend above the budget reports >100).
    #[must_use]
    pub const fn percent_of(self, total: Self) -> u32 {
        if total.0 == 0 {
            return 0;
        }
        // u64 cents * 100 cannot overflow u128.
        ((self.0 as u128) * 100 / (total.0 as u128)) as u32
    }
}

impl fmt::Display for BudgetAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.0 / 100, self.0 % 100)
    }
}

impl Serialize for BudgetAmount {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for BudgetAmount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(|e| D::Error::custom(e.message().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_wire_format() {
        assert_eq!(BudgetAmount::parse("100.00").unwrap().cents(), 10_000);
        assert_eq!(BudgetAmount::parse("0.05").unwrap().cents(), 5);
        assert_eq!(BudgetAmount::parse("1234.99").unwrap().cents(), 123_499);
    }

    #[test]
    fn rejects_malformed_amounts() {
        for bad in ["100", "100.0", "100.000", ".50", "-1.00", "1,00", "a.bc", "1.2x", ""] {
            assert!(BudgetAmount::parse(bad).is_err(), "{bad:?} must be rejected");
        }
    }

    #[test]
    fn round_trips_through_display() {
        for s in ["0.00", "0.05", "100.00", "9.90"] {
            assert_eq!(BudgetAmount::parse(s).unwrap().to_string(), s);
        }
    }

    #[test]
    fn serde_round_trip() {
        let amount = BudgetAmount::from_cents(10_050);
        let json = serde_json::to_string(&amount).unwrap();
        assert_eq!(json, "\"100.50\"");
        let back: BudgetAmount = serde_json::from_str(&json).unwrap();
        assert_eq!(back, amount);
    }

    #[test]
    fn percent_of_reports_overspend() {
        let budget = BudgetAmount::from_cents(10_000);
        assert_eq!(BudgetAmount::from_cents(5_000).percent_of(budget), 50);
        assert_eq!(BudgetAmount::from_cents(12_000).percent_of(budget), 120);
        assert_eq!(BudgetAmount::from_cents(1).percent_of(BudgetAmount::ZERO), 0);
    }
}
