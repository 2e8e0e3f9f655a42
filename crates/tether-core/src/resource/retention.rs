//! Retention periods.
//!
//! Retention values use the compact wire format `"\d+[dwmy]"` — days,
//! weeks, months (30 days), years (365 days). A resource whose age equals
//! the period exactly is already eligible for the next sweep tick.

use std::fmt;

use chrono::Duration;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// A retention period parsed from `"\d+[dwmy]"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RetentionPeriod {
    count: u32,
    unit: RetentionUnit,
}

/// Supported retention units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetentionUnit {
    /// Calendar days.
    Days,
    /// Seven-day weeks.
    Weeks,
    /// Thirty-day months.
    Months,
    /// 365-day years.
    Years,
}

impl RetentionPeriod {
    /// Parses the wire format.
    ///
    /// # Errors
    ///
    /// Returns `ShapeInvalid` with reason `RetentionFormat` when the string
    /// is not one or more digits followed by one of `d`, `w`, `m`, `y`.
    pub fn parse(s: &str) -> Result<Self> {
        let invalid = || Error::shape("RetentionFormat", format!("invalid retention period {s:?}"));

        let (digits, unit) = s.split_at(s.len().saturating_sub(1));
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let unit = match unit {
            "d" => RetentionUnit::Days,
            "w" => RetentionUnit::Weeks,
            "m" => RetentionUnit::Months,
            "y" => RetentionUnit::Years,
            _ => return Err(invalid()),
        };
        let count: u32 = digits.parse().map_err(|_| invalid())?;
        Ok(Self { count, unit })
    }

    /// The period as a concrete duration.
    #[must_use]
    pub fn as_duration(self) -> Duration {
        let days = i64::from(self.count)
            * match self.unit {
                RetentionUnit::Days => 1,
                RetentionUnit::Weeks => 7,
                RetentionUnit::Months => 30,
                RetentionUnit::Years => 365,
            };
        Duration::days(days)
    }
}

impl fmt::Display for RetentionPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let unit = match self.unit {
            RetentionUnit::Days => 'd',
            RetentionUnit::Weeks => 'w',
            RetentionUnit::Months => 'm',
            RetentionUnit::Years => 'y',
        };
        write!(f, "{}{}", self.count, unit)
    }
}

impl Serialize for RetentionPeriod {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for RetentionPeriod {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(|e| D::Error::custom(e.message().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_units() {
        assert_eq!(RetentionPeriod::parse("7d").unwrap().as_duration(), Duration::days(7));
        assert_eq!(RetentionPeriod::parse("2w").unwrap().as_duration(), Duration::days(14));
        assert_eq!(RetentionPeriod::parse("3m").unwrap().as_duration(), Duration::days(90));
        assert_eq!(RetentionPeriod::parse("1y").unwrap().as_duration(), Duration::days(365));
    }

    #[test]
    fn rejects_malformed_periods() {
        for bad in ["", "d", "7", "7h", "-7d", "7 d", "d7", "7dd"] {
            assert!(RetentionPeriod::parse(bad).is_err(), "{bad:?} must be rejected");
        }
    }

    #[test]
    fn serde_round_trip() {
        let period = RetentionPeriod::parse("90d").unwrap();
        let json = serde_json::to_string(&period).unwrap();
        assert_eq!(json, "\"90d\"");
        let back: RetentionPeriod = serde_json::from_str(&json).unwrap();
        assert_eq!(back, period);
    }
}
