use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Amount in the settlement currency, stored as integer minor units (cents).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(pub u64);

impl Money {
    pub const ZERO: Self = Self(0);

    #[must_use]
    pub fn from_cents(cents: u64) -> Self {
        Self(cents)
    }

    #[must_use]
    pub fn from_major(units: u64) -> Self {
        Self(units.saturating_mul(100))
    }

    #[must_use]
    pub fn cents(self) -> u64 {
        self.0
    }

    #[must_use]
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, rhs: Self) -> Result<Self, MoneyError> {
        self.0
            .checked_add(rhs.0)
            .map(Self)
            .ok_or(MoneyError::Overflow)
    }

    pub fn checked_sub(self, rhs: Self) -> Result<Self, MoneyError> {
        self.0
            .checked_sub(rhs.0)
            .map(Self)
            .ok_or(MoneyError::Underflow)
    }

    /// Parses a decimal amount such as `"150"`, `"150.5"` or `"150.50"`.
    /// More than two fractional digits is rejected rather than rounded.
    pub fn parse_decimal(raw: &str) -> Result<Self, MoneyError> {
        let s = raw.trim();
        if s.is_empty() || s.starts_with('-') || s.starts_with('+') {
            return Err(MoneyError::Malformed(raw.to_string()));
        }
        let (whole, frac) = match s.split_once('.') {
            Some((w, f)) => (w, f),
            None => (s, ""),
        };
        if whole.is_empty()
            || frac.len() > 2
            || !whole.bytes().all(|b| b.is_ascii_digit())
            || !frac.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(MoneyError::Malformed(raw.to_string()));
        }
        let whole: u64 = whole
            .parse()
            .map_err(|_| MoneyError::Malformed(raw.to_string()))?;
        let frac_cents = match frac.len() {
            0 => 0,
            1 => frac.parse::<u64>().unwrap_or(0) * 10,
            _ => frac.parse::<u64>().unwrap_or(0),
        };
        whole
            .checked_mul(100)
            .and_then(|c| c.checked_add(frac_cents))
            .map(Self)
            .ok_or(MoneyError::Overflow)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.0 / 100, self.0 % 100)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MoneyError {
    #[error("amount overflow")]
    Overflow,
    #[error("amount underflow")]
    Underflow,
    #[error("malformed amount: {0}")]
    Malformed(String),
}
