use thiserror::Error;

use crate::money::MoneyError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("amount must be greater than zero")]
    NonPositiveAmount,
    #[error("{field} must not be empty")]
    EmptyField { field: &'static str },
    #[error(transparent)]
    Money(#[from] MoneyError),
}

/// Rejects blank input after trimming; returns the trimmed value.
pub fn require_non_empty(field: &'static str, value: &str) -> Result<String, DomainError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(DomainError::EmptyField { field });
    }
    Ok(trimmed.to_string())
}
