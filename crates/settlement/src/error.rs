use audit_store::AuditStoreError;
use ledger_store::LedgerStoreError;
use payment_gateway::GatewayError;
use rental_domain::{DomainError, Money};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettlementError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("insufficient funds: balance {balance}, requested {requested}")]
    InsufficientFunds { balance: Money, requested: Money },
    #[error("payment gateway error: {0}")]
    Gateway(#[from] GatewayError),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl SettlementError {
    pub(crate) fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Errors that leave nothing behind and are safe to show the caller as-is.
    #[must_use]
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::InsufficientFunds { .. }
                | Self::NotFound { .. }
                | Self::Forbidden(_)
                | Self::Conflict(_)
        )
    }
}

impl From<LedgerStoreError> for SettlementError {
    fn from(err: LedgerStoreError) -> Self {
        match err {
            LedgerStoreError::InsufficientFunds { balance, requested } => {
                Self::InsufficientFunds { balance, requested }
            }
            LedgerStoreError::UnknownUser(user_id) => Self::not_found("user", user_id.0),
            LedgerStoreError::NotFound { entity, id } => Self::NotFound { entity, id },
            LedgerStoreError::DuplicateSessionLink(_) | LedgerStoreError::VersionConflict { .. } => {
                Self::Conflict(err.to_string())
            }
            LedgerStoreError::Money(e) => Self::Validation(e.to_string()),
            LedgerStoreError::LockPoisoned
            | LedgerStoreError::Database(_)
            | LedgerStoreError::InvalidColumn { .. }
            | LedgerStoreError::Audit(_) => Self::Storage(err.to_string()),
        }
    }
}

impl From<AuditStoreError> for SettlementError {
    fn from(err: AuditStoreError) -> Self {
        Self::Storage(format!("audit: {err}"))
    }
}

impl From<DomainError> for SettlementError {
    fn from(err: DomainError) -> Self {
        Self::Validation(err.to_string())
    }
}
