mod accounts;
mod ledger;
mod postgres;
mod sessions;

use audit_store::AuditStoreError;
use rental_domain::{MoneyError, PaymentSessionId, UserId};
use thiserror::Error;

pub use accounts::{AccountRepository, ActivationInsert, InMemoryAccountRepository};
pub use ledger::{
    InMemoryLedgerRepository, LedgerEntryInsert, LedgerRepository, PendingOutcome,
};
pub use postgres::PostgresLedgerStore;
pub use sessions::{InMemoryPaymentSessionRepository, PaymentSessionRepository};

#[derive(Debug, Error)]
pub enum LedgerStoreError {
    #[error("insufficient funds: balance {balance}, requested {requested}")]
    InsufficientFunds {
        balance: rental_domain::Money,
        requested: rental_domain::Money,
    },
    #[error("unknown user {0:?}")]
    UnknownUser(UserId),
    #[error("payment session {0:?} already has a transaction")]
    DuplicateSessionLink(PaymentSessionId),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("version conflict on {entity} {id}")]
    VersionConflict { entity: &'static str, id: String },
    #[error("store lock poisoned")]
    LockPoisoned,
    #[error("database error: {0}")]
    Database(String),
    #[error("money error: {0}")]
    Money(#[from] MoneyError),
    #[error("invalid value in column {field}: {value}")]
    InvalidColumn { field: &'static str, value: String },
    #[error("audit write failed: {0}")]
    Audit(#[from] AuditStoreError),
}
