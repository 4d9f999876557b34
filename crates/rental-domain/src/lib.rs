pub mod account;
pub mod audit;
pub mod clock;
pub mod errors;
pub mod identity;
pub mod ids;
pub mod money;
pub mod payment;
pub mod transaction;

pub use account::{Account, AccountStatus, DEFAULT_RENTAL_PERIOD_DAYS, extension_target};
pub use audit::{AuditAction, AuditEntry};
pub use clock::{Clock, ManualClock, SystemClock};
pub use errors::{DomainError, require_non_empty};
pub use identity::{Identity, Role};
pub use ids::{AccountId, AuditEntryId, PaymentSessionId, TransactionId, UserId};
pub use money::{Money, MoneyError};
pub use payment::{
    CryptoPaymentDetails, PaymentMethod, PaymentPurpose, PaymentSession, PaymentSessionStatus,
};
pub use transaction::{LedgerDirection, Transaction, TransactionStatus, TransactionType};
