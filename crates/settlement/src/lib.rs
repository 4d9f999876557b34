mod checkout;
mod error;
mod ledger;
mod lifecycle;
mod locks;
mod loops;
mod orchestrator;
mod poller;

pub use checkout::{CheckoutFlow, CheckoutStep};
pub use error::SettlementError;
pub use ledger::{EntryContext, Ledger};
pub use lifecycle::{AccountLifecycleManager, LifecycleSettings, SweepFailure, SweepReport};
pub use locks::KeyedLocks;
pub use loops::{spawn_expiry_sweep_loop, spawn_session_recovery_loop};
pub use orchestrator::{
    CheckoutOptions, ExtendRequest, PurchaseMethod, PurchaseOutcome, PurchaseStatus,
    SettlementOrchestrator, SettlementSettings, SettlementStores,
};
pub use poller::{ConfirmationPoller, RecoveryReport, SessionSettler, spawn_session_poller};
