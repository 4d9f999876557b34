use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use audit_store::{AuditRepository, PageRequest};
use chrono::{DateTime, Duration, Utc};
use ledger_store::{AccountRepository, LedgerRepository, PaymentSessionRepository};
use payment_gateway::{CreatePaymentRequest, PaymentGateway};
use rental_domain::{
    Account, AccountId, AuditEntry, Clock, CryptoPaymentDetails, DomainError, Identity,
    LedgerDirection, Money, PaymentMethod, PaymentPurpose, PaymentSession, PaymentSessionId,
    PaymentSessionStatus, Transaction, TransactionStatus, TransactionType, UserId,
    require_non_empty,
};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::ledger::{EntryContext, Ledger};
use crate::lifecycle::{AccountLifecycleManager, LifecycleSettings};
use crate::locks::KeyedLocks;
use crate::poller::{ConfirmationPoller, SessionSettler, spawn_session_poller};
use crate::SettlementError;

#[derive(Debug, Clone)]
pub struct SettlementSettings {
    pub rental_price: Money,
    /// Fiat currency prices are quoted in when talking to the gateway.
    pub currency: String,
    pub payment_window: Duration,
    pub checkout_poll_interval: StdDuration,
    pub lifecycle: LifecycleSettings,
}

impl Default for SettlementSettings {
    fn default() -> Self {
        let lifecycle = LifecycleSettings::default();
        Self {
            rental_price: lifecycle.renewal_price,
            currency: "usd".to_string(),
            payment_window: Duration::minutes(20),
            checkout_poll_interval: StdDuration::from_secs(10),
            lifecycle,
        }
    }
}

/// The four repositories the orchestrator writes through.
#[derive(Clone)]
pub struct SettlementStores {
    pub ledger: Arc<dyn LedgerRepository>,
    pub sessions: Arc<dyn PaymentSessionRepository>,
    pub accounts: Arc<dyn AccountRepository>,
    pub audit: Arc<dyn AuditRepository>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutOptions {
    pub price: Money,
    pub currency: String,
    pub balance: Money,
    pub balance_allowed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum PurchaseMethod {
    Balance,
    Crypto { pay_currency: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PurchaseOutcome {
    Activated {
        session: PaymentSession,
        account: Account,
        transaction: Transaction,
    },
    AwaitingPayment {
        session: PaymentSession,
    },
}

impl PurchaseOutcome {
    #[must_use]
    pub fn session(&self) -> &PaymentSession {
        match self {
            Self::Activated { session, .. } | Self::AwaitingPayment { session } => session,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseStatus {
    pub session: PaymentSession,
    pub account: Option<Account>,
    pub transaction: Option<Transaction>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtendRequest {
    Until(DateTime<Utc>),
    ByMonths(u32),
}

/// Applies the side effects of terminal sessions. Shared by the poller and
/// the purchase paths; serialized per session and skipped once settled.
struct PaymentSettler {
    ledger: Ledger,
    lifecycle: Arc<AccountLifecycleManager>,
    sessions: Arc<dyn PaymentSessionRepository>,
    clock: Arc<dyn Clock>,
    session_locks: KeyedLocks<PaymentSessionId>,
}

#[async_trait]
impl SessionSettler for PaymentSettler {
    async fn settle(&self, session: &PaymentSession) -> Result<(), SettlementError> {
        let _guard = self.session_locks.lock(&session.id).await?;
        let Some(current) = self.sessions.get_session(session.id).await? else {
            return Err(SettlementError::not_found("payment session", session.id.0));
        };
        if current.settled_at.is_some() || !current.is_terminal() {
            return Ok(());
        }
        let owner = current.owner_user_id;
        let success = current.status.is_success();
        match (current.kind, current.purpose, success) {
            (PaymentMethod::Crypto, PaymentPurpose::Rental, true) => {
                let outcome = self.ledger.complete_pending(owner, current.id).await?;
                if outcome.transaction().status == TransactionStatus::Failed {
                    warn!(
                        session_id = %current.id.0,
                        "confirmed session has a failed ledger entry; not activating"
                    );
                } else {
                    self.lifecycle.activate(owner, current.amount, current.id).await?;
                }
            }
            (PaymentMethod::Crypto, PaymentPurpose::Deposit, true) => {
                self.ledger.complete_pending(owner, current.id).await?;
            }
            (PaymentMethod::Crypto, _, false) => {
                self.ledger.fail_pending(owner, current.id).await?;
            }
            (PaymentMethod::Balance, PaymentPurpose::Rental, true) => {
                if self.completed_debit(&current).await?.is_some() {
                    self.lifecycle.activate(owner, current.amount, current.id).await?;
                }
            }
            (PaymentMethod::Balance, PaymentPurpose::Rental, false) => {
                self.roll_back_debit(&current).await?;
            }
            (PaymentMethod::Balance, PaymentPurpose::Deposit, _) => {}
        }
        self.sessions
            .mark_settled(current.id, self.clock.now())
            .await?;
        info!(
            session_id = %current.id.0,
            status = current.status.as_str(),
            purpose = current.purpose.as_str(),
            "payment session settled"
        );
        Ok(())
    }
}

impl PaymentSettler {
    async fn completed_debit(
        &self,
        session: &PaymentSession,
    ) -> Result<Option<Transaction>, SettlementError> {
        Ok(self
            .ledger
            .find_by_session(session.owner_user_id, session.id)
            .await?
            .filter(|tx| {
                tx.status == TransactionStatus::Completed && tx.direction == LedgerDirection::Debit
            }))
    }

    /// Returns a failed balance purchase's debit. The store keeps at most one
    /// reversal per session, whichever process gets there first.
    async fn roll_back_debit(&self, session: &PaymentSession) -> Result<(), SettlementError> {
        if self.lifecycle.find_by_activation_key(session.id).await?.is_some() {
            return Ok(());
        }
        let reversal = self
            .ledger
            .reverse_session_debit(
                session.owner_user_id,
                session.id,
                &rollback_marker(session.id),
            )
            .await?;
        if let Some(tx) = reversal {
            info!(
                session_id = %session.id.0,
                amount = %tx.amount,
                "balance purchase rolled back"
            );
        }
        Ok(())
    }
}

fn rollback_marker(session_id: PaymentSessionId) -> String {
    format!("rollback of payment session {}", session_id.0)
}

/// Entry point for every purchase, deposit, settlement and account
/// operation. Role checks live here; the lifecycle manager trusts its callers.
pub struct SettlementOrchestrator {
    ledger: Ledger,
    lifecycle: Arc<AccountLifecycleManager>,
    sessions: Arc<dyn PaymentSessionRepository>,
    audit: Arc<dyn AuditRepository>,
    gateway: Arc<dyn PaymentGateway>,
    settler: Arc<PaymentSettler>,
    poller: Arc<ConfirmationPoller>,
    clock: Arc<dyn Clock>,
    settings: SettlementSettings,
}

impl SettlementOrchestrator {
    #[must_use]
    pub fn new(
        stores: SettlementStores,
        gateway: Arc<dyn PaymentGateway>,
        clock: Arc<dyn Clock>,
        settings: SettlementSettings,
    ) -> Self {
        let ledger = Ledger::new(stores.ledger, clock.clone());
        let lifecycle = Arc::new(AccountLifecycleManager::new(
            stores.accounts,
            stores.audit.clone(),
            ledger.clone(),
            clock.clone(),
            settings.lifecycle.clone(),
        ));
        let settler = Arc::new(PaymentSettler {
            ledger: ledger.clone(),
            lifecycle: lifecycle.clone(),
            sessions: stores.sessions.clone(),
            clock: clock.clone(),
            session_locks: KeyedLocks::new(),
        });
        let poller = Arc::new(ConfirmationPoller::new(
            stores.sessions.clone(),
            gateway.clone(),
            settler.clone(),
            clock.clone(),
        ));
        Self {
            ledger,
            lifecycle,
            sessions: stores.sessions,
            audit: stores.audit,
            gateway,
            settler,
            poller,
            clock,
            settings,
        }
    }

    #[must_use]
    pub fn settings(&self) -> &SettlementSettings {
        &self.settings
    }

    #[must_use]
    pub fn lifecycle(&self) -> Arc<AccountLifecycleManager> {
        self.lifecycle.clone()
    }

    #[must_use]
    pub fn poller(&self) -> Arc<ConfirmationPoller> {
        self.poller.clone()
    }

    #[must_use]
    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    /// Background confirmation polling for a crypto session.
    pub fn start_polling(
        &self,
        session_id: PaymentSessionId,
    ) -> JoinHandle<Result<PaymentSessionStatus, SettlementError>> {
        spawn_session_poller(
            self.poller.clone(),
            session_id,
            self.settings.checkout_poll_interval,
        )
    }

    pub async fn checkout_options(
        &self,
        identity: &Identity,
    ) -> Result<CheckoutOptions, SettlementError> {
        self.ledger.open_user(identity.user_id).await?;
        let balance = self.ledger.balance(identity.user_id).await?;
        let price = self.settings.rental_price;
        Ok(CheckoutOptions {
            price,
            currency: self.settings.currency.clone(),
            balance,
            balance_allowed: balance >= price,
        })
    }

    pub async fn initiate_purchase(
        &self,
        identity: &Identity,
        method: PurchaseMethod,
    ) -> Result<PurchaseOutcome, SettlementError> {
        self.ledger.open_user(identity.user_id).await?;
        match method {
            PurchaseMethod::Balance => self.purchase_with_balance(identity.user_id).await,
            PurchaseMethod::Crypto { pay_currency } => {
                let session = self
                    .open_crypto_session(
                        identity.user_id,
                        PaymentPurpose::Rental,
                        self.settings.rental_price,
                        &pay_currency,
                    )
                    .await?;
                Ok(PurchaseOutcome::AwaitingPayment { session })
            }
        }
    }

    /// Crypto top-up of the central balance. Credited only on confirmation.
    pub async fn initiate_deposit(
        &self,
        identity: &Identity,
        amount: Money,
        pay_currency: &str,
    ) -> Result<PaymentSession, SettlementError> {
        if amount.is_zero() {
            return Err(DomainError::NonPositiveAmount.into());
        }
        self.ledger.open_user(identity.user_id).await?;
        self.open_crypto_session(identity.user_id, PaymentPurpose::Deposit, amount, pay_currency)
            .await
    }

    /// Current state of a session. A session read past its window is
    /// expired on the spot.
    pub async fn get_purchase_status(
        &self,
        identity: &Identity,
        session_id: PaymentSessionId,
    ) -> Result<PurchaseStatus, SettlementError> {
        let mut session = self.load_session(session_id).await?;
        if !identity.can_act_for(session.owner_user_id) {
            return Err(SettlementError::Forbidden(
                "payment session belongs to another user".to_string(),
            ));
        }
        if !session.is_terminal() && session.is_past_expiry(self.clock.now()) {
            self.poller.poll_once(session_id).await?;
            session = self.load_session(session_id).await?;
        }
        let account = match session.purpose {
            PaymentPurpose::Rental => self.lifecycle.find_by_activation_key(session_id).await?,
            PaymentPurpose::Deposit => None,
        };
        let transaction = self
            .ledger
            .find_by_session(session.owner_user_id, session_id)
            .await?;
        Ok(PurchaseStatus {
            session,
            account,
            transaction,
        })
    }

    pub async fn balance(
        &self,
        identity: &Identity,
        user_id: UserId,
    ) -> Result<Money, SettlementError> {
        require_actor_for(identity, user_id)?;
        self.ledger.open_user(user_id).await?;
        self.ledger.balance(user_id).await
    }

    pub async fn list_transactions(
        &self,
        identity: &Identity,
        user_id: UserId,
    ) -> Result<Vec<Transaction>, SettlementError> {
        require_actor_for(identity, user_id)?;
        self.ledger.open_user(user_id).await?;
        self.ledger.list_transactions(user_id).await
    }

    pub async fn list_accounts(
        &self,
        identity: &Identity,
        user_id: UserId,
    ) -> Result<Vec<Account>, SettlementError> {
        require_actor_for(identity, user_id)?;
        self.lifecycle.list_for_user(user_id).await
    }

    pub async fn get_account(
        &self,
        identity: &Identity,
        account_id: AccountId,
    ) -> Result<Account, SettlementError> {
        let account = self.lifecycle.get(account_id).await?;
        match account.owner_user_id {
            Some(owner) => require_actor_for(identity, owner)?,
            None => require_admin(identity)?,
        }
        Ok(account)
    }

    pub async fn rename_account(
        &self,
        identity: &Identity,
        account_id: AccountId,
        name: &str,
    ) -> Result<Account, SettlementError> {
        self.get_account(identity, account_id).await?;
        self.lifecycle
            .rename(Some(identity.user_id), account_id, name)
            .await
    }

    pub async fn set_auto_renew(
        &self,
        identity: &Identity,
        account_id: AccountId,
        enabled: bool,
    ) -> Result<Account, SettlementError> {
        self.get_account(identity, account_id).await?;
        self.lifecycle
            .set_auto_renew(Some(identity.user_id), account_id, enabled)
            .await
    }

    pub async fn account_audit(
        &self,
        identity: &Identity,
        account_id: AccountId,
        page: PageRequest,
    ) -> Result<Vec<AuditEntry>, SettlementError> {
        self.get_account(identity, account_id).await?;
        Ok(self.audit.list_for_account(account_id, page).await?)
    }

    pub async fn extend_account(
        &self,
        identity: &Identity,
        account_id: AccountId,
        request: ExtendRequest,
        note: Option<String>,
    ) -> Result<Account, SettlementError> {
        require_admin(identity)?;
        let target = match request {
            ExtendRequest::Until(at) => at,
            ExtendRequest::ByMonths(months) => {
                self.lifecycle
                    .extension_target_for(account_id, months)
                    .await?
            }
        };
        self.lifecycle
            .extend(Some(identity.user_id), account_id, target, note)
            .await
    }

    pub async fn suspend_account(
        &self,
        identity: &Identity,
        account_id: AccountId,
        reason: &str,
    ) -> Result<Account, SettlementError> {
        require_admin(identity)?;
        self.lifecycle
            .suspend(Some(identity.user_id), account_id, reason)
            .await
    }

    pub async fn reactivate_account(
        &self,
        identity: &Identity,
        account_id: AccountId,
    ) -> Result<Account, SettlementError> {
        require_admin(identity)?;
        self.lifecycle
            .reactivate(Some(identity.user_id), account_id)
            .await
    }

    pub async fn refund_user(
        &self,
        identity: &Identity,
        user_id: UserId,
        amount: Money,
        reason: &str,
    ) -> Result<Transaction, SettlementError> {
        require_admin(identity)?;
        self.ledger.open_user(user_id).await?;
        self.lifecycle
            .refund(Some(identity.user_id), user_id, amount, reason)
            .await
    }

    /// Debits before the session is stored, so a purchase the balance cannot
    /// cover leaves no trace.
    async fn purchase_with_balance(
        &self,
        user_id: UserId,
    ) -> Result<PurchaseOutcome, SettlementError> {
        let price = self.settings.rental_price;
        let session_id = PaymentSessionId::new();
        let transaction = self
            .ledger
            .debit(
                user_id,
                price,
                TransactionType::Rental,
                EntryContext::session(session_id).describe("agency account rental"),
            )
            .await?;

        let now = self.clock.now();
        let session = PaymentSession {
            id: session_id,
            owner_user_id: user_id,
            kind: PaymentMethod::Balance,
            purpose: PaymentPurpose::Rental,
            amount: price,
            crypto: None,
            status: PaymentSessionStatus::Waiting,
            created_at: now,
            expires_at: now + self.settings.payment_window,
            updated_at: now,
            settled_at: None,
        };
        if let Err(err) = self.sessions.insert_session(&session).await {
            warn!(
                user_id = %user_id.0,
                session_id = %session_id.0,
                error = %err,
                "session insert failed after balance debit"
            );
            self.ledger
                .reverse_session_debit(user_id, session_id, &rollback_marker(session_id))
                .await?;
            return Err(err.into());
        }

        let account = match self.lifecycle.activate(user_id, price, session.id).await {
            Ok(account) => account,
            Err(err) => {
                warn!(
                    user_id = %user_id.0,
                    session_id = %session.id.0,
                    error = %err,
                    "activation failed after balance debit"
                );
                self.fail_session(session.id).await;
                return Err(err);
            }
        };

        let now = self.clock.now();
        self.sessions
            .advance_status(session.id, PaymentSessionStatus::Confirmed, now)
            .await?;
        self.sessions.mark_settled(session.id, now).await?;
        let session = self.load_session(session.id).await?;
        info!(
            user_id = %user_id.0,
            account_id = %account.id.0,
            session_id = %session.id.0,
            "balance purchase completed"
        );
        Ok(PurchaseOutcome::Activated {
            session,
            account,
            transaction,
        })
    }

    /// Marks a balance session failed and runs its settlement, which returns
    /// any debit already taken. Errors are logged; recovery retries them.
    async fn fail_session(&self, session_id: PaymentSessionId) {
        let now = self.clock.now();
        let result = match self
            .sessions
            .advance_status(session_id, PaymentSessionStatus::Failed, now)
            .await
        {
            Ok(Some(failed)) => self.settler.settle(&failed).await,
            Ok(None) => Ok(()),
            Err(err) => Err(err.into()),
        };
        if let Err(err) = result {
            warn!(session_id = %session_id.0, error = %err, "failed session left for recovery");
        }
    }

    async fn open_crypto_session(
        &self,
        user_id: UserId,
        purpose: PaymentPurpose,
        amount: Money,
        pay_currency: &str,
    ) -> Result<PaymentSession, SettlementError> {
        let pay_currency = require_non_empty("pay_currency", pay_currency)?.to_ascii_lowercase();
        let session_id = PaymentSessionId::new();
        let (tx_type, direction, description) = match purpose {
            PaymentPurpose::Rental => (
                TransactionType::Rental,
                LedgerDirection::OffBalance,
                "agency account rental (crypto)",
            ),
            PaymentPurpose::Deposit => (
                TransactionType::Deposit,
                LedgerDirection::Credit,
                "balance deposit (crypto)",
            ),
        };
        let created = self
            .gateway
            .create_payment(&CreatePaymentRequest {
                amount,
                price_currency: self.settings.currency.clone(),
                pay_currency,
                order_id: session_id.0.to_string(),
                description: description.to_string(),
            })
            .await?;

        let now = self.clock.now();
        let session = PaymentSession {
            id: session_id,
            owner_user_id: user_id,
            kind: PaymentMethod::Crypto,
            purpose,
            amount,
            crypto: Some(CryptoPaymentDetails {
                external_reference: created.external_reference,
                pay_address: created.pay_address,
                pay_amount: created.pay_amount,
                pay_currency: created.pay_currency,
            }),
            status: PaymentSessionStatus::Waiting,
            created_at: now,
            expires_at: created
                .expires_at
                .unwrap_or(now + self.settings.payment_window),
            updated_at: now,
            settled_at: None,
        };
        self.ledger
            .record_pending(
                user_id,
                amount,
                tx_type,
                direction,
                EntryContext::session(session_id).describe(description),
            )
            .await?;
        self.sessions.insert_session(&session).await?;
        info!(
            user_id = %user_id.0,
            session_id = %session_id.0,
            purpose = purpose.as_str(),
            amount = %amount,
            "crypto payment session opened"
        );
        Ok(session)
    }

    async fn load_session(
        &self,
        session_id: PaymentSessionId,
    ) -> Result<PaymentSession, SettlementError> {
        self.sessions
            .get_session(session_id)
            .await?
            .ok_or_else(|| SettlementError::not_found("payment session", session_id.0))
    }
}

fn require_admin(identity: &Identity) -> Result<(), SettlementError> {
    if identity.is_admin() {
        Ok(())
    } else {
        Err(SettlementError::Forbidden("admin role required".to_string()))
    }
}

fn require_actor_for(identity: &Identity, user_id: UserId) -> Result<(), SettlementError> {
    if identity.can_act_for(user_id) {
        Ok(())
    } else {
        Err(SettlementError::Forbidden(
            "resource belongs to another user".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use audit_store::InMemoryAuditRepository;
    use chrono::TimeZone;
    use ledger_store::{
        InMemoryAccountRepository, InMemoryLedgerRepository, InMemoryPaymentSessionRepository,
    };
    use payment_gateway::{GatewayError, GatewayStatus, ScriptedPaymentGateway};
    use rental_domain::{AccountStatus, AuditAction, ManualClock};

    use super::*;

    struct Harness {
        orchestrator: Arc<SettlementOrchestrator>,
        ledger_repo: InMemoryLedgerRepository,
        sessions: InMemoryPaymentSessionRepository,
        accounts: InMemoryAccountRepository,
        audit: InMemoryAuditRepository,
        gateway: ScriptedPaymentGateway,
        clock: ManualClock,
    }

    fn harness() -> Harness {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap());
        let audit = InMemoryAuditRepository::new();
        let ledger_repo = InMemoryLedgerRepository::with_audit(audit.clone());
        let sessions = InMemoryPaymentSessionRepository::new();
        let accounts = InMemoryAccountRepository::new();
        let gateway = ScriptedPaymentGateway::new();
        let orchestrator = Arc::new(SettlementOrchestrator::new(
            SettlementStores {
                ledger: Arc::new(ledger_repo.clone()),
                sessions: Arc::new(sessions.clone()),
                accounts: Arc::new(accounts.clone()),
                audit: Arc::new(audit.clone()),
            },
            Arc::new(gateway.clone()),
            Arc::new(clock.clone()),
            SettlementSettings::default(),
        ));
        Harness {
            orchestrator,
            ledger_repo,
            sessions,
            accounts,
            audit,
            gateway,
            clock,
        }
    }

    async fn funded_user(h: &Harness, major: u64) -> Identity {
        let identity = Identity::advertiser(UserId::new());
        h.ledger_repo
            .seed_balance(identity.user_id, Money::from_major(major))
            .await
            .expect("seed");
        identity
    }

    fn crypto() -> PurchaseMethod {
        PurchaseMethod::Crypto {
            pay_currency: "BTC".to_string(),
        }
    }

    #[tokio::test]
    async fn balance_purchase_debits_and_activates() {
        let h = harness();
        let user = funded_user(&h, 200).await;

        let outcome = h
            .orchestrator
            .initiate_purchase(&user, PurchaseMethod::Balance)
            .await
            .expect("purchase");
        let PurchaseOutcome::Activated {
            session,
            account,
            transaction,
        } = outcome
        else {
            panic!("balance purchase should activate immediately");
        };

        assert_eq!(
            h.orchestrator.balance(&user, user.user_id).await.expect("balance"),
            Money::from_major(50)
        );
        assert_eq!(transaction.tx_type, TransactionType::Rental);
        assert_eq!(transaction.status, TransactionStatus::Completed);
        assert_eq!(transaction.linked_payment_session_id, Some(session.id));
        assert_eq!(account.status, AccountStatus::Active);
        assert_eq!(account.expire_at, Some(h.clock.now() + Duration::days(30)));
        assert_eq!(session.status, PaymentSessionStatus::Confirmed);
        assert!(session.settled_at.is_some());
    }

    #[tokio::test]
    async fn checkout_options_reflect_the_balance() {
        let h = harness();
        let poor = funded_user(&h, 100).await;
        let rich = funded_user(&h, 150).await;

        let options = h.orchestrator.checkout_options(&poor).await.expect("options");
        assert_eq!(options.price, Money::from_major(150));
        assert!(!options.balance_allowed);
        assert!(
            h.orchestrator
                .checkout_options(&rich)
                .await
                .expect("options")
                .balance_allowed
        );
    }

    #[tokio::test]
    async fn insufficient_balance_fails_without_side_effects() {
        let h = harness();
        let user = funded_user(&h, 100).await;

        let err = h
            .orchestrator
            .initiate_purchase(&user, PurchaseMethod::Balance)
            .await
            .expect_err("too poor");
        assert!(matches!(err, SettlementError::InsufficientFunds { .. }));
        assert_eq!(
            h.orchestrator.balance(&user, user.user_id).await.expect("balance"),
            Money::from_major(100)
        );
        assert!(h.accounts.snapshot().expect("accounts").is_empty());
        assert!(
            h.sessions
                .list_sessions_for_user(user.user_id)
                .await
                .expect("sessions")
                .is_empty()
        );
        assert!(
            h.ledger_repo
                .list_transactions(user.user_id)
                .await
                .expect("transactions")
                .is_empty()
        );
    }

    #[tokio::test]
    async fn activation_failure_returns_the_debit_once() {
        let h = harness();
        let user = funded_user(&h, 200).await;
        h.audit.set_unavailable(true).expect("toggle");

        let err = h
            .orchestrator
            .initiate_purchase(&user, PurchaseMethod::Balance)
            .await
            .expect_err("audit down");
        assert!(matches!(err, SettlementError::Storage(_)));
        assert_eq!(
            h.orchestrator.balance(&user, user.user_id).await.expect("balance"),
            Money::from_major(200)
        );

        let session = h
            .sessions
            .list_sessions_for_user(user.user_id)
            .await
            .expect("sessions")
            .remove(0);
        h.orchestrator
            .settler
            .settle(&session)
            .await
            .expect("replayed settle");
        let refunds = h
            .orchestrator
            .list_transactions(&user, user.user_id)
            .await
            .expect("transactions")
            .into_iter()
            .filter(|tx| tx.tx_type == TransactionType::Refund)
            .count();
        assert_eq!(refunds, 1);
        assert_eq!(
            h.orchestrator.balance(&user, user.user_id).await.expect("balance"),
            Money::from_major(200)
        );
    }

    #[tokio::test]
    async fn rollback_from_two_processes_returns_the_debit_once() {
        let h = harness();
        let user = funded_user(&h, 200).await;
        let now = h.clock.now();
        // debited and failed, but the process stopped before settling
        let session = PaymentSession {
            id: PaymentSessionId::new(),
            owner_user_id: user.user_id,
            kind: PaymentMethod::Balance,
            purpose: PaymentPurpose::Rental,
            amount: Money::from_major(150),
            crypto: None,
            status: PaymentSessionStatus::Failed,
            created_at: now,
            expires_at: now + Duration::minutes(20),
            updated_at: now,
            settled_at: None,
        };
        h.orchestrator
            .ledger
            .debit(
                user.user_id,
                session.amount,
                TransactionType::Rental,
                EntryContext::session(session.id),
            )
            .await
            .expect("debit");
        h.sessions.insert_session(&session).await.expect("session");

        let other = SettlementOrchestrator::new(
            SettlementStores {
                ledger: Arc::new(h.ledger_repo.clone()),
                sessions: Arc::new(h.sessions.clone()),
                accounts: Arc::new(h.accounts.clone()),
                audit: Arc::new(h.audit.clone()),
            },
            Arc::new(h.gateway.clone()),
            Arc::new(h.clock.clone()),
            SettlementSettings::default(),
        );
        let (a, b) = tokio::join!(
            h.orchestrator.settler.settle(&session),
            other.settler.settle(&session),
        );
        a.expect("first settle");
        b.expect("second settle");

        let refunds = h
            .ledger_repo
            .list_transactions(user.user_id)
            .await
            .expect("transactions")
            .into_iter()
            .filter(|tx| tx.tx_type == TransactionType::Refund)
            .collect::<Vec<_>>();
        assert_eq!(refunds.len(), 1);
        assert_eq!(refunds[0].reverses_payment_session_id, Some(session.id));
        assert_eq!(
            h.ledger_repo.balance(user.user_id).await.expect("balance"),
            Money::from_major(200)
        );
    }

    #[tokio::test]
    async fn crypto_purchase_activates_after_confirmation() {
        let h = harness();
        let user = funded_user(&h, 10).await;

        let outcome = h
            .orchestrator
            .initiate_purchase(&user, crypto())
            .await
            .expect("purchase");
        let PurchaseOutcome::AwaitingPayment { session } = outcome else {
            panic!("crypto purchase should wait for the gateway");
        };
        let crypto = session.crypto.clone().expect("crypto details");
        assert_eq!(crypto.pay_currency, "btc");
        assert_eq!(h.gateway.created_requests()[0].order_id, session.id.0.to_string());

        h.gateway
            .push_status(&crypto.external_reference, GatewayStatus::Confirming);
        h.gateway
            .push_status(&crypto.external_reference, GatewayStatus::Finished);
        let poller = h.orchestrator.poller();
        poller.poll_once(session.id).await.expect("poll");
        poller.poll_once(session.id).await.expect("poll");

        let status = h
            .orchestrator
            .get_purchase_status(&user, session.id)
            .await
            .expect("status");
        assert_eq!(status.session.status, PaymentSessionStatus::Confirmed);
        let account = status.account.expect("activated");
        assert_eq!(account.status, AccountStatus::Active);
        let tx = status.transaction.expect("ledger entry");
        assert_eq!(tx.status, TransactionStatus::Completed);
        assert_eq!(tx.direction, LedgerDirection::OffBalance);
        // paid off-platform, so the central balance is untouched
        assert_eq!(
            h.orchestrator.balance(&user, user.user_id).await.expect("balance"),
            Money::from_major(10)
        );
    }

    #[tokio::test]
    async fn unconfirmed_crypto_purchase_expires_with_no_account() {
        let h = harness();
        let user = funded_user(&h, 10).await;
        let session = h
            .orchestrator
            .initiate_purchase(&user, crypto())
            .await
            .expect("purchase")
            .session()
            .clone();

        h.clock.advance(Duration::minutes(21));
        let status = h
            .orchestrator
            .get_purchase_status(&user, session.id)
            .await
            .expect("status");
        assert_eq!(status.session.status, PaymentSessionStatus::Expired);
        assert!(status.session.settled_at.is_some());
        assert!(status.account.is_none());
        assert_eq!(
            status.transaction.expect("entry").status,
            TransactionStatus::Failed
        );
        assert_eq!(
            h.orchestrator.balance(&user, user.user_id).await.expect("balance"),
            Money::from_major(10)
        );
        assert!(h.accounts.snapshot().expect("accounts").is_empty());
    }

    #[tokio::test]
    async fn failed_crypto_rental_leaves_no_account_and_no_charge() {
        let h = harness();
        let user = funded_user(&h, 10).await;
        let session = h
            .orchestrator
            .initiate_purchase(&user, crypto())
            .await
            .expect("purchase")
            .session()
            .clone();
        let reference = session.external_reference().expect("reference").to_string();
        h.gateway.push_status(&reference, GatewayStatus::Failed);

        let status = h
            .orchestrator
            .poller()
            .poll_once(session.id)
            .await
            .expect("poll");
        assert_eq!(status, PaymentSessionStatus::Failed);

        let status = h
            .orchestrator
            .get_purchase_status(&user, session.id)
            .await
            .expect("status");
        assert_eq!(status.session.status, PaymentSessionStatus::Failed);
        assert!(status.session.settled_at.is_some());
        assert!(status.account.is_none());
        assert_eq!(
            status.transaction.expect("entry").status,
            TransactionStatus::Failed
        );
        assert!(h.accounts.snapshot().expect("accounts").is_empty());
        assert_eq!(
            h.orchestrator.balance(&user, user.user_id).await.expect("balance"),
            Money::from_major(10)
        );
    }

    #[tokio::test]
    async fn refunded_deposit_credits_nothing() {
        let h = harness();
        let user = funded_user(&h, 5).await;
        let session = h
            .orchestrator
            .initiate_deposit(&user, Money::from_major(40), "usdt")
            .await
            .expect("deposit");
        let reference = session.external_reference().expect("reference").to_string();
        h.gateway.push_status(&reference, GatewayStatus::Refunded);

        h.orchestrator
            .poller()
            .poll_once(session.id)
            .await
            .expect("poll");

        let status = h
            .orchestrator
            .get_purchase_status(&user, session.id)
            .await
            .expect("status");
        assert_eq!(status.session.status, PaymentSessionStatus::Failed);
        assert!(status.session.settled_at.is_some());
        assert_eq!(
            status.transaction.expect("entry").status,
            TransactionStatus::Failed
        );
        assert_eq!(
            h.orchestrator.balance(&user, user.user_id).await.expect("balance"),
            Money::from_major(5)
        );
    }

    #[tokio::test]
    async fn concurrent_confirmation_activates_once() {
        let h = harness();
        let user = funded_user(&h, 0).await;
        let session = h
            .orchestrator
            .initiate_purchase(&user, crypto())
            .await
            .expect("purchase")
            .session()
            .clone();
        let reference = session.external_reference().expect("reference").to_string();
        h.gateway.push_status(&reference, GatewayStatus::Confirmed);

        let poller = h.orchestrator.poller();
        let (a, b) = tokio::join!(poller.poll_once(session.id), poller.poll_once(session.id));
        assert_eq!(a.expect("a"), PaymentSessionStatus::Confirmed);
        assert_eq!(b.expect("b"), PaymentSessionStatus::Confirmed);

        assert_eq!(h.accounts.snapshot().expect("accounts").len(), 1);
        let rentals = h
            .ledger_repo
            .entries_snapshot()
            .await
            .expect("entries")
            .into_iter()
            .filter(|tx| tx.tx_type == TransactionType::Rental)
            .count();
        assert_eq!(rentals, 1);
    }

    #[tokio::test]
    async fn gateway_failure_at_creation_leaves_nothing_behind() {
        let h = harness();
        let user = funded_user(&h, 0).await;
        h.gateway.fail_next_create(GatewayError::Timeout);

        let err = h
            .orchestrator
            .initiate_purchase(&user, crypto())
            .await
            .expect_err("gateway down");
        assert!(matches!(err, SettlementError::Gateway(GatewayError::Timeout)));
        assert!(
            h.sessions
                .list_sessions_for_user(user.user_id)
                .await
                .expect("sessions")
                .is_empty()
        );
        assert!(h.ledger_repo.entries_snapshot().await.expect("entries").is_empty());
    }

    #[tokio::test]
    async fn confirmed_deposit_credits_the_balance() {
        let h = harness();
        let user = funded_user(&h, 5).await;
        let session = h
            .orchestrator
            .initiate_deposit(&user, Money::from_major(40), "usdt")
            .await
            .expect("deposit");
        assert_eq!(
            h.orchestrator.balance(&user, user.user_id).await.expect("balance"),
            Money::from_major(5)
        );

        let reference = session.external_reference().expect("reference").to_string();
        h.gateway.push_status(&reference, GatewayStatus::Finished);
        h.orchestrator
            .poller()
            .poll_once(session.id)
            .await
            .expect("poll");
        assert_eq!(
            h.orchestrator.balance(&user, user.user_id).await.expect("balance"),
            Money::from_major(45)
        );

        let err = h
            .orchestrator
            .initiate_deposit(&user, Money::ZERO, "usdt")
            .await
            .expect_err("zero deposit");
        assert!(matches!(err, SettlementError::Validation(_)));
    }

    #[tokio::test]
    async fn admin_operations_require_the_admin_role() {
        let h = harness();
        let user = funded_user(&h, 200).await;
        let PurchaseOutcome::Activated { account, .. } = h
            .orchestrator
            .initiate_purchase(&user, PurchaseMethod::Balance)
            .await
            .expect("purchase")
        else {
            panic!("expected activation");
        };

        let forbidden = [
            h.orchestrator
                .suspend_account(&user, account.id, "abuse")
                .await
                .map(|_| ()),
            h.orchestrator
                .refund_user(&user, user.user_id, Money::from_major(5), "mine")
                .await
                .map(|_| ()),
            h.orchestrator
                .extend_account(&user, account.id, ExtendRequest::ByMonths(1), None)
                .await
                .map(|_| ()),
        ];
        for result in forbidden {
            assert!(matches!(result, Err(SettlementError::Forbidden(_))));
        }

        let stranger = Identity::advertiser(UserId::new());
        assert!(matches!(
            h.orchestrator.get_account(&stranger, account.id).await,
            Err(SettlementError::Forbidden(_))
        ));

        let admin = Identity::admin(UserId::new());
        let suspended = h
            .orchestrator
            .suspend_account(&admin, account.id, "chargeback")
            .await
            .expect("suspend");
        assert_eq!(suspended.status, AccountStatus::Suspended);
        let trail = h
            .orchestrator
            .account_audit(&user, account.id, PageRequest::default())
            .await
            .expect("audit");
        let actions: Vec<_> = trail.iter().map(|e| e.action).collect();
        assert_eq!(actions, vec![AuditAction::Activated, AuditAction::Suspended]);
        assert_eq!(trail[1].actor_user_id, Some(admin.user_id));
    }

    #[tokio::test]
    async fn admin_extension_by_months_and_refund() {
        let h = harness();
        let user = funded_user(&h, 150).await;
        let admin = Identity::admin(UserId::new());
        let PurchaseOutcome::Activated { account, .. } = h
            .orchestrator
            .initiate_purchase(&user, PurchaseMethod::Balance)
            .await
            .expect("purchase")
        else {
            panic!("expected activation");
        };

        let extended = h
            .orchestrator
            .extend_account(&admin, account.id, ExtendRequest::ByMonths(3), None)
            .await
            .expect("extend");
        assert!(extended.expire_at > account.expire_at);

        h.orchestrator
            .refund_user(&admin, user.user_id, Money::from_major(25), "service issue")
            .await
            .expect("refund");
        assert_eq!(
            h.orchestrator.balance(&user, user.user_id).await.expect("balance"),
            Money::from_major(25)
        );
        assert_eq!(
            h.orchestrator
                .get_account(&user, account.id)
                .await
                .expect("account")
                .status,
            AccountStatus::Active
        );
    }
}
