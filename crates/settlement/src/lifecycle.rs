use std::sync::Arc;

use audit_store::{AuditEntryInsert, AuditRepository};
use chrono::{DateTime, Duration, Utc};
use ledger_store::AccountRepository;
use rental_domain::{
    Account, AccountId, AccountStatus, AuditAction, Clock, DEFAULT_RENTAL_PERIOD_DAYS,
    DomainError, Money, PaymentSessionId, Transaction, TransactionType, UserId, extension_target,
    require_non_empty,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::ledger::{EntryContext, Ledger};
use crate::locks::KeyedLocks;
use crate::SettlementError;

#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub rental_period: Duration,
    pub renewal_period: Duration,
    pub renewal_price: Money,
    pub sweep_batch_limit: usize,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            rental_period: Duration::days(DEFAULT_RENTAL_PERIOD_DAYS),
            renewal_period: Duration::days(DEFAULT_RENTAL_PERIOD_DAYS),
            renewal_price: Money::from_major(150),
            sweep_batch_limit: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepFailure {
    pub account_id: AccountId,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub renewed: Vec<AccountId>,
    pub expired: Vec<AccountId>,
    pub failures: Vec<SweepFailure>,
}

enum SweepAction {
    Renewed,
    Expired,
    Skipped,
}

/// Owns the account state machine. Every mutation runs under the account's
/// lock and writes its audit entry before the state change is stored.
pub struct AccountLifecycleManager {
    accounts: Arc<dyn AccountRepository>,
    audit: Arc<dyn AuditRepository>,
    ledger: Ledger,
    clock: Arc<dyn Clock>,
    settings: LifecycleSettings,
    account_locks: KeyedLocks<AccountId>,
    activation_locks: KeyedLocks<PaymentSessionId>,
}

impl AccountLifecycleManager {
    #[must_use]
    pub fn new(
        accounts: Arc<dyn AccountRepository>,
        audit: Arc<dyn AuditRepository>,
        ledger: Ledger,
        clock: Arc<dyn Clock>,
        settings: LifecycleSettings,
    ) -> Self {
        Self {
            accounts,
            audit,
            ledger,
            clock,
            settings,
            account_locks: KeyedLocks::new(),
            activation_locks: KeyedLocks::new(),
        }
    }

    #[must_use]
    pub fn settings(&self) -> &LifecycleSettings {
        &self.settings
    }

    /// Creates an active account for a paid session. A replay with the same
    /// `dedup_key`, from this process or another sharing the stores, returns
    /// the account created the first time. The account id is the session id
    /// and the activation audit entry is keyed by it, so racing writers end
    /// with one account and one entry.
    pub async fn activate(
        &self,
        user_id: UserId,
        price_paid: Money,
        dedup_key: PaymentSessionId,
    ) -> Result<Account, SettlementError> {
        let _guard = self.activation_locks.lock(&dedup_key).await?;
        if let Some(existing) = self.accounts.find_by_activation_key(dedup_key).await? {
            debug!(
                session_id = %dedup_key.0,
                account_id = %existing.id.0,
                "activation replay ignored"
            );
            return Ok(existing);
        }
        let now = self.clock.now();
        let account = Account::new_active(
            user_id,
            price_paid,
            dedup_key,
            self.settings.rental_period,
            now,
        );
        self.audit
            .record(
                &AuditEntryInsert::for_account(
                    account.id,
                    AuditAction::Activated,
                    Some(user_id),
                    json!({
                        "payment_session_id": dedup_key.0,
                        "price_paid": price_paid.to_string(),
                        "expire_at": account.expire_at,
                    }),
                )
                .with_subject(user_id)
                .once_per(dedup_key.0),
                now,
            )
            .await?;
        let stored = self.accounts.insert_activated(&account).await?.into_account();
        info!(
            user_id = %user_id.0,
            account_id = %stored.id.0,
            session_id = %dedup_key.0,
            "account activated"
        );
        Ok(stored)
    }

    /// Sets `expire_at` to a caller-computed date. The date must be in the
    /// future and must not shorten the current term. Status is untouched.
    pub async fn extend(
        &self,
        actor: Option<UserId>,
        account_id: AccountId,
        new_expire_at: DateTime<Utc>,
        note: Option<String>,
    ) -> Result<Account, SettlementError> {
        let _guard = self.account_locks.lock(&account_id).await?;
        let now = self.clock.now();
        let mut account = self.load(account_id).await?;
        if new_expire_at <= now {
            return Err(SettlementError::Validation(
                "new expiry must be in the future".to_string(),
            ));
        }
        if account.expire_at.is_some_and(|current| new_expire_at < current) {
            return Err(SettlementError::Validation(
                "new expiry would shorten the current term".to_string(),
            ));
        }
        let note = note.map(|n| n.trim().to_string()).filter(|n| !n.is_empty());
        let insert = AuditEntryInsert::for_account(
            account_id,
            AuditAction::Extended,
            actor,
            json!({
                "previous_expire_at": account.expire_at,
                "new_expire_at": new_expire_at,
                "note": note,
            }),
        );
        account.expire_at = Some(new_expire_at);
        let stored = self.commit(account, insert, now).await?;
        info!(account_id = %account_id.0, expire_at = %new_expire_at, "account extended");
        Ok(stored)
    }

    /// `max(expire_at, now) + months`.
    pub async fn extension_target_for(
        &self,
        account_id: AccountId,
        months: u32,
    ) -> Result<DateTime<Utc>, SettlementError> {
        if months == 0 {
            return Err(SettlementError::Validation(
                "months must be greater than zero".to_string(),
            ));
        }
        let account = self.load(account_id).await?;
        extension_target(account.expire_at, self.clock.now(), months)
            .ok_or_else(|| SettlementError::Validation("extension out of range".to_string()))
    }

    pub async fn suspend(
        &self,
        actor: Option<UserId>,
        account_id: AccountId,
        reason: &str,
    ) -> Result<Account, SettlementError> {
        let reason = require_non_empty("reason", reason)?;
        let _guard = self.account_locks.lock(&account_id).await?;
        let now = self.clock.now();
        let mut account = self.load(account_id).await?;
        if account.status == AccountStatus::Suspended {
            return Err(SettlementError::Conflict(format!(
                "account {} is already suspended",
                account_id.0
            )));
        }
        let insert = AuditEntryInsert::for_account(
            account_id,
            AuditAction::Suspended,
            actor,
            json!({ "reason": reason, "previous_status": account.status.as_str() }),
        );
        account.status = AccountStatus::Suspended;
        let stored = self.commit(account, insert, now).await?;
        info!(account_id = %account_id.0, "account suspended");
        Ok(stored)
    }

    /// Credits the user's central balance. The credit and its audit entry
    /// are stored as one unit. No account state changes.
    pub async fn refund(
        &self,
        actor: Option<UserId>,
        user_id: UserId,
        amount: Money,
        reason: &str,
    ) -> Result<Transaction, SettlementError> {
        if amount.is_zero() {
            return Err(DomainError::NonPositiveAmount.into());
        }
        let reason = require_non_empty("reason", reason)?;
        let audit = AuditEntryInsert::for_user(
            user_id,
            AuditAction::Refunded,
            actor,
            json!({ "amount": amount.to_string(), "reason": reason }),
        );
        let (tx, _) = self
            .ledger
            .credit_audited(
                user_id,
                amount,
                TransactionType::Refund,
                EntryContext::default().describe(reason),
                &audit,
            )
            .await?;
        info!(user_id = %user_id.0, amount = %amount, "refund credited");
        Ok(tx)
    }

    pub async fn rename(
        &self,
        actor: Option<UserId>,
        account_id: AccountId,
        new_name: &str,
    ) -> Result<Account, SettlementError> {
        let new_name = require_non_empty("name", new_name)?;
        let _guard = self.account_locks.lock(&account_id).await?;
        let now = self.clock.now();
        let mut account = self.load(account_id).await?;
        let insert = AuditEntryInsert::for_account(
            account_id,
            AuditAction::Renamed,
            actor,
            json!({ "from": account.name, "to": new_name }),
        );
        account.name = new_name;
        self.commit(account, insert, now).await
    }

    pub async fn set_auto_renew(
        &self,
        actor: Option<UserId>,
        account_id: AccountId,
        enabled: bool,
    ) -> Result<Account, SettlementError> {
        let _guard = self.account_locks.lock(&account_id).await?;
        let now = self.clock.now();
        let mut account = self.load(account_id).await?;
        if account.auto_renew == enabled {
            return Ok(self.view(account, now));
        }
        let insert = AuditEntryInsert::for_account(
            account_id,
            AuditAction::AutoRenewChanged,
            actor,
            json!({ "auto_renew": enabled }),
        );
        account.auto_renew = enabled;
        self.commit(account, insert, now).await
    }

    /// Returns a suspended or expired account to `active`. Only possible once
    /// its term already runs past now; paying for that term is a separate step.
    pub async fn reactivate(
        &self,
        actor: Option<UserId>,
        account_id: AccountId,
    ) -> Result<Account, SettlementError> {
        let _guard = self.account_locks.lock(&account_id).await?;
        let now = self.clock.now();
        let mut account = self.load(account_id).await?;
        if !matches!(
            account.status,
            AccountStatus::Suspended | AccountStatus::Expired
        ) {
            return Err(SettlementError::Conflict(format!(
                "account {} is {} and cannot be reactivated",
                account_id.0,
                account.status.as_str()
            )));
        }
        if !account.expire_at.is_some_and(|at| at > now) {
            return Err(SettlementError::Validation(
                "account term has ended; extend it before reactivating".to_string(),
            ));
        }
        let insert = AuditEntryInsert::for_account(
            account_id,
            AuditAction::Reactivated,
            actor,
            json!({ "previous_status": account.status.as_str(), "expire_at": account.expire_at }),
        );
        account.status = AccountStatus::Active;
        let stored = self.commit(account, insert, now).await?;
        info!(account_id = %account_id.0, "account reactivated");
        Ok(stored)
    }

    /// Reads with lazy expiry: an active account past its term reads as expired.
    pub async fn get(&self, account_id: AccountId) -> Result<Account, SettlementError> {
        let account = self.load(account_id).await?;
        Ok(self.view(account, self.clock.now()))
    }

    pub async fn list_for_user(&self, user_id: UserId) -> Result<Vec<Account>, SettlementError> {
        let now = self.clock.now();
        Ok(self
            .accounts
            .list_accounts_for_user(user_id)
            .await?
            .into_iter()
            .map(|account| self.view(account, now))
            .collect())
    }

    pub async fn find_by_activation_key(
        &self,
        key: PaymentSessionId,
    ) -> Result<Option<Account>, SettlementError> {
        let now = self.clock.now();
        Ok(self
            .accounts
            .find_by_activation_key(key)
            .await?
            .map(|account| self.view(account, now)))
    }

    /// Fresh read of whether the account may be used right now.
    pub async fn is_usable(&self, account_id: AccountId) -> Result<bool, SettlementError> {
        let account = self.load(account_id).await?;
        Ok(account.is_usable_at(self.clock.now()))
    }

    /// Renews or expires every lapsed active account. One account failing
    /// does not stop the others.
    pub async fn expiry_sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, SettlementError> {
        let lapsed = self
            .accounts
            .list_lapsed_active(now, self.settings.sweep_batch_limit)
            .await?;
        let mut report = SweepReport::default();
        for account in lapsed {
            match self.renew_or_expire(account.id, now).await {
                Ok(SweepAction::Renewed) => report.renewed.push(account.id),
                Ok(SweepAction::Expired) => report.expired.push(account.id),
                Ok(SweepAction::Skipped) => {}
                Err(err) => {
                    warn!(account_id = %account.id.0, error = %err, "expiry sweep failed for account");
                    report.failures.push(SweepFailure {
                        account_id: account.id,
                        error: err.to_string(),
                    });
                }
            }
        }
        if !report.renewed.is_empty() || !report.expired.is_empty() || !report.failures.is_empty() {
            info!(
                renewed = report.renewed.len(),
                expired = report.expired.len(),
                failures = report.failures.len(),
                "expiry sweep finished"
            );
        }
        Ok(report)
    }

    async fn renew_or_expire(
        &self,
        account_id: AccountId,
        now: DateTime<Utc>,
    ) -> Result<SweepAction, SettlementError> {
        let _guard = self.account_locks.lock(&account_id).await?;
        let mut account = self.load(account_id).await?;
        if account.status != AccountStatus::Active || account.expire_at.is_some_and(|at| at >= now)
        {
            return Ok(SweepAction::Skipped);
        }
        if let (true, Some(owner)) = (account.auto_renew, account.owner_user_id) {
            match self.try_renew(&mut account, owner, now).await {
                Ok(true) => return Ok(SweepAction::Renewed),
                Ok(false) => {}
                Err(err) => return Err(err),
            }
        }
        let insert = AuditEntryInsert::for_account(
            account_id,
            AuditAction::Expired,
            None,
            json!({ "expire_at": account.expire_at, "auto_renew": account.auto_renew }),
        );
        account.status = AccountStatus::Expired;
        self.commit(account, insert, now).await?;
        Ok(SweepAction::Expired)
    }

    /// Debits one renewal period and extends. `Ok(false)` when the balance
    /// cannot cover it.
    async fn try_renew(
        &self,
        account: &mut Account,
        owner: UserId,
        now: DateTime<Utc>,
    ) -> Result<bool, SettlementError> {
        let price = self.settings.renewal_price;
        let debit = self
            .ledger
            .debit(
                owner,
                price,
                TransactionType::Rental,
                EntryContext::account(account.id).describe("auto-renewal"),
            )
            .await;
        let tx = match debit {
            Ok(tx) => tx,
            Err(SettlementError::InsufficientFunds { balance, .. }) => {
                info!(
                    account_id = %account.id.0,
                    balance = %balance,
                    price = %price,
                    "auto-renewal skipped for insufficient funds"
                );
                return Ok(false);
            }
            Err(err) => return Err(err),
        };
        let base = account.expire_at.map_or(now, |at| at.max(now));
        let new_expire_at = base + self.settings.renewal_period;
        let insert = AuditEntryInsert::for_account(
            account.id,
            AuditAction::Renewed,
            None,
            json!({
                "transaction_id": tx.id.0,
                "price": price.to_string(),
                "previous_expire_at": account.expire_at,
                "new_expire_at": new_expire_at,
            }),
        )
        .with_subject(owner);
        let mut renewed = account.clone();
        renewed.expire_at = Some(new_expire_at);
        if let Err(err) = self.commit(renewed, insert, now).await {
            self.compensate(
                owner,
                price,
                EntryContext::account(account.id).describe("auto-renewal rollback"),
            )
            .await;
            return Err(err);
        }
        info!(account_id = %account.id.0, expire_at = %new_expire_at, "account auto-renewed");
        Ok(true)
    }

    /// Best-effort credit that undoes a debit whose follow-up step failed.
    pub(crate) async fn compensate(&self, user_id: UserId, amount: Money, context: EntryContext) {
        if let Err(err) = self
            .ledger
            .credit(user_id, amount, TransactionType::Refund, context)
            .await
        {
            warn!(
                user_id = %user_id.0,
                amount = %amount,
                error = %err,
                "compensating credit failed"
            );
        }
    }

    async fn load(&self, account_id: AccountId) -> Result<Account, SettlementError> {
        self.accounts
            .get_account(account_id)
            .await?
            .ok_or_else(|| SettlementError::not_found("account", account_id.0))
    }

    async fn commit(
        &self,
        mut account: Account,
        insert: AuditEntryInsert,
        now: DateTime<Utc>,
    ) -> Result<Account, SettlementError> {
        self.audit.record(&insert, now).await?;
        account.updated_at = now;
        let stored = self.accounts.update_account(&account).await?;
        Ok(self.view(stored, now))
    }

    fn view(&self, mut account: Account, now: DateTime<Utc>) -> Account {
        account.status = account.effective_status(now);
        account
    }
}

#[cfg(test)]
mod tests {
    use audit_store::{InMemoryAuditRepository, PageRequest};
    use chrono::TimeZone;
    use ledger_store::{InMemoryAccountRepository, InMemoryLedgerRepository, LedgerRepository};
    use rental_domain::ManualClock;

    use super::*;

    struct Harness {
        manager: AccountLifecycleManager,
        ledger_repo: InMemoryLedgerRepository,
        audit: InMemoryAuditRepository,
        clock: ManualClock,
    }

    fn harness() -> Harness {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 1, 10, 12, 0, 0).unwrap());
        let audit = InMemoryAuditRepository::new();
        let ledger_repo = InMemoryLedgerRepository::with_audit(audit.clone());
        let ledger = Ledger::new(Arc::new(ledger_repo.clone()), Arc::new(clock.clone()));
        let manager = AccountLifecycleManager::new(
            Arc::new(InMemoryAccountRepository::new()),
            Arc::new(audit.clone()),
            ledger,
            Arc::new(clock.clone()),
            LifecycleSettings::default(),
        );
        Harness {
            manager,
            ledger_repo,
            audit,
            clock,
        }
    }

    async fn audit_actions(h: &Harness, account_id: AccountId) -> Vec<AuditAction> {
        h.audit
            .list_for_account(account_id, PageRequest::default())
            .await
            .expect("audit")
            .into_iter()
            .map(|e| e.action)
            .collect()
    }

    #[tokio::test]
    async fn activation_is_idempotent_per_session() {
        let h = harness();
        let user = UserId::new();
        let session = PaymentSessionId::new();
        let first = h
            .manager
            .activate(user, Money::from_major(150), session)
            .await
            .expect("activate");
        let replay = h
            .manager
            .activate(user, Money::from_major(150), session)
            .await
            .expect("replay");
        assert_eq!(first.id, replay.id);
        assert_eq!(first.status, AccountStatus::Active);
        assert_eq!(first.expire_at, Some(h.clock.now() + Duration::days(30)));
        assert_eq!(h.manager.list_for_user(user).await.expect("list").len(), 1);
        assert_eq!(audit_actions(&h, first.id).await, vec![AuditAction::Activated]);
    }

    #[tokio::test]
    async fn extend_by_three_months_adds_one_audit_entry() {
        let h = harness();
        let account = h
            .manager
            .activate(UserId::new(), Money::from_major(150), PaymentSessionId::new())
            .await
            .expect("activate");
        let target = h
            .manager
            .extension_target_for(account.id, 3)
            .await
            .expect("target");
        assert_eq!(target, Utc.with_ymd_and_hms(2026, 5, 9, 12, 0, 0).unwrap());

        let admin = UserId::new();
        let extended = h
            .manager
            .extend(Some(admin), account.id, target, Some("goodwill".to_string()))
            .await
            .expect("extend");
        assert_eq!(extended.expire_at, Some(target));
        assert_eq!(extended.status, AccountStatus::Active);
        assert_eq!(
            audit_actions(&h, account.id).await,
            vec![AuditAction::Activated, AuditAction::Extended]
        );
    }

    #[tokio::test]
    async fn extend_rejects_past_and_shortening_dates() {
        let h = harness();
        let account = h
            .manager
            .activate(UserId::new(), Money::from_major(150), PaymentSessionId::new())
            .await
            .expect("activate");
        let past = h.clock.now() - Duration::days(1);
        assert!(matches!(
            h.manager.extend(None, account.id, past, None).await,
            Err(SettlementError::Validation(_))
        ));
        let shorter = h.clock.now() + Duration::days(5);
        assert!(matches!(
            h.manager.extend(None, account.id, shorter, None).await,
            Err(SettlementError::Validation(_))
        ));
        assert_eq!(audit_actions(&h, account.id).await, vec![AuditAction::Activated]);
    }

    #[tokio::test]
    async fn suspend_is_immediate_and_audited_once() {
        let h = harness();
        let account = h
            .manager
            .activate(UserId::new(), Money::from_major(150), PaymentSessionId::new())
            .await
            .expect("activate");
        assert!(matches!(
            h.manager.suspend(None, account.id, "   ").await,
            Err(SettlementError::Validation(_))
        ));
        h.manager
            .suspend(None, account.id, "policy violation")
            .await
            .expect("suspend");
        assert!(!h.manager.is_usable(account.id).await.expect("usable"));
        assert_eq!(
            h.manager.get(account.id).await.expect("get").status,
            AccountStatus::Suspended
        );
        assert!(matches!(
            h.manager.suspend(None, account.id, "again").await,
            Err(SettlementError::Conflict(_))
        ));
        assert_eq!(
            audit_actions(&h, account.id).await,
            vec![AuditAction::Activated, AuditAction::Suspended]
        );
    }

    #[tokio::test]
    async fn failed_audit_write_leaves_account_unchanged() {
        let h = harness();
        let account = h
            .manager
            .activate(UserId::new(), Money::from_major(150), PaymentSessionId::new())
            .await
            .expect("activate");
        h.audit.set_unavailable(true).expect("toggle");
        let err = h
            .manager
            .rename(None, account.id, "client-b")
            .await
            .expect_err("audit down");
        assert!(matches!(err, SettlementError::Storage(_)));
        h.audit.set_unavailable(false).expect("toggle");
        assert_eq!(h.manager.get(account.id).await.expect("get").name, account.name);
    }

    #[tokio::test]
    async fn refund_credits_balance_without_touching_accounts() {
        let h = harness();
        let user = UserId::new();
        h.ledger_repo
            .seed_balance(user, Money::from_major(10))
            .await
            .expect("seed");
        let account = h
            .manager
            .activate(user, Money::from_major(150), PaymentSessionId::new())
            .await
            .expect("activate");

        assert!(matches!(
            h.manager.refund(None, user, Money::ZERO, "x").await,
            Err(SettlementError::Validation(_))
        ));
        let tx = h
            .manager
            .refund(
                Some(UserId::new()),
                user,
                Money::parse_decimal("25.00").expect("amount"),
                "service issue",
            )
            .await
            .expect("refund");
        assert_eq!(tx.tx_type, TransactionType::Refund);
        assert_eq!(
            h.ledger_repo.balance(user).await.expect("balance"),
            Money::from_major(35)
        );
        let refunds = h
            .audit
            .list_for_user(user, PageRequest::default())
            .await
            .expect("audit");
        assert!(refunds.iter().any(|e| e.action == AuditAction::Refunded));
        assert_eq!(h.manager.get(account.id).await.expect("get"), account);
    }

    #[tokio::test]
    async fn reactivation_requires_a_live_term() {
        let h = harness();
        let account = h
            .manager
            .activate(UserId::new(), Money::from_major(150), PaymentSessionId::new())
            .await
            .expect("activate");
        assert!(matches!(
            h.manager.reactivate(None, account.id).await,
            Err(SettlementError::Conflict(_))
        ));
        h.manager
            .suspend(None, account.id, "chargeback")
            .await
            .expect("suspend");
        let reactivated = h
            .manager
            .reactivate(None, account.id)
            .await
            .expect("reactivate");
        assert_eq!(reactivated.status, AccountStatus::Active);

        h.manager
            .suspend(None, account.id, "again")
            .await
            .expect("suspend");
        h.clock.advance(Duration::days(31));
        assert!(matches!(
            h.manager.reactivate(None, account.id).await,
            Err(SettlementError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn sweep_renews_funded_accounts_and_expires_the_rest() {
        let h = harness();
        let funded_user = UserId::new();
        let broke_user = UserId::new();
        h.ledger_repo
            .seed_balance(funded_user, Money::from_major(200))
            .await
            .expect("seed");
        h.ledger_repo.open_user(broke_user).await.expect("open");

        let funded = h
            .manager
            .activate(funded_user, Money::from_major(150), PaymentSessionId::new())
            .await
            .expect("activate");
        h.manager
            .set_auto_renew(Some(funded_user), funded.id, true)
            .await
            .expect("auto renew");
        let broke = h
            .manager
            .activate(broke_user, Money::from_major(150), PaymentSessionId::new())
            .await
            .expect("activate");
        h.manager
            .set_auto_renew(Some(broke_user), broke.id, true)
            .await
            .expect("auto renew");
        let plain = h
            .manager
            .activate(UserId::new(), Money::from_major(150), PaymentSessionId::new())
            .await
            .expect("activate");

        h.clock.advance(Duration::days(31));
        assert_eq!(
            h.manager.get(plain.id).await.expect("lazy").status,
            AccountStatus::Expired
        );
        let report = h.manager.expiry_sweep(h.clock.now()).await.expect("sweep");
        assert_eq!(report.renewed, vec![funded.id]);
        let mut expired = report.expired.clone();
        expired.sort();
        let mut expected = vec![broke.id, plain.id];
        expected.sort();
        assert_eq!(expired, expected);
        assert!(report.failures.is_empty());

        assert_eq!(
            h.ledger_repo.balance(funded_user).await.expect("balance"),
            Money::from_major(50)
        );
        let renewed = h.manager.get(funded.id).await.expect("get");
        assert_eq!(renewed.status, AccountStatus::Active);
        assert_eq!(renewed.expire_at, Some(h.clock.now() + Duration::days(30)));
        assert_eq!(
            audit_actions(&h, funded.id).await.last(),
            Some(&AuditAction::Renewed)
        );

        let again = h.manager.expiry_sweep(h.clock.now()).await.expect("sweep");
        assert_eq!(again, SweepReport::default());
    }

    #[tokio::test]
    async fn activation_from_two_managers_sharing_stores_is_recorded_once() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 1, 10, 12, 0, 0).unwrap());
        let audit = InMemoryAuditRepository::new();
        let accounts = InMemoryAccountRepository::new();
        let ledger_repo = InMemoryLedgerRepository::with_audit(audit.clone());
        let manager = || {
            AccountLifecycleManager::new(
                Arc::new(accounts.clone()),
                Arc::new(audit.clone()),
                Ledger::new(Arc::new(ledger_repo.clone()), Arc::new(clock.clone())),
                Arc::new(clock.clone()),
                LifecycleSettings::default(),
            )
        };
        let (first, second) = (manager(), manager());
        let user = UserId::new();
        let session = PaymentSessionId::new();

        let (a, b) = tokio::join!(
            first.activate(user, Money::from_major(150), session),
            second.activate(user, Money::from_major(150), session),
        );
        let (a, b) = (a.expect("first"), b.expect("second"));
        assert_eq!(a.id, b.id);
        assert_eq!(accounts.snapshot().expect("accounts").len(), 1);
        let activated = audit
            .list_for_account(a.id, PageRequest::default())
            .await
            .expect("audit")
            .into_iter()
            .filter(|e| e.action == AuditAction::Activated)
            .count();
        assert_eq!(activated, 1);
    }

    #[tokio::test]
    async fn activation_after_another_writer_audited_adds_no_second_entry() {
        let h = harness();
        let user = UserId::new();
        let session = PaymentSessionId::new();
        // a writer elsewhere got as far as the audit entry
        h.audit
            .record(
                &AuditEntryInsert::for_account(
                    AccountId(session.0),
                    AuditAction::Activated,
                    Some(user),
                    json!({ "payment_session_id": session.0 }),
                )
                .with_subject(user)
                .once_per(session.0),
                h.clock.now(),
            )
            .await
            .expect("audit");

        let account = h
            .manager
            .activate(user, Money::from_major(150), session)
            .await
            .expect("activate");
        assert_eq!(account.id, AccountId(session.0));
        assert_eq!(audit_actions(&h, account.id).await, vec![AuditAction::Activated]);
    }

    #[tokio::test]
    async fn refund_with_audit_down_moves_no_money() {
        let h = harness();
        let user = UserId::new();
        h.ledger_repo
            .seed_balance(user, Money::from_major(10))
            .await
            .expect("seed");
        h.audit.set_unavailable(true).expect("toggle");

        let err = h
            .manager
            .refund(None, user, Money::from_major(25), "service issue")
            .await
            .expect_err("audit down");
        assert!(matches!(err, SettlementError::Storage(_)));
        assert_eq!(
            h.ledger_repo.balance(user).await.expect("balance"),
            Money::from_major(10)
        );
        assert!(h.ledger_repo.list_transactions(user).await.expect("list").is_empty());

        h.audit.set_unavailable(false).expect("toggle");
        assert!(
            h.audit
                .list_for_user(user, PageRequest::default())
                .await
                .expect("audit")
                .is_empty()
        );
    }

    #[tokio::test]
    async fn sweep_and_reads_agree_at_the_expiry_instant() {
        let h = harness();
        let account = h
            .manager
            .activate(UserId::new(), Money::from_major(150), PaymentSessionId::new())
            .await
            .expect("activate");
        let expire_at = account.expire_at.expect("expiry");
        h.clock.advance(expire_at - h.clock.now());

        assert_eq!(
            h.manager.get(account.id).await.expect("get").status,
            AccountStatus::Active
        );
        let report = h.manager.expiry_sweep(h.clock.now()).await.expect("sweep");
        assert_eq!(report, SweepReport::default());

        h.clock.advance(Duration::seconds(1));
        assert_eq!(
            h.manager.get(account.id).await.expect("get").status,
            AccountStatus::Expired
        );
        let report = h.manager.expiry_sweep(h.clock.now()).await.expect("sweep");
        assert_eq!(report.expired, vec![account.id]);
    }
}
