use std::sync::Arc;

use audit_store::AuditEntryInsert;
use ledger_store::{LedgerEntryInsert, LedgerRepository, PendingOutcome};
use rental_domain::{
    AccountId, AuditEntry, Clock, DomainError, LedgerDirection, Money, PaymentSessionId,
    Transaction, TransactionType, UserId,
};
use tracing::info;

use crate::SettlementError;

/// Optional links and a note carried on a ledger entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryContext {
    pub payment_session_id: Option<PaymentSessionId>,
    pub account_id: Option<AccountId>,
    pub description: Option<String>,
}

impl EntryContext {
    #[must_use]
    pub fn session(session_id: PaymentSessionId) -> Self {
        Self {
            payment_session_id: Some(session_id),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn account(account_id: AccountId) -> Self {
        Self {
            account_id: Some(account_id),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// The only way balances change. Validates amounts and hands the atomic
/// part to the repository.
#[derive(Clone)]
pub struct Ledger {
    repo: Arc<dyn LedgerRepository>,
    clock: Arc<dyn Clock>,
}

impl Ledger {
    #[must_use]
    pub fn new(repo: Arc<dyn LedgerRepository>, clock: Arc<dyn Clock>) -> Self {
        Self { repo, clock }
    }

    pub async fn open_user(&self, user_id: UserId) -> Result<(), SettlementError> {
        Ok(self.repo.open_user(user_id).await?)
    }

    pub async fn balance(&self, user_id: UserId) -> Result<Money, SettlementError> {
        Ok(self.repo.balance(user_id).await?)
    }

    pub async fn debit(
        &self,
        user_id: UserId,
        amount: Money,
        tx_type: TransactionType,
        context: EntryContext,
    ) -> Result<Transaction, SettlementError> {
        self.post(user_id, amount, tx_type, LedgerDirection::Debit, context)
            .await
    }

    pub async fn credit(
        &self,
        user_id: UserId,
        amount: Money,
        tx_type: TransactionType,
        context: EntryContext,
    ) -> Result<Transaction, SettlementError> {
        self.post(user_id, amount, tx_type, LedgerDirection::Credit, context)
            .await
    }

    /// Credit stored together with its audit record.
    pub async fn credit_audited(
        &self,
        user_id: UserId,
        amount: Money,
        tx_type: TransactionType,
        context: EntryContext,
        audit: &AuditEntryInsert,
    ) -> Result<(Transaction, AuditEntry), SettlementError> {
        let entry = build_entry(user_id, amount, tx_type, LedgerDirection::Credit, context)?;
        let (tx, recorded) = self
            .repo
            .post_audited_entry(&entry, audit, self.clock.now())
            .await?;
        info!(
            user_id = %user_id.0,
            tx_id = %tx.id.0,
            audit_entry_id = %recorded.id.0,
            amount = %tx.amount,
            "audited credit posted"
        );
        Ok((tx, recorded))
    }

    /// Returns a session's completed debit to the balance. `None` when there
    /// is nothing to return or another caller already returned it.
    pub async fn reverse_session_debit(
        &self,
        user_id: UserId,
        session_id: PaymentSessionId,
        description: &str,
    ) -> Result<Option<Transaction>, SettlementError> {
        Ok(self
            .repo
            .reverse_session_debit(user_id, session_id, description, self.clock.now())
            .await?)
    }

    /// Pending row tied to a payment session; no balance effect until it
    /// is completed.
    pub async fn record_pending(
        &self,
        user_id: UserId,
        amount: Money,
        tx_type: TransactionType,
        direction: LedgerDirection,
        context: EntryContext,
    ) -> Result<Transaction, SettlementError> {
        if context.payment_session_id.is_none() {
            return Err(SettlementError::Validation(
                "pending entries must be linked to a payment session".to_string(),
            ));
        }
        let entry = build_entry(user_id, amount, tx_type, direction, context)?;
        Ok(self.repo.insert_pending(&entry, self.clock.now()).await?)
    }

    pub async fn complete_pending(
        &self,
        user_id: UserId,
        session_id: PaymentSessionId,
    ) -> Result<PendingOutcome, SettlementError> {
        let outcome = self
            .repo
            .complete_pending(user_id, session_id, self.clock.now())
            .await?;
        if outcome.was_applied() {
            let tx = outcome.transaction();
            info!(
                user_id = %user_id.0,
                session_id = %session_id.0,
                tx_id = %tx.id.0,
                amount = %tx.amount,
                "pending ledger entry completed"
            );
        }
        Ok(outcome)
    }

    pub async fn fail_pending(
        &self,
        user_id: UserId,
        session_id: PaymentSessionId,
    ) -> Result<PendingOutcome, SettlementError> {
        Ok(self
            .repo
            .fail_pending(user_id, session_id, self.clock.now())
            .await?)
    }

    pub async fn find_by_session(
        &self,
        user_id: UserId,
        session_id: PaymentSessionId,
    ) -> Result<Option<Transaction>, SettlementError> {
        Ok(self.repo.find_by_session(user_id, session_id).await?)
    }

    pub async fn list_transactions(
        &self,
        user_id: UserId,
    ) -> Result<Vec<Transaction>, SettlementError> {
        Ok(self.repo.list_transactions(user_id).await?)
    }

    async fn post(
        &self,
        user_id: UserId,
        amount: Money,
        tx_type: TransactionType,
        direction: LedgerDirection,
        context: EntryContext,
    ) -> Result<Transaction, SettlementError> {
        let entry = build_entry(user_id, amount, tx_type, direction, context)?;
        let tx = self.repo.post_entry(&entry, self.clock.now()).await?;
        info!(
            user_id = %user_id.0,
            tx_id = %tx.id.0,
            tx_type = tx.tx_type.as_str(),
            direction = tx.direction.as_str(),
            amount = %tx.amount,
            "ledger entry posted"
        );
        Ok(tx)
    }
}

fn build_entry(
    user_id: UserId,
    amount: Money,
    tx_type: TransactionType,
    direction: LedgerDirection,
    context: EntryContext,
) -> Result<LedgerEntryInsert, SettlementError> {
    if amount.is_zero() {
        return Err(DomainError::NonPositiveAmount.into());
    }
    Ok(LedgerEntryInsert {
        user_id,
        tx_type,
        amount,
        direction,
        linked_payment_session_id: context.payment_session_id,
        linked_account_id: context.account_id,
        description: context.description,
    })
}
