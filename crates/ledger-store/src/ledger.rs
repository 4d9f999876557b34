use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use audit_store::{AuditEntryInsert, AuditRepository, InMemoryAuditRepository};
use chrono::{DateTime, Utc};
use rental_domain::{
    AccountId, AuditEntry, LedgerDirection, Money, PaymentSessionId, Transaction, TransactionId,
    TransactionStatus, TransactionType, UserId,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;

use crate::LedgerStoreError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntryInsert {
    pub user_id: UserId,
    pub tx_type: TransactionType,
    pub amount: Money,
    pub direction: LedgerDirection,
    pub linked_payment_session_id: Option<PaymentSessionId>,
    pub linked_account_id: Option<AccountId>,
    pub description: Option<String>,
}

impl LedgerEntryInsert {
    fn to_transaction(&self, status: TransactionStatus, now: DateTime<Utc>) -> Transaction {
        Transaction {
            id: TransactionId::new(),
            user_id: self.user_id,
            tx_type: self.tx_type,
            amount: self.amount,
            direction: self.direction,
            status,
            linked_payment_session_id: self.linked_payment_session_id,
            linked_account_id: self.linked_account_id,
            reverses_payment_session_id: None,
            description: self.description.clone(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Result of settling a pending entry. `AlreadySettled` carries the row as it
/// was found, whichever way it went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingOutcome {
    Applied(Transaction),
    AlreadySettled(Transaction),
}

impl PendingOutcome {
    #[must_use]
    pub fn transaction(&self) -> &Transaction {
        match self {
            Self::Applied(tx) | Self::AlreadySettled(tx) => tx,
        }
    }

    #[must_use]
    pub fn was_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

/// Owner of every user's central balance. Each implementation serializes
/// mutations per user and applies the balance change and its transaction row
/// together or not at all.
#[async_trait]
pub trait LedgerRepository: Send + Sync {
    /// Idempotent; a new user starts at zero.
    async fn open_user(&self, user_id: UserId) -> Result<(), LedgerStoreError>;

    async fn balance(&self, user_id: UserId) -> Result<Money, LedgerStoreError>;

    /// Applies a completed entry. Debits beyond the balance fail with
    /// `InsufficientFunds`; a second entry for the same session fails with
    /// `DuplicateSessionLink`.
    async fn post_entry(
        &self,
        entry: &LedgerEntryInsert,
        now: DateTime<Utc>,
    ) -> Result<Transaction, LedgerStoreError>;

    /// `post_entry` plus its audit record in the same unit: either both are
    /// stored or neither is.
    async fn post_audited_entry(
        &self,
        entry: &LedgerEntryInsert,
        audit: &AuditEntryInsert,
        now: DateTime<Utc>,
    ) -> Result<(Transaction, AuditEntry), LedgerStoreError>;

    /// Credits back the completed debit linked to `session_id`. At most one
    /// reversal exists per session; `None` when there is no completed debit
    /// or it was already reversed.
    async fn reverse_session_debit(
        &self,
        user_id: UserId,
        session_id: PaymentSessionId,
        description: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Transaction>, LedgerStoreError>;

    /// Records a pending entry with no balance effect yet.
    async fn insert_pending(
        &self,
        entry: &LedgerEntryInsert,
        now: DateTime<Utc>,
    ) -> Result<Transaction, LedgerStoreError>;

    /// pending -> completed, applying the balance effect in the same step.
    async fn complete_pending(
        &self,
        user_id: UserId,
        session_id: PaymentSessionId,
        now: DateTime<Utc>,
    ) -> Result<PendingOutcome, LedgerStoreError>;

    /// pending -> failed; the balance is untouched.
    async fn fail_pending(
        &self,
        user_id: UserId,
        session_id: PaymentSessionId,
        now: DateTime<Utc>,
    ) -> Result<PendingOutcome, LedgerStoreError>;

    async fn find_by_session(
        &self,
        user_id: UserId,
        session_id: PaymentSessionId,
    ) -> Result<Option<Transaction>, LedgerStoreError>;

    /// Newest first.
    async fn list_transactions(&self, user_id: UserId)
    -> Result<Vec<Transaction>, LedgerStoreError>;
}

#[derive(Debug, Default)]
struct UserBook {
    balance: Money,
    transactions: Vec<Transaction>,
}

impl UserBook {
    fn apply(&self, direction: LedgerDirection, amount: Money) -> Result<Money, LedgerStoreError> {
        match direction {
            LedgerDirection::Credit => Ok(self.balance.checked_add(amount)?),
            LedgerDirection::Debit => {
                self.balance
                    .checked_sub(amount)
                    .map_err(|_| LedgerStoreError::InsufficientFunds {
                        balance: self.balance,
                        requested: amount,
                    })
            }
            LedgerDirection::OffBalance => Ok(self.balance),
        }
    }

    fn reversed(&self, session_id: PaymentSessionId) -> bool {
        self.transactions
            .iter()
            .any(|tx| tx.reverses_payment_session_id == Some(session_id))
    }

    fn linked(&self, session_id: PaymentSessionId) -> Option<usize> {
        self.transactions
            .iter()
            .position(|tx| tx.linked_payment_session_id == Some(session_id))
    }

    fn ensure_unlinked(&self, entry: &LedgerEntryInsert) -> Result<(), LedgerStoreError> {
        match entry.linked_payment_session_id {
            Some(session_id) if self.linked(session_id).is_some() => {
                Err(LedgerStoreError::DuplicateSessionLink(session_id))
            }
            _ => Ok(()),
        }
    }
}

/// One async mutex per user; the outer map lock is held only to look the
/// user's book up. Audited entries go to `audit` while the book is locked.
#[derive(Debug, Default, Clone)]
pub struct InMemoryLedgerRepository {
    books: Arc<Mutex<HashMap<UserId, Arc<AsyncMutex<UserBook>>>>>,
    audit: InMemoryAuditRepository,
}

impl InMemoryLedgerRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Shares the audit log that the rest of the process reads.
    #[must_use]
    pub fn with_audit(audit: InMemoryAuditRepository) -> Self {
        Self {
            books: Arc::default(),
            audit,
        }
    }

    /// Test and bootstrap helper: sets a starting balance without a
    /// transaction row.
    pub async fn seed_balance(&self, user_id: UserId, balance: Money) -> Result<(), LedgerStoreError> {
        let book = self.book_or_create(user_id)?;
        book.lock().await.balance = balance;
        Ok(())
    }

    pub async fn entries_snapshot(&self) -> Result<Vec<Transaction>, LedgerStoreError> {
        let books: Vec<_> = self
            .books
            .lock()
            .map_err(|_| LedgerStoreError::LockPoisoned)?
            .values()
            .cloned()
            .collect();
        let mut out = Vec::new();
        for book in books {
            out.extend(book.lock().await.transactions.iter().cloned());
        }
        Ok(out)
    }

    fn book(&self, user_id: UserId) -> Result<Arc<AsyncMutex<UserBook>>, LedgerStoreError> {
        self.books
            .lock()
            .map_err(|_| LedgerStoreError::LockPoisoned)?
            .get(&user_id)
            .cloned()
            .ok_or(LedgerStoreError::UnknownUser(user_id))
    }

    fn book_or_create(&self, user_id: UserId) -> Result<Arc<AsyncMutex<UserBook>>, LedgerStoreError> {
        Ok(self
            .books
            .lock()
            .map_err(|_| LedgerStoreError::LockPoisoned)?
            .entry(user_id)
            .or_default()
            .clone())
    }

    async fn settle_pending(
        &self,
        user_id: UserId,
        session_id: PaymentSessionId,
        next: TransactionStatus,
        now: DateTime<Utc>,
    ) -> Result<PendingOutcome, LedgerStoreError> {
        let book = self.book(user_id)?;
        let mut guard = book.lock().await;
        let idx = guard.linked(session_id).ok_or_else(|| LedgerStoreError::NotFound {
            entity: "transaction for session",
            id: session_id.0.to_string(),
        })?;
        let current = guard.transactions[idx].clone();
        if current.status != TransactionStatus::Pending {
            return Ok(PendingOutcome::AlreadySettled(current));
        }
        if next == TransactionStatus::Completed {
            guard.balance = guard.apply(current.direction, current.amount)?;
        }
        let row = &mut guard.transactions[idx];
        row.status = next;
        row.updated_at = now;
        Ok(PendingOutcome::Applied(row.clone()))
    }
}

#[async_trait]
impl LedgerRepository for InMemoryLedgerRepository {
    async fn open_user(&self, user_id: UserId) -> Result<(), LedgerStoreError> {
        self.book_or_create(user_id).map(|_| ())
    }

    async fn balance(&self, user_id: UserId) -> Result<Money, LedgerStoreError> {
        Ok(self.book(user_id)?.lock().await.balance)
    }

    async fn post_entry(
        &self,
        entry: &LedgerEntryInsert,
        now: DateTime<Utc>,
    ) -> Result<Transaction, LedgerStoreError> {
        let book = self.book(entry.user_id)?;
        let mut guard = book.lock().await;
        guard.ensure_unlinked(entry)?;
        let next_balance = guard.apply(entry.direction, entry.amount)?;
        let tx = entry.to_transaction(TransactionStatus::Completed, now);
        guard.balance = next_balance;
        guard.transactions.push(tx.clone());
        Ok(tx)
    }

    async fn post_audited_entry(
        &self,
        entry: &LedgerEntryInsert,
        audit: &AuditEntryInsert,
        now: DateTime<Utc>,
    ) -> Result<(Transaction, AuditEntry), LedgerStoreError> {
        let book = self.book(entry.user_id)?;
        let mut guard = book.lock().await;
        guard.ensure_unlinked(entry)?;
        let next_balance = guard.apply(entry.direction, entry.amount)?;
        let recorded = self.audit.record(audit, now).await?;
        let tx = entry.to_transaction(TransactionStatus::Completed, now);
        guard.balance = next_balance;
        guard.transactions.push(tx.clone());
        Ok((tx, recorded))
    }

    async fn reverse_session_debit(
        &self,
        user_id: UserId,
        session_id: PaymentSessionId,
        description: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Transaction>, LedgerStoreError> {
        let book = self.book(user_id)?;
        let mut guard = book.lock().await;
        let Some(debit) = guard
            .linked(session_id)
            .map(|idx| guard.transactions[idx].clone())
            .filter(is_completed_debit)
        else {
            return Ok(None);
        };
        if guard.reversed(session_id) {
            return Ok(None);
        }
        let next_balance = guard.apply(LedgerDirection::Credit, debit.amount)?;
        let tx = reversal_of(&debit, description, now);
        guard.balance = next_balance;
        guard.transactions.push(tx.clone());
        Ok(Some(tx))
    }

    async fn insert_pending(
        &self,
        entry: &LedgerEntryInsert,
        now: DateTime<Utc>,
    ) -> Result<Transaction, LedgerStoreError> {
        let book = self.book(entry.user_id)?;
        let mut guard = book.lock().await;
        guard.ensure_unlinked(entry)?;
        let tx = entry.to_transaction(TransactionStatus::Pending, now);
        guard.transactions.push(tx.clone());
        Ok(tx)
    }

    async fn complete_pending(
        &self,
        user_id: UserId,
        session_id: PaymentSessionId,
        now: DateTime<Utc>,
    ) -> Result<PendingOutcome, LedgerStoreError> {
        self.settle_pending(user_id, session_id, TransactionStatus::Completed, now)
            .await
    }

    async fn fail_pending(
        &self,
        user_id: UserId,
        session_id: PaymentSessionId,
        now: DateTime<Utc>,
    ) -> Result<PendingOutcome, LedgerStoreError> {
        self.settle_pending(user_id, session_id, TransactionStatus::Failed, now)
            .await
    }

    async fn find_by_session(
        &self,
        user_id: UserId,
        session_id: PaymentSessionId,
    ) -> Result<Option<Transaction>, LedgerStoreError> {
        let book = self.book(user_id)?;
        let guard = book.lock().await;
        Ok(guard.linked(session_id).map(|idx| guard.transactions[idx].clone()))
    }

    async fn list_transactions(
        &self,
        user_id: UserId,
    ) -> Result<Vec<Transaction>, LedgerStoreError> {
        let book = self.book(user_id)?;
        let guard = book.lock().await;
        Ok(guard.transactions.iter().rev().cloned().collect())
    }
}

pub(crate) fn is_completed_debit(tx: &Transaction) -> bool {
    tx.status == TransactionStatus::Completed && tx.direction == LedgerDirection::Debit
}

/// Completed refund credit returning `debit` to the balance.
pub(crate) fn reversal_of(debit: &Transaction, description: &str, now: DateTime<Utc>) -> Transaction {
    Transaction {
        id: TransactionId::new(),
        user_id: debit.user_id,
        tx_type: TransactionType::Refund,
        amount: debit.amount,
        direction: LedgerDirection::Credit,
        status: TransactionStatus::Completed,
        linked_payment_session_id: None,
        linked_account_id: debit.linked_account_id,
        reverses_payment_session_id: debit.linked_payment_session_id,
        description: Some(description.to_string()),
        created_at: now,
        updated_at: now,
    }
}
