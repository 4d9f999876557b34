use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rental_domain::{Account, AccountId, PaymentSessionId, UserId};

use crate::LedgerStoreError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivationInsert {
    Created(Account),
    /// An account already exists for the activation key.
    Existing(Account),
}

impl ActivationInsert {
    #[must_use]
    pub fn into_account(self) -> Account {
        match self {
            Self::Created(account) | Self::Existing(account) => account,
        }
    }
}

#[async_trait]
pub trait AccountRepository: Send + Sync {
    /// Inserts unless an account with the same activation key exists.
    async fn insert_activated(&self, account: &Account)
    -> Result<ActivationInsert, LedgerStoreError>;

    async fn get_account(&self, id: AccountId) -> Result<Option<Account>, LedgerStoreError>;

    async fn find_by_activation_key(
        &self,
        key: PaymentSessionId,
    ) -> Result<Option<Account>, LedgerStoreError>;

    /// Optimistic write: succeeds only if the stored version equals
    /// `account.version`; the stored copy gets `version + 1`.
    async fn update_account(&self, account: &Account) -> Result<Account, LedgerStoreError>;

    async fn list_accounts_for_user(
        &self,
        user_id: UserId,
    ) -> Result<Vec<Account>, LedgerStoreError>;

    /// `active` accounts whose `expire_at` is before `now`.
    async fn list_lapsed_active(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Account>, LedgerStoreError>;
}

#[derive(Debug, Default, Clone)]
pub struct InMemoryAccountRepository {
    accounts: Arc<Mutex<HashMap<AccountId, Account>>>,
}

impl InMemoryAccountRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Result<Vec<Account>, LedgerStoreError> {
        Ok(self
            .accounts
            .lock()
            .map_err(|_| LedgerStoreError::LockPoisoned)?
            .values()
            .cloned()
            .collect())
    }
}

#[async_trait]
impl AccountRepository for InMemoryAccountRepository {
    async fn insert_activated(
        &self,
        account: &Account,
    ) -> Result<ActivationInsert, LedgerStoreError> {
        let mut guard = self
            .accounts
            .lock()
            .map_err(|_| LedgerStoreError::LockPoisoned)?;
        if let Some(key) = account.activation_key {
            if let Some(existing) = guard.values().find(|a| a.activation_key == Some(key)) {
                return Ok(ActivationInsert::Existing(existing.clone()));
            }
        }
        guard.insert(account.id, account.clone());
        Ok(ActivationInsert::Created(account.clone()))
    }

    async fn get_account(&self, id: AccountId) -> Result<Option<Account>, LedgerStoreError> {
        Ok(self
            .accounts
            .lock()
            .map_err(|_| LedgerStoreError::LockPoisoned)?
            .get(&id)
            .cloned())
    }

    async fn find_by_activation_key(
        &self,
        key: PaymentSessionId,
    ) -> Result<Option<Account>, LedgerStoreError> {
        Ok(self
            .accounts
            .lock()
            .map_err(|_| LedgerStoreError::LockPoisoned)?
            .values()
            .find(|a| a.activation_key == Some(key))
            .cloned())
    }

    async fn update_account(&self, account: &Account) -> Result<Account, LedgerStoreError> {
        let mut guard = self
            .accounts
            .lock()
            .map_err(|_| LedgerStoreError::LockPoisoned)?;
        let stored = guard
            .get_mut(&account.id)
            .ok_or_else(|| LedgerStoreError::NotFound {
                entity: "account",
                id: account.id.0.to_string(),
            })?;
        if stored.version != account.version {
            return Err(LedgerStoreError::VersionConflict {
                entity: "account",
                id: account.id.0.to_string(),
            });
        }
        let mut next = account.clone();
        next.version = account.version + 1;
        *stored = next.clone();
        Ok(next)
    }

    async fn list_accounts_for_user(
        &self,
        user_id: UserId,
    ) -> Result<Vec<Account>, LedgerStoreError> {
        let mut out: Vec<_> = self
            .accounts
            .lock()
            .map_err(|_| LedgerStoreError::LockPoisoned)?
            .values()
            .filter(|a| a.is_owned_by(user_id))
            .cloned()
            .collect();
        out.sort_by_key(|a| std::cmp::Reverse(a.created_at));
        Ok(out)
    }

    async fn list_lapsed_active(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Account>, LedgerStoreError> {
        let mut out: Vec<_> = self
            .accounts
            .lock()
            .map_err(|_| LedgerStoreError::LockPoisoned)?
            .values()
            .filter(|a| a.is_lapsed_at(now))
            .cloned()
            .collect();
        out.sort_by_key(|a| a.expire_at);
        out.truncate(limit);
        Ok(out)
    }
}
