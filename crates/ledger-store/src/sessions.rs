use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rental_domain::{PaymentSession, PaymentSessionId, PaymentSessionStatus, UserId};

use crate::LedgerStoreError;

#[async_trait]
pub trait PaymentSessionRepository: Send + Sync {
    async fn insert_session(&self, session: &PaymentSession) -> Result<(), LedgerStoreError>;

    async fn get_session(
        &self,
        id: PaymentSessionId,
    ) -> Result<Option<PaymentSession>, LedgerStoreError>;

    /// Compare-and-set: writes `next` only while the stored status is
    /// non-terminal and differs from `next`. Returns the updated session when
    /// this call performed the write, `None` otherwise.
    async fn advance_status(
        &self,
        id: PaymentSessionId,
        next: PaymentSessionStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<PaymentSession>, LedgerStoreError>;

    /// Stamps `settled_at` on a terminal session once. Returns false when it
    /// was already settled.
    async fn mark_settled(
        &self,
        id: PaymentSessionId,
        now: DateTime<Utc>,
    ) -> Result<bool, LedgerStoreError>;

    async fn list_open_sessions(
        &self,
        limit: usize,
    ) -> Result<Vec<PaymentSession>, LedgerStoreError>;

    async fn list_unsettled_terminal_sessions(
        &self,
        limit: usize,
    ) -> Result<Vec<PaymentSession>, LedgerStoreError>;

    async fn list_sessions_for_user(
        &self,
        user_id: UserId,
    ) -> Result<Vec<PaymentSession>, LedgerStoreError>;
}

#[derive(Debug, Default, Clone)]
pub struct InMemoryPaymentSessionRepository {
    sessions: Arc<Mutex<HashMap<PaymentSessionId, PaymentSession>>>,
}

impl InMemoryPaymentSessionRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn filtered<F>(&self, limit: usize, keep: F) -> Result<Vec<PaymentSession>, LedgerStoreError>
    where
        F: Fn(&PaymentSession) -> bool,
    {
        let guard = self
            .sessions
            .lock()
            .map_err(|_| LedgerStoreError::LockPoisoned)?;
        let mut out: Vec<_> = guard.values().filter(|s| keep(s)).cloned().collect();
        out.sort_by_key(|s| s.created_at);
        out.truncate(limit);
        Ok(out)
    }
}

#[async_trait]
impl PaymentSessionRepository for InMemoryPaymentSessionRepository {
    async fn insert_session(&self, session: &PaymentSession) -> Result<(), LedgerStoreError> {
        self.sessions
            .lock()
            .map_err(|_| LedgerStoreError::LockPoisoned)?
            .insert(session.id, session.clone());
        Ok(())
    }

    async fn get_session(
        &self,
        id: PaymentSessionId,
    ) -> Result<Option<PaymentSession>, LedgerStoreError> {
        Ok(self
            .sessions
            .lock()
            .map_err(|_| LedgerStoreError::LockPoisoned)?
            .get(&id)
            .cloned())
    }

    async fn advance_status(
        &self,
        id: PaymentSessionId,
        next: PaymentSessionStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<PaymentSession>, LedgerStoreError> {
        let mut guard = self
            .sessions
            .lock()
            .map_err(|_| LedgerStoreError::LockPoisoned)?;
        let session = guard.get_mut(&id).ok_or_else(|| LedgerStoreError::NotFound {
            entity: "payment session",
            id: id.0.to_string(),
        })?;
        if session.status.is_terminal() || session.status == next {
            return Ok(None);
        }
        session.status = next;
        session.updated_at = now;
        Ok(Some(session.clone()))
    }

    async fn mark_settled(
        &self,
        id: PaymentSessionId,
        now: DateTime<Utc>,
    ) -> Result<bool, LedgerStoreError> {
        let mut guard = self
            .sessions
            .lock()
            .map_err(|_| LedgerStoreError::LockPoisoned)?;
        let session = guard.get_mut(&id).ok_or_else(|| LedgerStoreError::NotFound {
            entity: "payment session",
            id: id.0.to_string(),
        })?;
        if !session.status.is_terminal() || session.settled_at.is_some() {
            return Ok(false);
        }
        session.settled_at = Some(now);
        Ok(true)
    }

    async fn list_open_sessions(
        &self,
        limit: usize,
    ) -> Result<Vec<PaymentSession>, LedgerStoreError> {
        self.filtered(limit, |s| !s.status.is_terminal())
    }

    async fn list_unsettled_terminal_sessions(
        &self,
        limit: usize,
    ) -> Result<Vec<PaymentSession>, LedgerStoreError> {
        self.filtered(limit, |s| s.status.is_terminal() && s.settled_at.is_none())
    }

    async fn list_sessions_for_user(
        &self,
        user_id: UserId,
    ) -> Result<Vec<PaymentSession>, LedgerStoreError> {
        let mut out = self.filtered(usize::MAX, |s| s.owner_user_id == user_id)?;
        out.reverse();
        Ok(out)
    }
}
