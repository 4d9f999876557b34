use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rental_domain::{AccountId, AuditAction, AuditEntry, AuditEntryId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{Executor, PgPool, Postgres, Row};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum AuditStoreError {
    #[error("store lock poisoned")]
    LockPoisoned,
    #[error("database error: {0}")]
    Database(String),
    #[error("invalid value in column {field}: {value}")]
    InvalidColumn { field: &'static str, value: String },
}

/// Fields the caller supplies; id and timestamp are assigned on write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntryInsert {
    pub account_id: Option<AccountId>,
    pub subject_user_id: Option<UserId>,
    pub action: AuditAction,
    pub actor_user_id: Option<UserId>,
    pub details: Value,
    /// Writes sharing a key are recorded once; later writes return the
    /// first entry.
    #[serde(default)]
    pub dedup_key: Option<Uuid>,
}

impl AuditEntryInsert {
    #[must_use]
    pub fn for_account(
        account_id: AccountId,
        action: AuditAction,
        actor_user_id: Option<UserId>,
        details: Value,
    ) -> Self {
        Self {
            account_id: Some(account_id),
            subject_user_id: None,
            action,
            actor_user_id,
            details,
            dedup_key: None,
        }
    }

    #[must_use]
    pub fn for_user(
        user_id: UserId,
        action: AuditAction,
        actor_user_id: Option<UserId>,
        details: Value,
    ) -> Self {
        Self {
            account_id: None,
            subject_user_id: Some(user_id),
            action,
            actor_user_id,
            details,
            dedup_key: None,
        }
    }

    #[must_use]
    pub fn once_per(mut self, key: Uuid) -> Self {
        self.dedup_key = Some(key);
        self
    }

    #[must_use]
    pub fn with_subject(mut self, user_id: UserId) -> Self {
        self.subject_user_id = Some(user_id);
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PageRequest {
    pub limit: usize,
    pub offset: usize,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            limit: 100,
            offset: 0,
        }
    }
}

/// Append-only audit trail. There is no update or delete.
#[async_trait]
pub trait AuditRepository: Send + Sync {
    async fn record(
        &self,
        entry: &AuditEntryInsert,
        now: DateTime<Utc>,
    ) -> Result<AuditEntry, AuditStoreError>;

    /// Oldest first.
    async fn list_for_account(
        &self,
        account_id: AccountId,
        page: PageRequest,
    ) -> Result<Vec<AuditEntry>, AuditStoreError>;

    /// Entries whose subject is the user (refunds and other balance-level actions).
    async fn list_for_user(
        &self,
        user_id: UserId,
        page: PageRequest,
    ) -> Result<Vec<AuditEntry>, AuditStoreError>;
}

/// Assigns the id and timestamp an insert is stored with.
#[must_use]
pub fn materialize(entry: &AuditEntryInsert, now: DateTime<Utc>) -> AuditEntry {
    AuditEntry {
        id: AuditEntryId::new(),
        account_id: entry.account_id,
        subject_user_id: entry.subject_user_id,
        action: entry.action,
        actor_user_id: entry.actor_user_id,
        details: entry.details.clone(),
        created_at: now,
    }
}

#[derive(Debug, Default, Clone)]
pub struct InMemoryAuditRepository {
    entries: Arc<Mutex<Vec<(Option<Uuid>, AuditEntry)>>>,
    fail_writes: Arc<Mutex<bool>>,
}

impl InMemoryAuditRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Result<Vec<AuditEntry>, AuditStoreError> {
        Ok(self
            .entries
            .lock()
            .map_err(|_| AuditStoreError::LockPoisoned)?
            .iter()
            .map(|(_, entry)| entry.clone())
            .collect())
    }

    /// Makes subsequent writes fail as if storage were unavailable.
    pub fn set_unavailable(&self, unavailable: bool) -> Result<(), AuditStoreError> {
        *self
            .fail_writes
            .lock()
            .map_err(|_| AuditStoreError::LockPoisoned)? = unavailable;
        Ok(())
    }

    fn page<F>(&self, page: PageRequest, keep: F) -> Result<Vec<AuditEntry>, AuditStoreError>
    where
        F: Fn(&AuditEntry) -> bool,
    {
        Ok(self
            .entries
            .lock()
            .map_err(|_| AuditStoreError::LockPoisoned)?
            .iter()
            .map(|(_, entry)| entry)
            .filter(|e| keep(e))
            .skip(page.offset)
            .take(page.limit)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl AuditRepository for InMemoryAuditRepository {
    async fn record(
        &self,
        entry: &AuditEntryInsert,
        now: DateTime<Utc>,
    ) -> Result<AuditEntry, AuditStoreError> {
        if *self
            .fail_writes
            .lock()
            .map_err(|_| AuditStoreError::LockPoisoned)?
        {
            return Err(AuditStoreError::Database("audit storage unavailable".to_string()));
        }
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| AuditStoreError::LockPoisoned)?;
        if let Some(key) = entry.dedup_key {
            if let Some((_, first)) = entries.iter().find(|(k, _)| *k == Some(key)) {
                return Ok(first.clone());
            }
        }
        let stored = materialize(entry, now);
        entries.push((entry.dedup_key, stored.clone()));
        Ok(stored)
    }

    async fn list_for_account(
        &self,
        account_id: AccountId,
        page: PageRequest,
    ) -> Result<Vec<AuditEntry>, AuditStoreError> {
        self.page(page, |e| e.account_id == Some(account_id))
    }

    async fn list_for_user(
        &self,
        user_id: UserId,
        page: PageRequest,
    ) -> Result<Vec<AuditEntry>, AuditStoreError> {
        self.page(page, |e| e.subject_user_id == Some(user_id))
    }
}

#[derive(Debug, Clone)]
pub struct PostgresAuditRepository {
    pool: PgPool,
}

impl PostgresAuditRepository {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn list_where(
        &self,
        column: &'static str,
        id: Uuid,
        page: PageRequest,
    ) -> Result<Vec<AuditEntry>, AuditStoreError> {
        let sql = format!(
            "SELECT * FROM audit_entries WHERE {column} = $1 \
             ORDER BY created_at, audit_entry_id LIMIT $2 OFFSET $3"
        );
        let rows = sqlx::query(&sql)
            .bind(id)
            .bind(i64::try_from(page.limit).unwrap_or(i64::MAX))
            .bind(i64::try_from(page.offset).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AuditStoreError::Database(e.to_string()))?;
        rows.iter().map(row_to_audit_entry).collect()
    }
}

/// Inserts a materialized entry through any executor, so callers can append
/// it inside their own transaction. `false` when `dedup_key` was taken.
pub async fn insert_entry<'e, E>(
    executor: E,
    entry: &AuditEntry,
    dedup_key: Option<Uuid>,
) -> Result<bool, AuditStoreError>
where
    E: Executor<'e, Database = Postgres>,
{
    let result = sqlx::query(
        r#"
        INSERT INTO audit_entries (
            audit_entry_id, account_id, subject_user_id, action, actor_user_id, details,
            created_at, dedup_key
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ON CONFLICT (dedup_key) DO NOTHING
        "#,
    )
    .bind(entry.id.0)
    .bind(entry.account_id.map(|v| v.0))
    .bind(entry.subject_user_id.map(|v| v.0))
    .bind(entry.action.as_str())
    .bind(entry.actor_user_id.map(|v| v.0))
    .bind(&entry.details)
    .bind(entry.created_at)
    .bind(dedup_key)
    .execute(executor)
    .await
    .map_err(|e| AuditStoreError::Database(e.to_string()))?;
    Ok(result.rows_affected() == 1)
}

fn row_to_audit_entry(row: &sqlx::postgres::PgRow) -> Result<AuditEntry, AuditStoreError> {
    let action: String = row
        .try_get("action")
        .map_err(|e| AuditStoreError::Database(e.to_string()))?;
    Ok(AuditEntry {
        id: AuditEntryId(
            row.try_get::<Uuid, _>("audit_entry_id")
                .map_err(|e| AuditStoreError::Database(e.to_string()))?,
        ),
        account_id: row
            .try_get::<Option<Uuid>, _>("account_id")
            .map_err(|e| AuditStoreError::Database(e.to_string()))?
            .map(AccountId),
        subject_user_id: row
            .try_get::<Option<Uuid>, _>("subject_user_id")
            .map_err(|e| AuditStoreError::Database(e.to_string()))?
            .map(UserId),
        action: AuditAction::parse(&action).ok_or(AuditStoreError::InvalidColumn {
            field: "action",
            value: action.clone(),
        })?,
        actor_user_id: row
            .try_get::<Option<Uuid>, _>("actor_user_id")
            .map_err(|e| AuditStoreError::Database(e.to_string()))?
            .map(UserId),
        details: row
            .try_get("details")
            .map_err(|e| AuditStoreError::Database(e.to_string()))?,
        created_at: row
            .try_get("created_at")
            .map_err(|e| AuditStoreError::Database(e.to_string()))?,
    })
}

#[async_trait]
impl AuditRepository for PostgresAuditRepository {
    async fn record(
        &self,
        entry: &AuditEntryInsert,
        now: DateTime<Utc>,
    ) -> Result<AuditEntry, AuditStoreError> {
        let stored = materialize(entry, now);
        if insert_entry(&self.pool, &stored, entry.dedup_key).await? {
            return Ok(stored);
        }
        let Some(key) = entry.dedup_key else {
            return Err(AuditStoreError::Database(
                "audit insert affected no rows".to_string(),
            ));
        };
        let row = sqlx::query("SELECT * FROM audit_entries WHERE dedup_key = $1")
            .bind(key)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| AuditStoreError::Database(e.to_string()))?;
        row_to_audit_entry(&row)
    }

    async fn list_for_account(
        &self,
        account_id: AccountId,
        page: PageRequest,
    ) -> Result<Vec<AuditEntry>, AuditStoreError> {
        self.list_where("account_id", account_id.0, page).await
    }

    async fn list_for_user(
        &self,
        user_id: UserId,
        page: PageRequest,
    ) -> Result<Vec<AuditEntry>, AuditStoreError> {
        self.list_where("subject_user_id", user_id.0, page).await
    }
}
