use async_trait::async_trait;
use audit_store::{AuditEntryInsert, insert_entry, materialize};
use chrono::{DateTime, Utc};
use rental_domain::{
    Account, AccountId, AccountStatus, AuditEntry, CryptoPaymentDetails, LedgerDirection, Money, MoneyError,
    PaymentMethod, PaymentPurpose, PaymentSession, PaymentSessionId, PaymentSessionStatus,
    Transaction, TransactionId, TransactionStatus, TransactionType, UserId,
};
use sqlx::{PgPool, Postgres, Row};
use tracing::debug;
use uuid::Uuid;

use crate::ledger::{is_completed_debit, reversal_of};
use crate::{
    AccountRepository, ActivationInsert, LedgerEntryInsert, LedgerRepository, LedgerStoreError,
    PaymentSessionRepository, PendingOutcome,
};

const TERMINAL_SQL: &str = "('confirmed', 'finished', 'failed', 'expired')";

/// Postgres-backed ledger, payment sessions and accounts. Per-user
/// serialization comes from `SELECT ... FOR UPDATE` on the `users` row.
#[derive(Debug, Clone)]
pub struct PostgresLedgerStore {
    pool: PgPool,
}

impl PostgresLedgerStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn lock_balance(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        user_id: UserId,
    ) -> Result<Money, LedgerStoreError> {
        let row = sqlx::query("SELECT balance_cents FROM users WHERE user_id = $1 FOR UPDATE")
            .bind(user_id.0)
            .fetch_optional(&mut **tx)
            .await
            .map_err(db_err)?
            .ok_or(LedgerStoreError::UnknownUser(user_id))?;
        from_db_cents(row.try_get("balance_cents").map_err(db_err)?)
    }

    async fn write_balance(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        user_id: UserId,
        balance: Money,
    ) -> Result<(), LedgerStoreError> {
        sqlx::query("UPDATE users SET balance_cents = $2 WHERE user_id = $1")
            .bind(user_id.0)
            .bind(to_db_cents(balance)?)
            .execute(&mut **tx)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn insert_transaction(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        row: &Transaction,
    ) -> Result<(), LedgerStoreError> {
        sqlx::query(
            r#"
            INSERT INTO ledger_transactions (
                transaction_id, user_id, tx_type, amount_cents, direction, status,
                linked_payment_session_id, linked_account_id, reverses_payment_session_id,
                description, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(row.id.0)
        .bind(row.user_id.0)
        .bind(row.tx_type.as_str())
        .bind(to_db_cents(row.amount)?)
        .bind(row.direction.as_str())
        .bind(row.status.as_str())
        .bind(row.linked_payment_session_id.map(|id| id.0))
        .bind(row.linked_account_id.map(|id| id.0))
        .bind(row.reverses_payment_session_id.map(|id| id.0))
        .bind(row.description.as_deref())
        .bind(row.created_at)
        .bind(row.updated_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| match (&e, row.linked_payment_session_id) {
            (sqlx::Error::Database(inner), Some(session_id)) if inner.is_unique_violation() => {
                LedgerStoreError::DuplicateSessionLink(session_id)
            }
            _ => db_err(e),
        })?;
        Ok(())
    }

    async fn settle_pending(
        &self,
        user_id: UserId,
        session_id: PaymentSessionId,
        next: TransactionStatus,
        now: DateTime<Utc>,
    ) -> Result<PendingOutcome, LedgerStoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let balance = Self::lock_balance(&mut tx, user_id).await?;
        let row = sqlx::query(
            "SELECT * FROM ledger_transactions WHERE user_id = $1 AND linked_payment_session_id = $2",
        )
        .bind(user_id.0)
        .bind(session_id.0)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?
        .ok_or_else(|| LedgerStoreError::NotFound {
            entity: "transaction for session",
            id: session_id.0.to_string(),
        })?;
        let mut current = row_to_transaction(&row)?;
        if current.status != TransactionStatus::Pending {
            tx.rollback().await.map_err(db_err)?;
            return Ok(PendingOutcome::AlreadySettled(current));
        }
        if next == TransactionStatus::Completed {
            let next_balance = apply_direction(balance, current.direction, current.amount)?;
            Self::write_balance(&mut tx, user_id, next_balance).await?;
        }
        sqlx::query(
            "UPDATE ledger_transactions SET status = $2, updated_at = $3 \
             WHERE transaction_id = $1 AND status = 'pending'",
        )
        .bind(current.id.0)
        .bind(next.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        current.status = next;
        current.updated_at = now;
        Ok(PendingOutcome::Applied(current))
    }
}

#[async_trait]
impl LedgerRepository for PostgresLedgerStore {
    async fn open_user(&self, user_id: UserId) -> Result<(), LedgerStoreError> {
        sqlx::query("INSERT INTO users (user_id) VALUES ($1) ON CONFLICT (user_id) DO NOTHING")
            .bind(user_id.0)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn balance(&self, user_id: UserId) -> Result<Money, LedgerStoreError> {
        let row = sqlx::query("SELECT balance_cents FROM users WHERE user_id = $1")
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or(LedgerStoreError::UnknownUser(user_id))?;
        from_db_cents(row.try_get("balance_cents").map_err(db_err)?)
    }

    async fn post_entry(
        &self,
        entry: &LedgerEntryInsert,
        now: DateTime<Utc>,
    ) -> Result<Transaction, LedgerStoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let balance = Self::lock_balance(&mut tx, entry.user_id).await?;
        let next_balance = apply_direction(balance, entry.direction, entry.amount)?;
        let row = Transaction {
            id: TransactionId::new(),
            user_id: entry.user_id,
            tx_type: entry.tx_type,
            amount: entry.amount,
            direction: entry.direction,
            status: TransactionStatus::Completed,
            linked_payment_session_id: entry.linked_payment_session_id,
            linked_account_id: entry.linked_account_id,
            reverses_payment_session_id: None,
            description: entry.description.clone(),
            created_at: now,
            updated_at: now,
        };
        Self::insert_transaction(&mut tx, &row).await?;
        Self::write_balance(&mut tx, entry.user_id, next_balance).await?;
        tx.commit().await.map_err(db_err)?;
        debug!(user_id = %entry.user_id.0, tx_id = %row.id.0, "ledger entry committed");
        Ok(row)
    }

    async fn post_audited_entry(
        &self,
        entry: &LedgerEntryInsert,
        audit: &AuditEntryInsert,
        now: DateTime<Utc>,
    ) -> Result<(Transaction, AuditEntry), LedgerStoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let balance = Self::lock_balance(&mut tx, entry.user_id).await?;
        let next_balance = apply_direction(balance, entry.direction, entry.amount)?;
        let row = Transaction {
            id: TransactionId::new(),
            user_id: entry.user_id,
            tx_type: entry.tx_type,
            amount: entry.amount,
            direction: entry.direction,
            status: TransactionStatus::Completed,
            linked_payment_session_id: entry.linked_payment_session_id,
            linked_account_id: entry.linked_account_id,
            reverses_payment_session_id: None,
            description: entry.description.clone(),
            created_at: now,
            updated_at: now,
        };
        let recorded = materialize(audit, now);
        insert_entry(&mut *tx, &recorded, audit.dedup_key).await?;
        Self::insert_transaction(&mut tx, &row).await?;
        Self::write_balance(&mut tx, entry.user_id, next_balance).await?;
        tx.commit().await.map_err(db_err)?;
        debug!(user_id = %entry.user_id.0, tx_id = %row.id.0, "audited ledger entry committed");
        Ok((row, recorded))
    }

    async fn reverse_session_debit(
        &self,
        user_id: UserId,
        session_id: PaymentSessionId,
        description: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Transaction>, LedgerStoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let balance = Self::lock_balance(&mut tx, user_id).await?;
        let debit = sqlx::query(
            "SELECT * FROM ledger_transactions WHERE user_id = $1 AND linked_payment_session_id = $2",
        )
        .bind(user_id.0)
        .bind(session_id.0)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?
        .as_ref()
        .map(row_to_transaction)
        .transpose()?
        .filter(is_completed_debit);
        let Some(debit) = debit else {
            tx.rollback().await.map_err(db_err)?;
            return Ok(None);
        };
        let reversal = reversal_of(&debit, description, now);
        let inserted = sqlx::query(
            r#"
            INSERT INTO ledger_transactions (
                transaction_id, user_id, tx_type, amount_cents, direction, status,
                linked_payment_session_id, linked_account_id, reverses_payment_session_id,
                description, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (reverses_payment_session_id) DO NOTHING
            "#,
        )
        .bind(reversal.id.0)
        .bind(reversal.user_id.0)
        .bind(reversal.tx_type.as_str())
        .bind(to_db_cents(reversal.amount)?)
        .bind(reversal.direction.as_str())
        .bind(reversal.status.as_str())
        .bind(None::<Uuid>)
        .bind(reversal.linked_account_id.map(|id| id.0))
        .bind(session_id.0)
        .bind(reversal.description.as_deref())
        .bind(reversal.created_at)
        .bind(reversal.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        if inserted.rows_affected() == 0 {
            tx.rollback().await.map_err(db_err)?;
            return Ok(None);
        }
        let next_balance = apply_direction(balance, LedgerDirection::Credit, reversal.amount)?;
        Self::write_balance(&mut tx, user_id, next_balance).await?;
        tx.commit().await.map_err(db_err)?;
        debug!(user_id = %user_id.0, session_id = %session_id.0, "session debit reversed");
        Ok(Some(reversal))
    }

    async fn insert_pending(
        &self,
        entry: &LedgerEntryInsert,
        now: DateTime<Utc>,
    ) -> Result<Transaction, LedgerStoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        Self::lock_balance(&mut tx, entry.user_id).await?;
        let row = Transaction {
            id: TransactionId::new(),
            user_id: entry.user_id,
            tx_type: entry.tx_type,
            amount: entry.amount,
            direction: entry.direction,
            status: TransactionStatus::Pending,
            linked_payment_session_id: entry.linked_payment_session_id,
            linked_account_id: entry.linked_account_id,
            reverses_payment_session_id: None,
            description: entry.description.clone(),
            created_at: now,
            updated_at: now,
        };
        Self::insert_transaction(&mut tx, &row).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(row)
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
        sqlx::query(
            "SELECT * FROM ledger_transactions WHERE user_id = $1 AND linked_payment_session_id = $2",
        )
        .bind(user_id.0)
        .bind(session_id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .as_ref()
        .map(row_to_transaction)
        .transpose()
    }

    async fn list_transactions(
        &self,
        user_id: UserId,
    ) -> Result<Vec<Transaction>, LedgerStoreError> {
        let rows = sqlx::query(
            "SELECT * FROM ledger_transactions WHERE user_id = $1 ORDER BY created_at DESC, transaction_id DESC",
        )
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_transaction).collect()
    }
}

#[async_trait]
impl PaymentSessionRepository for PostgresLedgerStore {
    async fn insert_session(&self, session: &PaymentSession) -> Result<(), LedgerStoreError> {
        let crypto = session.crypto.as_ref();
        sqlx::query(
            r#"
            INSERT INTO payment_sessions (
                payment_session_id, owner_user_id, kind, purpose, amount_cents,
                external_reference, pay_address, pay_amount, pay_currency,
                status, created_at, expires_at, updated_at, settled_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(session.id.0)
        .bind(session.owner_user_id.0)
        .bind(session.kind.as_str())
        .bind(session.purpose.as_str())
        .bind(to_db_cents(session.amount)?)
        .bind(crypto.map(|c| c.external_reference.as_str()))
        .bind(crypto.map(|c| c.pay_address.as_str()))
        .bind(crypto.map(|c| c.pay_amount.as_str()))
        .bind(crypto.map(|c| c.pay_currency.as_str()))
        .bind(session.status.as_str())
        .bind(session.created_at)
        .bind(session.expires_at)
        .bind(session.updated_at)
        .bind(session.settled_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_session(
        &self,
        id: PaymentSessionId,
    ) -> Result<Option<PaymentSession>, LedgerStoreError> {
        sqlx::query("SELECT * FROM payment_sessions WHERE payment_session_id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .as_ref()
            .map(row_to_session)
            .transpose()
    }

    async fn advance_status(
        &self,
        id: PaymentSessionId,
        next: PaymentSessionStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<PaymentSession>, LedgerStoreError> {
        let sql = format!(
            "UPDATE payment_sessions SET status = $2, updated_at = $3 \
             WHERE payment_session_id = $1 AND status <> $2 AND status NOT IN {TERMINAL_SQL} \
             RETURNING *"
        );
        sqlx::query(&sql)
            .bind(id.0)
            .bind(next.as_str())
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .as_ref()
            .map(row_to_session)
            .transpose()
    }

    async fn mark_settled(
        &self,
        id: PaymentSessionId,
        now: DateTime<Utc>,
    ) -> Result<bool, LedgerStoreError> {
        let sql = format!(
            "UPDATE payment_sessions SET settled_at = $2 \
             WHERE payment_session_id = $1 AND settled_at IS NULL AND status IN {TERMINAL_SQL}"
        );
        let result = sqlx::query(&sql)
            .bind(id.0)
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_open_sessions(
        &self,
        limit: usize,
    ) -> Result<Vec<PaymentSession>, LedgerStoreError> {
        let sql = format!(
            "SELECT * FROM payment_sessions WHERE status NOT IN {TERMINAL_SQL} \
             ORDER BY created_at LIMIT $1"
        );
        let rows = sqlx::query(&sql)
            .bind(limit_to_db(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(row_to_session).collect()
    }

    async fn list_unsettled_terminal_sessions(
        &self,
        limit: usize,
    ) -> Result<Vec<PaymentSession>, LedgerStoreError> {
        let sql = format!(
            "SELECT * FROM payment_sessions WHERE status IN {TERMINAL_SQL} AND settled_at IS NULL \
             ORDER BY created_at LIMIT $1"
        );
        let rows = sqlx::query(&sql)
            .bind(limit_to_db(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(row_to_session).collect()
    }

    async fn list_sessions_for_user(
        &self,
        user_id: UserId,
    ) -> Result<Vec<PaymentSession>, LedgerStoreError> {
        let rows = sqlx::query(
            "SELECT * FROM payment_sessions WHERE owner_user_id = $1 ORDER BY created_at DESC",
        )
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_session).collect()
    }
}

#[async_trait]
impl AccountRepository for PostgresLedgerStore {
    async fn insert_activated(
        &self,
        account: &Account,
    ) -> Result<ActivationInsert, LedgerStoreError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO accounts (
                account_id, owner_user_id, name, status, start_date, expire_at, auto_renew,
                price_paid_cents, activation_key, version, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(account.id.0)
        .bind(account.owner_user_id.map(|id| id.0))
        .bind(&account.name)
        .bind(account.status.as_str())
        .bind(account.start_date)
        .bind(account.expire_at)
        .bind(account.auto_renew)
        .bind(to_db_cents(account.price_paid)?)
        .bind(account.activation_key.map(|id| id.0))
        .bind(version_to_db(account.version))
        .bind(account.created_at)
        .bind(account.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if inserted.rows_affected() == 1 {
            return Ok(ActivationInsert::Created(account.clone()));
        }
        let Some(key) = account.activation_key else {
            return Err(LedgerStoreError::Database(
                "account insert affected no rows".to_string(),
            ));
        };
        self.find_by_activation_key(key)
            .await?
            .map(ActivationInsert::Existing)
            .ok_or_else(|| LedgerStoreError::NotFound {
                entity: "account for activation key",
                id: key.0.to_string(),
            })
    }

    async fn get_account(&self, id: AccountId) -> Result<Option<Account>, LedgerStoreError> {
        sqlx::query("SELECT * FROM accounts WHERE account_id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .as_ref()
            .map(row_to_account)
            .transpose()
    }

    async fn find_by_activation_key(
        &self,
        key: PaymentSessionId,
    ) -> Result<Option<Account>, LedgerStoreError> {
        sqlx::query("SELECT * FROM accounts WHERE activation_key = $1")
            .bind(key.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .as_ref()
            .map(row_to_account)
            .transpose()
    }

    async fn update_account(&self, account: &Account) -> Result<Account, LedgerStoreError> {
        let row = sqlx::query(
            r#"
            UPDATE accounts SET
                owner_user_id = $3, name = $4, status = $5, start_date = $6, expire_at = $7,
                auto_renew = $8, price_paid_cents = $9, updated_at = $10, version = version + 1
            WHERE account_id = $1 AND version = $2
            RETURNING *
            "#,
        )
        .bind(account.id.0)
        .bind(version_to_db(account.version))
        .bind(account.owner_user_id.map(|id| id.0))
        .bind(&account.name)
        .bind(account.status.as_str())
        .bind(account.start_date)
        .bind(account.expire_at)
        .bind(account.auto_renew)
        .bind(to_db_cents(account.price_paid)?)
        .bind(account.updated_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        match row {
            Some(row) => row_to_account(&row),
            None => Err(LedgerStoreError::VersionConflict {
                entity: "account",
                id: account.id.0.to_string(),
            }),
        }
    }

    async fn list_accounts_for_user(
        &self,
        user_id: UserId,
    ) -> Result<Vec<Account>, LedgerStoreError> {
        let rows = sqlx::query(
            "SELECT * FROM accounts WHERE owner_user_id = $1 ORDER BY created_at DESC",
        )
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_account).collect()
    }

    async fn list_lapsed_active(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Account>, LedgerStoreError> {
        let rows = sqlx::query(
            "SELECT * FROM accounts WHERE status = 'active' AND (expire_at IS NULL OR expire_at < $1) \
             ORDER BY expire_at NULLS FIRST LIMIT $2",
        )
        .bind(now)
        .bind(limit_to_db(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_account).collect()
    }
}

fn apply_direction(
    balance: Money,
    direction: LedgerDirection,
    amount: Money,
) -> Result<Money, LedgerStoreError> {
    match direction {
        LedgerDirection::Credit => Ok(balance.checked_add(amount)?),
        LedgerDirection::Debit => balance
            .checked_sub(amount)
            .map_err(|_| LedgerStoreError::InsufficientFunds {
                balance,
                requested: amount,
            }),
        LedgerDirection::OffBalance => Ok(balance),
    }
}

fn db_err(err: sqlx::Error) -> LedgerStoreError {
    LedgerStoreError::Database(err.to_string())
}

fn to_db_cents(amount: Money) -> Result<i64, LedgerStoreError> {
    i64::try_from(amount.cents()).map_err(|_| LedgerStoreError::Money(MoneyError::Overflow))
}

fn from_db_cents(raw: i64) -> Result<Money, LedgerStoreError> {
    u64::try_from(raw)
        .map(Money)
        .map_err(|_| LedgerStoreError::InvalidColumn {
            field: "amount_cents",
            value: raw.to_string(),
        })
}

fn version_to_db(version: u64) -> i64 {
    i64::try_from(version).unwrap_or(i64::MAX)
}

fn limit_to_db(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn parse_column<T>(
    field: &'static str,
    raw: String,
    parse: fn(&str) -> Option<T>,
) -> Result<T, LedgerStoreError> {
    parse(&raw).ok_or(LedgerStoreError::InvalidColumn { field, value: raw })
}

fn row_to_transaction(row: &sqlx::postgres::PgRow) -> Result<Transaction, LedgerStoreError> {
    Ok(Transaction {
        id: TransactionId(row.try_get::<Uuid, _>("transaction_id").map_err(db_err)?),
        user_id: UserId(row.try_get::<Uuid, _>("user_id").map_err(db_err)?),
        tx_type: parse_column(
            "tx_type",
            row.try_get("tx_type").map_err(db_err)?,
            TransactionType::parse,
        )?,
        amount: from_db_cents(row.try_get("amount_cents").map_err(db_err)?)?,
        direction: parse_column(
            "direction",
            row.try_get("direction").map_err(db_err)?,
            LedgerDirection::parse,
        )?,
        status: parse_column(
            "status",
            row.try_get("status").map_err(db_err)?,
            TransactionStatus::parse,
        )?,
        linked_payment_session_id: row
            .try_get::<Option<Uuid>, _>("linked_payment_session_id")
            .map_err(db_err)?
            .map(PaymentSessionId),
        linked_account_id: row
            .try_get::<Option<Uuid>, _>("linked_account_id")
            .map_err(db_err)?
            .map(AccountId),
        reverses_payment_session_id: row
            .try_get::<Option<Uuid>, _>("reverses_payment_session_id")
            .map_err(db_err)?
            .map(PaymentSessionId),
        description: row.try_get("description").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    })
}

fn row_to_session(row: &sqlx::postgres::PgRow) -> Result<PaymentSession, LedgerStoreError> {
    let external_reference: Option<String> = row.try_get("external_reference").map_err(db_err)?;
    let crypto = match external_reference {
        Some(external_reference) => Some(CryptoPaymentDetails {
            external_reference,
            pay_address: row
                .try_get::<Option<String>, _>("pay_address")
                .map_err(db_err)?
                .unwrap_or_default(),
            pay_amount: row
                .try_get::<Option<String>, _>("pay_amount")
                .map_err(db_err)?
                .unwrap_or_default(),
            pay_currency: row
                .try_get::<Option<String>, _>("pay_currency")
                .map_err(db_err)?
                .unwrap_or_default(),
        }),
        None => None,
    };
    Ok(PaymentSession {
        id: PaymentSessionId(row.try_get::<Uuid, _>("payment_session_id").map_err(db_err)?),
        owner_user_id: UserId(row.try_get::<Uuid, _>("owner_user_id").map_err(db_err)?),
        kind: parse_column(
            "kind",
            row.try_get("kind").map_err(db_err)?,
            PaymentMethod::parse,
        )?,
        purpose: parse_column(
            "purpose",
            row.try_get("purpose").map_err(db_err)?,
            PaymentPurpose::parse,
        )?,
        amount: from_db_cents(row.try_get("amount_cents").map_err(db_err)?)?,
        crypto,
        status: parse_column(
            "status",
            row.try_get("status").map_err(db_err)?,
            PaymentSessionStatus::parse,
        )?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        expires_at: row.try_get("expires_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
        settled_at: row.try_get("settled_at").map_err(db_err)?,
    })
}

fn row_to_account(row: &sqlx::postgres::PgRow) -> Result<Account, LedgerStoreError> {
    Ok(Account {
        id: AccountId(row.try_get::<Uuid, _>("account_id").map_err(db_err)?),
        owner_user_id: row
            .try_get::<Option<Uuid>, _>("owner_user_id")
            .map_err(db_err)?
            .map(UserId),
        name: row.try_get("name").map_err(db_err)?,
        status: parse_column(
            "status",
            row.try_get("status").map_err(db_err)?,
            AccountStatus::parse,
        )?,
        start_date: row.try_get("start_date").map_err(db_err)?,
        expire_at: row.try_get("expire_at").map_err(db_err)?,
        auto_renew: row.try_get("auto_renew").map_err(db_err)?,
        price_paid: from_db_cents(row.try_get("price_paid_cents").map_err(db_err)?)?,
        activation_key: row
            .try_get::<Option<Uuid>, _>("activation_key")
            .map_err(db_err)?
            .map(PaymentSessionId),
        version: u64::try_from(row.try_get::<i64, _>("version").map_err(db_err)?).unwrap_or(0),
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    })
}
