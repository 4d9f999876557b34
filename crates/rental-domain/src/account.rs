use chrono::{DateTime, Duration, Months, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{AccountId, PaymentSessionId, UserId};
use crate::money::Money;

pub const DEFAULT_RENTAL_PERIOD_DAYS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    Expired,
    Canceled,
    Suspended,
}

impl AccountStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Expired => "expired",
            Self::Canceled => "canceled",
            Self::Suspended => "suspended",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "active" => Some(Self::Active),
            "expired" => Some(Self::Expired),
            "canceled" => Some(Self::Canceled),
            "suspended" => Some(Self::Suspended),
            _ => None,
        }
    }
}

/// A rented agency account. Never hard-deleted; `status` carries its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub owner_user_id: Option<UserId>,
    pub name: String,
    pub status: AccountStatus,
    pub start_date: DateTime<Utc>,
    pub expire_at: Option<DateTime<Utc>>,
    pub auto_renew: bool,
    pub price_paid: Money,
    /// Payment session that created this account; unique across accounts.
    pub activation_key: Option<PaymentSessionId>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    #[must_use]
    pub fn new_active(
        owner: UserId,
        price_paid: Money,
        activation_key: PaymentSessionId,
        period: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        let id = AccountId(activation_key.0);
        Self {
            id,
            owner_user_id: Some(owner),
            name: default_account_name(id),
            status: AccountStatus::Active,
            start_date: now,
            expire_at: Some(now + period),
            auto_renew: false,
            price_paid,
            activation_key: Some(activation_key),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Stored `active` with `expire_at` strictly before `now`. The sweep and
    /// lazy reads both use this, so an account is still active at the
    /// instant of `expire_at`.
    #[must_use]
    pub fn is_lapsed_at(&self, now: DateTime<Utc>) -> bool {
        self.status == AccountStatus::Active && self.expire_at.is_none_or(|at| at < now)
    }

    /// Status as observed at `now`: a lapsed account reads as `expired`
    /// until the sweep persists it.
    #[must_use]
    pub fn effective_status(&self, now: DateTime<Utc>) -> AccountStatus {
        if self.is_lapsed_at(now) {
            AccountStatus::Expired
        } else {
            self.status
        }
    }

    #[must_use]
    pub fn is_usable_at(&self, now: DateTime<Utc>) -> bool {
        self.effective_status(now) == AccountStatus::Active
    }

    #[must_use]
    pub fn is_owned_by(&self, user_id: UserId) -> bool {
        self.owner_user_id == Some(user_id)
    }
}

fn default_account_name(id: AccountId) -> String {
    let simple = id.0.simple().to_string();
    format!("agency-{}", &simple[simple.len() - 8..])
}

/// `max(current expire_at, now) + months`. Returns `None` on calendar overflow.
#[must_use]
pub fn extension_target(
    current_expire_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    months: u32,
) -> Option<DateTime<Utc>> {
    let base = current_expire_at.map_or(now, |at| at.max(now));
    base.checked_add_months(Months::new(months))
}
