use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{AccountId, AuditEntryId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Activated,
    Extended,
    Suspended,
    Refunded,
    Renamed,
    Expired,
    Renewed,
    Reactivated,
    AutoRenewChanged,
}

impl AuditAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Activated => "activated",
            Self::Extended => "extended",
            Self::Suspended => "suspended",
            Self::Refunded => "refunded",
            Self::Renamed => "renamed",
            Self::Expired => "expired",
            Self::Renewed => "renewed",
            Self::Reactivated => "reactivated",
            Self::AutoRenewChanged => "auto_renew_changed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "activated" => Some(Self::Activated),
            "extended" => Some(Self::Extended),
            "suspended" => Some(Self::Suspended),
            "refunded" => Some(Self::Refunded),
            "renamed" => Some(Self::Renamed),
            "expired" => Some(Self::Expired),
            "renewed" => Some(Self::Renewed),
            "reactivated" => Some(Self::Reactivated),
            "auto_renew_changed" => Some(Self::AutoRenewChanged),
            _ => None,
        }
    }
}

/// Write-once audit record. `actor_user_id = None` means a system actor
/// (expiry sweep, confirmation poller).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: AuditEntryId,
    pub account_id: Option<AccountId>,
    pub subject_user_id: Option<UserId>,
    pub action: AuditAction,
    pub actor_user_id: Option<UserId>,
    pub details: Value,
    pub created_at: DateTime<Utc>,
}
