use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{PaymentSessionId, UserId};
use crate::money::Money;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Balance,
    Crypto,
}

impl PaymentMethod {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Balance => "balance",
            Self::Crypto => "crypto",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "balance" => Some(Self::Balance),
            "crypto" => Some(Self::Crypto),
            _ => None,
        }
    }
}

/// What a confirmed session pays for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentPurpose {
    Rental,
    Deposit,
}

impl PaymentPurpose {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rental => "rental",
            Self::Deposit => "deposit",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "rental" => Some(Self::Rental),
            "deposit" => Some(Self::Deposit),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentSessionStatus {
    Waiting,
    Confirming,
    Confirmed,
    Finished,
    Failed,
    Expired,
}

impl PaymentSessionStatus {
    pub const TERMINAL: [Self; 4] = [Self::Confirmed, Self::Finished, Self::Failed, Self::Expired];

    #[must_use]
    pub fn is_terminal(self) -> bool {
        Self::TERMINAL.contains(&self)
    }

    #[must_use]
    pub fn is_success(self) -> bool {
        matches!(self, Self::Confirmed | Self::Finished)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Confirming => "confirming",
            Self::Confirmed => "confirmed",
            Self::Finished => "finished",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "waiting" => Some(Self::Waiting),
            "confirming" => Some(Self::Confirming),
            "confirmed" => Some(Self::Confirmed),
            "finished" => Some(Self::Finished),
            "failed" => Some(Self::Failed),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }
}

/// Gateway-side details of a crypto payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CryptoPaymentDetails {
    pub external_reference: String,
    pub pay_address: String,
    /// Kept as the gateway's decimal string; crypto amounts exceed cent precision.
    pub pay_amount: String,
    pub pay_currency: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentSession {
    pub id: PaymentSessionId,
    pub owner_user_id: UserId,
    pub kind: PaymentMethod,
    pub purpose: PaymentPurpose,
    pub amount: Money,
    pub crypto: Option<CryptoPaymentDetails>,
    pub status: PaymentSessionStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set once the terminal side effects (ledger, activation) are applied.
    pub settled_at: Option<DateTime<Utc>>,
}

impl PaymentSession {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    #[must_use]
    pub fn is_past_expiry(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    #[must_use]
    pub fn external_reference(&self) -> Option<&str> {
        self.crypto.as_ref().map(|c| c.external_reference.as_str())
    }
}
