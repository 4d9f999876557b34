use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{AccountId, PaymentSessionId, TransactionId, UserId};
use crate::money::Money;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Deposit,
    Rental,
    Withdrawal,
    Refund,
}

impl TransactionType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Deposit => "deposit",
            Self::Rental => "rental",
            Self::Withdrawal => "withdrawal",
            Self::Refund => "refund",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "deposit" => Some(Self::Deposit),
            "rental" => Some(Self::Rental),
            "withdrawal" => Some(Self::Withdrawal),
            "refund" => Some(Self::Refund),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
}

impl TransactionStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Effect of an entry on the user's central balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerDirection {
    Credit,
    Debit,
    /// Paid outside the balance (crypto rental); recorded for history only.
    OffBalance,
}

impl LedgerDirection {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Credit => "credit",
            Self::Debit => "debit",
            Self::OffBalance => "off_balance",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "credit" => Some(Self::Credit),
            "debit" => Some(Self::Debit),
            "off_balance" => Some(Self::OffBalance),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub user_id: UserId,
    pub tx_type: TransactionType,
    pub amount: Money,
    pub direction: LedgerDirection,
    pub status: TransactionStatus,
    pub linked_payment_session_id: Option<PaymentSessionId>,
    pub linked_account_id: Option<AccountId>,
    /// Set on the credit that returns a balance purchase's debit; unique.
    pub reverses_payment_session_id: Option<PaymentSessionId>,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    /// Amount relative to the user's balance in cents; zero unless completed.
    #[must_use]
    pub fn signed_cents(&self) -> i128 {
        if self.status != TransactionStatus::Completed {
            return 0;
        }
        let cents = i128::from(self.amount.cents());
        match self.direction {
            LedgerDirection::Credit => cents,
            LedgerDirection::Debit => -cents,
            LedgerDirection::OffBalance => 0,
        }
    }
}
