use rental_domain::PaymentSessionStatus;
use serde::{Deserialize, Serialize};

/// Payment status in the gateway's own vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayStatus {
    Waiting,
    Confirming,
    Confirmed,
    Sending,
    PartiallyPaid,
    Finished,
    Failed,
    Refunded,
    Expired,
    Unknown(String),
}

impl GatewayStatus {
    #[must_use]
    pub fn from_wire(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "waiting" => Self::Waiting,
            "confirming" => Self::Confirming,
            "confirmed" => Self::Confirmed,
            "sending" => Self::Sending,
            "partially_paid" => Self::PartiallyPaid,
            "finished" => Self::Finished,
            "failed" => Self::Failed,
            "refunded" => Self::Refunded,
            "expired" => Self::Expired,
            _ => Self::Unknown(raw.to_string()),
        }
    }

    /// Mapping onto local session states. Anything that is not a clear
    /// success or failure keeps the session polling as `confirming`.
    #[must_use]
    pub fn to_session_status(&self) -> PaymentSessionStatus {
        match self {
            Self::Waiting => PaymentSessionStatus::Waiting,
            Self::Confirming | Self::Sending | Self::PartiallyPaid | Self::Unknown(_) => {
                PaymentSessionStatus::Confirming
            }
            Self::Confirmed | Self::Finished => PaymentSessionStatus::Confirmed,
            Self::Failed | Self::Refunded => PaymentSessionStatus::Failed,
            Self::Expired => PaymentSessionStatus::Expired,
        }
    }
}
