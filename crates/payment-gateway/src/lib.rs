mod http;
mod scripted;
mod status;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rental_domain::Money;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use http::{GatewayClientConfig, ReqwestPaymentGateway};
pub use scripted::ScriptedPaymentGateway;
pub use status::GatewayStatus;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("gateway request timed out")]
    Timeout,
    #[error("gateway unreachable: {0}")]
    Unreachable(String),
    #[error("malformed gateway response: {0}")]
    MalformedResponse(String),
    #[error("gateway rejected request with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatePaymentRequest {
    /// Amount in the settlement (fiat) currency.
    pub amount: Money,
    pub price_currency: String,
    pub pay_currency: String,
    /// Local payment session id, echoed back by the gateway as `order_id`.
    pub order_id: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedPayment {
    pub external_reference: String,
    pub pay_address: String,
    pub pay_amount: String,
    pub pay_currency: String,
    /// Gateway-side deadline when it reports one; callers fall back to their
    /// own payment window otherwise.
    pub expires_at: Option<DateTime<Utc>>,
}

/// External payment processor. Calls may time out or return stale data, and
/// repeated status reads may arrive duplicated or out of order.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_payment(
        &self,
        request: &CreatePaymentRequest,
    ) -> Result<CreatedPayment, GatewayError>;

    async fn get_status(&self, external_reference: &str) -> Result<GatewayStatus, GatewayError>;
}
