use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::{CreatePaymentRequest, CreatedPayment, GatewayError, GatewayStatus, PaymentGateway};

#[derive(Debug, Clone)]
pub struct GatewayClientConfig {
    pub base_url: String,
    pub api_key: String,
    pub request_timeout: Duration,
}

/// REST client for a NOWPayments-style processor: `POST {base}/payment`
/// creates a payment, `GET {base}/payment/{id}` reads its status.
#[derive(Debug, Clone)]
pub struct ReqwestPaymentGateway {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl ReqwestPaymentGateway {
    pub fn new(config: GatewayClientConfig) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| GatewayError::Unreachable(e.to_string()))?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key,
            client,
        })
    }

    async fn read_body(resp: reqwest::Response) -> Result<String, GatewayError> {
        let status = resp.status();
        let body = resp.text().await.map_err(map_transport_error)?;
        if !status.is_success() {
            warn!(status = status.as_u16(), "gateway rejected request");
            return Err(GatewayError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }
}

#[async_trait]
impl PaymentGateway for ReqwestPaymentGateway {
    async fn create_payment(
        &self,
        request: &CreatePaymentRequest,
    ) -> Result<CreatedPayment, GatewayError> {
        let body = serde_json::json!({
            "price_amount": request.amount.cents() as f64 / 100.0,
            "price_currency": request.price_currency.to_ascii_lowercase(),
            "pay_currency": request.pay_currency.to_ascii_lowercase(),
            "order_id": request.order_id,
            "order_description": request.description,
        });
        let resp = self
            .client
            .post(format!("{}/payment", self.base_url))
            .header("x-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(map_transport_error)?;
        let created = parse_created_payment(&Self::read_body(resp).await?)?;
        debug!(
            external_reference = %created.external_reference,
            pay_currency = %created.pay_currency,
            "gateway payment created"
        );
        Ok(created)
    }

    async fn get_status(&self, external_reference: &str) -> Result<GatewayStatus, GatewayError> {
        let resp = self
            .client
            .get(format!("{}/payment/{external_reference}", self.base_url))
            .header("x-api-key", &self.api_key)
            .send()
            .await
            .map_err(map_transport_error)?;
        parse_status(&Self::read_body(resp).await?)
    }
}

fn map_transport_error(err: reqwest::Error) -> GatewayError {
    if err.is_timeout() {
        GatewayError::Timeout
    } else if err.is_decode() {
        GatewayError::MalformedResponse(err.to_string())
    } else {
        GatewayError::Unreachable(err.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct PaymentPayload {
    payment_id: Option<Value>,
    payment_status: Option<String>,
    pay_address: Option<String>,
    pay_amount: Option<Value>,
    pay_currency: Option<String>,
    expiration_estimate_date: Option<String>,
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn decode(body: &str) -> Result<PaymentPayload, GatewayError> {
    serde_json::from_str(body).map_err(|e| GatewayError::MalformedResponse(e.to_string()))
}

fn parse_created_payment(body: &str) -> Result<CreatedPayment, GatewayError> {
    let payload = decode(body)?;
    let missing = |field: &str| GatewayError::MalformedResponse(format!("missing {field}"));
    let external_reference = payload
        .payment_id
        .as_ref()
        .and_then(scalar_to_string)
        .ok_or_else(|| missing("payment_id"))?;
    let pay_address = payload
        .pay_address
        .filter(|s| !s.is_empty())
        .ok_or_else(|| missing("pay_address"))?;
    let pay_amount = payload
        .pay_amount
        .as_ref()
        .and_then(scalar_to_string)
        .ok_or_else(|| missing("pay_amount"))?;
    let pay_currency = payload
        .pay_currency
        .filter(|s| !s.is_empty())
        .ok_or_else(|| missing("pay_currency"))?;
    let expires_at = payload
        .expiration_estimate_date
        .as_deref()
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|at| at.with_timezone(&Utc));
    Ok(CreatedPayment {
        external_reference,
        pay_address,
        pay_amount,
        pay_currency,
        expires_at,
    })
}

fn parse_status(body: &str) -> Result<GatewayStatus, GatewayError> {
    decode(body)?
        .payment_status
        .map(|raw| GatewayStatus::from_wire(&raw))
        .ok_or_else(|| GatewayError::MalformedResponse("missing payment_status".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn created_payment_accepts_numeric_ids_and_amounts() {
        let body = r#"{
            "payment_id": 5524759814,
            "payment_status": "waiting",
            "pay_address": "TNDFkiSmBQorNFacb3735q8MnT29sn8BLn",
            "pay_amount": 150.12,
            "pay_currency": "usdttrc20",
            "price_amount": 150,
            "expiration_estimate_date": "2026-10-18T12:20:00.000Z"
        }"#;
        let created = parse_created_payment(body).expect("parse");
        assert_eq!(created.external_reference, "5524759814");
        assert_eq!(created.pay_amount, "150.12");
        assert_eq!(created.pay_currency, "usdttrc20");
        assert_eq!(
            created.expires_at.map(|at| at.to_rfc3339()),
            Some("2026-10-18T12:20:00+00:00".to_string())
        );
    }

    #[test]
    fn created_payment_without_address_is_malformed() {
        let body = r#"{"payment_id":"abc","pay_amount":"1.5","pay_currency":"btc"}"#;
        let err = parse_created_payment(body).expect_err("missing address");
        assert_eq!(
            err,
            GatewayError::MalformedResponse("missing pay_address".to_string())
        );
    }

    #[test]
    fn status_body_is_parsed_into_gateway_vocabulary() {
        assert_eq!(
            parse_status(r#"{"payment_id":1,"payment_status":"partially_paid"}"#).expect("parse"),
            GatewayStatus::PartiallyPaid
        );
        assert!(matches!(
            parse_status("not json"),
            Err(GatewayError::MalformedResponse(_))
        ));
        assert!(matches!(
            parse_status(r#"{"payment_id":1}"#),
            Err(GatewayError::MalformedResponse(_))
        ));
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let gateway = ReqwestPaymentGateway::new(GatewayClientConfig {
            base_url: "https://api.example.test/v1/".to_string(),
            api_key: "key".to_string(),
            request_timeout: Duration::from_secs(5),
        })
        .expect("client");
        assert_eq!(gateway.base_url, "https://api.example.test/v1");
    }
}
