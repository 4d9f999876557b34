use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::{CreatePaymentRequest, CreatedPayment, GatewayError, GatewayStatus, PaymentGateway};

type Reply = Result<GatewayStatus, GatewayError>;

/// In-memory gateway driven by per-reference scripts. Each status read pops
/// the next scripted reply; the last one repeats. Unscripted references
/// report `waiting`.
#[derive(Debug, Default, Clone)]
pub struct ScriptedPaymentGateway {
    scripts: Arc<Mutex<HashMap<String, VecDeque<Reply>>>>,
    created: Arc<Mutex<Vec<CreatePaymentRequest>>>,
    create_failure: Arc<Mutex<Option<GatewayError>>>,
    next_reference: Arc<AtomicU64>,
    status_calls: Arc<AtomicU64>,
}

impl ScriptedPaymentGateway {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_status(&self, external_reference: &str, status: GatewayStatus) {
        self.push(external_reference, Ok(status));
    }

    pub fn push_error(&self, external_reference: &str, err: GatewayError) {
        self.push(external_reference, Err(err));
    }

    /// The next `create_payment` call fails with `err`.
    pub fn fail_next_create(&self, err: GatewayError) {
        if let Ok(mut guard) = self.create_failure.lock() {
            *guard = Some(err);
        }
    }

    #[must_use]
    pub fn created_requests(&self) -> Vec<CreatePaymentRequest> {
        self.created
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn status_calls(&self) -> u64 {
        self.status_calls.load(Ordering::SeqCst)
    }

    fn push(&self, external_reference: &str, reply: Reply) {
        if let Ok(mut guard) = self.scripts.lock() {
            guard
                .entry(external_reference.to_string())
                .or_default()
                .push_back(reply);
        }
    }
}

#[async_trait]
impl PaymentGateway for ScriptedPaymentGateway {
    async fn create_payment(
        &self,
        request: &CreatePaymentRequest,
    ) -> Result<CreatedPayment, GatewayError> {
        let failure = self
            .create_failure
            .lock()
            .map_err(|_| GatewayError::Unreachable("script lock poisoned".to_string()))?
            .take();
        if let Some(err) = failure {
            return Err(err);
        }
        self.created
            .lock()
            .map_err(|_| GatewayError::Unreachable("script lock poisoned".to_string()))?
            .push(request.clone());
        let n = self.next_reference.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(CreatedPayment {
            external_reference: format!("scripted-{n}"),
            pay_address: format!("addr-{n}"),
            pay_amount: request.amount.to_string(),
            pay_currency: request.pay_currency.clone(),
            expires_at: None,
        })
    }

    async fn get_status(&self, external_reference: &str) -> Result<GatewayStatus, GatewayError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let mut guard = self
            .scripts
            .lock()
            .map_err(|_| GatewayError::Unreachable("script lock poisoned".to_string()))?;
        let Some(queue) = guard.get_mut(external_reference) else {
            return Ok(GatewayStatus::Waiting);
        };
        if queue.len() > 1 {
            if let Some(reply) = queue.pop_front() {
                return reply;
            }
        }
        queue.front().cloned().unwrap_or(Ok(GatewayStatus::Waiting))
    }
}
