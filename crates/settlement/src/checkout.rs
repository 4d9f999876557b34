use std::sync::Arc;

use rental_domain::{AccountId, Identity, PaymentSessionId, PaymentSessionStatus};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::orchestrator::{CheckoutOptions, PurchaseMethod, PurchaseOutcome, SettlementOrchestrator};
use crate::SettlementError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum CheckoutStep {
    Select,
    BalanceConfirm,
    CryptoCurrencySelect,
    CryptoPayment { session_id: PaymentSessionId },
    Success { account_id: AccountId },
    Failed { reason: String },
}

impl CheckoutStep {
    fn name(&self) -> &'static str {
        match self {
            Self::Select => "select",
            Self::BalanceConfirm => "balance_confirm",
            Self::CryptoCurrencySelect => "crypto_currency_select",
            Self::CryptoPayment { .. } => "crypto_payment",
            Self::Success { .. } => "success",
            Self::Failed { .. } => "failed",
        }
    }
}

/// One user's walk through a purchase. Holds only a reference to the
/// server-side session; dropping or rewinding the flow never touches it.
pub struct CheckoutFlow {
    orchestrator: Arc<SettlementOrchestrator>,
    identity: Identity,
    options: CheckoutOptions,
    step: CheckoutStep,
}

impl CheckoutFlow {
    pub async fn start(
        orchestrator: Arc<SettlementOrchestrator>,
        identity: Identity,
    ) -> Result<Self, SettlementError> {
        let options = orchestrator.checkout_options(&identity).await?;
        Ok(Self {
            orchestrator,
            identity,
            options,
            step: CheckoutStep::Select,
        })
    }

    #[must_use]
    pub fn step(&self) -> &CheckoutStep {
        &self.step
    }

    #[must_use]
    pub fn options(&self) -> &CheckoutOptions {
        &self.options
    }

    pub fn choose_balance(&mut self) -> Result<&CheckoutStep, SettlementError> {
        self.expect_step(|s| matches!(s, CheckoutStep::Select), "choose balance")?;
        if !self.options.balance_allowed {
            return Err(SettlementError::InsufficientFunds {
                balance: self.options.balance,
                requested: self.options.price,
            });
        }
        Ok(self.move_to(CheckoutStep::BalanceConfirm))
    }

    pub fn choose_crypto(&mut self) -> Result<&CheckoutStep, SettlementError> {
        self.expect_step(|s| matches!(s, CheckoutStep::Select), "choose crypto")?;
        Ok(self.move_to(CheckoutStep::CryptoCurrencySelect))
    }

    pub async fn confirm_balance(&mut self) -> Result<&CheckoutStep, SettlementError> {
        self.expect_step(
            |s| matches!(s, CheckoutStep::BalanceConfirm),
            "confirm balance purchase",
        )?;
        match self
            .orchestrator
            .initiate_purchase(&self.identity, PurchaseMethod::Balance)
            .await
        {
            Ok(PurchaseOutcome::Activated { account, .. }) => Ok(self.move_to(
                CheckoutStep::Success {
                    account_id: account.id,
                },
            )),
            Ok(PurchaseOutcome::AwaitingPayment { session }) => {
                Ok(self.move_to(CheckoutStep::CryptoPayment {
                    session_id: session.id,
                }))
            }
            Err(err) => {
                self.move_to(CheckoutStep::Failed {
                    reason: err.to_string(),
                });
                Err(err)
            }
        }
    }

    /// Creates the gateway payment. A gateway error leaves the flow where it
    /// was so the user can retry or pick another currency.
    pub async fn choose_currency(
        &mut self,
        pay_currency: &str,
    ) -> Result<&CheckoutStep, SettlementError> {
        self.expect_step(
            |s| matches!(s, CheckoutStep::CryptoCurrencySelect),
            "choose currency",
        )?;
        let outcome = self
            .orchestrator
            .initiate_purchase(
                &self.identity,
                PurchaseMethod::Crypto {
                    pay_currency: pay_currency.to_string(),
                },
            )
            .await?;
        Ok(self.move_to(CheckoutStep::CryptoPayment {
            session_id: outcome.session().id,
        }))
    }

    /// Re-reads the session and moves to `success` or `failed` once it is terminal.
    pub async fn refresh(&mut self) -> Result<&CheckoutStep, SettlementError> {
        let CheckoutStep::CryptoPayment { session_id } = self.step else {
            return Ok(&self.step);
        };
        let status = self
            .orchestrator
            .get_purchase_status(&self.identity, session_id)
            .await?;
        let next = match (status.session.status, status.account) {
            (s, Some(account)) if s.is_success() => CheckoutStep::Success {
                account_id: account.id,
            },
            (s, None) if s.is_success() => {
                // confirmed but settlement has not landed yet
                return Ok(&self.step);
            }
            (PaymentSessionStatus::Failed | PaymentSessionStatus::Expired, _) => {
                CheckoutStep::Failed {
                    reason: format!("payment {}", status.session.status.as_str()),
                }
            }
            _ => return Ok(&self.step),
        };
        Ok(self.move_to(next))
    }

    /// Polls until the session is terminal, then refreshes.
    pub async fn wait_for_outcome(&mut self) -> Result<&CheckoutStep, SettlementError> {
        let CheckoutStep::CryptoPayment { session_id } = self.step else {
            return Ok(&self.step);
        };
        self.orchestrator
            .poller()
            .run_until_terminal(session_id, self.orchestrator.settings().checkout_poll_interval)
            .await?;
        self.refresh().await
    }

    /// Back to method selection from anywhere. Any session reference is
    /// dropped; the session itself runs on until it confirms or expires.
    pub async fn back_to_select(&mut self) -> Result<&CheckoutStep, SettlementError> {
        self.options = self.orchestrator.checkout_options(&self.identity).await?;
        Ok(self.move_to(CheckoutStep::Select))
    }

    fn expect_step(
        &self,
        allowed: impl Fn(&CheckoutStep) -> bool,
        action: &str,
    ) -> Result<(), SettlementError> {
        if allowed(&self.step) {
            Ok(())
        } else {
            Err(SettlementError::Conflict(format!(
                "cannot {action} from checkout step {}",
                self.step.name()
            )))
        }
    }

    fn move_to(&mut self, next: CheckoutStep) -> &CheckoutStep {
        debug!(
            user_id = %self.identity.user_id.0,
            from = self.step.name(),
            to = next.name(),
            "checkout step"
        );
        self.step = next;
        &self.step
    }
}
