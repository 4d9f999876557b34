use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ledger_store::PaymentSessionRepository;
use payment_gateway::PaymentGateway;
use rental_domain::{Clock, PaymentSession, PaymentSessionId, PaymentSessionStatus};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::SettlementError;

/// Applies the side effects of a terminal session. Must tolerate being
/// called again for a session it already settled.
#[async_trait]
pub trait SessionSettler: Send + Sync {
    async fn settle(&self, session: &PaymentSession) -> Result<(), SettlementError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub polled: usize,
    pub settled: usize,
    pub failures: usize,
}

/// Drives crypto sessions toward a terminal state from gateway reads.
/// Status writes are compare-and-set, so any number of pollers may run for
/// the same session; only the one that lands the terminal write settles it.
pub struct ConfirmationPoller {
    sessions: Arc<dyn PaymentSessionRepository>,
    gateway: Arc<dyn PaymentGateway>,
    settler: Arc<dyn SessionSettler>,
    clock: Arc<dyn Clock>,
}

impl ConfirmationPoller {
    #[must_use]
    pub fn new(
        sessions: Arc<dyn PaymentSessionRepository>,
        gateway: Arc<dyn PaymentGateway>,
        settler: Arc<dyn SessionSettler>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            sessions,
            gateway,
            settler,
            clock,
        }
    }

    /// One observation. Gateway errors are logged and leave the session as
    /// it was; settlement errors are logged and left to the recovery pass.
    pub async fn poll_once(
        &self,
        session_id: PaymentSessionId,
    ) -> Result<PaymentSessionStatus, SettlementError> {
        let session = self.load(session_id).await?;
        if session.is_terminal() {
            return Ok(session.status);
        }

        let now = self.clock.now();
        if session.is_past_expiry(now) {
            return self.transition(&session, PaymentSessionStatus::Expired).await;
        }

        let Some(reference) = session.external_reference() else {
            return Ok(session.status);
        };
        let observed = match self.gateway.get_status(reference).await {
            Ok(status) => status,
            Err(err) => {
                warn!(
                    session_id = %session_id.0,
                    external_reference = reference,
                    error = %err,
                    "gateway status read failed; will retry"
                );
                return Ok(session.status);
            }
        };
        let next = observed.to_session_status();
        // a stale `waiting` read must not undo an observed `confirming`
        if next == session.status
            || (next == PaymentSessionStatus::Waiting
                && session.status == PaymentSessionStatus::Confirming)
        {
            return Ok(session.status);
        }
        debug!(
            session_id = %session_id.0,
            gateway_status = ?observed,
            next = next.as_str(),
            "gateway status observed"
        );
        self.transition(&session, next).await
    }

    /// Polls on a fixed interval until the session is terminal.
    pub async fn run_until_terminal(
        &self,
        session_id: PaymentSessionId,
        interval: Duration,
    ) -> Result<PaymentSessionStatus, SettlementError> {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match self.poll_once(session_id).await {
                Ok(status) if status.is_terminal() => return Ok(status),
                Ok(_) => {}
                Err(err @ SettlementError::NotFound { .. }) => return Err(err),
                Err(err) => {
                    warn!(session_id = %session_id.0, error = %err, "session poll failed");
                }
            }
        }
    }

    /// Re-polls open sessions and settles terminal ones that never got
    /// their side effects applied, e.g. after a restart.
    pub async fn recover_once(&self, batch_limit: usize) -> Result<RecoveryReport, SettlementError> {
        let mut report = RecoveryReport::default();
        for session in self.sessions.list_open_sessions(batch_limit).await? {
            match self.poll_once(session.id).await {
                Ok(_) => report.polled += 1,
                Err(err) => {
                    report.failures += 1;
                    warn!(session_id = %session.id.0, error = %err, "recovery poll failed");
                }
            }
        }
        for session in self
            .sessions
            .list_unsettled_terminal_sessions(batch_limit)
            .await?
        {
            match self.settler.settle(&session).await {
                Ok(()) => report.settled += 1,
                Err(err) => {
                    report.failures += 1;
                    warn!(session_id = %session.id.0, error = %err, "recovery settle failed");
                }
            }
        }
        Ok(report)
    }

    async fn transition(
        &self,
        session: &PaymentSession,
        next: PaymentSessionStatus,
    ) -> Result<PaymentSessionStatus, SettlementError> {
        let now = self.clock.now();
        match self.sessions.advance_status(session.id, next, now).await? {
            Some(updated) => {
                if updated.is_terminal() {
                    info!(
                        session_id = %updated.id.0,
                        status = updated.status.as_str(),
                        "payment session reached terminal state"
                    );
                    self.settle_logged(&updated).await;
                }
                Ok(updated.status)
            }
            None => Ok(self.load(session.id).await?.status),
        }
    }

    async fn settle_logged(&self, session: &PaymentSession) {
        if let Err(err) = self.settler.settle(session).await {
            warn!(
                session_id = %session.id.0,
                error = %err,
                "settlement failed; left for recovery"
            );
        }
    }

    async fn load(&self, session_id: PaymentSessionId) -> Result<PaymentSession, SettlementError> {
        self.sessions
            .get_session(session_id)
            .await?
            .ok_or_else(|| SettlementError::not_found("payment session", session_id.0))
    }
}

/// Background poller for one session; the task ends with the terminal status.
pub fn spawn_session_poller(
    poller: Arc<ConfirmationPoller>,
    session_id: PaymentSessionId,
    interval: Duration,
) -> tokio::task::JoinHandle<Result<PaymentSessionStatus, SettlementError>> {
    tokio::spawn(async move { poller.run_until_terminal(session_id, interval).await })
}
