use std::sync::Arc;
use std::time::Duration;

use rental_domain::Clock;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::lifecycle::AccountLifecycleManager;
use crate::poller::ConfirmationPoller;

/// Runs the expiry sweep on a fixed interval until shutdown.
pub fn spawn_expiry_sweep_loop(
    lifecycle: Arc<AccountLifecycleManager>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    mut shutdown_rx: oneshot::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(err) = lifecycle.expiry_sweep(clock.now()).await {
                        warn!(error = %err, "expiry sweep iteration failed");
                    }
                }
            }
        }
    })
}

/// Re-polls open sessions and settles stranded terminal ones until shutdown.
pub fn spawn_session_recovery_loop(
    poller: Arc<ConfirmationPoller>,
    interval: Duration,
    batch_limit: usize,
    mut shutdown_rx: oneshot::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    break;
                }
                _ = ticker.tick() => {
                    match poller.recover_once(batch_limit).await {
                        Ok(report) if report.settled > 0 || report.failures > 0 => {
                            info!(
                                polled = report.polled,
                                settled = report.settled,
                                failures = report.failures,
                                "session recovery pass finished"
                            );
                        }
                        Ok(_) => {}
                        Err(err) => warn!(error = %err, "session recovery iteration failed"),
                    }
                }
            }
        }
    })
}
