//! Background sweeper for expired reservations and stale webhook records.
//!
//! ```ignore
//! let (janitor, shutdown) = Janitor::new(service.clone(), config.janitor_interval());
//! let handle = tokio::spawn(janitor.run());
//!
//! // On shutdown:
//! shutdown.send(true).ok();
//! handle.await?;
//! ```

use crate::checkout::OrderService;
use crate::error::CheckoutError;
use crate::order::OrderId;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// What one sweep did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Pending orders cancelled because their reservation lapsed
    pub cancelled_orders: Vec<OrderId>,
    /// Unmatched webhook records deleted
    pub evicted_webhooks: u64,
}

/// Periodically releases expired reservations and evicts old unmatched webhooks.
pub struct Janitor {
    service: Arc<OrderService>,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl Janitor {
    /// Creates a janitor and the sender that stops it.
    #[must_use]
    pub fn new(service: Arc<OrderService>, interval: Duration) -> (Self, watch::Sender<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        (
            Self {
                service,
                interval,
                shutdown: shutdown_rx,
            },
            shutdown_tx,
        )
    }

    /// Creates a janitor and runs it on the current tokio runtime.
    #[must_use]
    pub fn spawn(
        service: Arc<OrderService>,
        interval: Duration,
    ) -> (tokio::task::JoinHandle<()>, watch::Sender<bool>) {
        let (janitor, shutdown) = Self::new(service, interval);
        (tokio::spawn(janitor.run()), shutdown)
    }

    /// Runs a single sweep.
    ///
    /// # Errors
    ///
    /// Returns the first storage error hit by either half of the sweep.
    pub async fn sweep_once(&self) -> Result<SweepReport, CheckoutError> {
        let cancelled_orders = self.service.sweep_expired_reservations().await?;
        let evicted_webhooks = self.service.evict_stale_webhooks().await?;
        Ok(SweepReport {
            cancelled_orders,
            evicted_webhooks,
        })
    }

    /// Sweeps on every tick until the shutdown signal flips to `true`.
    ///
    /// Sweep failures are logged and retried on the next tick.
    pub async fn run(mut self) {
        tracing::info!(interval_ms = self.interval.as_millis(), "Janitor started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        while !*self.shutdown.borrow() {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.sweep_once().await {
                        Ok(report) => tracing::debug!(
                            cancelled = report.cancelled_orders.len(),
                            evicted = report.evicted_webhooks,
                            "Janitor sweep finished"
                        ),
                        Err(error) => tracing::error!(error = %error, "Janitor sweep failed"),
                    }
                }
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::info!("Janitor stopped");
    }
}

impl std::fmt::Debug for Janitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Janitor")
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}
