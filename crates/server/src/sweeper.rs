//! Expiration sweeper.
//!
//! Cancels orders that are still unpaid after the expiration window. Unpaid
//! orders never hold stock, so expiring one moves no inventory.

use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::config::SweeperConfig;
use crate::db::Store;
use crate::services::{OrderEngine, OrderError};

/// Counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Orders past the cutoff when the sweep started.
    pub found: usize,
    pub cancelled: usize,
    pub failed: usize,
}

/// Periodically cancels expired unpaid orders.
#[derive(Clone)]
pub struct ExpirationSweeper {
    engine: OrderEngine,
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    config: SweeperConfig,
}

impl ExpirationSweeper {
    #[must_use]
    pub fn new(engine: OrderEngine, config: SweeperConfig) -> Self {
        Self {
            store: Arc::clone(engine.store()),
            clock: Arc::clone(engine.clock()),
            engine,
            config,
        }
    }

    /// Run one pass.
    ///
    /// A failing order is logged and counted; the rest of the batch still
    /// runs.
    ///
    /// # Errors
    ///
    /// Only if the expired orders cannot be listed.
    pub async fn sweep(&self) -> Result<SweepReport, OrderError> {
        let cutoff = self.clock.now() - self.config.expiration;
        let expired = self.store.find_expired_orders(cutoff).await?;

        let mut report = SweepReport {
            found: expired.len(),
            ..SweepReport::default()
        };

        for order_id in expired {
            match self.engine.expire_order(order_id, cutoff).await {
                Ok(true) => report.cancelled += 1,
                Ok(false) => {
                    tracing::debug!(order_id = %order_id, "Order changed since selection; left alone");
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::error!(order_id = %order_id, error = %e, "Failed to expire order");
                }
            }
        }

        if report.found > 0 {
            tracing::info!(
                found = report.found,
                cancelled = report.cancelled,
                failed = report.failed,
                cutoff = %cutoff,
                "Expiration sweep finished"
            );
        }
        Ok(report)
    }

    /// Sweep every interval until `shutdown` is cancelled.
    ///
    /// The first sweep runs immediately.
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!(
            interval_secs = self.config.interval.as_secs(),
            expiration_hours = self.config.expiration.num_hours(),
            "Expiration sweeper started"
        );

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                () = shutdown.cancelled() => break,
            }

            if let Err(e) = self.sweep().await {
                tracing::error!(error = %e, "Expiration sweep failed");
            }
        }

        tracing::info!("Expiration sweeper stopped");
    }

    /// Start [`Self::run`] on the runtime.
    #[must_use]
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}
