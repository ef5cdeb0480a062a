use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::StoreError;
use crate::manager::ScannerSet;

/// Periodically re-reads the worker registry and starts scanners for
/// workers added since the last pass. Scanners of workers that disappear
/// from the registry are left running.
pub struct FleetWatcher {
    scanners: Arc<ScannerSet>,
    interval: Duration,
}

impl FleetWatcher {
    pub fn new(scanners: Arc<ScannerSet>, interval: Duration) -> Self {
        Self { scanners, interval }
    }

    /// One discovery pass. Returns the number of scanners started.
    pub async fn discover_once(&self) -> Result<usize, StoreError> {
        let workers = self.scanners.store().list_workers().await?;
        let started = self.scanners.spawn_missing(&workers).await;
        if started > 0 {
            tracing::info!(started, known = workers.len(), "Discovered new workers");
        }
        Ok(started)
    }

    /// Run discovery every interval until `shutdown` fires. The first pass
    /// happens one interval after start; the caller covers start-up itself.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.discover_once().await {
                        tracing::warn!(error = %e, "Fleet discovery failed");
                    }
                }
            }
        }
        tracing::debug!("Fleet watcher stopped");
    }
}
