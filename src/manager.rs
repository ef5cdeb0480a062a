//! The dispatcher service: one scanner per worker plus fleet discovery.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::ManagerConfig;
use crate::error::{Result, StoreError};
use crate::farm::Worker;
use crate::fleet::FleetWatcher;
use crate::pipeline::UploadPipeline;
use crate::scanner::{ScanReport, WorkerScanner};
use crate::store::FarmStore;
use crate::worker::WorkerConnector;

/// Owns the worker name to scanner mapping.
///
/// Entries are only added (by start-up and fleet discovery) and only removed
/// in bulk at shutdown. Every scanner task is spawned on the set's tracker so
/// shutdown can wait for all of them.
pub struct ScannerSet {
    store: Arc<dyn FarmStore>,
    connector: Arc<dyn WorkerConnector>,
    pipeline: Arc<dyn UploadPipeline>,
    config: ManagerConfig,
    scanners: RwLock<BTreeMap<String, watch::Receiver<Option<ScanReport>>>>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl ScannerSet {
    pub fn new(
        store: Arc<dyn FarmStore>,
        connector: Arc<dyn WorkerConnector>,
        pipeline: Arc<dyn UploadPipeline>,
        config: ManagerConfig,
    ) -> Self {
        Self {
            store,
            connector,
            pipeline,
            config,
            scanners: RwLock::new(BTreeMap::new()),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn FarmStore> {
        &self.store
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Start a scanner for `worker` unless one already exists. Returns
    /// whether a scanner was started.
    pub async fn spawn_for(&self, worker: &Worker) -> Result<bool> {
        if self.shutdown.is_cancelled() {
            return Ok(false);
        }
        let mut scanners = self.scanners.write().await;
        if scanners.contains_key(&worker.name) {
            return Ok(false);
        }

        let handle = self.connector.connect(worker)?;
        let scanner = WorkerScanner::new(
            worker.name.clone(),
            self.store.clone(),
            handle,
            self.pipeline.clone(),
            &self.config,
        );
        scanners.insert(worker.name.clone(), scanner.subscribe());
        self.tracker.spawn(scanner.run(self.shutdown.clone()));

        tracing::info!(worker = %worker.name, url = %worker.url, "Scanner spawned");
        Ok(true)
    }

    /// Start scanners for every worker in `workers` not yet tracked. A
    /// worker that cannot be connected is skipped and retried on the next
    /// discovery pass.
    pub async fn spawn_missing(&self, workers: &[Worker]) -> usize {
        let mut started = 0;
        for worker in workers {
            match self.spawn_for(worker).await {
                Ok(true) => started += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(worker = %worker.name, error = %e, "Failed to connect to worker")
                }
            }
        }
        started
    }

    /// Spawn a task that drains with the scanners.
    pub(crate) fn spawn_task<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(task);
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn names(&self) -> Vec<String> {
        self.scanners.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.scanners.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.scanners.read().await.is_empty()
    }

    /// Latest report of every scanner that has finished at least one cycle.
    pub async fn reports(&self) -> Vec<ScanReport> {
        self.scanners
            .read()
            .await
            .values()
            .filter_map(|rx| rx.borrow().clone())
            .collect()
    }

    async fn drain(&self) {
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        self.scanners.write().await.clear();
    }
}

/// The dispatcher.
pub struct Manager {
    scanners: Arc<ScannerSet>,
}

impl Manager {
    pub fn new(
        store: Arc<dyn FarmStore>,
        connector: Arc<dyn WorkerConnector>,
        pipeline: Arc<dyn UploadPipeline>,
        config: ManagerConfig,
    ) -> Self {
        Self {
            scanners: Arc::new(ScannerSet::new(store, connector, pipeline, config)),
        }
    }

    /// Start one scanner per registered worker and the fleet watcher.
    /// Returns the number of scanners started.
    pub async fn start(&self) -> std::result::Result<usize, StoreError> {
        let workers = self.scanners.store().list_workers().await?;
        let started = self.scanners.spawn_missing(&workers).await;

        let watcher = FleetWatcher::new(
            self.scanners.clone(),
            self.scanners.config().fleet_discovery_interval,
        );
        self.scanners
            .spawn_task(watcher.run(self.scanners.shutdown_token()));

        tracing::info!(workers = workers.len(), scanners = started, "Manager started");
        Ok(started)
    }

    /// Stop every timer and wait for in-flight cycles to finish. No scan is
    /// interrupted; the returned future resolves once all of them are done.
    pub async fn stop(&self) {
        tracing::info!("Manager stopping, draining scanners");
        self.scanners.drain().await;
        tracing::info!("Manager stopped");
    }

    pub fn is_stopping(&self) -> bool {
        self.scanners.shutdown_token().is_cancelled()
    }

    pub fn scanners(&self) -> &Arc<ScannerSet> {
        &self.scanners
    }

    pub async fn scanner_names(&self) -> Vec<String> {
        self.scanners.names().await
    }

    pub async fn reports(&self) -> Vec<ScanReport> {
        self.scanners.reports().await
    }
}
