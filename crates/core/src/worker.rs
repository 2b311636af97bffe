//! Background analysis: drains the scheduler, calls the feature extractor,
//! flushes results into the cache and catalog, and re-clusters at the end of
//! every run.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};

use crate::cache::{AnalysisCache, AnalysisCacheEntry};
use crate::catalog::Catalog;
use crate::config::EngineConfig;
use crate::domain::{AssetId, AssetTags};
use crate::error::{Error, Result};
use crate::matching::{self, ClusterParams};
use crate::pressure::{PressureLevel, PressureSignal};
use crate::scheduler::{AnalysisScheduler, Priority};
use crate::source::{lock, FeatureExtractor};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Worker tunables, taken from [`EngineConfig`].
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub chunk_size: usize,
    pub flush_count: usize,
    pub flush_interval: Duration,
    pub pressure_backoff: Duration,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub cluster: ClusterParams,
    pub blur_threshold: f64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for WorkerConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            chunk_size: config.worker_chunk_size.max(1),
            flush_count: config.flush_count.max(1),
            flush_interval: config.flush_interval,
            pressure_backoff: config.pressure_backoff,
            max_retries: config.max_extraction_retries,
            retry_backoff: config.retry_backoff,
            cluster: ClusterParams {
                window: config.cluster_window,
                hamming_threshold: config.hamming_threshold,
            },
            blur_threshold: config.blur_threshold,
        }
    }
}

/// Progress reported by the worker.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// Left `Idle` with this many ids queued.
    DrainStarted { pending: usize },
    Analyzed { id: AssetId },
    Failed {
        id: AssetId,
        attempt: u32,
        error: String,
        will_retry: bool,
    },
    /// A batch of results reached the cache and catalog.
    Flushed { entries: usize },
    Clustered { groups: usize, grouped_assets: usize },
    /// Back to `Idle` after a run.
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Draining,
}

enum Outcome {
    Analyzed(AnalysisCacheEntry),
    Failed(String),
    /// Nothing to do: fresh cache entry, unanalyzable media, unknown id or
    /// retries exhausted.
    Skipped,
}

/// Failure bookkeeping per asset. Reset when the byte size changes.
#[derive(Debug, Clone, Copy)]
struct Attempts {
    byte_size: u64,
    failures: u32,
}

pub struct AnalysisWorker {
    scheduler: AnalysisScheduler,
    cache: Arc<AnalysisCache>,
    catalog: Arc<Catalog>,
    extractor: Arc<dyn FeatureExtractor>,
    pressure: Arc<dyn PressureSignal>,
    config: WorkerConfig,
    wake: Notify,
    event_tx: broadcast::Sender<WorkerEvent>,
    draining: AtomicBool,
    stopped: AtomicBool,
    attempts: Mutex<HashMap<AssetId, Attempts>>,
    retries_in_flight: AtomicUsize,
}

/// Cloneable handle to a running [`AnalysisWorker`].
#[derive(Clone)]
pub struct WorkerHandle {
    worker: Arc<AnalysisWorker>,
    shutdown_tx: mpsc::Sender<()>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl AnalysisWorker {
    pub fn new(
        cache: Arc<AnalysisCache>,
        catalog: Arc<Catalog>,
        extractor: Arc<dyn FeatureExtractor>,
        pressure: Arc<dyn PressureSignal>,
        config: WorkerConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            scheduler: AnalysisScheduler::new(),
            cache,
            catalog,
            extractor,
            pressure,
            config,
            wake: Notify::new(),
            event_tx,
            draining: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            attempts: Mutex::new(HashMap::new()),
            retries_in_flight: AtomicUsize::new(0),
        }
    }

    /// Spawn the run loop on the current tokio runtime.
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let worker = Arc::new(self);
        let task = tokio::spawn(worker.clone().run(shutdown_rx));
        WorkerHandle {
            worker,
            shutdown_tx,
            task: Arc::new(Mutex::new(Some(task))),
        }
    }

    fn emit(&self, event: WorkerEvent) {
        // No subscribers is fine.
        let _ = self.event_tx.send(event);
    }

    #[instrument(skip_all, name = "analysis_worker")]
    async fn run(self: Arc<Self>, mut shutdown_rx: mpsc::Receiver<()>) {
        info!(
            chunk_size = self.config.chunk_size,
            flush_count = self.config.flush_count,
            flush_interval_ms = self.config.flush_interval.as_millis() as u64,
            "Analysis worker started"
        );

        loop {
            if self.scheduler.has_pending() {
                if !self.drain(&mut shutdown_rx).await {
                    break;
                }
                continue;
            }
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = self.wake.notified() => {}
            }
        }

        self.stopped.store(true, Ordering::SeqCst);
        info!("Analysis worker stopped");
    }

    /// One `Draining` run. Returns `false` when shutdown was requested.
    async fn drain(self: &Arc<Self>, shutdown_rx: &mut mpsc::Receiver<()>) -> bool {
        self.draining.store(true, Ordering::SeqCst);
        let pending = self.scheduler.pending_count();
        debug!(pending, "Draining analysis queue");
        self.emit(WorkerEvent::DrainStarted { pending });

        let mut buffer: Vec<AnalysisCacheEntry> = Vec::new();
        let mut last_flush = Instant::now();
        let mut analyzed = 0usize;
        let mut keep_running = true;

        loop {
            if shutdown_rx.try_recv().is_ok() {
                keep_running = false;
                break;
            }
            let batch = self.scheduler.next_batch(self.config.chunk_size);
            if batch.is_empty() {
                break;
            }

            for id in batch {
                match self.analyze_one(&id).await {
                    Outcome::Analyzed(entry) => {
                        analyzed += 1;
                        buffer.push(entry);
                        self.emit(WorkerEvent::Analyzed { id });
                    }
                    Outcome::Failed(message) => self.record_failure(id, message),
                    Outcome::Skipped => {}
                }

                let due = buffer.len() >= self.config.flush_count
                    || (!buffer.is_empty() && last_flush.elapsed() >= self.config.flush_interval);
                if due {
                    self.flush(&mut buffer);
                    last_flush = Instant::now();
                }
            }

            let level = self.pressure.level();
            if level != PressureLevel::Nominal {
                debug!(?level, "Throttling analysis under system pressure");
            }
            tokio::select! {
                _ = sleep(level.backoff(self.config.pressure_backoff)) => {}
                _ = shutdown_rx.recv() => {
                    keep_running = false;
                    break;
                }
            }
        }

        self.finish_run(buffer, analyzed).await;
        self.draining.store(false, Ordering::SeqCst);
        self.emit(WorkerEvent::Idle);
        keep_running
    }

    async fn analyze_one(&self, id: &AssetId) -> Outcome {
        let record = match self.catalog.get_asset(id) {
            Ok(Some(record)) => record,
            Ok(None) => return Outcome::Skipped,
            Err(e) => {
                warn!(%id, error = %e, "Catalog lookup failed");
                return Outcome::Skipped;
            }
        };
        if !record.media_type.is_analyzable() {
            return Outcome::Skipped;
        }
        // Another writer may have analyzed it since it was queued.
        if self.cache.fresh(id, record.byte_size).is_some() {
            return Outcome::Skipped;
        }
        if self.retries_exhausted(id, record.byte_size) {
            return Outcome::Skipped;
        }

        match self.extractor.analyze(id).await {
            Ok(features) => {
                lock(&self.attempts).remove(id);
                Outcome::Analyzed(AnalysisCacheEntry::from_features(
                    id.clone(),
                    record.byte_size,
                    record.tags.contains(AssetTags::SCREENSHOT),
                    features,
                    self.cache.schema_version(),
                    self.config.blur_threshold,
                ))
            }
            Err(e) => {
                // Remember which file version failed.
                let mut attempts = lock(&self.attempts);
                let entry = attempts.entry(id.clone()).or_insert(Attempts {
                    byte_size: record.byte_size,
                    failures: 0,
                });
                if entry.byte_size != record.byte_size {
                    *entry = Attempts {
                        byte_size: record.byte_size,
                        failures: 0,
                    };
                }
                Outcome::Failed(e.to_string())
            }
        }
    }

    fn retries_exhausted(&self, id: &str, byte_size: u64) -> bool {
        lock(&self.attempts)
            .get(id)
            .is_some_and(|a| a.byte_size == byte_size && a.failures > self.config.max_retries)
    }

    /// Count the failure and, while attempts remain, re-queue at `normal`
    /// after an exponential backoff.
    fn record_failure(self: &Arc<Self>, id: AssetId, message: String) {
        let attempt = {
            let mut attempts = lock(&self.attempts);
            match attempts.get_mut(&id) {
                Some(a) => {
                    a.failures += 1;
                    a.failures
                }
                None => 1,
            }
        };
        let will_retry = attempt <= self.config.max_retries;
        warn!(%id, attempt, will_retry, error = %message, "Feature extraction failed");
        self.emit(WorkerEvent::Failed {
            id: id.clone(),
            attempt,
            error: message,
            will_retry,
        });

        if will_retry {
            let delay = self
                .config
                .retry_backoff
                .saturating_mul(2u32.saturating_pow(attempt - 1));
            self.retries_in_flight.fetch_add(1, Ordering::SeqCst);
            let worker = Arc::clone(self);
            tokio::spawn(async move {
                sleep(delay).await;
                if !worker.stopped.load(Ordering::SeqCst) {
                    worker.scheduler.enqueue([id], Priority::Normal);
                    worker.wake.notify_one();
                }
                worker.retries_in_flight.fetch_sub(1, Ordering::SeqCst);
            });
        }
    }

    fn flush(&self, buffer: &mut Vec<AnalysisCacheEntry>) {
        if buffer.is_empty() {
            return;
        }
        let entries: Vec<AnalysisCacheEntry> = std::mem::take(buffer);
        if let Err(e) = self.catalog.apply_analysis(&entries) {
            error!(error = %e, "Failed to write analysis to catalog");
        }
        let count = entries.len();
        self.cache.put(entries);
        debug!(entries = count, "Flushed analysis results");
        self.emit(WorkerEvent::Flushed { entries: count });
    }

    /// Write what is left in the buffer, re-cluster the whole library when
    /// anything new was analyzed, and persist both in one cache write.
    async fn finish_run(&self, buffer: Vec<AnalysisCacheEntry>, analyzed: usize) {
        if let Err(e) = self.catalog.apply_analysis(&buffer) {
            error!(error = %e, "Failed to write analysis to catalog");
        }
        let flushed = buffer.len();

        if analyzed == 0 {
            if flushed > 0 {
                self.cache.put(buffer);
                self.emit(WorkerEvent::Flushed { entries: flushed });
            }
            return;
        }

        let outcome = match self.cluster().await {
            Ok(result) => self.store_clusters(result, buffer),
            Err(e) => {
                self.cache.put(buffer);
                Err(e)
            }
        };
        match outcome {
            Ok(stored) => {
                info!(
                    groups = stored.groups.len(),
                    grouped_assets = stored.grouped_count(),
                    analyzed,
                    "Analysis run complete"
                );
                self.emit(WorkerEvent::Clustered {
                    groups: stored.groups.len(),
                    grouped_assets: stored.grouped_count(),
                });
            }
            Err(e) => error!(error = %e, "Similarity clustering failed"),
        }
        if flushed > 0 {
            self.emit(WorkerEvent::Flushed { entries: flushed });
        }
    }

    /// Full clustering pass over every analyzed asset in the catalog.
    async fn cluster(&self) -> Result<matching::ClusterResult> {
        let inputs = self.catalog.clustering_inputs()?;
        let params = self.config.cluster;
        tokio::task::spawn_blocking(move || matching::find_similar(&inputs, params))
            .await
            .map_err(|e| Error::task("clustering", e))
    }

    /// Replace the catalog's groups with `result`, then stamp the cache with
    /// the groups the catalog kept. Groups whose members were deleted in the
    /// meantime never reach the cache. Returns the stored groups.
    fn store_clusters(
        &self,
        result: matching::ClusterResult,
        buffer: Vec<AnalysisCacheEntry>,
    ) -> Result<matching::ClusterResult> {
        let stored = self
            .catalog
            .replace_groups(&result)
            .and_then(|_| self.catalog.list_groups());
        match stored {
            Ok(groups) => {
                let stored = matching::ClusterResult {
                    groups,
                    scores: result.scores,
                };
                self.cache.commit(buffer, Some(&stored.assignments()));
                Ok(stored)
            }
            Err(e) => {
                self.cache.put(buffer);
                Err(e)
            }
        }
    }
}

impl WorkerHandle {
    /// Queue ids and wake the worker. Returns how many were newly queued.
    pub fn enqueue(&self, ids: Vec<AssetId>, priority: Priority) -> usize {
        if ids.is_empty() {
            return 0;
        }
        if self.worker.stopped.load(Ordering::SeqCst) {
            debug!(count = ids.len(), "Worker stopped, ignoring enqueue");
            return 0;
        }
        let queued = self.worker.scheduler.enqueue(ids, priority);
        if queued > 0 {
            self.worker.wake.notify_one();
        }
        queued
    }

    /// Drop queued ids, e.g. for assets that were deleted.
    pub fn forget(&self, ids: &[AssetId]) {
        self.worker.scheduler.forget(ids);
        let mut attempts = lock(&self.worker.attempts);
        for id in ids {
            attempts.remove(id);
        }
    }

    /// Clear the queue and failure history ahead of a full reload.
    pub fn reset(&self) {
        self.worker.scheduler.reset();
        lock(&self.worker.attempts).clear();
    }

    pub fn state(&self) -> WorkerState {
        if self.worker.draining.load(Ordering::SeqCst) {
            WorkerState::Draining
        } else {
            WorkerState::Idle
        }
    }

    pub fn pending_count(&self) -> usize {
        self.worker.scheduler.pending_count()
    }

    /// Idle with an empty queue and no retry waiting to fire.
    pub fn is_idle(&self) -> bool {
        self.state() == WorkerState::Idle
            && !self.worker.scheduler.has_pending()
            && self.worker.retries_in_flight.load(Ordering::SeqCst) == 0
    }

    pub fn is_stopped(&self) -> bool {
        self.worker.stopped.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.worker.event_tx.subscribe()
    }

    /// Resolve once the worker has nothing left to do.
    pub async fn wait_idle(&self) {
        let mut events = self.events();
        loop {
            if self.is_idle() || self.is_stopped() {
                return;
            }
            // Retries settle without an event, so poll as well.
            tokio::select! {
                event = events.recv() => {
                    if let Err(broadcast::error::RecvError::Closed) = event {
                        return;
                    }
                }
                _ = sleep(IDLE_POLL_INTERVAL) => {}
            }
        }
    }

    /// Ask the worker to stop after flushing its buffer, and wait for it.
    pub async fn shutdown(&self) -> Result<()> {
        if self.is_stopped() {
            return Err(Error::WorkerStopped);
        }
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| Error::WorkerStopped)?;
        let task = lock(&self.task).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(error = %e, "Analysis worker task panicked");
            }
        }
        Ok(())
    }
}
