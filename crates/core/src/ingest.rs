//! Generation-stamped paging over the asset source.
//!
//! Each [`PagingStream::start`] mints a new generation. The background task
//! re-checks its generation before every step and stops as soon as it is
//! stale, and receivers drop events from older generations, so a scope
//! switch never leaks pages from the previous scope.
//!
//! Background resyncs count generations separately, so a resync and a
//! user-started walk never cancel each other.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};

use crate::cache::{AnalysisCache, AnalysisCacheEntry};
use crate::catalog::Catalog;
use crate::domain::{AssetDescriptor, AssetId, AssetRecord, AssetTags, Scope};
use crate::scheduler::Priority;
use crate::source::{lock, AssetSource};
use crate::worker::WorkerHandle;

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEventKind {
    Switching { scope: Scope },
    /// First page. `cursor` is the offset of the next page, `None` when done.
    InitialReady {
        records: Vec<AssetRecord>,
        cursor: Option<usize>,
    },
    Append {
        records: Vec<AssetRecord>,
        cursor: Option<usize>,
    },
    Finished { total: usize },
    /// The source failed; no further events follow.
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent {
    pub generation: u64,
    pub kind: StreamEventKind,
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            StreamEventKind::Finished { .. } | StreamEventKind::Failed { .. }
        )
    }
}

/// Receiving end of one generation. Yields `None` once the stream ends or a
/// newer generation has started.
pub struct StreamReceiver {
    generation: u64,
    current: Arc<AtomicU64>,
    rx: mpsc::UnboundedReceiver<StreamEvent>,
}

impl StreamReceiver {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub async fn recv(&mut self) -> Option<StreamEvent> {
        let event = self.rx.recv().await?;
        if self.current.load(Ordering::SeqCst) != self.generation || event.generation != self.generation {
            self.rx.close();
            return None;
        }
        if event.is_terminal() {
            self.rx.close();
        }
        Some(event)
    }

    /// Drain to the end, returning every event seen.
    pub async fn collect(mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.recv().await {
            events.push(event);
        }
        events
    }
}

#[derive(Debug, Clone)]
pub struct PagingConfig {
    pub page_size: usize,
    pub pacing: Duration,
    pub large_file_threshold: u64,
}

struct Pipeline {
    source: Arc<dyn AssetSource>,
    cache: Arc<AnalysisCache>,
    catalog: Arc<Catalog>,
    worker: WorkerHandle,
    config: PagingConfig,
}

pub struct PagingStream {
    generation: Arc<AtomicU64>,
    resync_generation: Arc<AtomicU64>,
    pipeline: Arc<Pipeline>,
    task: Mutex<Option<JoinHandle<()>>>,
    resync_task: Mutex<Option<JoinHandle<()>>>,
}

impl PagingStream {
    pub fn new(
        source: Arc<dyn AssetSource>,
        cache: Arc<AnalysisCache>,
        catalog: Arc<Catalog>,
        worker: WorkerHandle,
        config: PagingConfig,
    ) -> Self {
        Self {
            generation: Arc::new(AtomicU64::new(0)),
            resync_generation: Arc::new(AtomicU64::new(0)),
            pipeline: Arc::new(Pipeline {
                source,
                cache,
                catalog,
                worker,
                config: PagingConfig {
                    page_size: config.page_size.max(1),
                    ..config
                },
            }),
            task: Mutex::new(None),
            resync_task: Mutex::new(None),
        }
    }

    pub fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Begin paging `scope` under a new generation. Any earlier generation
    /// stops at its next checkpoint.
    pub fn start(&self, scope: Scope) -> StreamReceiver {
        let rx = self.spawn(scope, &self.generation, &self.task);
        info!(generation = rx.generation, %scope, "Paging stream started");
        rx
    }

    /// Walk the whole library in the background. Supersedes only an earlier
    /// resync; streams from [`PagingStream::start`] keep running.
    pub fn resync(&self) -> StreamReceiver {
        let rx = self.spawn(Scope::All, &self.resync_generation, &self.resync_task);
        info!(generation = rx.generation, "Resync started");
        rx
    }

    fn spawn(
        &self,
        scope: Scope,
        counter: &Arc<AtomicU64>,
        slot: &Mutex<Option<JoinHandle<()>>>,
    ) -> StreamReceiver {
        let generation = counter.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = mpsc::unbounded_channel();
        let pipeline = self.pipeline.clone();
        let current = counter.clone();
        let task = tokio::spawn(async move {
            pipeline.run(scope, generation, current, tx).await;
        });
        // The previous task is not aborted; it observes the new generation.
        *lock(slot) = Some(task);

        StreamReceiver {
            generation,
            current: counter.clone(),
            rx,
        }
    }

    /// Invalidate the current generation and any resync without starting
    /// new ones.
    pub fn cancel(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.resync_generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Wait for the most recently started tasks to exit.
    pub async fn join(&self) {
        let tasks = [lock(&self.task).take(), lock(&self.resync_task).take()];
        for task in tasks.into_iter().flatten() {
            let _ = task.await;
        }
    }
}

impl Pipeline {
    #[instrument(skip_all, fields(%scope, generation))]
    async fn run(
        &self,
        scope: Scope,
        generation: u64,
        current: Arc<AtomicU64>,
        tx: mpsc::UnboundedSender<StreamEvent>,
    ) {
        let live = || current.load(Ordering::SeqCst) == generation;
        let emit = |kind: StreamEventKind| {
            if live() {
                let _ = tx.send(StreamEvent { generation, kind });
                true
            } else {
                false
            }
        };

        if !emit(StreamEventKind::Switching { scope }) {
            return;
        }

        let page_size = self.config.page_size;
        let mut offset = 0usize;
        let mut seen: HashSet<AssetId> = HashSet::new();
        let mut first = true;

        loop {
            if !first {
                sleep(self.config.pacing).await;
            }
            if !live() {
                debug!(generation, "Stale generation, stopping before fetch");
                return;
            }

            let page = match self.source.enumerate(scope, offset, page_size).await {
                Ok(page) => page,
                Err(e) => {
                    warn!(generation, offset, error = %e, "Asset source enumeration failed");
                    emit(StreamEventKind::Failed {
                        error: e.to_string(),
                    });
                    return;
                }
            };
            if !live() {
                debug!(generation, "Stale generation, dropping fetched page");
                return;
            }

            let fetched = page.len();
            let done = fetched < page_size;
            offset += fetched;
            seen.extend(page.iter().map(|d| d.id.clone()));

            let priority = if first { Priority::High } else { Priority::Normal };
            let records = self.merge_and_store(&page, priority);
            let cursor = (!done).then_some(offset);

            let kind = if first {
                StreamEventKind::InitialReady { records, cursor }
            } else if records.is_empty() {
                break;
            } else {
                StreamEventKind::Append { records, cursor }
            };
            if !emit(kind) {
                return;
            }
            if done {
                break;
            }
            first = false;
        }

        if scope == Scope::All && live() {
            self.prune(seen, &current, generation).await;
        }
        emit(StreamEventKind::Finished { total: offset });
        debug!(generation, total = offset, "Paging stream finished");
    }

    /// Merge fresh cache entries into the page, upsert it, and queue the
    /// assets whose analysis is missing or stale.
    fn merge_and_store(&self, page: &[AssetDescriptor], priority: Priority) -> Vec<AssetRecord> {
        let snapshot = self
            .cache
            .snapshot(page.iter().map(|d| (d.id.as_str(), d.byte_size)));

        let mut stale = Vec::new();
        let records: Vec<AssetRecord> = page
            .iter()
            .map(|desc| {
                let mut record = AssetRecord::from_descriptor(desc, self.config.large_file_threshold);
                match snapshot.get(&desc.id) {
                    Some(entry) => merge_analysis(&mut record, entry),
                    None if desc.media_type.is_analyzable() => stale.push(desc.id.clone()),
                    None => {}
                }
                record
            })
            .collect();

        if let Err(e) = self.catalog.upsert_assets(&records) {
            warn!(error = %e, count = records.len(), "Failed to index page");
        }
        if !stale.is_empty() {
            let queued = self.worker.enqueue(stale, priority);
            debug!(queued, ?priority, "Queued assets for analysis");
        }
        records
    }

    /// After a complete walk of the library, drop everything the source no
    /// longer has. Offsets shift when the library changes mid-walk, so ids
    /// the walk did not see are confirmed with `describe` before deletion;
    /// any that still exist are indexed instead.
    async fn prune(&self, mut seen: HashSet<AssetId>, current: &AtomicU64, generation: u64) {
        let catalog_ids = match self.catalog.all_asset_ids() {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "Failed to list catalog, skipping prune");
                return;
            }
        };
        let unseen: Vec<AssetId> = catalog_ids
            .into_iter()
            .chain(self.cache.ids())
            .filter(|id| !seen.contains(id))
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();

        if !unseen.is_empty() {
            let alive = match self.source.describe(&unseen).await {
                Ok(alive) => alive,
                Err(e) => {
                    warn!(error = %e, "Could not confirm missing assets, skipping prune");
                    return;
                }
            };
            if current.load(Ordering::SeqCst) != generation {
                return;
            }
            if !alive.is_empty() {
                debug!(count = alive.len(), "Walk skipped live assets, indexing them");
                self.merge_and_store(&alive, Priority::Normal);
                seen.extend(alive.into_iter().map(|d| d.id));
            }
        }

        let pruned_cache = self.cache.prune_missing(&seen);
        match self.catalog.prune_missing(&seen) {
            Ok(removed) => {
                if !removed.is_empty() {
                    self.worker.forget(&removed);
                }
                info!(
                    catalog = removed.len(),
                    cache = pruned_cache,
                    "Pruned assets missing from the library"
                );
            }
            Err(e) => warn!(error = %e, "Failed to prune catalog"),
        }
    }
}

/// Copy cached analysis onto a freshly built record.
pub(crate) fn merge_analysis(record: &mut AssetRecord, entry: &AnalysisCacheEntry) {
    record.perceptual_hash = entry.perceptual_hash;
    record.blur_score = entry.blur_score;
    record.document_score = entry.document_score();
    let analysis = entry.analysis_tags();
    for tag in [AssetTags::BLURRED, AssetTags::DOCUMENT, AssetTags::TEXT_HEAVY] {
        record.tags.set(tag, analysis.contains(tag));
    }
    record.group_identifier = entry.similarity_group_id.clone();
}
