//! The engine facade: one owned instance wiring the source, cache, catalog,
//! worker, paging stream and feeds together.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cache::AnalysisCache;
use crate::catalog::Catalog;
use crate::config::EngineConfig;
use crate::domain::{
    AssetId, AssetRecord, DashboardSnapshot, Decision, MonthBucket, Scope, SimilarityGroup,
};
use crate::error::{Error, Result};
use crate::feed::{Cursor, FeedRegistry, FeedState, GroupView, QueryIntent};
use crate::ingest::{merge_analysis, PagingConfig, PagingStream, StreamEventKind, StreamReceiver};
use crate::pressure::PressureSignal;
use crate::scheduler::Priority;
use crate::source::{lock, AssetSource, ChangeSet, FeatureExtractor};
use crate::worker::{AnalysisWorker, WorkerConfig, WorkerEvent, WorkerHandle};

const LAST_RELOAD_KEY: &str = "last_reload";

/// Result of a mutation: every open feed, re-queried.
pub type FeedUpdate = HashMap<QueryIntent, FeedState>;

struct Shared {
    source: Arc<dyn AssetSource>,
    cache: Arc<AnalysisCache>,
    catalog: Arc<Catalog>,
    worker: WorkerHandle,
    stream: PagingStream,
    feeds: FeedRegistry,
    large_file_threshold: u64,
}

pub struct Engine {
    shared: Arc<Shared>,
    config: EngineConfig,
    listener_shutdown: mpsc::Sender<()>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Open the cache and catalog, start the analysis worker and begin
    /// listening for library changes. Must be called inside a tokio runtime.
    ///
    /// Neither store failing to open is fatal: the cache starts empty and the
    /// catalog degrades to answering every query with nothing.
    pub fn start(
        config: EngineConfig,
        source: Arc<dyn AssetSource>,
        extractor: Arc<dyn FeatureExtractor>,
        pressure: Arc<dyn PressureSignal>,
    ) -> Self {
        let cache = Arc::new(match &config.cache_path {
            Some(path) => AnalysisCache::open(path, config.cache_schema_version),
            None => AnalysisCache::in_memory(config.cache_schema_version),
        });
        let catalog = Arc::new(Catalog::open_or_degraded(config.catalog_path.as_deref()));

        let worker = AnalysisWorker::new(
            cache.clone(),
            catalog.clone(),
            extractor,
            pressure,
            WorkerConfig::from(&config),
        )
        .start();

        let stream = PagingStream::new(
            source.clone(),
            cache.clone(),
            catalog.clone(),
            worker.clone(),
            PagingConfig {
                page_size: config.ingest_page_size,
                pacing: config.page_pacing,
                large_file_threshold: config.large_file_threshold,
            },
        );

        let shared = Arc::new(Shared {
            source,
            cache,
            catalog,
            worker,
            stream,
            feeds: FeedRegistry::new(),
            large_file_threshold: config.large_file_threshold,
        });

        let (listener_shutdown, shutdown_rx) = mpsc::channel(1);
        let listener = tokio::spawn(listen(shared.clone(), shutdown_rx));

        info!(
            catalog = ?config.catalog_path,
            cache = ?config.cache_path,
            degraded = shared.catalog.is_degraded(),
            "Engine started"
        );

        Self {
            shared,
            config,
            listener_shutdown,
            listener: Mutex::new(Some(listener)),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Whether the catalog failed to open and queries return nothing.
    pub fn is_degraded(&self) -> bool {
        self.shared.catalog.is_degraded()
    }

    /// Load the first page of `intent`, or return it as-is if already open.
    pub fn ensure_feed(&self, intent: QueryIntent) -> Result<FeedState> {
        self.shared.feeds.ensure(intent, &self.shared.catalog)
    }

    /// Append the next page of `intent`. Exhausted feeds come back unchanged.
    pub fn request_next_page(&self, intent: QueryIntent) -> Result<FeedState> {
        self.shared.feeds.next_page(intent, None, &self.shared.catalog)
    }

    /// Like [`Engine::request_next_page`], but rejects a cursor minted for a
    /// feed generation that has since been rebuilt.
    pub fn request_page_after(&self, intent: QueryIntent, cursor: Cursor) -> Result<FeedState> {
        self.shared
            .feeds
            .next_page(intent, Some(cursor), &self.shared.catalog)
    }

    /// Record a user decision and re-query every open feed.
    pub fn apply_decision(&self, ids: &[AssetId], decision: Decision) -> Result<FeedUpdate> {
        let updated = self.shared.catalog.apply_decision(ids, decision)?;
        info!(updated, %decision, "Applied decision");
        self.shared.feeds.refresh_all(&self.shared.catalog)
    }

    /// Drop assets from the index, dissolving groups they leave too small,
    /// and re-query every open feed.
    pub fn remove_assets(&self, ids: &[AssetId]) -> Result<FeedUpdate> {
        self.shared.remove(ids)?;
        self.shared.feeds.refresh_all(&self.shared.catalog)
    }

    pub fn dashboard_snapshot(&self) -> Result<DashboardSnapshot> {
        self.shared.catalog.dashboard()
    }

    pub fn timeline_buckets(&self) -> Result<Vec<MonthBucket>> {
        self.shared.catalog.month_buckets()
    }

    pub fn asset(&self, id: &str) -> Result<AssetRecord> {
        self.shared
            .catalog
            .get_asset(id)?
            .ok_or_else(|| Error::AssetNotFound(id.to_string()))
    }

    pub fn group(&self, id: &str) -> Result<SimilarityGroup> {
        self.shared
            .catalog
            .get_group(id)?
            .ok_or_else(|| Error::GroupNotFound(id.to_string()))
    }

    /// A similarity group with its member records resolved.
    pub fn group_view(&self, id: &str) -> Result<GroupView> {
        self.shared
            .catalog
            .group_view(id)?
            .ok_or_else(|| Error::GroupNotFound(id.to_string()))
    }

    /// When the last full reload finished, as RFC 3339.
    pub fn last_reload(&self) -> Result<Option<String>> {
        self.shared.catalog.get_config(LAST_RELOAD_KEY)
    }

    /// Page `scope` from the source into the catalog under a new generation.
    pub fn ingest(&self, scope: Scope) -> StreamReceiver {
        self.shared.stream.start(scope)
    }

    /// Re-walk the whole library from scratch. Returns the number of assets
    /// enumerated, or 0 when a newer ingest superseded the walk.
    pub async fn reload(&self) -> Result<usize> {
        self.shared.worker.reset();
        self.shared.feeds.clear();
        let Some(total) = walk_to_end(self.shared.stream.start(Scope::All)).await? else {
            debug!("Reload superseded by a newer ingest");
            return Ok(0);
        };
        self.shared
            .catalog
            .set_config(LAST_RELOAD_KEY, &Utc::now().to_rfc3339())?;
        info!(total, "Library reloaded");
        Ok(total)
    }

    /// Worker progress.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.shared.worker.events()
    }

    pub fn worker(&self) -> &WorkerHandle {
        &self.shared.worker
    }

    /// Resolve once the analysis queue is drained.
    pub async fn wait_idle(&self) {
        self.shared.worker.wait_idle().await;
    }

    /// Stop listening for changes, cancel paging, and let the worker flush
    /// before it exits.
    pub async fn shutdown(&self) -> Result<()> {
        let _ = self.listener_shutdown.send(()).await;
        let listener = lock(&self.listener).take();
        if let Some(listener) = listener {
            if let Err(e) = listener.await {
                error!(error = %e, "Change listener panicked");
            }
        }
        self.shared.stream.cancel();
        self.shared.stream.join().await;
        self.shared.worker.shutdown().await?;
        info!("Engine stopped");
        Ok(())
    }
}

impl Shared {
    fn remove(&self, ids: &[AssetId]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let removed = self.catalog.delete_assets(ids)?;
        self.cache.remove(ids);
        self.worker.forget(ids);
        debug!(removed, "Removed assets");
        Ok(removed)
    }

    /// Index added or changed assets and queue the ones needing analysis.
    async fn upsert_from_source(&self, ids: &[AssetId]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let descs = self.source.describe(ids).await?;
        let snapshot = self
            .cache
            .snapshot(descs.iter().map(|d| (d.id.as_str(), d.byte_size)));

        let mut stale = Vec::new();
        let records: Vec<AssetRecord> = descs
            .iter()
            .map(|desc| {
                let mut record = AssetRecord::from_descriptor(desc, self.large_file_threshold);
                match snapshot.get(&desc.id) {
                    Some(entry) => merge_analysis(&mut record, entry),
                    None if desc.media_type.is_analyzable() => stale.push(desc.id.clone()),
                    None => {}
                }
                record
            })
            .collect();

        let upserted = self.catalog.upsert_assets(&records)?;
        self.worker.enqueue(stale, Priority::High);
        Ok(upserted)
    }

    async fn apply_changes(&self, change: &ChangeSet) -> Result<()> {
        debug!(
            added = change.added.len(),
            removed = change.removed.len(),
            changed = change.changed.len(),
            "Library changed"
        );
        self.remove(&change.removed)?;
        let touched: Vec<AssetId> = change
            .added
            .iter()
            .chain(change.changed.iter())
            .cloned()
            .collect();
        self.upsert_from_source(&touched).await?;
        self.feeds.refresh_all(&self.catalog)?;
        Ok(())
    }
}

/// Drain a full-library walk. `None` when a newer generation superseded it.
async fn walk_to_end(mut rx: StreamReceiver) -> Result<Option<usize>> {
    while let Some(event) = rx.recv().await {
        match event.kind {
            StreamEventKind::Finished { total } => return Ok(Some(total)),
            StreamEventKind::Failed { error } => return Err(Error::SourceUnavailable(error)),
            _ => {}
        }
    }
    Ok(None)
}

/// Apply library changes and refresh feeds after each clustering pass until
/// told to stop.
async fn listen(shared: Arc<Shared>, mut shutdown_rx: mpsc::Receiver<()>) {
    let mut changes = shared.source.subscribe_changes();
    let mut worker_events = shared.worker.events();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            change = changes.recv() => match change {
                Ok(change) => {
                    if let Err(e) = shared.apply_changes(&change).await {
                        warn!(error = %e, "Failed to apply library changes");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "Missed library changes, re-walking the library");
                    let rx = shared.stream.resync();
                    tokio::spawn(async move {
                        match walk_to_end(rx).await {
                            Ok(Some(total)) => info!(total, "Library re-walk finished"),
                            Ok(None) => debug!("Library re-walk superseded"),
                            Err(e) => warn!(error = %e, "Library re-walk failed"),
                        }
                    });
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Asset source closed its change stream");
                    break;
                }
            },
            event = worker_events.recv() => match event {
                Ok(WorkerEvent::Clustered { .. }) => {
                    if let Err(e) = shared.feeds.refresh_all(&shared.catalog) {
                        warn!(error = %e, "Failed to refresh feeds after clustering");
                    }
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    debug!("Change listener stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AssetDescriptor, MediaType};
    use crate::feed::{FeedStatus, PendingKind};
    use crate::pressure::ManualPressure;
    use crate::source::{Features, InMemorySource};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::time::Duration;

    struct HashById;

    #[async_trait]
    impl FeatureExtractor for HashById {
        async fn analyze(&self, id: &AssetId) -> Result<Features> {
            let hash = if id.starts_with("dup") { 0xF0F0 } else { id.len() as u64 * 0x1111_1111_1111 };
            Ok(Features {
                sharpness: 0.9,
                exposure_bad: false,
                perceptual_hash: hash,
                feature_vector: Vec::new(),
                is_document_like: false,
                is_text_heavy: false,
            })
        }
    }

    fn desc(id: &str, secs: i64) -> AssetDescriptor {
        AssetDescriptor {
            id: id.to_string(),
            capture_date: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
            byte_size: 1000,
            pixel_width: 100,
            pixel_height: 100,
            media_type: MediaType::Photo,
            file_name: format!("{id}.jpg"),
            album_name: None,
            is_screenshot: false,
        }
    }

    fn engine(source: Arc<InMemorySource>) -> Engine {
        let config = EngineConfig::default()
            .with_page_pacing(Duration::from_millis(1))
            .with_flush(10, Duration::from_millis(50))
            .with_pressure_backoff(Duration::from_millis(1));
        Engine::start(
            config,
            source,
            Arc::new(HashById),
            Arc::new(ManualPressure::default()),
        )
    }

    #[tokio::test]
    async fn test_reload_indexes_and_clusters() {
        let source = Arc::new(InMemorySource::new(vec![
            desc("dup-a", 0),
            desc("dup-b", 1),
            desc("solo", 100),
        ]));
        let engine = engine(source);

        assert_eq!(engine.reload().await.unwrap(), 3);
        engine.wait_idle().await;

        let a = engine.asset("dup-a").unwrap();
        let group_id = a.group_identifier.clone().expect("grouped");
        let group = engine.group(&group_id).unwrap();
        assert_eq!(group.members.len(), 2);
        assert!(engine.asset("solo").unwrap().group_identifier.is_none());
        assert!(matches!(engine.asset("nope"), Err(Error::AssetNotFound(_))));
        assert!(matches!(engine.group("nope"), Err(Error::GroupNotFound(_))));
        let view = engine.group_view(&group_id).unwrap();
        assert_eq!(view.cover.as_deref(), Some(group.cover.as_str()));
        assert!(engine.last_reload().unwrap().is_some());

        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_decision_refreshes_open_feeds() {
        let source = Arc::new(InMemorySource::new(vec![desc("x", 0), desc("y", 10)]));
        let engine = engine(source);
        engine.reload().await.unwrap();

        let pending = QueryIntent::Pending(PendingKind::PendingDeletion);
        assert!(engine.ensure_feed(pending).unwrap().items.is_empty());

        let update = engine
            .apply_decision(&["x".to_string()], Decision::PendingDeletion)
            .unwrap();
        let state = &update[&pending];
        assert_eq!(state.asset_ids(), vec!["x"]);
        assert_eq!(state.status, FeedStatus::Exhausted);

        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_superseded_reload_is_not_stamped() {
        let source = Arc::new(InMemorySource::new(
            (0..10).map(|i| desc(&format!("a{i}"), i)).collect(),
        ));
        let config = EngineConfig::default()
            .with_ingest_page_size(1)
            .with_page_pacing(Duration::from_millis(20))
            .with_pressure_backoff(Duration::from_millis(1));
        let engine = Engine::start(
            config,
            source,
            Arc::new(HashById),
            Arc::new(ManualPressure::default()),
        );

        let (reloaded, _) = tokio::join!(engine.reload(), async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            engine.ingest(Scope::All)
        });
        assert_eq!(reloaded.unwrap(), 0);
        assert!(engine.last_reload().unwrap().is_none());

        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_missed_changes_rewalk_without_cancelling_ingest() {
        let source = Arc::new(InMemorySource::with_capacity(
            (0..20).map(|i| desc(&format!("a{i}"), i)).collect(),
            1,
        ));
        let config = EngineConfig::default()
            .with_ingest_page_size(2)
            .with_page_pacing(Duration::from_millis(5))
            .with_pressure_backoff(Duration::from_millis(1));
        let engine = Engine::start(
            config,
            source.clone(),
            Arc::new(HashById),
            Arc::new(ManualPressure::default()),
        );
        // Let the listener subscribe.
        tokio::task::yield_now().await;

        let user = engine.ingest(Scope::All);
        // More notifications than the channel holds, before the listener runs.
        for i in 0..8 {
            source.upsert(vec![desc(&format!("late{i}"), 100 + i)]);
        }

        let events = user.collect().await;
        assert!(
            matches!(
                events.last().map(|e| &e.kind),
                Some(StreamEventKind::Finished { .. })
            ),
            "the re-walk must not cancel the running ingest"
        );

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while engine.dashboard_snapshot().unwrap().total_count < 28 {
            assert!(tokio::time::Instant::now() < deadline, "library never fully indexed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_twice_reports_stopped_worker() {
        let engine = engine(Arc::new(InMemorySource::new(Vec::new())));
        engine.shutdown().await.unwrap();
        assert!(matches!(engine.shutdown().await, Err(Error::WorkerStopped)));
    }
}
