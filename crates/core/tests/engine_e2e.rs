use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use photosift_core::{
    AssetDescriptor, AssetId, AssetSource, Decision, Engine, EngineConfig, Error, FeatureExtractor,
    FeedStatus, Features, GroupedKind, InMemorySource, ManualPressure, MediaType, PendingKind,
    QueryIntent, RankedKind, Result, Scope, StreamEventKind,
};

/// Extractor that hashes `dup*` ids identically and counts its calls.
#[derive(Default)]
struct CountingExtractor {
    calls: AtomicUsize,
}

#[async_trait]
impl FeatureExtractor for CountingExtractor {
    async fn analyze(&self, id: &AssetId) -> Result<Features> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let perceptual_hash = if id.starts_with("dup") {
            0xDEAD_BEEF
        } else {
            // Far apart for distinct ids.
            let seed = id.bytes().fold(0u64, |h, b| h.wrapping_mul(31).wrapping_add(b as u64));
            seed.wrapping_mul(0x9E37_79B9_7F4A_7C15)
        };
        Ok(Features {
            sharpness: if id.starts_with("blurry") { 0.1 } else { 0.9 },
            exposure_bad: false,
            perceptual_hash,
            feature_vector: vec![0xAB],
            is_document_like: id.starts_with("doc"),
            is_text_heavy: false,
        })
    }
}

fn asset(id: &str, secs: i64) -> AssetDescriptor {
    AssetDescriptor {
        id: id.to_string(),
        capture_date: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
        byte_size: 2048,
        pixel_width: 4032,
        pixel_height: 3024,
        media_type: MediaType::Photo,
        file_name: format!("{id}.heic"),
        album_name: None,
        is_screenshot: false,
    }
}

fn video(id: &str, secs: i64) -> AssetDescriptor {
    AssetDescriptor {
        media_type: MediaType::Video,
        file_name: format!("{id}.mov"),
        ..asset(id, secs)
    }
}

fn fast_config() -> EngineConfig {
    EngineConfig::default()
        .with_page_pacing(Duration::from_millis(1))
        .with_flush(8, Duration::from_millis(20))
        .with_pressure_backoff(Duration::from_millis(1))
        .with_retries(0, Duration::from_millis(1))
}

fn start(config: EngineConfig, source: Arc<InMemorySource>) -> (Engine, Arc<CountingExtractor>) {
    let extractor = Arc::new(CountingExtractor::default());
    let engine = Engine::start(
        config,
        source,
        extractor.clone(),
        Arc::new(ManualPressure::default()),
    );
    (engine, extractor)
}

/// Poll `check` until it holds or two seconds pass.
async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

// ── Decisions ────────────────────────────────────────────────────

#[tokio::test]
async fn test_pending_decision_is_visible_in_the_right_feeds() {
    let source = Arc::new(InMemorySource::new(vec![asset("x", 0), asset("y", 60)]));
    let (engine, _) = start(fast_config(), source);
    engine.reload().await.unwrap();
    engine.wait_idle().await;

    engine
        .apply_decision(&["x".to_string()], Decision::PendingDeletion)
        .unwrap();

    let all = engine.ensure_feed(QueryIntent::Sequential(Scope::All)).unwrap();
    assert!(all.asset_ids().contains(&"x"));

    let pending = engine
        .ensure_feed(QueryIntent::Pending(PendingKind::PendingDeletion))
        .unwrap();
    assert_eq!(pending.asset_ids(), vec!["x"]);

    let skipped = engine
        .ensure_feed(QueryIntent::Pending(PendingKind::Skipped))
        .unwrap();
    assert!(skipped.items.is_empty());

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_skipped_assets_group_by_month() {
    let source = Arc::new(InMemorySource::new(vec![
        asset("a", 0),
        asset("b", 40 * 24 * 3600),
        asset("c", 41 * 24 * 3600),
    ]));
    let (engine, _) = start(fast_config(), source);
    engine.reload().await.unwrap();

    let ids: Vec<AssetId> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
    engine.apply_decision(&ids, Decision::Skipped).unwrap();

    let feed = engine
        .ensure_feed(QueryIntent::Grouped(GroupedKind::Skipped))
        .unwrap();
    let sizes: Vec<usize> = feed
        .items
        .iter()
        .filter_map(|i| i.as_group().map(|g| g.members.len()))
        .collect();
    // December (b, c) before November (a).
    assert_eq!(sizes, vec![2, 1]);

    engine.shutdown().await.unwrap();
}

// ── Similarity groups ────────────────────────────────────────────

#[tokio::test]
async fn test_deleting_one_of_a_pair_dissolves_the_group() {
    let source = Arc::new(InMemorySource::new(vec![
        asset("dup-1", 0),
        asset("dup-2", 1),
        asset("other", 500),
    ]));
    let (engine, _) = start(fast_config(), source);
    engine.reload().await.unwrap();
    engine.wait_idle().await;

    let group_id = engine
        .asset("dup-1")
        .unwrap()
        .group_identifier
        .expect("pair should be grouped");
    assert_eq!(engine.group(&group_id).unwrap().members.len(), 2);

    let similar = engine
        .ensure_feed(QueryIntent::Grouped(GroupedKind::Similar))
        .unwrap();
    assert_eq!(similar.items.len(), 1);

    let update = engine.remove_assets(&["dup-1".to_string()]).unwrap();
    assert!(update[&QueryIntent::Grouped(GroupedKind::Similar)]
        .items
        .is_empty());

    assert!(matches!(engine.group(&group_id), Err(Error::GroupNotFound(_))));
    assert!(engine.asset("dup-2").unwrap().group_identifier.is_none());
    assert!(matches!(engine.asset("dup-1"), Err(Error::AssetNotFound(_))));

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_distant_captures_are_never_grouped() {
    let source = Arc::new(InMemorySource::new(vec![asset("dup-1", 0), asset("dup-2", 3600)]));
    let (engine, _) = start(fast_config(), source);
    engine.reload().await.unwrap();
    engine.wait_idle().await;

    assert!(engine.asset("dup-1").unwrap().group_identifier.is_none());
    assert!(engine.asset("dup-2").unwrap().group_identifier.is_none());
    assert_eq!(engine.dashboard_snapshot().unwrap().similar_group_count, 0);

    engine.shutdown().await.unwrap();
}

// ── Change notifications ─────────────────────────────────────────

#[tokio::test]
async fn test_source_changes_flow_into_the_catalog() {
    let source = Arc::new(InMemorySource::new(vec![asset("a", 0)]));
    let (engine, extractor) = start(fast_config(), source.clone());
    engine.reload().await.unwrap();
    engine.wait_idle().await;
    assert_eq!(extractor.calls.load(Ordering::SeqCst), 1);

    source.upsert(vec![asset("b", 10)]);
    assert!(
        eventually(|| engine
            .asset("b")
            .map(|r| r.perceptual_hash.is_some())
            .unwrap_or(false))
        .await,
        "added asset should be indexed and analyzed"
    );

    // A new byte size invalidates the cached analysis.
    source.upsert(vec![AssetDescriptor {
        byte_size: 4096,
        ..asset("a", 0)
    }]);
    assert!(
        eventually(|| extractor.calls.load(Ordering::SeqCst) == 3).await,
        "resized asset should be re-analyzed"
    );
    assert!(
        eventually(|| engine
            .asset("a")
            .map(|r| r.byte_size == 4096 && r.perceptual_hash.is_some())
            .unwrap_or(false))
        .await
    );

    source.remove(&["b".to_string()]);
    assert!(eventually(|| engine.asset("b").is_err()).await);

    engine.shutdown().await.unwrap();
}

// ── Persistence ──────────────────────────────────────────────────

#[tokio::test]
async fn test_analysis_survives_restart_and_reload_prunes() {
    let tmp = tempfile::tempdir().unwrap();
    let config = || EngineConfig::in_dir(tmp.path()).with_page_pacing(Duration::from_millis(1));

    {
        let source = Arc::new(InMemorySource::new(vec![
            asset("keep", 0),
            asset("gone", 100),
        ]));
        let (engine, extractor) = start(config(), source);
        engine.reload().await.unwrap();
        engine.wait_idle().await;
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 2);
        engine.shutdown().await.unwrap();
    }
    assert!(tmp.path().join("analysis-cache.json").exists());
    assert!(tmp.path().join("catalog.db").exists());

    let source = Arc::new(InMemorySource::new(vec![asset("keep", 0)]));
    let (engine, extractor) = start(config(), source);
    assert!(engine.asset("gone").is_ok(), "catalog rows persist");

    engine.reload().await.unwrap();
    engine.wait_idle().await;

    assert_eq!(extractor.calls.load(Ordering::SeqCst), 0, "cache hit, no re-analysis");
    assert!(engine.asset("keep").unwrap().perceptual_hash.is_some());
    assert!(engine.asset("gone").is_err(), "missing asset pruned");

    engine.shutdown().await.unwrap();
}

// ── Pagination ───────────────────────────────────────────────────

#[tokio::test]
async fn test_sequential_feed_pages_without_duplicates() {
    let clips: Vec<AssetDescriptor> = (0..70).map(|i| video(&format!("v{i:02}"), i * 10)).collect();
    let source = Arc::new(InMemorySource::new(clips));
    let (engine, _) = start(fast_config(), source);
    engine.reload().await.unwrap();

    let intent = QueryIntent::Sequential(Scope::All);
    let first = engine.ensure_feed(intent).unwrap();
    assert_eq!(first.items.len(), 60);
    assert_eq!(first.status, FeedStatus::Streaming);
    let cursor = first.cursor.expect("more pages");
    assert_eq!(cursor.offset, 60);
    assert_eq!(first.asset_ids()[0], "v69", "newest first");

    let second = engine.request_next_page(intent).unwrap();
    assert_eq!(second.items.len(), 70);
    assert_eq!(second.status, FeedStatus::Exhausted);
    assert!(second.cursor.is_none());
    let unique: HashSet<&str> = second.asset_ids().into_iter().collect();
    assert_eq!(unique.len(), 70);

    // Exhausted feeds stay put.
    assert_eq!(engine.request_next_page(intent).unwrap().items.len(), 70);

    // A mutation rebuilds feeds under a new context.
    engine
        .apply_decision(&["v00".to_string()], Decision::Skipped)
        .unwrap();
    assert!(matches!(
        engine.request_page_after(intent, cursor),
        Err(Error::StaleCursor)
    ));

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_ranked_feed_orders_by_metric() {
    let source = Arc::new(InMemorySource::new(vec![
        AssetDescriptor {
            byte_size: 50 * 1024 * 1024,
            ..asset("big", 0)
        },
        AssetDescriptor {
            byte_size: 30 * 1024 * 1024,
            ..asset("bigger-than-threshold", 10)
        },
        asset("small", 20),
    ]));
    let (engine, _) = start(fast_config(), source);
    engine.reload().await.unwrap();

    let feed = engine
        .ensure_feed(QueryIntent::Ranked(RankedKind::LargeFile))
        .unwrap();
    assert_eq!(feed.asset_ids(), vec!["big", "bigger-than-threshold"]);

    engine.shutdown().await.unwrap();
}

// ── Ingestion ────────────────────────────────────────────────────

#[tokio::test]
async fn test_second_ingest_supersedes_the_first() {
    let many: Vec<AssetDescriptor> = (0..40).map(|i| video(&format!("v{i}"), i)).collect();
    let source = Arc::new(InMemorySource::new(many));
    let config = fast_config().with_ingest_page_size(1);
    let (engine, _) = start(config, source);

    let mut first = engine.ingest(Scope::All);
    let second = engine.ingest(Scope::All);
    assert!(second.generation() > first.generation());

    assert!(first.recv().await.is_none(), "stale generation leaked events");

    let events = second.collect().await;
    assert!(matches!(
        events.last().map(|e| &e.kind),
        Some(StreamEventKind::Finished { total: 40 })
    ));

    engine.shutdown().await.unwrap();
}

// ── Aggregates ───────────────────────────────────────────────────

#[tokio::test]
async fn test_dashboard_and_timeline() {
    let nov = 0;
    let dec = 30 * 24 * 3600;
    let source = Arc::new(InMemorySource::new(vec![
        asset("blurry-1", nov),
        asset("doc-1", nov + 100),
        video("clip", dec),
        asset("plain", dec + 100),
    ]));
    let (engine, _) = start(fast_config(), source);
    engine.reload().await.unwrap();
    engine.wait_idle().await;
    engine
        .apply_decision(&["plain".to_string()], Decision::PendingDeletion)
        .unwrap();

    let snapshot = engine.dashboard_snapshot().unwrap();
    assert_eq!(snapshot.total_count, 4);
    assert_eq!(snapshot.video_count, 1);
    assert_eq!(snapshot.photo_count, 3);
    assert_eq!(snapshot.blurred_count, 1);
    assert_eq!(snapshot.document_count, 1);
    assert_eq!(snapshot.pending_deletion_count, 1);
    assert_eq!(snapshot.pending_deletion_bytes, 2048);
    assert_eq!(snapshot.total_bytes, 4 * 2048);

    let buckets = engine.timeline_buckets().unwrap();
    assert_eq!(buckets.len(), 2);
    assert!(buckets[0].month > buckets[1].month, "newest month first");
    assert_eq!(buckets[0].asset_count, 2);
    assert_eq!(buckets[0].pending_count, 1);
    assert_eq!(buckets[0].cover.as_deref(), Some("clip"));
    assert_eq!(buckets[1].blurred_count, 1);
    assert_eq!(buckets[1].document_count, 1);

    engine.shutdown().await.unwrap();
}

// ── Degraded mode ────────────────────────────────────────────────

#[tokio::test]
async fn test_unopenable_catalog_degrades_to_empty_results() {
    let tmp = tempfile::tempdir().unwrap();
    // A directory where the database file should be.
    let blocked = tmp.path().join("catalog.db");
    std::fs::create_dir_all(&blocked).unwrap();

    let source = Arc::new(InMemorySource::new(vec![asset("a", 0)]));
    let (engine, _) = start(fast_config().with_catalog_path(&blocked), source.clone());
    assert!(engine.is_degraded());

    engine.reload().await.unwrap();
    let feed = engine.ensure_feed(QueryIntent::Sequential(Scope::All)).unwrap();
    assert!(feed.items.is_empty());
    assert_eq!(engine.dashboard_snapshot().unwrap().total_count, 0);
    assert_eq!(source.enumerate(Scope::All, 0, 10).await.unwrap().len(), 1);

    engine.shutdown().await.unwrap();
}
