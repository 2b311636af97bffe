//! Photo-library analysis and index engine.
//!
//! Pages assets out of an [`AssetSource`], caches expensive per-asset
//! analysis across restarts, clusters near-duplicates by capture time and
//! perceptual hash, and answers paginated [`QueryIntent`]s from a SQLite
//! catalog. [`Engine`] ties it together.

pub mod cache;
pub mod catalog;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod feed;
pub mod ingest;
pub mod matching;
pub mod pressure;
pub mod scheduler;
pub mod source;
pub mod worker;

pub use cache::{AnalysisCache, AnalysisCacheEntry};
pub use config::EngineConfig;
pub use domain::{
    AssetDescriptor, AssetId, AssetRecord, AssetTags, DashboardSnapshot, Decision, GroupId,
    MediaType, MonthBucket, MonthKey, Scope, SimilarityGroup,
};
pub use engine::{Engine, FeedUpdate};
pub use error::{Error, Result};
pub use feed::{
    Cursor, FeedItem, FeedState, FeedStatus, GroupKey, GroupView, GroupedKind, PendingKind,
    QueryIntent, RankedKind,
};
pub use ingest::{StreamEvent, StreamEventKind, StreamReceiver};
pub use pressure::{ManualPressure, PressureLevel, PressureSignal};
pub use scheduler::Priority;
pub use source::{AssetSource, ChangeSet, FeatureExtractor, Features, InMemorySource};
pub use worker::{WorkerEvent, WorkerHandle, WorkerState};
