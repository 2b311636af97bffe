//! Query intents and their paginated feed state.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::catalog::Catalog;
use crate::domain::{AssetId, AssetRecord, AssetTags, DashboardSnapshot, GroupId, MonthBucket, MonthKey, Scope};
use crate::error::{Error, Result};
use crate::source::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GroupedKind {
    /// Similarity groups, highest confidence first.
    Similar,
    /// Skipped assets grouped by capture month, newest month first.
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RankedKind {
    LargeFile,
    Blurred,
    Document,
    Screenshot,
}

impl RankedKind {
    /// Assets qualify when any of these tags is set.
    pub fn mask(&self) -> AssetTags {
        match self {
            RankedKind::LargeFile => AssetTags::LARGE_FILE,
            RankedKind::Blurred => AssetTags::BLURRED,
            RankedKind::Document => AssetTags::DOCUMENT.union(AssetTags::TEXT_HEAVY),
            RankedKind::Screenshot => AssetTags::SCREENSHOT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PendingKind {
    PendingDeletion,
    Skipped,
}

/// Every query shape the catalog answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueryIntent {
    Sequential(Scope),
    Grouped(GroupedKind),
    Ranked(RankedKind),
    Pending(PendingKind),
    /// Month aggregates; `Some(month)` narrows to a single bucket.
    Bucketed(Option<MonthKey>),
    Dashboard,
}

impl QueryIntent {
    pub const fn page_size(&self) -> usize {
        match self {
            QueryIntent::Sequential(_) => 60,
            QueryIntent::Grouped(_) => 20,
            QueryIntent::Ranked(_) => 60,
            QueryIntent::Pending(_) => 60,
            QueryIntent::Bucketed(_) => 24,
            QueryIntent::Dashboard => 1,
        }
    }

    /// Intents whose whole answer is a single page.
    pub const fn is_singleton(&self) -> bool {
        matches!(self, QueryIntent::Dashboard | QueryIntent::Bucketed(Some(_)))
    }
}

impl fmt::Display for QueryIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryIntent::Sequential(Scope::All) => f.write_str("all"),
            QueryIntent::Sequential(Scope::Month(m)) => write!(f, "month:{m}"),
            QueryIntent::Grouped(GroupedKind::Similar) => f.write_str("similar"),
            QueryIntent::Grouped(GroupedKind::Skipped) => f.write_str("skipped-groups"),
            QueryIntent::Ranked(RankedKind::LargeFile) => f.write_str("large"),
            QueryIntent::Ranked(RankedKind::Blurred) => f.write_str("blurred"),
            QueryIntent::Ranked(RankedKind::Document) => f.write_str("documents"),
            QueryIntent::Ranked(RankedKind::Screenshot) => f.write_str("screenshots"),
            QueryIntent::Pending(PendingKind::PendingDeletion) => f.write_str("pending"),
            QueryIntent::Pending(PendingKind::Skipped) => f.write_str("skipped"),
            QueryIntent::Bucketed(None) => f.write_str("timeline"),
            QueryIntent::Bucketed(Some(m)) => write!(f, "timeline:{m}"),
            QueryIntent::Dashboard => f.write_str("dashboard"),
        }
    }
}

impl FromStr for QueryIntent {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if let Some(month) = s.strip_prefix("month:") {
            return Ok(QueryIntent::Sequential(Scope::Month(month.parse()?)));
        }
        if let Some(month) = s.strip_prefix("timeline:") {
            return Ok(QueryIntent::Bucketed(Some(month.parse()?)));
        }
        Ok(match s {
            "all" => QueryIntent::Sequential(Scope::All),
            "similar" => QueryIntent::Grouped(GroupedKind::Similar),
            "skipped-groups" => QueryIntent::Grouped(GroupedKind::Skipped),
            "large" => QueryIntent::Ranked(RankedKind::LargeFile),
            "blurred" => QueryIntent::Ranked(RankedKind::Blurred),
            "documents" => QueryIntent::Ranked(RankedKind::Document),
            "screenshots" => QueryIntent::Ranked(RankedKind::Screenshot),
            "pending" => QueryIntent::Pending(PendingKind::PendingDeletion),
            "skipped" => QueryIntent::Pending(PendingKind::Skipped),
            "timeline" => QueryIntent::Bucketed(None),
            "dashboard" => QueryIntent::Dashboard,
            other => return Err(format!("unknown query intent: {other}")),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GroupKey {
    Similarity(GroupId),
    Month(MonthKey),
}

/// A group with its member records resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupView {
    pub key: GroupKey,
    pub members: Vec<AssetRecord>,
    pub confidence: f64,
    pub cover: Option<AssetId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FeedItem {
    Asset(AssetRecord),
    Group(GroupView),
    Bucket(MonthBucket),
    Dashboard(DashboardSnapshot),
}

impl FeedItem {
    /// Identity used to keep items unique across pages.
    pub fn key(&self) -> String {
        match self {
            FeedItem::Asset(a) => format!("asset:{}", a.id),
            FeedItem::Group(g) => match &g.key {
                GroupKey::Similarity(id) => format!("group:{id}"),
                GroupKey::Month(m) => format!("skipped:{m}"),
            },
            FeedItem::Bucket(b) => format!("bucket:{}", b.month),
            FeedItem::Dashboard(_) => "dashboard".to_string(),
        }
    }

    pub fn as_asset(&self) -> Option<&AssetRecord> {
        match self {
            FeedItem::Asset(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_group(&self) -> Option<&GroupView> {
        match self {
            FeedItem::Group(g) => Some(g),
            _ => None,
        }
    }
}

/// Position of the next page. `context` ties the cursor to one feed generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cursor {
    pub offset: usize,
    pub context: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeedStatus {
    Idle,
    Loading,
    Streaming,
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedState {
    pub items: Vec<FeedItem>,
    pub cursor: Option<Cursor>,
    pub status: FeedStatus,
}

impl FeedState {
    fn idle() -> Self {
        Self {
            items: Vec::new(),
            cursor: None,
            status: FeedStatus::Idle,
        }
    }

    pub fn asset_ids(&self) -> Vec<&str> {
        self.items
            .iter()
            .filter_map(|i| i.as_asset().map(|a| a.id.as_str()))
            .collect()
    }
}

struct FeedEntry {
    state: FeedState,
    context: u64,
}

/// Per-intent pagination state.
///
/// Queries run outside the lock; an entry's `context` changes whenever the
/// feed is rebuilt, and results computed for an older context are dropped.
pub(crate) struct FeedRegistry {
    feeds: Mutex<HashMap<QueryIntent, FeedEntry>>,
    next_context: AtomicU64,
}

impl FeedRegistry {
    pub(crate) fn new() -> Self {
        Self {
            feeds: Mutex::new(HashMap::new()),
            next_context: AtomicU64::new(1),
        }
    }

    fn mint(&self) -> u64 {
        self.next_context.fetch_add(1, Ordering::Relaxed)
    }

    /// Load the first page if the feed does not exist yet.
    pub(crate) fn ensure(&self, intent: QueryIntent, catalog: &Catalog) -> Result<FeedState> {
        let context = {
            let mut feeds = lock(&self.feeds);
            if let Some(entry) = feeds.get(&intent) {
                if entry.state.status != FeedStatus::Idle {
                    return Ok(entry.state.clone());
                }
            }
            let context = self.mint();
            feeds.insert(
                intent,
                FeedEntry {
                    state: FeedState {
                        status: FeedStatus::Loading,
                        ..FeedState::idle()
                    },
                    context,
                },
            );
            context
        };

        let items = match catalog.page(intent, 0, intent.page_size()) {
            Ok(items) => items,
            Err(e) => {
                self.reset_to_idle(intent, context);
                return Err(e);
            }
        };
        Ok(self.install(intent, context, 0, items, false))
    }

    /// Append the next page, or return the feed unchanged when it is
    /// exhausted or already loading.
    pub(crate) fn next_page(
        &self,
        intent: QueryIntent,
        after: Option<Cursor>,
        catalog: &Catalog,
    ) -> Result<FeedState> {
        let (cursor, context) = {
            let mut feeds = lock(&self.feeds);
            let Some(entry) = feeds.get_mut(&intent) else {
                drop(feeds);
                return self.ensure(intent, catalog);
            };
            if let Some(requested) = after {
                if requested.context != entry.context {
                    return Err(Error::StaleCursor);
                }
            }
            match (entry.state.status, entry.state.cursor) {
                (FeedStatus::Streaming, Some(cursor)) => {
                    if let Some(requested) = after {
                        if requested.offset < cursor.offset {
                            // Already served; hand back what we have.
                            return Ok(entry.state.clone());
                        }
                    }
                    entry.state.status = FeedStatus::Loading;
                    (cursor, entry.context)
                }
                (FeedStatus::Idle, _) => {
                    drop(feeds);
                    return self.ensure(intent, catalog);
                }
                _ => return Ok(entry.state.clone()),
            }
        };

        let items = match catalog.page(intent, cursor.offset, intent.page_size()) {
            Ok(items) => items,
            Err(e) => {
                let mut feeds = lock(&self.feeds);
                if let Some(entry) = feeds.get_mut(&intent) {
                    if entry.context == context {
                        entry.state.status = FeedStatus::Streaming;
                    }
                }
                return Err(e);
            }
        };
        Ok(self.install(intent, context, cursor.offset, items, true))
    }

    /// Re-run every open feed over the range it has loaded so far, under a
    /// fresh context. Used after mutations.
    pub(crate) fn refresh_all(&self, catalog: &Catalog) -> Result<HashMap<QueryIntent, FeedState>> {
        let open: Vec<(QueryIntent, usize)> = lock(&self.feeds)
            .iter()
            .filter(|(_, e)| e.state.status != FeedStatus::Idle)
            .map(|(intent, e)| (*intent, e.state.items.len()))
            .collect();

        let mut refreshed = HashMap::with_capacity(open.len());
        for (intent, loaded) in open {
            let context = self.mint();
            let limit = loaded.max(intent.page_size());
            let items = catalog.page(intent, 0, limit)?;
            let exhausted = intent.is_singleton() || items.len() < limit;
            let state = FeedState {
                cursor: (!exhausted).then_some(Cursor {
                    offset: items.len(),
                    context,
                }),
                status: if exhausted {
                    FeedStatus::Exhausted
                } else {
                    FeedStatus::Streaming
                },
                items,
            };
            lock(&self.feeds).insert(
                intent,
                FeedEntry {
                    state: state.clone(),
                    context,
                },
            );
            refreshed.insert(intent, state);
        }
        debug!(feeds = refreshed.len(), "Refreshed open feeds");
        Ok(refreshed)
    }

    /// Forget all feeds; the next request reloads from scratch.
    pub(crate) fn clear(&self) {
        lock(&self.feeds).clear();
    }

    fn reset_to_idle(&self, intent: QueryIntent, context: u64) {
        let mut feeds = lock(&self.feeds);
        if feeds.get(&intent).is_some_and(|e| e.context == context) {
            feeds.remove(&intent);
        }
    }

    fn install(
        &self,
        intent: QueryIntent,
        context: u64,
        offset: usize,
        items: Vec<FeedItem>,
        append: bool,
    ) -> FeedState {
        let mut feeds = lock(&self.feeds);
        let Some(entry) = feeds.get_mut(&intent) else {
            return FeedState::idle();
        };
        if entry.context != context {
            // Rebuilt while we were querying.
            return entry.state.clone();
        }

        let fetched = items.len();
        let exhausted = intent.is_singleton() || fetched < intent.page_size();
        if append {
            let seen: HashSet<String> = entry.state.items.iter().map(FeedItem::key).collect();
            entry
                .state
                .items
                .extend(items.into_iter().filter(|i| !seen.contains(&i.key())));
        } else {
            entry.state.items = items;
        }
        entry.state.cursor = (!exhausted).then_some(Cursor {
            offset: offset + fetched,
            context,
        });
        entry.state.status = if exhausted {
            FeedStatus::Exhausted
        } else {
            FeedStatus::Streaming
        };
        entry.state.clone()
    }
}
