//! Boundaries to the photo library and the pixel-level analyzer.
//!
//! Both are external collaborators: the engine only ever talks to them
//! through [`AssetSource`] and [`FeatureExtractor`].

use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::domain::{AssetDescriptor, AssetId, Scope};
use crate::error::Result;

const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// A batch of library mutations reported by the asset source.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    pub added: Vec<AssetId>,
    pub removed: Vec<AssetId>,
    pub changed: Vec<AssetId>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

/// Enumerates the library.
#[async_trait]
pub trait AssetSource: Send + Sync {
    /// One page of descriptors within `scope`, newest capture date first
    /// (ties broken by id ascending). A page shorter than `limit` is the last.
    async fn enumerate(
        &self,
        scope: Scope,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<AssetDescriptor>>;

    /// Current descriptors for specific ids. Unknown ids are omitted.
    async fn describe(&self, ids: &[AssetId]) -> Result<Vec<AssetDescriptor>>;

    /// Stream of additions, removals and in-place changes.
    fn subscribe_changes(&self) -> broadcast::Receiver<ChangeSet>;
}

/// Raw analysis primitives for one asset.
#[derive(Debug, Clone, PartialEq)]
pub struct Features {
    /// 0.0 (fully blurred) to 1.0 (sharp).
    pub sharpness: f64,
    pub exposure_bad: bool,
    pub perceptual_hash: u64,
    pub feature_vector: Vec<u8>,
    pub is_document_like: bool,
    pub is_text_heavy: bool,
}

/// Computes [`Features`] for an asset. Failures are non-fatal.
#[async_trait]
pub trait FeatureExtractor: Send + Sync {
    async fn analyze(&self, id: &AssetId) -> Result<Features>;
}

/// Asset source backed by a vector, for embedding and tests.
pub struct InMemorySource {
    assets: Mutex<Vec<AssetDescriptor>>,
    changes: broadcast::Sender<ChangeSet>,
}

impl InMemorySource {
    pub fn new(assets: Vec<AssetDescriptor>) -> Self {
        Self::with_capacity(assets, CHANGE_CHANNEL_CAPACITY)
    }

    /// Like [`InMemorySource::new`], buffering at most `capacity` unread
    /// change notifications per subscriber.
    pub fn with_capacity(assets: Vec<AssetDescriptor>, capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(capacity.max(1));
        Self {
            assets: Mutex::new(assets),
            changes,
        }
    }

    /// Add or replace assets and notify subscribers.
    pub fn upsert(&self, descs: Vec<AssetDescriptor>) {
        let mut change = ChangeSet::default();
        {
            let mut assets = lock(&self.assets);
            for desc in descs {
                match assets.iter_mut().find(|a| a.id == desc.id) {
                    Some(existing) => {
                        change.changed.push(desc.id.clone());
                        *existing = desc;
                    }
                    None => {
                        change.added.push(desc.id.clone());
                        assets.push(desc);
                    }
                }
            }
        }
        self.notify(change);
    }

    /// Remove assets and notify subscribers.
    pub fn remove(&self, ids: &[AssetId]) {
        let mut change = ChangeSet::default();
        {
            let mut assets = lock(&self.assets);
            assets.retain(|a| {
                let gone = ids.contains(&a.id);
                if gone {
                    change.removed.push(a.id.clone());
                }
                !gone
            });
        }
        self.notify(change);
    }

    pub fn len(&self) -> usize {
        lock(&self.assets).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn notify(&self, change: ChangeSet) {
        if !change.is_empty() {
            // No subscribers is fine.
            let _ = self.changes.send(change);
        }
    }
}

#[async_trait]
impl AssetSource for InMemorySource {
    async fn enumerate(
        &self,
        scope: Scope,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<AssetDescriptor>> {
        let mut matching: Vec<AssetDescriptor> = lock(&self.assets)
            .iter()
            .filter(|a| scope.contains(a.capture_date))
            .cloned()
            .collect();
        matching.sort_by(|a, b| {
            b.capture_date
                .cmp(&a.capture_date)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(matching.into_iter().skip(offset).take(limit).collect())
    }

    async fn describe(&self, ids: &[AssetId]) -> Result<Vec<AssetDescriptor>> {
        let assets = lock(&self.assets);
        Ok(ids
            .iter()
            .filter_map(|id| assets.iter().find(|a| &a.id == id).cloned())
            .collect())
    }

    fn subscribe_changes(&self) -> broadcast::Receiver<ChangeSet> {
        self.changes.subscribe()
    }
}

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{MediaType, MonthKey};
    use chrono::{TimeZone, Utc};

    fn desc(id: &str, month: u32, day: u32) -> AssetDescriptor {
        AssetDescriptor {
            id: id.to_string(),
            capture_date: Utc.with_ymd_and_hms(2024, month, day, 12, 0, 0).unwrap(),
            byte_size: 1000,
            pixel_width: 100,
            pixel_height: 100,
            media_type: MediaType::Photo,
            file_name: format!("{id}.jpg"),
            album_name: None,
            is_screenshot: false,
        }
    }

    #[tokio::test]
    async fn test_enumerate_orders_newest_first_and_pages() {
        let source = InMemorySource::new(vec![desc("a", 1, 1), desc("b", 1, 3), desc("c", 1, 2)]);
        let first = source.enumerate(Scope::All, 0, 2).await.unwrap();
        let ids: Vec<_> = first.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);

        let rest = source.enumerate(Scope::All, 2, 2).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].id, "a");
    }

    #[tokio::test]
    async fn test_enumerate_month_scope() {
        let source = InMemorySource::new(vec![desc("a", 1, 1), desc("b", 2, 1)]);
        let feb = MonthKey::new(2024, 2).unwrap();
        let page = source.enumerate(Scope::Month(feb), 0, 10).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, "b");
    }

    #[tokio::test]
    async fn test_changes_are_broadcast() {
        let source = InMemorySource::new(vec![desc("a", 1, 1)]);
        let mut rx = source.subscribe_changes();

        source.upsert(vec![desc("a", 1, 1), desc("b", 1, 2)]);
        let change = rx.recv().await.unwrap();
        assert_eq!(change.changed, vec!["a".to_string()]);
        assert_eq!(change.added, vec!["b".to_string()]);

        source.remove(&["a".to_string()]);
        let change = rx.recv().await.unwrap();
        assert_eq!(change.removed, vec!["a".to_string()]);
        assert_eq!(source.len(), 1);
    }
}
