pub mod entry;

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::domain::{AssetId, GroupId, SimilarityKind};
use crate::error::Result;
use crate::source::lock;

pub use entry::AnalysisCacheEntry;

/// On-disk layout of the cache file.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CacheFile {
    schema_version: u32,
    generated_at: DateTime<Utc>,
    asset_count: usize,
    entries: Vec<AnalysisCacheEntry>,
}

/// Versioned, invalidation-aware store of per-asset analysis results.
///
/// Every mutation rewrites the whole file (temp file + rename). Writes are
/// serialised by `write_lock`, and the snapshot is taken while holding it,
/// so a slower writer can never replace a newer file with older content.
pub struct AnalysisCache {
    path: Option<PathBuf>,
    schema_version: u32,
    entries: Mutex<HashMap<AssetId, AnalysisCacheEntry>>,
    write_lock: Mutex<()>,
}

impl AnalysisCache {
    /// Load the cache at `path`. A missing, unreadable or outdated file
    /// yields an empty cache.
    pub fn open(path: &Path, schema_version: u32) -> Self {
        let entries = load_entries(path, schema_version);
        info!(path = %path.display(), entries = entries.len(), "Analysis cache loaded");
        Self {
            path: Some(path.to_path_buf()),
            schema_version,
            entries: Mutex::new(entries),
            write_lock: Mutex::new(()),
        }
    }

    /// A cache that never touches disk.
    pub fn in_memory(schema_version: u32) -> Self {
        Self {
            path: None,
            schema_version,
            entries: Mutex::new(HashMap::new()),
            write_lock: Mutex::new(()),
        }
    }

    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    pub fn get(&self, id: &str) -> Option<AnalysisCacheEntry> {
        lock(&self.entries).get(id).cloned()
    }

    /// Entry for `id` if it is still valid for an asset of `byte_size` bytes.
    pub fn fresh(&self, id: &str, byte_size: u64) -> Option<AnalysisCacheEntry> {
        lock(&self.entries)
            .get(id)
            .filter(|e| e.is_fresh(self.schema_version, byte_size))
            .cloned()
    }

    pub fn needs_analysis(&self, id: &str, byte_size: u64) -> bool {
        self.fresh(id, byte_size).is_none()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Upsert entries; last write wins per id.
    pub fn put(&self, entries: Vec<AnalysisCacheEntry>) {
        if entries.is_empty() {
            return;
        }
        self.commit(entries, None);
    }

    /// Upsert entries and, when `assignments` is given, replace every
    /// similarity assignment with it, all in one persisted write.
    pub fn commit(
        &self,
        entries: Vec<AnalysisCacheEntry>,
        assignments: Option<&HashMap<AssetId, GroupId>>,
    ) {
        let _write = lock(&self.write_lock);
        {
            let mut map = lock(&self.entries);
            for entry in entries {
                map.insert(entry.asset_id.clone(), entry);
            }
            if let Some(assignments) = assignments {
                for (id, entry) in map.iter_mut() {
                    match assignments.get(id) {
                        Some(group) => {
                            entry.similarity_group_id = Some(group.clone());
                            entry.similarity_kind = Some(SimilarityKind::Similar);
                        }
                        None => {
                            entry.similarity_group_id = None;
                            entry.similarity_kind = None;
                        }
                    }
                }
            }
        }
        self.persist_locked();
    }

    pub fn remove(&self, ids: &[AssetId]) {
        let _write = lock(&self.write_lock);
        let removed = {
            let mut map = lock(&self.entries);
            ids.iter().filter(|id| map.remove(*id).is_some()).count()
        };
        if removed > 0 {
            self.persist_locked();
        }
    }

    /// Ids of every cached entry.
    pub fn ids(&self) -> Vec<AssetId> {
        lock(&self.entries).keys().cloned().collect()
    }

    /// Drop entries whose asset is no longer in the library.
    pub fn prune_missing(&self, keep: &HashSet<AssetId>) -> usize {
        let _write = lock(&self.write_lock);
        let pruned = {
            let mut map = lock(&self.entries);
            let before = map.len();
            map.retain(|id, _| keep.contains(id));
            before - map.len()
        };
        if pruned > 0 {
            debug!(pruned, "Pruned analysis cache entries");
            self.persist_locked();
        }
        pruned
    }

    /// Fresh entries for the given `(id, byte_size)` pairs.
    pub fn snapshot<'a>(
        &self,
        assets: impl IntoIterator<Item = (&'a str, u64)>,
    ) -> HashMap<AssetId, AnalysisCacheEntry> {
        let map = lock(&self.entries);
        assets
            .into_iter()
            .filter_map(|(id, size)| {
                map.get(id)
                    .filter(|e| e.is_fresh(self.schema_version, size))
                    .map(|e| (id.to_string(), e.clone()))
            })
            .collect()
    }

    /// Must be called with `write_lock` held. Failures are logged and dropped;
    /// the next mutation rewrites the whole file anyway.
    fn persist_locked(&self) {
        let Some(path) = &self.path else {
            return;
        };
        let file = {
            let map = lock(&self.entries);
            let mut entries: Vec<AnalysisCacheEntry> = map.values().cloned().collect();
            entries.sort_by(|a, b| a.asset_id.cmp(&b.asset_id));
            CacheFile {
                schema_version: self.schema_version,
                generated_at: Utc::now(),
                asset_count: entries.len(),
                entries,
            }
        };
        if let Err(e) = write_atomically(path, &file) {
            warn!(path = %path.display(), error = %e, "Failed to persist analysis cache");
        }
    }
}

fn load_entries(path: &Path, schema_version: u32) -> HashMap<AssetId, AnalysisCacheEntry> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return HashMap::new(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Unreadable analysis cache, starting empty");
            return HashMap::new();
        }
    };
    let file: CacheFile = match serde_json::from_slice(&bytes) {
        Ok(f) => f,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Corrupt analysis cache, starting empty");
            return HashMap::new();
        }
    };
    if file.schema_version != schema_version {
        info!(
            found = file.schema_version,
            expected = schema_version,
            "Analysis cache schema changed, starting empty"
        );
        return HashMap::new();
    }
    file.entries
        .into_iter()
        .filter(|e| e.schema_version == schema_version)
        .map(|e| (e.asset_id.clone(), e))
        .collect()
}

fn write_atomically(path: &Path, file: &CacheFile) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let bytes = serde_json::to_vec(file)?;
    let tmp = path.with_extension("json.tmp");
    {
        let mut out = fs::File::create(&tmp)?;
        out.write_all(&bytes)?;
        out.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}
