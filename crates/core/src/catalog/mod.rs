pub mod queries;
pub mod schema;

use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;

use chrono::DateTime;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use tracing::{debug, warn};

use crate::cache::AnalysisCacheEntry;
use crate::domain::*;
use crate::error::Result;
use crate::matching::score::{hamming_distance, similarity_from_hamming};
use crate::matching::{ClusterInput, ClusterResult};
use crate::source::lock;

/// Columns selected for every [`AssetRecord`] read. `gm` is the asset's
/// (optional) group membership.
pub(crate) const ASSET_SELECT: &str = "SELECT a.id, a.captured_at, a.file_name, a.byte_size,
        a.pixel_width, a.pixel_height, a.media_type, a.album_name, a.tags, a.decision,
        gm.group_id, a.phash, a.blur_score, a.document_score, a.similarity_score
     FROM assets a
     LEFT JOIN group_members gm ON gm.asset_id = a.id";

/// True when the incoming row carries analysis, or the file changed and the
/// stored analysis no longer applies.
const TAKE_INCOMING_ANALYSIS: &str =
    "(excluded.phash IS NOT NULL OR excluded.byte_size != assets.byte_size)";

/// SQLite-backed index of asset records and similarity groups.
///
/// All access goes through one connection behind a mutex. A catalog that
/// failed to open is *degraded*: reads return empty results and writes are
/// dropped.
pub struct Catalog {
    conn: Option<Mutex<Connection>>,
}

impl Catalog {
    /// Open or create a catalog at the given path with WAL mode.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        schema::initialize(&conn)?;
        schema::migrate(&conn)?;
        Ok(Self {
            conn: Some(Mutex::new(conn)),
        })
    }

    /// Open an in-memory catalog (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        schema::initialize(&conn)?;
        schema::migrate(&conn)?;
        Ok(Self {
            conn: Some(Mutex::new(conn)),
        })
    }

    /// Open the catalog at `path` (in memory when `None`), degrading instead
    /// of failing.
    pub fn open_or_degraded(path: Option<&Path>) -> Self {
        let opened = match path {
            Some(p) => Self::open(p),
            None => Self::open_in_memory(),
        };
        match opened {
            Ok(catalog) => catalog,
            Err(e) => {
                warn!(
                    path = %path.map(|p| p.display().to_string()).unwrap_or_else(|| ":memory:".into()),
                    error = %e,
                    "Catalog unavailable, serving empty results"
                );
                Self::degraded()
            }
        }
    }

    pub fn degraded() -> Self {
        Self { conn: None }
    }

    pub fn is_degraded(&self) -> bool {
        self.conn.is_none()
    }

    /// Run `f` against the connection, or return `T::default()` when degraded.
    pub(crate) fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Default,
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        match &self.conn {
            Some(conn) => f(&mut lock(conn)),
            None => Ok(T::default()),
        }
    }

    fn with_tx<T, F>(&self, f: F) -> Result<T>
    where
        T: Default,
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let out = f(&tx)?;
            tx.commit()?;
            Ok(out)
        })
    }

    // ── Assets ───────────────────────────────────────────────────────

    /// Insert or refresh asset rows in one transaction. User decisions are
    /// never overwritten; stored analysis survives unless the incoming row
    /// carries its own or the byte size changed. A size change also takes the
    /// asset out of its similarity group, dissolving the group when it falls
    /// below two members.
    pub fn upsert_assets(&self, records: &[AssetRecord]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        let mask = AssetTags::ANALYSIS_MASK.bits() as i64;
        let sql = format!(
            "INSERT INTO assets (id, captured_at, file_name, byte_size, pixel_width, pixel_height,
                 media_type, album_name, tags, decision, phash, blur_score, document_score)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
             ON CONFLICT(id) DO UPDATE SET
                 captured_at = excluded.captured_at,
                 file_name = excluded.file_name,
                 pixel_width = excluded.pixel_width,
                 pixel_height = excluded.pixel_height,
                 media_type = excluded.media_type,
                 album_name = excluded.album_name,
                 tags = CASE WHEN {take} THEN excluded.tags
                        ELSE (excluded.tags & ~{mask}) | (assets.tags & {mask}) END,
                 phash = CASE WHEN {take} THEN excluded.phash ELSE assets.phash END,
                 blur_score = CASE WHEN {take} THEN excluded.blur_score ELSE assets.blur_score END,
                 document_score = CASE WHEN {take} THEN excluded.document_score ELSE assets.document_score END,
                 similarity_score = CASE WHEN excluded.byte_size != assets.byte_size THEN 0
                                    ELSE assets.similarity_score END,
                 byte_size = excluded.byte_size",
            take = TAKE_INCOMING_ANALYSIS,
        );
        self.with_tx(|tx| {
            let mut prior = tx.prepare(
                "SELECT a.byte_size, gm.group_id FROM assets a
                 LEFT JOIN group_members gm ON gm.asset_id = a.id
                 WHERE a.id = ?1",
            )?;
            let mut unlink = tx.prepare("DELETE FROM group_members WHERE asset_id = ?1")?;
            let mut stmt = tx.prepare(&sql)?;
            // Groups that lost a member whose file changed under them.
            let mut regroup: HashSet<GroupId> = HashSet::new();
            for r in records {
                let previous = prior
                    .query_row(params![r.id], |row| {
                        Ok((row.get::<_, i64>(0)?, row.get::<_, Option<String>>(1)?))
                    })
                    .optional()?;
                if let Some((size, Some(group))) = previous {
                    if size as u64 != r.byte_size {
                        unlink.execute(params![r.id])?;
                        regroup.insert(group);
                    }
                }
                stmt.execute(params![
                    r.id,
                    r.capture_date.timestamp_millis(),
                    r.file_name,
                    r.byte_size as i64,
                    r.pixel_width,
                    r.pixel_height,
                    r.media_type.as_str(),
                    r.album_name,
                    r.tags.bits() as i64,
                    r.decision.as_str(),
                    r.perceptual_hash.map(|v| v as i64),
                    r.blur_score,
                    r.document_score,
                ])?;
            }
            for group in &regroup {
                reconcile_group(tx, group)?;
            }
            Ok(records.len())
        })
    }

    pub fn get_asset(&self, id: &str) -> Result<Option<AssetRecord>> {
        self.with_conn(|conn| {
            let sql = format!("{ASSET_SELECT} WHERE a.id = ?1");
            let record = conn
                .query_row(&sql, params![id], asset_from_row)
                .optional()?;
            Ok(record)
        })
    }

    pub fn all_asset_ids(&self) -> Result<Vec<AssetId>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id FROM assets")?;
            let ids = stmt
                .query_map([], |row| row.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(ids)
        })
    }

    pub fn count_assets(&self) -> Result<usize> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM assets", [], |row| row.get(0))?;
            Ok(count as usize)
        })
    }

    /// Write worker output onto matching rows. An entry whose file size no
    /// longer matches the row is stale and ignored.
    pub fn apply_analysis(&self, entries: &[AnalysisCacheEntry]) -> Result<usize> {
        if entries.is_empty() {
            return Ok(0);
        }
        let keep = (!AssetTags::ANALYSIS_MASK.bits()) as i64;
        self.with_tx(|tx| {
            let mut stmt = tx.prepare(
                "UPDATE assets SET
                     phash = ?1,
                     blur_score = ?2,
                     document_score = ?3,
                     tags = (tags & ?4) | ?5
                 WHERE id = ?6 AND byte_size = ?7",
            )?;
            let mut updated = 0;
            for e in entries {
                updated += stmt.execute(params![
                    e.perceptual_hash.map(|v| v as i64),
                    e.blur_score,
                    e.document_score(),
                    keep,
                    e.analysis_tags().bits() as i64,
                    e.asset_id,
                    e.file_size as i64,
                ])?;
            }
            Ok(updated)
        })
    }

    /// Set `decision` on every listed asset in one transaction.
    pub fn apply_decision(&self, ids: &[AssetId], decision: Decision) -> Result<usize> {
        self.with_tx(|tx| {
            let mut stmt = tx.prepare("UPDATE assets SET decision = ?1 WHERE id = ?2")?;
            let mut updated = 0;
            for id in ids {
                updated += stmt.execute(params![decision.as_str(), id])?;
            }
            Ok(updated)
        })
    }

    /// Delete assets and their group memberships. Groups left with fewer
    /// than two members are dissolved in the same transaction; surviving
    /// groups get a new cover and confidence when needed.
    pub fn delete_assets(&self, ids: &[AssetId]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let deleted = self.with_tx(|tx| {
            let mut affected: HashSet<GroupId> = HashSet::new();
            {
                let mut find = tx.prepare("SELECT group_id FROM group_members WHERE asset_id = ?1")?;
                let mut unlink = tx.prepare("DELETE FROM group_members WHERE asset_id = ?1")?;
                for id in ids {
                    if let Some(group) = find
                        .query_row(params![id], |row| row.get::<_, String>(0))
                        .optional()?
                    {
                        affected.insert(group);
                    }
                    unlink.execute(params![id])?;
                }
            }

            for group in &affected {
                reconcile_group(tx, group)?;
            }

            let mut delete = tx.prepare("DELETE FROM assets WHERE id = ?1")?;
            let mut deleted = 0;
            for id in ids {
                deleted += delete.execute(params![id])?;
            }
            Ok(deleted)
        })?;
        debug!(deleted, "Deleted assets from catalog");
        Ok(deleted)
    }

    /// Delete every asset not in `keep`. Returns the removed ids.
    pub fn prune_missing(&self, keep: &HashSet<AssetId>) -> Result<Vec<AssetId>> {
        let missing: Vec<AssetId> = self
            .all_asset_ids()?
            .into_iter()
            .filter(|id| !keep.contains(id))
            .collect();
        self.delete_assets(&missing)?;
        Ok(missing)
    }

    // ── Similarity groups ────────────────────────────────────────────

    /// Analyzed assets with a perceptual hash, for a clustering pass.
    pub fn clustering_inputs(&self) -> Result<Vec<ClusterInput>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT id, captured_at, phash FROM assets WHERE phash IS NOT NULL")?;
            let inputs = stmt
                .query_map([], |row| {
                    Ok(ClusterInput {
                        id: row.get(0)?,
                        captured_at_ms: row.get(1)?,
                        perceptual_hash: row.get::<_, i64>(2)? as u64,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(inputs)
        })
    }

    /// Replace all groups with a clustering result in a single transaction.
    /// Members deleted since the pass started are skipped, and groups that
    /// fall below two members are not written. Returns the groups stored.
    pub fn replace_groups(&self, result: &ClusterResult) -> Result<usize> {
        self.with_tx(|tx| {
            tx.execute("DELETE FROM group_members", [])?;
            tx.execute("DELETE FROM similarity_groups", [])?;
            tx.execute(
                "UPDATE assets SET similarity_score = 0 WHERE similarity_score != 0",
                [],
            )?;

            let mut exists = tx.prepare("SELECT 1 FROM assets WHERE id = ?1")?;
            let mut insert_group = tx.prepare(
                "INSERT INTO similarity_groups (id, confidence, cover_id) VALUES (?1, ?2, ?3)",
            )?;
            let mut insert_member = tx.prepare(
                "INSERT INTO group_members (group_id, asset_id, position) VALUES (?1, ?2, ?3)",
            )?;
            let mut set_score =
                tx.prepare("UPDATE assets SET similarity_score = ?1 WHERE id = ?2")?;

            let mut stored = 0;
            for group in &result.groups {
                let mut members = Vec::with_capacity(group.members.len());
                for id in &group.members {
                    if exists.exists(params![id])? {
                        members.push(id);
                    }
                }
                if members.len() < 2 {
                    continue;
                }

                let score = |id: &AssetId| result.scores.get(id).copied().unwrap_or(0.0);
                let cover = if members.contains(&&group.cover) {
                    &group.cover
                } else {
                    // Members are in capture order, so the first best wins ties.
                    members
                        .iter()
                        .copied()
                        .fold(members[0], |best, m| if score(m) > score(best) { m } else { best })
                };

                insert_group.execute(params![group.id, group.confidence, cover])?;
                for (position, id) in members.iter().enumerate() {
                    insert_member.execute(params![group.id, id, position as i64])?;
                    set_score.execute(params![score(id), id])?;
                }
                stored += 1;
            }
            Ok(stored)
        })
    }

    pub fn get_group(&self, id: &str) -> Result<Option<SimilarityGroup>> {
        self.with_conn(|conn| {
            let head = conn
                .query_row(
                    "SELECT confidence, cover_id FROM similarity_groups WHERE id = ?1",
                    params![id],
                    |row| Ok((row.get::<_, f64>(0)?, row.get::<_, String>(1)?)),
                )
                .optional()?;
            let Some((confidence, cover)) = head else {
                return Ok(None);
            };
            let mut stmt = conn.prepare(
                "SELECT asset_id FROM group_members WHERE group_id = ?1 ORDER BY position",
            )?;
            let members = stmt
                .query_map(params![id], |row| row.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(Some(SimilarityGroup {
                id: id.to_string(),
                members,
                confidence,
                cover,
            }))
        })
    }

    /// All groups, highest confidence first.
    pub fn list_groups(&self) -> Result<Vec<SimilarityGroup>> {
        self.with_conn(|conn| {
            // Single JOIN query to avoid N+1
            let mut stmt = conn.prepare(
                "SELECT g.id, g.confidence, g.cover_id, gm.asset_id
                 FROM similarity_groups g
                 JOIN group_members gm ON gm.group_id = g.id
                 ORDER BY g.confidence DESC, g.id, gm.position",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, f64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let mut groups: Vec<SimilarityGroup> = Vec::new();
            for (id, confidence, cover, member) in rows {
                match groups.last_mut() {
                    Some(g) if g.id == id => g.members.push(member),
                    _ => groups.push(SimilarityGroup {
                        id,
                        members: vec![member],
                        confidence,
                        cover,
                    }),
                }
            }
            Ok(groups)
        })
    }

    pub fn count_groups(&self) -> Result<usize> {
        self.with_conn(|conn| {
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM similarity_groups", [], |row| row.get(0))?;
            Ok(count as usize)
        })
    }

    // ── Config ───────────────────────────────────────────────────────

    pub fn set_config(&self, key: &str, value: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO config (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )?;
            Ok(())
        })
    }

    pub fn get_config(&self, key: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            let value = conn
                .query_row(
                    "SELECT value FROM config WHERE key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(value)
        })
    }
}

/// Bring a group back in line after members were removed: dissolve it below
/// two members, otherwise recompute scores and re-elect the cover.
fn reconcile_group(tx: &Transaction<'_>, group: &str) -> Result<()> {
    let members: Vec<(AssetId, Option<i64>)> = {
        let mut stmt = tx.prepare(
            "SELECT a.id, a.phash FROM group_members gm
             JOIN assets a ON a.id = gm.asset_id
             WHERE gm.group_id = ?1
             ORDER BY a.captured_at, a.id",
        )?;
        let rows = stmt
            .query_map(params![group], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows
    };

    if members.len() < 2 {
        for (id, _) in &members {
            tx.execute(
                "UPDATE assets SET similarity_score = 0 WHERE id = ?1",
                params![id],
            )?;
        }
        tx.execute("DELETE FROM group_members WHERE group_id = ?1", params![group])?;
        tx.execute("DELETE FROM similarity_groups WHERE id = ?1", params![group])?;
        debug!(group, "Dissolved similarity group");
        return Ok(());
    }

    let mut best = vec![0.0_f64; members.len()];
    for i in 0..members.len() {
        for j in (i + 1)..members.len() {
            if let (Some(a), Some(b)) = (members[i].1, members[j].1) {
                let sim = similarity_from_hamming(hamming_distance(a as u64, b as u64));
                best[i] = best[i].max(sim);
                best[j] = best[j].max(sim);
            }
        }
    }
    let mut cover = 0;
    for (i, score) in best.iter().enumerate() {
        if *score > best[cover] {
            cover = i;
        }
    }
    let confidence = best.iter().copied().fold(0.0, f64::max);

    for ((id, _), score) in members.iter().zip(&best) {
        tx.execute(
            "UPDATE assets SET similarity_score = ?1 WHERE id = ?2",
            params![score, id],
        )?;
    }
    tx.execute(
        "UPDATE similarity_groups SET confidence = ?1, cover_id = ?2 WHERE id = ?3",
        params![confidence, members[cover].0, group],
    )?;
    Ok(())
}

pub(crate) fn asset_from_row(row: &Row<'_>) -> rusqlite::Result<AssetRecord> {
    Ok(AssetRecord {
        id: row.get(0)?,
        capture_date: DateTime::from_timestamp_millis(row.get(1)?).unwrap_or_default(),
        file_name: row.get(2)?,
        byte_size: row.get::<_, i64>(3)? as u64,
        pixel_width: row.get(4)?,
        pixel_height: row.get(5)?,
        media_type: MediaType::parse(&row.get::<_, String>(6)?),
        album_name: row.get(7)?,
        tags: AssetTags::from_bits(row.get::<_, i64>(8)? as u8),
        decision: Decision::parse(&row.get::<_, String>(9)?),
        group_identifier: row.get(10)?,
        perceptual_hash: row.get::<_, Option<i64>>(11)?.map(|v| v as u64),
        blur_score: row.get(12)?,
        document_score: row.get(13)?,
        similarity_score: row.get(14)?,
    })
}
