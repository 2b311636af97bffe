//! Read side of the catalog: one query per [`QueryIntent`], plus the
//! aggregates behind the timeline and dashboard.

use rusqlite::{params, Connection, OptionalExtension, ToSql};

use super::{asset_from_row, Catalog, ASSET_SELECT};
use crate::domain::*;
use crate::error::Result;
use crate::feed::{FeedItem, GroupKey, GroupView, GroupedKind, PendingKind, QueryIntent, RankedKind};

/// `YYYY-MM` of a millisecond timestamp column, matching [`MonthKey`]'s display.
const MONTH_OF_CAPTURE: &str = "strftime('%Y-%m', captured_at / 1000, 'unixepoch')";

impl Catalog {
    /// One page of `intent`, in the intent's sort order.
    pub fn page(&self, intent: QueryIntent, offset: usize, limit: usize) -> Result<Vec<FeedItem>> {
        let items = match intent {
            QueryIntent::Sequential(scope) => self
                .sequential(scope, offset, limit)?
                .into_iter()
                .map(FeedItem::Asset)
                .collect(),
            QueryIntent::Grouped(GroupedKind::Similar) => self
                .similarity_groups(offset, limit)?
                .into_iter()
                .map(FeedItem::Group)
                .collect(),
            QueryIntent::Grouped(GroupedKind::Skipped) => self
                .skipped_groups(offset, limit)?
                .into_iter()
                .map(FeedItem::Group)
                .collect(),
            QueryIntent::Ranked(kind) => self
                .ranked(kind, offset, limit)?
                .into_iter()
                .map(FeedItem::Asset)
                .collect(),
            QueryIntent::Pending(kind) => self
                .pending(kind, offset, limit)?
                .into_iter()
                .map(FeedItem::Asset)
                .collect(),
            QueryIntent::Bucketed(month) => self
                .month_buckets_page(month, offset, limit)?
                .into_iter()
                .map(FeedItem::Bucket)
                .collect(),
            QueryIntent::Dashboard => {
                if offset == 0 {
                    vec![FeedItem::Dashboard(self.dashboard()?)]
                } else {
                    Vec::new()
                }
            }
        };
        Ok(items)
    }

    /// Assets newest first, optionally limited to one calendar month.
    pub fn sequential(&self, scope: Scope, offset: usize, limit: usize) -> Result<Vec<AssetRecord>> {
        match scope {
            Scope::All => self.assets_where("1 = 1", &[], "a.captured_at DESC", offset, limit),
            Scope::Month(month) => {
                let (start, end) = month.millis_range();
                self.assets_where(
                    "a.captured_at >= ?1 AND a.captured_at < ?2",
                    &[&start, &end],
                    "a.captured_at DESC",
                    offset,
                    limit,
                )
            }
        }
    }

    /// Assets carrying any tag of the kind's mask, by the kind's metric.
    pub fn ranked(&self, kind: RankedKind, offset: usize, limit: usize) -> Result<Vec<AssetRecord>> {
        let metric = match kind {
            RankedKind::LargeFile => "a.byte_size DESC",
            RankedKind::Blurred => "a.blur_score DESC",
            RankedKind::Document => "a.document_score DESC",
            RankedKind::Screenshot => "a.captured_at DESC",
        };
        let mask = kind.mask().bits() as i64;
        self.assets_where("(a.tags & ?1) != 0", &[&mask], metric, offset, limit)
    }

    pub fn pending(&self, kind: PendingKind, offset: usize, limit: usize) -> Result<Vec<AssetRecord>> {
        let decision = match kind {
            PendingKind::PendingDeletion => Decision::PendingDeletion,
            PendingKind::Skipped => Decision::Skipped,
        };
        self.assets_where(
            "a.decision = ?1",
            &[&decision.as_str()],
            "a.captured_at DESC",
            offset,
            limit,
        )
    }

    /// Similarity groups with their members, highest confidence first.
    pub fn similarity_groups(&self, offset: usize, limit: usize) -> Result<Vec<GroupView>> {
        self.with_conn(|conn| {
            let heads: Vec<(String, f64, String)> = {
                let mut stmt = conn.prepare(
                    "SELECT id, confidence, cover_id FROM similarity_groups
                     ORDER BY confidence DESC, id
                     LIMIT ?1 OFFSET ?2",
                )?;
                let rows = stmt
                    .query_map(params![limit as i64, offset as i64], |row| {
                        Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                rows
            };

            let mut views = Vec::with_capacity(heads.len());
            for (id, confidence, cover) in heads {
                views.push(GroupView {
                    members: group_members(conn, &id)?,
                    key: GroupKey::Similarity(id),
                    confidence,
                    cover: Some(cover),
                });
            }
            Ok(views)
        })
    }

    /// A single similarity group with member records.
    pub fn group_view(&self, id: &str) -> Result<Option<GroupView>> {
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
            Ok(Some(GroupView {
                key: GroupKey::Similarity(id.to_string()),
                members: group_members(conn, id)?,
                confidence,
                cover: Some(cover),
            }))
        })
    }

    /// Skipped assets grouped by capture month, newest month first.
    pub fn skipped_groups(&self, offset: usize, limit: usize) -> Result<Vec<GroupView>> {
        self.with_conn(|conn| {
            let months: Vec<MonthKey> = {
                let sql = format!(
                    "SELECT DISTINCT {MONTH_OF_CAPTURE} AS month FROM assets
                     WHERE decision = ?1
                     ORDER BY month DESC
                     LIMIT ?2 OFFSET ?3"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(
                        params![Decision::Skipped.as_str(), limit as i64, offset as i64],
                        |row| row.get::<_, String>(0),
                    )?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                rows.iter().filter_map(|m| m.parse().ok()).collect()
            };

            let sql = format!(
                "{ASSET_SELECT}
                 WHERE a.decision = ?1 AND a.captured_at >= ?2 AND a.captured_at < ?3
                 ORDER BY a.captured_at DESC, a.id"
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut views = Vec::with_capacity(months.len());
            for month in months {
                let (start, end) = month.millis_range();
                let members = stmt
                    .query_map(
                        params![Decision::Skipped.as_str(), start, end],
                        asset_from_row,
                    )?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                views.push(GroupView {
                    key: GroupKey::Month(month),
                    cover: members.first().map(|m| m.id.clone()),
                    members,
                    confidence: 0.0,
                });
            }
            Ok(views)
        })
    }

    /// Every month with at least one asset, newest first.
    pub fn month_buckets(&self) -> Result<Vec<MonthBucket>> {
        self.month_buckets_page(None, 0, usize::MAX)
    }

    /// Month aggregates, newest first. `only` narrows to a single month.
    pub fn month_buckets_page(
        &self,
        only: Option<MonthKey>,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<MonthBucket>> {
        let blurred = AssetTags::BLURRED.bits() as i64;
        let document = AssetTags::DOCUMENT.union(AssetTags::TEXT_HEAVY).bits() as i64;
        // The cover is the newest asset not marked for deletion, if any.
        let sql = format!(
            "WITH m AS (
                 SELECT id, captured_at, byte_size, decision, tags, {MONTH_OF_CAPTURE} AS month
                 FROM assets
             ),
             covers AS (
                 SELECT month, id,
                        ROW_NUMBER() OVER (
                            PARTITION BY month
                            ORDER BY decision = 'pending_deletion', captured_at DESC, id
                        ) AS rn
                 FROM m
             )
             SELECT m.month,
                    COUNT(*),
                    SUM(m.decision = 'pending_deletion'),
                    SUM((m.tags & {blurred}) != 0),
                    SUM((m.tags & {document}) != 0),
                    SUM(m.byte_size),
                    (SELECT c.id FROM covers c WHERE c.month = m.month AND c.rn = 1)
             FROM m
             WHERE ?1 IS NULL OR m.month = ?1
             GROUP BY m.month
             ORDER BY m.month DESC
             LIMIT ?2 OFFSET ?3"
        );
        let filter = only.map(|m| m.to_string());
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![filter, limit, offset as i64], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        MonthBucket {
                            month: MonthKey { year: 0, month: 1 },
                            asset_count: row.get::<_, i64>(1)? as usize,
                            pending_count: row.get::<_, i64>(2)? as usize,
                            blurred_count: row.get::<_, i64>(3)? as usize,
                            document_count: row.get::<_, i64>(4)? as usize,
                            total_bytes: row.get::<_, i64>(5)? as u64,
                            cover: row.get(6)?,
                        },
                    ))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows
                .into_iter()
                .filter_map(|(month, bucket)| {
                    month.parse().ok().map(|month| MonthBucket { month, ..bucket })
                })
                .collect())
        })
    }

    /// Library-wide totals, computed from current rows.
    pub fn dashboard(&self) -> Result<DashboardSnapshot> {
        let t = |tag: AssetTags| tag.bits() as i64;
        let sql = format!(
            "SELECT COUNT(*),
                    COALESCE(SUM(media_type != 'video'), 0),
                    COALESCE(SUM(media_type = 'video'), 0),
                    COALESCE(SUM(phash IS NOT NULL), 0),
                    COALESCE(SUM((tags & {}) != 0), 0),
                    COALESCE(SUM((tags & {}) != 0), 0),
                    COALESCE(SUM((tags & {}) != 0), 0),
                    COALESCE(SUM((tags & {}) != 0), 0),
                    COALESCE(SUM((tags & {}) != 0), 0),
                    COALESCE(SUM(decision = 'pending_deletion'), 0),
                    COALESCE(SUM(decision = 'skipped'), 0),
                    COALESCE(SUM(byte_size), 0),
                    COALESCE(SUM(CASE WHEN decision = 'pending_deletion' THEN byte_size ELSE 0 END), 0)
             FROM assets",
            t(AssetTags::BLURRED),
            t(AssetTags::DOCUMENT),
            t(AssetTags::SCREENSHOT),
            t(AssetTags::LARGE_FILE),
            t(AssetTags::TEXT_HEAVY),
        );
        self.with_conn(|conn| {
            let count = |row: &rusqlite::Row<'_>, i: usize| -> rusqlite::Result<usize> {
                Ok(row.get::<_, i64>(i)? as usize)
            };
            let mut snapshot = conn.query_row(&sql, [], |row| {
                Ok(DashboardSnapshot {
                    total_count: count(row, 0)?,
                    photo_count: count(row, 1)?,
                    video_count: count(row, 2)?,
                    analyzed_count: count(row, 3)?,
                    blurred_count: count(row, 4)?,
                    document_count: count(row, 5)?,
                    screenshot_count: count(row, 6)?,
                    large_file_count: count(row, 7)?,
                    text_heavy_count: count(row, 8)?,
                    pending_deletion_count: count(row, 9)?,
                    skipped_count: count(row, 10)?,
                    total_bytes: row.get::<_, i64>(11)? as u64,
                    pending_deletion_bytes: row.get::<_, i64>(12)? as u64,
                    ..DashboardSnapshot::default()
                })
            })?;

            let (groups, grouped, reclaimable) = conn.query_row(
                "SELECT
                    (SELECT COUNT(*) FROM similarity_groups),
                    (SELECT COUNT(*) FROM group_members),
                    (SELECT COALESCE(SUM(a.byte_size), 0)
                     FROM group_members gm
                     JOIN similarity_groups g ON g.id = gm.group_id
                     JOIN assets a ON a.id = gm.asset_id
                     WHERE gm.asset_id != g.cover_id)",
                [],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )?;
            snapshot.similar_group_count = groups as usize;
            snapshot.similar_asset_count = grouped as usize;
            snapshot.reclaimable_similar_bytes = reclaimable as u64;
            Ok(snapshot)
        })
    }

    /// Shared shape of every asset-list query. `filter` may use `?1..?n`
    /// bound to `args`; the page bounds are appended after them.
    fn assets_where(
        &self,
        filter: &str,
        args: &[&dyn ToSql],
        order: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<AssetRecord>> {
        let n = args.len();
        let sql = format!(
            "{ASSET_SELECT} WHERE {filter} ORDER BY {order}, a.id LIMIT ?{} OFFSET ?{}",
            n + 1,
            n + 2
        );
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let offset = offset as i64;
        let mut bound: Vec<&dyn ToSql> = args.to_vec();
        bound.push(&limit);
        bound.push(&offset);

        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let records = stmt
                .query_map(bound.as_slice(), asset_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(records)
        })
    }
}

fn group_members(conn: &Connection, group: &str) -> Result<Vec<AssetRecord>> {
    let sql = format!("{ASSET_SELECT} WHERE gm.group_id = ?1 ORDER BY gm.position");
    let mut stmt = conn.prepare(&sql)?;
    let members = stmt
        .query_map(params![group], asset_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(members)
}

#[cfg(test)]
mod tests {
    use super::super::tests::{analysis, record};
    use super::*;
    use crate::matching::ClusterResult;
    use std::collections::HashMap;

    fn ids(records: &[AssetRecord]) -> Vec<&str> {
        records.iter().map(|r| r.id.as_str()).collect()
    }

    fn catalog_with(records: &[AssetRecord]) -> Catalog {
        let catalog = Catalog::open_in_memory().unwrap();
        catalog.upsert_assets(records).unwrap();
        catalog
    }

    fn pair_group(id: &str, a: &str, b: &str, confidence: f64) -> ClusterResult {
        ClusterResult {
            groups: vec![SimilarityGroup {
                id: id.into(),
                members: vec![a.into(), b.into()],
                confidence,
                cover: a.into(),
            }],
            scores: HashMap::from([(a.to_string(), confidence), (b.to_string(), confidence)]),
        }
    }

    #[test]
    fn test_sequential_orders_newest_first_with_id_tiebreak() {
        let catalog = catalog_with(&[
            record("b", 10, 1),
            record("a", 10, 1),
            record("old", 0, 1),
            record("new", 20, 1),
        ]);
        let all = catalog.sequential(Scope::All, 0, 10).unwrap();
        assert_eq!(ids(&all), vec!["new", "a", "b", "old"]);

        let page = catalog.sequential(Scope::All, 1, 2).unwrap();
        assert_eq!(ids(&page), vec!["a", "b"]);
    }

    #[test]
    fn test_sequential_month_scope() {
        let mut march = record("march", 0, 1);
        march.capture_date = "2024-03-31T23:59:59Z".parse().unwrap();
        let mut april = record("april", 0, 1);
        april.capture_date = "2024-04-01T00:00:00Z".parse().unwrap();
        let catalog = catalog_with(&[march, april]);

        let scope = Scope::Month(MonthKey::new(2024, 3).unwrap());
        assert_eq!(ids(&catalog.sequential(scope, 0, 10).unwrap()), vec!["march"]);
    }

    #[test]
    fn test_ranked_filters_by_mask_and_orders_by_metric() {
        let mut big = record("big", 0, 30 * 1024 * 1024);
        big.tags.set(AssetTags::LARGE_FILE, true);
        let mut bigger = record("bigger", 1, 40 * 1024 * 1024);
        bigger.tags.set(AssetTags::LARGE_FILE, true);
        let catalog = catalog_with(&[big, bigger, record("small", 2, 10)]);

        let large = catalog.ranked(RankedKind::LargeFile, 0, 10).unwrap();
        assert_eq!(ids(&large), vec!["bigger", "big"]);

        catalog
            .apply_analysis(&[analysis("small", 10, 1, 0.05), analysis("big", 30 * 1024 * 1024, 2, 0.2)])
            .unwrap();
        let blurred = catalog.ranked(RankedKind::Blurred, 0, 10).unwrap();
        assert_eq!(ids(&blurred), vec!["small", "big"]);
    }

    #[test]
    fn test_decision_consistency() {
        let catalog = catalog_with(&[record("x", 0, 1), record("y", 1, 1)]);
        catalog
            .apply_decision(&["x".to_string()], Decision::PendingDeletion)
            .unwrap();

        assert!(ids(&catalog.sequential(Scope::All, 0, 10).unwrap()).contains(&"x"));
        assert_eq!(
            ids(&catalog.pending(PendingKind::PendingDeletion, 0, 10).unwrap()),
            vec!["x"]
        );
        assert!(catalog.pending(PendingKind::Skipped, 0, 10).unwrap().is_empty());
    }

    #[test]
    fn test_similarity_groups_resolve_members() {
        let catalog = catalog_with(&[record("a", 0, 1), record("b", 1, 1)]);
        catalog.replace_groups(&pair_group("g", "a", "b", 0.9)).unwrap();

        let groups = catalog.similarity_groups(0, 10).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].key, GroupKey::Similarity("g".into()));
        assert_eq!(ids(&groups[0].members), vec!["a", "b"]);
        assert_eq!(groups[0].cover.as_deref(), Some("a"));
        assert!(catalog.similarity_groups(1, 10).unwrap().is_empty());

        assert!(catalog.group_view("g").unwrap().is_some());
        assert!(catalog.group_view("nope").unwrap().is_none());
    }

    #[test]
    fn test_skipped_groups_by_month_descending() {
        let mut jan = record("jan", 0, 1);
        jan.capture_date = "2024-01-10T12:00:00Z".parse().unwrap();
        let mut feb1 = record("feb1", 0, 1);
        feb1.capture_date = "2024-02-01T08:00:00Z".parse().unwrap();
        let mut feb2 = record("feb2", 0, 1);
        feb2.capture_date = "2024-02-20T08:00:00Z".parse().unwrap();
        let catalog = catalog_with(&[jan, feb1, feb2, record("clean", 0, 1)]);
        catalog
            .apply_decision(
                &["jan".to_string(), "feb1".to_string(), "feb2".to_string()],
                Decision::Skipped,
            )
            .unwrap();

        let groups = catalog.skipped_groups(0, 10).unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].key, GroupKey::Month(MonthKey::new(2024, 2).unwrap()));
        assert_eq!(ids(&groups[0].members), vec!["feb2", "feb1"]);
        assert_eq!(groups[1].key, GroupKey::Month(MonthKey::new(2024, 1).unwrap()));
    }

    #[test]
    fn test_month_buckets_aggregate() {
        let mut a = record("a", 0, 100);
        a.capture_date = "2024-05-02T00:00:00Z".parse().unwrap();
        let mut b = record("b", 0, 200);
        b.capture_date = "2024-05-20T00:00:00Z".parse().unwrap();
        let mut c = record("c", 0, 50);
        c.capture_date = "2023-11-02T00:00:00Z".parse().unwrap();
        let catalog = catalog_with(&[a, b, c]);
        catalog
            .apply_decision(&["b".to_string()], Decision::PendingDeletion)
            .unwrap();

        let buckets = catalog.month_buckets().unwrap();
        assert_eq!(buckets.len(), 2);
        let may = &buckets[0];
        assert_eq!(may.month, MonthKey::new(2024, 5).unwrap());
        assert_eq!(may.asset_count, 2);
        assert_eq!(may.pending_count, 1);
        assert_eq!(may.total_bytes, 300);
        assert_eq!(may.cover.as_deref(), Some("a"), "pending assets are not covers");

        let only = catalog
            .month_buckets_page(Some(MonthKey::new(2023, 11).unwrap()), 0, 10)
            .unwrap();
        assert_eq!(only.len(), 1);
        assert_eq!(only[0].asset_count, 1);
    }

    #[test]
    fn test_dashboard_totals() {
        let mut shot = record("shot", 0, 10);
        shot.tags.set(AssetTags::SCREENSHOT, true);
        let catalog = catalog_with(&[record("a", 0, 100), record("b", 1, 300), shot]);
        catalog.replace_groups(&pair_group("g", "a", "b", 0.95)).unwrap();
        catalog
            .apply_decision(&["b".to_string()], Decision::PendingDeletion)
            .unwrap();

        let d = catalog.dashboard().unwrap();
        assert_eq!(d.total_count, 3);
        assert_eq!(d.photo_count, 3);
        assert_eq!(d.screenshot_count, 1);
        assert_eq!(d.pending_deletion_count, 1);
        assert_eq!(d.pending_deletion_bytes, 300);
        assert_eq!(d.total_bytes, 410);
        assert_eq!(d.similar_group_count, 1);
        assert_eq!(d.similar_asset_count, 2);
        assert_eq!(d.reclaimable_similar_bytes, 300);
    }

    #[test]
    fn test_dashboard_on_empty_catalog() {
        let catalog = Catalog::open_in_memory().unwrap();
        assert_eq!(catalog.dashboard().unwrap(), DashboardSnapshot::default());
    }

    #[test]
    fn test_page_dispatch_for_every_intent() {
        let catalog = catalog_with(&[record("a", 0, 1)]);
        for intent in [
            QueryIntent::Sequential(Scope::All),
            QueryIntent::Grouped(GroupedKind::Similar),
            QueryIntent::Grouped(GroupedKind::Skipped),
            QueryIntent::Ranked(RankedKind::Screenshot),
            QueryIntent::Pending(PendingKind::Skipped),
            QueryIntent::Bucketed(None),
            QueryIntent::Dashboard,
        ] {
            catalog.page(intent, 0, intent.page_size()).unwrap();
        }
        assert_eq!(catalog.page(QueryIntent::Dashboard, 0, 1).unwrap().len(), 1);
        assert!(catalog.page(QueryIntent::Dashboard, 1, 1).unwrap().is_empty());
        assert_eq!(catalog.page(QueryIntent::Bucketed(None), 0, 24).unwrap().len(), 1);
    }
}
