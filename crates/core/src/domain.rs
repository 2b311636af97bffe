use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Stable, source-assigned asset identifier.
pub type AssetId = String;

/// Identifier of a similarity group. Reassigned on every clustering pass.
pub type GroupId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaType {
    Photo,
    Live,
    Video,
    Gif,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Photo => "photo",
            MediaType::Live => "live",
            MediaType::Video => "video",
            MediaType::Gif => "gif",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "live" => MediaType::Live,
            "video" => MediaType::Video,
            "gif" => MediaType::Gif,
            _ => MediaType::Photo,
        }
    }

    /// Whether the feature extractor can analyze this media type.
    pub fn is_analyzable(&self) -> bool {
        !matches!(self, MediaType::Video)
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bitset of asset classification tags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AssetTags(u8);

impl AssetTags {
    pub const BLURRED: AssetTags = AssetTags(1 << 0);
    pub const DOCUMENT: AssetTags = AssetTags(1 << 1);
    pub const SCREENSHOT: AssetTags = AssetTags(1 << 2);
    pub const LARGE_FILE: AssetTags = AssetTags(1 << 3);
    pub const TEXT_HEAVY: AssetTags = AssetTags(1 << 4);

    /// Tags derived from analysis; everything else comes from the source.
    pub const ANALYSIS_MASK: AssetTags = AssetTags(1 | (1 << 1) | (1 << 4));

    pub const fn empty() -> Self {
        AssetTags(0)
    }

    pub const fn from_bits(bits: u8) -> Self {
        AssetTags(bits & 0b1_1111)
    }

    pub const fn bits(&self) -> u8 {
        self.0
    }

    pub const fn union(self, other: AssetTags) -> Self {
        AssetTags(self.0 | other.0)
    }

    pub fn contains(&self, other: AssetTags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(&self, other: AssetTags) -> bool {
        self.0 & other.0 != 0
    }

    pub fn set(&mut self, tag: AssetTags, on: bool) {
        if on {
            self.0 |= tag.0;
        } else {
            self.0 &= !tag.0;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

/// The user's verdict on an asset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Decision {
    #[default]
    Clean,
    PendingDeletion,
    Skipped,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Clean => "clean",
            Decision::PendingDeletion => "pending_deletion",
            Decision::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "pending_deletion" => Decision::PendingDeletion,
            "skipped" => Decision::Skipped,
            _ => Decision::Clean,
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Decision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "clean" => Ok(Decision::Clean),
            "pending_deletion" | "pending" | "delete" => Ok(Decision::PendingDeletion),
            "skipped" | "skip" | "keep" => Ok(Decision::Skipped),
            other => Err(format!("unknown decision: {other}")),
        }
    }
}

/// Calendar month in UTC, used for bucketing and month-scoped queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MonthKey {
    pub year: i32,
    pub month: u32,
}

impl MonthKey {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        if (1..=12).contains(&month) {
            Some(Self { year, month })
        } else {
            None
        }
    }

    pub fn of(date: DateTime<Utc>) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn next(&self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    /// Half-open `[start, end)` range of the month in Unix milliseconds.
    pub fn millis_range(&self) -> (i64, i64) {
        (month_start_millis(*self), month_start_millis(self.next()))
    }
}

fn month_start_millis(key: MonthKey) -> i64 {
    Utc.with_ymd_and_hms(key.year, key.month, 1, 0, 0, 0)
        .single()
        .map(|d| d.timestamp_millis())
        .unwrap_or(0)
}

impl fmt::Display for MonthKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for MonthKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (y, m) = s
            .split_once('-')
            .ok_or_else(|| format!("expected YYYY-MM, got {s}"))?;
        let year: i32 = y.parse().map_err(|_| format!("invalid year in {s}"))?;
        let month: u32 = m.parse().map_err(|_| format!("invalid month in {s}"))?;
        MonthKey::new(year, month).ok_or_else(|| format!("month out of range in {s}"))
    }
}

/// Which slice of the library a sequential query or ingestion covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scope {
    All,
    Month(MonthKey),
}

impl Scope {
    pub fn contains(&self, date: DateTime<Utc>) -> bool {
        match self {
            Scope::All => true,
            Scope::Month(key) => MonthKey::of(date) == *key,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::All => f.write_str("all"),
            Scope::Month(key) => write!(f, "{key}"),
        }
    }
}

/// What the asset source reports about one asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetDescriptor {
    pub id: AssetId,
    pub capture_date: DateTime<Utc>,
    pub byte_size: u64,
    pub pixel_width: u32,
    pub pixel_height: u32,
    pub media_type: MediaType,
    pub file_name: String,
    pub album_name: Option<String>,
    /// Set when the source itself classifies the asset as a screenshot.
    pub is_screenshot: bool,
}

/// One indexed asset as stored in the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetRecord {
    pub id: AssetId,
    pub capture_date: DateTime<Utc>,
    pub file_name: String,
    pub byte_size: u64,
    pub pixel_width: u32,
    pub pixel_height: u32,
    pub media_type: MediaType,
    pub album_name: Option<String>,
    pub tags: AssetTags,
    pub decision: Decision,
    pub group_identifier: Option<GroupId>,
    pub perceptual_hash: Option<u64>,
    pub blur_score: f64,
    pub document_score: f64,
    pub similarity_score: f64,
}

impl AssetRecord {
    /// Fresh, unanalyzed record for a descriptor.
    pub fn from_descriptor(desc: &AssetDescriptor, large_file_threshold: u64) -> Self {
        let mut tags = AssetTags::empty();
        tags.set(AssetTags::SCREENSHOT, desc.is_screenshot);
        tags.set(AssetTags::LARGE_FILE, desc.byte_size >= large_file_threshold);
        Self {
            id: desc.id.clone(),
            capture_date: desc.capture_date,
            file_name: desc.file_name.clone(),
            byte_size: desc.byte_size,
            pixel_width: desc.pixel_width,
            pixel_height: desc.pixel_height,
            media_type: desc.media_type,
            album_name: desc.album_name.clone(),
            tags,
            decision: Decision::Clean,
            group_identifier: None,
            perceptual_hash: None,
            blur_score: 0.0,
            document_score: 0.0,
            similarity_score: 0.0,
        }
    }

    pub fn month(&self) -> MonthKey {
        MonthKey::of(self.capture_date)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SimilarityKind {
    Similar,
}

/// A cluster of near-duplicate assets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityGroup {
    pub id: GroupId,
    pub members: Vec<AssetId>,
    pub confidence: f64,
    pub cover: AssetId,
}

/// Monthly aggregate for the timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthBucket {
    pub month: MonthKey,
    pub asset_count: usize,
    pub pending_count: usize,
    pub blurred_count: usize,
    pub document_count: usize,
    pub total_bytes: u64,
    pub cover: Option<AssetId>,
}

/// Library-wide totals for the dashboard.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DashboardSnapshot {
    pub total_count: usize,
    pub photo_count: usize,
    pub video_count: usize,
    pub analyzed_count: usize,
    pub blurred_count: usize,
    pub document_count: usize,
    pub screenshot_count: usize,
    pub large_file_count: usize,
    pub text_heavy_count: usize,
    pub pending_deletion_count: usize,
    pub skipped_count: usize,
    pub similar_group_count: usize,
    pub similar_asset_count: usize,
    pub total_bytes: u64,
    pub pending_deletion_bytes: u64,
    /// Bytes held by group members other than each group's cover.
    pub reclaimable_similar_bytes: u64,
}
