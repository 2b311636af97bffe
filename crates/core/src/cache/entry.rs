use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{AssetId, AssetTags, GroupId, SimilarityKind};
use crate::source::Features;

/// Persisted, versioned result of analyzing one asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisCacheEntry {
    pub asset_id: AssetId,
    pub schema_version: u32,
    /// Byte size of the asset when it was analyzed; the invalidation fingerprint.
    pub file_size: u64,
    pub is_screenshot: bool,
    pub is_document_like: bool,
    pub is_text_image: bool,
    pub blur_score: f64,
    pub is_blurred_or_shaky: bool,
    pub exposure_is_bad: bool,
    pub perceptual_hash: Option<u64>,
    #[serde(default)]
    pub feature_vector: Vec<u8>,
    pub similarity_group_id: Option<GroupId>,
    pub similarity_kind: Option<SimilarityKind>,
    pub analyzed_at: DateTime<Utc>,
}

impl AnalysisCacheEntry {
    pub fn from_features(
        asset_id: AssetId,
        file_size: u64,
        is_screenshot: bool,
        features: Features,
        schema_version: u32,
        blur_threshold: f64,
    ) -> Self {
        let sharpness = features.sharpness.clamp(0.0, 1.0);
        Self {
            asset_id,
            schema_version,
            file_size,
            is_screenshot,
            is_document_like: features.is_document_like,
            is_text_image: features.is_text_heavy,
            blur_score: 1.0 - sharpness,
            is_blurred_or_shaky: sharpness < blur_threshold,
            exposure_is_bad: features.exposure_bad,
            perceptual_hash: Some(features.perceptual_hash),
            feature_vector: features.feature_vector,
            similarity_group_id: None,
            similarity_kind: None,
            analyzed_at: Utc::now(),
        }
    }

    /// Usable without recomputation only when both the schema and the
    /// file-size fingerprint still match.
    pub fn is_fresh(&self, schema_version: u32, current_byte_size: u64) -> bool {
        self.schema_version == schema_version && self.file_size == current_byte_size
    }

    /// 0.0 to 1.0; document-like content outranks text-heavy content.
    pub fn document_score(&self) -> f64 {
        let mut score = 0.0;
        if self.is_document_like {
            score += 0.6;
        }
        if self.is_text_image {
            score += 0.4;
        }
        score
    }

    /// Classification tags owned by analysis (see [`AssetTags::ANALYSIS_MASK`]).
    pub fn analysis_tags(&self) -> AssetTags {
        let mut tags = AssetTags::empty();
        tags.set(AssetTags::BLURRED, self.is_blurred_or_shaky);
        tags.set(AssetTags::DOCUMENT, self.is_document_like);
        tags.set(AssetTags::TEXT_HEAVY, self.is_text_image);
        tags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features(sharpness: f64) -> Features {
        Features {
            sharpness,
            exposure_bad: false,
            perceptual_hash: 0xABCD,
            feature_vector: vec![1, 2, 3],
            is_document_like: true,
            is_text_heavy: false,
        }
    }

    #[test]
    fn test_from_features_derives_blur() {
        let entry = AnalysisCacheEntry::from_features("a".into(), 10, false, features(0.2), 3, 0.35);
        assert!(entry.is_blurred_or_shaky);
        assert!((entry.blur_score - 0.8).abs() < 1e-9);
        assert_eq!(entry.perceptual_hash, Some(0xABCD));

        let sharp = AnalysisCacheEntry::from_features("b".into(), 10, false, features(0.9), 3, 0.35);
        assert!(!sharp.is_blurred_or_shaky);
    }

    #[test]
    fn test_freshness_requires_version_and_size() {
        let entry = AnalysisCacheEntry::from_features("a".into(), 10, false, features(0.5), 3, 0.35);
        assert!(entry.is_fresh(3, 10));
        assert!(!entry.is_fresh(3, 11));
        assert!(!entry.is_fresh(4, 10));
    }

    #[test]
    fn test_analysis_tags_and_document_score() {
        let entry = AnalysisCacheEntry::from_features("a".into(), 10, true, features(0.1), 3, 0.35);
        let tags = entry.analysis_tags();
        assert!(tags.contains(AssetTags::BLURRED));
        assert!(tags.contains(AssetTags::DOCUMENT));
        assert!(!tags.contains(AssetTags::SCREENSHOT));
        assert!((entry.document_score() - 0.6).abs() < 1e-9);
    }
}
