pub mod score;

use std::collections::HashMap;
use std::time::Duration;

use rayon::prelude::*;
use uuid::Uuid;

use crate::domain::{AssetId, GroupId, SimilarityGroup};
use score::{hamming_distance, similarity_from_hamming, within_threshold};

/// An analyzed asset eligible for clustering.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterInput {
    pub id: AssetId,
    pub captured_at_ms: i64,
    pub perceptual_hash: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct ClusterParams {
    /// Consecutive assets further apart than this start a new time bucket.
    pub window: Duration,
    /// Hamming distances strictly below this are considered similar.
    pub hamming_threshold: u32,
}

impl Default for ClusterParams {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(3),
            hamming_threshold: 10,
        }
    }
}

/// Output of one full clustering pass.
#[derive(Debug, Clone, Default)]
pub struct ClusterResult {
    pub groups: Vec<SimilarityGroup>,
    /// Best similarity of each grouped asset to any other member of its group.
    pub scores: HashMap<AssetId, f64>,
}

impl ClusterResult {
    /// asset id → group id for every grouped asset.
    pub fn assignments(&self) -> HashMap<AssetId, GroupId> {
        self.groups
            .iter()
            .flat_map(|g| g.members.iter().map(move |m| (m.clone(), g.id.clone())))
            .collect()
    }

    pub fn grouped_count(&self) -> usize {
        self.groups.iter().map(|g| g.members.len()).sum()
    }
}

/// Run the full clustering pass. Group ids are freshly minted every call.
pub fn find_similar(inputs: &[ClusterInput], params: ClusterParams) -> ClusterResult {
    if inputs.len() < 2 {
        return ClusterResult::default();
    }

    let mut sorted: Vec<&ClusterInput> = inputs.iter().collect();
    sorted.sort_by(|a, b| {
        a.captured_at_ms
            .cmp(&b.captured_at_ms)
            .then_with(|| a.id.cmp(&b.id))
    });

    let window_ms = params.window.as_millis() as i64;
    let buckets = bucket_by_time(&sorted, window_ms);

    // Buckets are independent, so they cluster in parallel.
    let clusters: Vec<Vec<Vec<&ClusterInput>>> = buckets
        .par_iter()
        .map(|bucket| cluster_bucket(bucket, params.hamming_threshold))
        .collect();

    let mut result = ClusterResult::default();
    for members in clusters.into_iter().flatten() {
        let (group, scores) = build_group(&members);
        result.scores.extend(scores);
        result.groups.push(group);
    }
    result
}

/// Split capture-sorted assets wherever the gap to the previous asset
/// exceeds the window. Singleton buckets are dropped.
fn bucket_by_time<'a>(sorted: &[&'a ClusterInput], window_ms: i64) -> Vec<Vec<&'a ClusterInput>> {
    let mut buckets: Vec<Vec<&ClusterInput>> = Vec::new();
    let mut current: Vec<&ClusterInput> = Vec::new();

    for &input in sorted {
        if let Some(prev) = current.last() {
            if input.captured_at_ms - prev.captured_at_ms > window_ms {
                buckets.push(std::mem::take(&mut current));
            }
        }
        current.push(input);
    }
    buckets.push(current);

    buckets.retain(|b| b.len() >= 2);
    buckets
}

/// Greedy transitive clustering inside one bucket: a seed pulls in every
/// unclustered asset within threshold, and each newcomer does the same,
/// until nothing else joins. Groups of one are discarded.
fn cluster_bucket<'a>(bucket: &[&'a ClusterInput], threshold: u32) -> Vec<Vec<&'a ClusterInput>> {
    let mut clustered = vec![false; bucket.len()];
    let mut groups = Vec::new();

    for seed in 0..bucket.len() {
        if clustered[seed] {
            continue;
        }
        clustered[seed] = true;

        let mut members = vec![seed];
        let mut frontier = vec![seed];
        while let Some(current) = frontier.pop() {
            let hash = bucket[current].perceptual_hash;
            for candidate in 0..bucket.len() {
                if clustered[candidate] {
                    continue;
                }
                if within_threshold(hash, bucket[candidate].perceptual_hash, threshold) {
                    clustered[candidate] = true;
                    members.push(candidate);
                    frontier.push(candidate);
                }
            }
        }

        if members.len() >= 2 {
            members.sort_unstable();
            groups.push(members.into_iter().map(|i| bucket[i]).collect());
        }
    }

    groups
}

/// Score members and elect the cover. Confidence is the best pairwise
/// similarity in the group; the cover is the member with the highest score,
/// earliest capture winning ties.
fn build_group(members: &[&ClusterInput]) -> (SimilarityGroup, HashMap<AssetId, f64>) {
    let mut best = vec![0.0_f64; members.len()];
    for i in 0..members.len() {
        for j in (i + 1)..members.len() {
            let sim = similarity_from_hamming(hamming_distance(
                members[i].perceptual_hash,
                members[j].perceptual_hash,
            ));
            best[i] = best[i].max(sim);
            best[j] = best[j].max(sim);
        }
    }

    let confidence = best.iter().copied().fold(0.0, f64::max);
    let mut cover = 0;
    for (i, score) in best.iter().enumerate() {
        if *score > best[cover] {
            cover = i;
        }
    }

    let scores = members
        .iter()
        .zip(&best)
        .map(|(m, s)| (m.id.clone(), *s))
        .collect();

    let group = SimilarityGroup {
        id: Uuid::new_v4().to_string(),
        members: members.iter().map(|m| m.id.clone()).collect(),
        confidence,
        cover: members[cover].id.clone(),
    };
    (group, scores)
}
