/// Width of the perceptual hashes produced by the feature extractor.
pub const HASH_BITS: u32 = 64;

/// Compute the Hamming distance between two hash values.
pub fn hamming_distance(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

/// Map a Hamming distance to a similarity in `[0, 1]`; identical hashes score 1.
pub fn similarity_from_hamming(distance: u32) -> f64 {
    1.0 - f64::from(distance.min(HASH_BITS)) / f64::from(HASH_BITS)
}

/// Whether two hashes are close enough to share a cluster.
pub fn within_threshold(a: u64, b: u64, threshold: u32) -> bool {
    hamming_distance(a, b) < threshold
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hamming_distance() {
        assert_eq!(hamming_distance(0, 0), 0);
        assert_eq!(hamming_distance(0b1111_0000, 0b1111_0001), 1);
        assert_eq!(hamming_distance(0, u64::MAX), 64);
    }

    #[test]
    fn test_similarity_from_hamming() {
        assert_eq!(similarity_from_hamming(0), 1.0);
        assert_eq!(similarity_from_hamming(32), 0.5);
        assert_eq!(similarity_from_hamming(64), 0.0);
        assert_eq!(similarity_from_hamming(100), 0.0);
    }

    #[test]
    fn test_threshold_is_exclusive() {
        assert!(within_threshold(0, 0b1_1111_1111, 10)); // 9 bits
        assert!(!within_threshold(0, 0b11_1111_1111, 10)); // 10 bits
    }
}
