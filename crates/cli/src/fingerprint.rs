use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use image::imageops::FilterType;
use image::{DynamicImage, GrayImage};

use photosift_core::{AssetId, Error, FeatureExtractor, Features, Result};

use crate::library::DirectorySource;

/// Side of the grayscale thumbnail used for sharpness and content heuristics.
const SAMPLE_SIZE: u32 = 128;

/// Coarse reference extractor: dHash, gradient sharpness, mean-luminance
/// exposure and a bright-page/edge-density document guess.
pub struct FingerprintExtractor {
    library: Arc<DirectorySource>,
}

impl FingerprintExtractor {
    pub fn new(library: Arc<DirectorySource>) -> Self {
        Self { library }
    }
}

#[async_trait]
impl FeatureExtractor for FingerprintExtractor {
    async fn analyze(&self, id: &AssetId) -> Result<Features> {
        let path: PathBuf = self
            .library
            .path_of(id)
            .ok_or_else(|| Error::AssetNotFound(id.clone()))?
            .to_path_buf();
        let features = tokio::task::spawn_blocking(move || fingerprint(&path))
            .await
            .map_err(|e| Error::ExtractionFailed {
                id: id.clone(),
                message: e.to_string(),
            })?;
        features.map_err(|message| Error::ExtractionFailed {
            id: id.clone(),
            message,
        })
    }
}

/// Decode, orient and measure one image.
pub fn fingerprint(path: &Path) -> std::result::Result<Features, String> {
    let img = image::open(path).map_err(|e| e.to_string())?;
    let img = orient(img, read_exif_orientation(path));

    let hash_pixels = img.resize_exact(9, 8, FilterType::Triangle).to_luma8();
    let sample = img
        .resize_exact(SAMPLE_SIZE, SAMPLE_SIZE, FilterType::Triangle)
        .to_luma8();

    let stats = SampleStats::measure(&sample);
    Ok(Features {
        sharpness: stats.sharpness(),
        exposure_bad: !(40.0..=215.0).contains(&stats.mean_luma),
        perceptual_hash: dhash(hash_pixels.as_raw()),
        feature_vector: hash_pixels.into_raw(),
        is_document_like: stats.bright_ratio > 0.55 && stats.edge_ratio > 0.04,
        is_text_heavy: stats.edge_ratio > 0.12 && stats.bright_ratio > 0.35,
    })
}

/// Difference hash over a 9x8 grayscale buffer: one bit per horizontal
/// neighbour pair, set when the left pixel is brighter.
pub fn dhash(pixels: &[u8]) -> u64 {
    let mut hash = 0u64;
    for row in 0..8 {
        for col in 0..8 {
            if pixels[row * 9 + col] > pixels[row * 9 + col + 1] {
                hash |= 1 << (row * 8 + col);
            }
        }
    }
    hash
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct SampleStats {
    mean_luma: f64,
    /// Mean absolute horizontal plus vertical gradient.
    mean_gradient: f64,
    bright_ratio: f64,
    edge_ratio: f64,
}

impl SampleStats {
    fn measure(sample: &GrayImage) -> Self {
        let (w, h) = sample.dimensions();
        let px = |x: u32, y: u32| sample.get_pixel(x, y).0[0] as f64;

        let mut luma_sum = 0.0;
        let mut bright = 0usize;
        for p in sample.pixels() {
            luma_sum += p.0[0] as f64;
            if p.0[0] > 190 {
                bright += 1;
            }
        }

        let mut gradient_sum = 0.0;
        let mut edges = 0usize;
        let mut samples = 0usize;
        for y in 0..h.saturating_sub(1) {
            for x in 0..w.saturating_sub(1) {
                let g = (px(x + 1, y) - px(x, y)).abs() + (px(x, y + 1) - px(x, y)).abs();
                gradient_sum += g;
                if g > 40.0 {
                    edges += 1;
                }
                samples += 1;
            }
        }

        let total = (w * h).max(1) as f64;
        let samples = samples.max(1) as f64;
        Self {
            mean_luma: luma_sum / total,
            mean_gradient: gradient_sum / samples,
            bright_ratio: bright as f64 / total,
            edge_ratio: edges as f64 / samples,
        }
    }

    /// Maps mean gradient onto 0..1; about 12 levels per pixel reads as sharp.
    fn sharpness(&self) -> f64 {
        (self.mean_gradient / 12.0).clamp(0.0, 1.0)
    }
}

/// EXIF orientation tag (1-8), 1 when missing or unreadable.
fn read_exif_orientation(path: &Path) -> u8 {
    let read = || -> Option<u8> {
        let file = File::open(path).ok()?;
        let mut reader = BufReader::new(file);
        let exif = exif::Reader::new().read_from_container(&mut reader).ok()?;
        let field = exif.get_field(exif::Tag::Orientation, exif::In::PRIMARY)?;
        field.value.get_uint(0).map(|v| v as u8)
    };
    read().unwrap_or(1)
}

/// Undo an EXIF orientation so rotated originals hash like upright copies.
fn orient(img: DynamicImage, orientation: u8) -> DynamicImage {
    match orientation {
        2 => img.fliph(),
        3 => img.rotate180(),
        4 => img.flipv(),
        5 => img.rotate90().fliph(),
        6 => img.rotate90(),
        7 => img.rotate270().fliph(),
        8 => img.rotate270(),
        _ => img,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, Rgb, RgbImage};

    fn gradient(path: &Path, seed: u8) {
        let img = RgbImage::from_fn(64, 64, |x, y| {
            Rgb([
                seed.wrapping_add((x * 3) as u8),
                seed.wrapping_add((y * 3) as u8),
                seed.wrapping_add(((x + y) * 2) as u8),
            ])
        });
        img.save(path).unwrap();
    }

    #[test]
    fn test_dhash_of_flat_image_is_zero() {
        assert_eq!(dhash(&[128u8; 72]), 0);
    }

    #[test]
    fn test_dhash_of_descending_rows_is_all_ones() {
        let pixels: Vec<u8> = (0..8).flat_map(|_| (0..9).rev().map(|v| v * 20)).collect();
        assert_eq!(dhash(&pixels), u64::MAX);
    }

    #[test]
    fn test_identical_files_share_a_hash() {
        let tmp = tempfile::tempdir().unwrap();
        let a = tmp.path().join("a.png");
        let b = tmp.path().join("b.png");
        gradient(&a, 10);
        std::fs::copy(&a, &b).unwrap();

        let fa = fingerprint(&a).unwrap();
        let fb = fingerprint(&b).unwrap();
        assert_eq!(fa.perceptual_hash, fb.perceptual_hash);
        assert_eq!(fa.feature_vector.len(), 72);
    }

    #[test]
    fn test_flat_image_is_blurry_and_badly_exposed() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("dark.png");
        image::GrayImage::from_pixel(64, 64, Luma([5])).save(&path).unwrap();

        let features = fingerprint(&path).unwrap();
        assert_eq!(features.sharpness, 0.0);
        assert!(features.exposure_bad);
        assert!(!features.is_document_like);
    }

    #[test]
    fn test_checkerboard_is_sharp() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("checks.png");
        image::GrayImage::from_fn(256, 256, |x, y| {
            if (x / 4 + y / 4) % 2 == 0 {
                Luma([30])
            } else {
                Luma([220])
            }
        })
        .save(&path)
        .unwrap();

        let features = fingerprint(&path).unwrap();
        assert!(features.sharpness > 0.9, "sharpness {}", features.sharpness);
    }

    #[test]
    fn test_undecodable_file_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("broken.jpg");
        std::fs::write(&path, b"not an image").unwrap();
        assert!(fingerprint(&path).is_err());
    }

    #[test]
    fn test_orientation_swaps_dimensions() {
        let img = DynamicImage::ImageLuma8(image::GrayImage::new(4, 2));
        let turned = orient(img, 6);
        assert_eq!((turned.width(), turned.height()), (2, 4));
    }
}
