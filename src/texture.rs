//! Gray-level co-occurrence texture scoring for areas of interest.
//!
//! A detection whose texture looks like its surroundings is usually a false
//! positive (a bright rock, a patch of glare). Each AOI is scored twice: once
//! over its detected pixels and once over its whole disk.

use std::f64::consts::PI;

use image::GrayImage;
use serde::{Deserialize, Serialize};

use crate::models::{AreaOfInterest, Point, TextureFeatures, TextureRecord};

/// Regions with fewer pixels than this carry no usable texture.
const MIN_REGION_PIXELS: usize = 4;

#[derive(Debug, Clone)]
pub struct TextureAnalyzer {
    pub distances: Vec<u32>,
    /// Radians.
    pub angles: Vec<f64>,
    /// Gray levels of the input.
    pub levels: u32,
    /// Gray levels the co-occurrence matrix is built over.
    pub normalized_levels: usize,
}

impl Default for TextureAnalyzer {
    fn default() -> Self {
        Self {
            distances: vec![1, 2, 3],
            angles: vec![0.0, PI / 4.0, PI / 2.0, 3.0 * PI / 4.0],
            levels: 256,
            normalized_levels: 64,
        }
    }
}

/// Dense membership bitmap over a region's bounding box.
struct Region {
    x0: i32,
    y0: i32,
    width: i32,
    height: i32,
    inside: Vec<bool>,
    points: Vec<Point>,
}

impl Region {
    fn new(gray: &GrayImage, pixels: &[Point]) -> Option<Self> {
        let (w, h) = (gray.width() as i32, gray.height() as i32);
        let in_image: Vec<Point> = pixels
            .iter()
            .copied()
            .filter(|p| p.x >= 0 && p.y >= 0 && p.x < w && p.y < h)
            .collect();
        let x0 = in_image.iter().map(|p| p.x).min()?;
        let y0 = in_image.iter().map(|p| p.y).min()?;
        let x1 = in_image.iter().map(|p| p.x).max()?;
        let y1 = in_image.iter().map(|p| p.y).max()?;
        let (width, height) = (x1 - x0 + 1, y1 - y0 + 1);

        let mut inside = vec![false; (width * height) as usize];
        let mut points = Vec::with_capacity(in_image.len());
        for p in in_image {
            let idx = ((p.y - y0) * width + (p.x - x0)) as usize;
            if !inside[idx] {
                inside[idx] = true;
                points.push(p);
            }
        }
        Some(Self {
            x0,
            y0,
            width,
            height,
            inside,
            points,
        })
    }

    fn contains(&self, x: i32, y: i32) -> bool {
        let (lx, ly) = (x - self.x0, y - self.y0);
        lx >= 0
            && ly >= 0
            && lx < self.width
            && ly < self.height
            && self.inside[(ly * self.width + lx) as usize]
    }
}

impl TextureAnalyzer {
    fn offsets(&self) -> Vec<(i32, i32)> {
        self.distances
            .iter()
            .flat_map(|&d| {
                self.angles.iter().map(move |&a| {
                    let d = d as f64;
                    ((d * a.cos()).round() as i32, (d * a.sin()).round() as i32)
                })
            })
            .collect()
    }

    fn quantize(&self, value: u8) -> usize {
        let level = value as usize * self.normalized_levels / self.levels.max(1) as usize;
        level.min(self.normalized_levels.saturating_sub(1))
    }

    /// Texture features over exactly `pixels`. Only pixel pairs with both
    /// ends inside the region contribute.
    pub fn features(&self, gray: &GrayImage, pixels: &[Point]) -> TextureFeatures {
        let Some(region) = Region::new(gray, pixels) else {
            return TextureFeatures::neutral();
        };
        if region.points.len() < MIN_REGION_PIXELS || self.normalized_levels == 0 {
            return TextureFeatures::neutral();
        }

        let levels = self.normalized_levels;
        let mut glcm = vec![0f64; levels * levels];
        let mut sums = [0f64; 6];
        let mut used = 0usize;

        for (dx, dy) in self.offsets() {
            glcm.iter_mut().for_each(|v| *v = 0.0);
            let mut pairs = 0f64;
            for p in &region.points {
                let (qx, qy) = (p.x + dx, p.y + dy);
                if !region.contains(qx, qy) {
                    continue;
                }
                let i = self.quantize(gray.get_pixel(p.x as u32, p.y as u32)[0]);
                let j = self.quantize(gray.get_pixel(qx as u32, qy as u32)[0]);
                glcm[i * levels + j] += 1.0;
                glcm[j * levels + i] += 1.0;
                pairs += 2.0;
            }
            if pairs == 0.0 {
                continue;
            }
            glcm.iter_mut().for_each(|v| *v /= pairs);

            let props = glcm_properties(&glcm, levels);
            for (sum, value) in sums.iter_mut().zip(props) {
                *sum += value;
            }
            used += 1;
        }

        if used == 0 {
            return TextureFeatures::neutral();
        }
        let [contrast, dissimilarity, homogeneity, energy, correlation, asm] =
            sums.map(|s| s / used as f64);
        let mut features = TextureFeatures {
            contrast,
            dissimilarity,
            homogeneity,
            energy,
            correlation,
            asm,
            texture_score: 0.0,
        };
        features.texture_score = composite_score(&features);
        features
    }

    /// Score the detected pixels and the whole disk of one AOI.
    pub fn aoi_textures(&self, gray: &GrayImage, aoi: &AreaOfInterest) -> TextureRecord {
        let detected = self.features(gray, &aoi.detected_pixels);
        let disk = self.features(gray, &disk_pixels(aoi, gray.width(), gray.height()));
        TextureRecord::new(detected, disk)
    }

    pub fn analyze_batch(&self, gray: &GrayImage, aois: &mut [AreaOfInterest]) {
        for aoi in aois.iter_mut() {
            aoi.texture_data = Some(self.aoi_textures(gray, aoi));
        }
    }
}

/// contrast, dissimilarity, homogeneity, energy, correlation, ASM of one
/// normalized symmetric matrix.
fn glcm_properties(glcm: &[f64], levels: usize) -> [f64; 6] {
    let mut contrast = 0.0;
    let mut dissimilarity = 0.0;
    let mut homogeneity = 0.0;
    let mut asm = 0.0;
    let mut mean = 0.0;
    for i in 0..levels {
        for j in 0..levels {
            let p = glcm[i * levels + j];
            if p == 0.0 {
                continue;
            }
            let diff = i as f64 - j as f64;
            contrast += p * diff * diff;
            dissimilarity += p * diff.abs();
            homogeneity += p / (1.0 + diff * diff);
            asm += p * p;
            mean += p * i as f64;
        }
    }

    let mut variance = 0.0;
    let mut covariance = 0.0;
    for i in 0..levels {
        for j in 0..levels {
            let p = glcm[i * levels + j];
            if p == 0.0 {
                continue;
            }
            variance += p * (i as f64 - mean).powi(2);
            covariance += p * (i as f64 - mean) * (j as f64 - mean);
        }
    }
    // Symmetric matrix: both marginals share mean and variance.
    let correlation = if variance < 1e-15 { 1.0 } else { covariance / variance };

    [contrast, dissimilarity, homogeneity, asm.sqrt(), correlation, asm]
}

/// 0-100 texture complexity. Contrast and dissimilarity raise it, homogeneity
/// and energy lower it.
pub fn composite_score(features: &TextureFeatures) -> f64 {
    let contrast = (features.contrast / 10.0).min(1.0);
    let dissimilarity = (features.dissimilarity / 5.0).min(1.0);
    let inhomogeneity = (1.0 - features.homogeneity).clamp(0.0, 1.0);
    let non_uniformity = (1.0 - features.energy).clamp(0.0, 1.0);
    (contrast * 0.3 + dissimilarity * 0.3 + inhomogeneity * 0.2 + non_uniformity * 0.2) * 100.0
}

/// In-bounds pixels of an AOI's disk.
pub fn disk_pixels(aoi: &AreaOfInterest, width: u32, height: u32) -> Vec<Point> {
    let r = aoi.radius.max(0);
    let mut pixels = Vec::new();
    for y in (aoi.center.y - r).max(0)..=(aoi.center.y + r).min(height as i32 - 1) {
        for x in (aoi.center.x - r).max(0)..=(aoi.center.x + r).min(width as i32 - 1) {
            let p = Point::new(x, y);
            if aoi.contains(&p) {
                pixels.push(p);
            }
        }
    }
    pixels
}

/// Thresholds on texture difference and ratio. Unset bounds are ignored and
/// AOIs without texture data always pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TextureFilter {
    pub min_difference: Option<f64>,
    pub min_ratio: Option<f64>,
    pub max_ratio: Option<f64>,
}

impl TextureFilter {
    pub fn keeps(&self, aoi: &AreaOfInterest) -> bool {
        let Some(texture) = &aoi.texture_data else {
            return true;
        };
        if self.min_difference.is_some_and(|min| texture.texture_difference < min) {
            return false;
        }
        if self.min_ratio.is_some_and(|min| texture.texture_ratio < min) {
            return false;
        }
        if self.max_ratio.is_some_and(|max| texture.texture_ratio > max) {
            return false;
        }
        true
    }

    pub fn apply(&self, aois: Vec<AreaOfInterest>) -> Vec<AreaOfInterest> {
        aois.into_iter().filter(|aoi| self.keeps(aoi)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn checkerboard(size: u32) -> GrayImage {
        GrayImage::from_fn(size, size, |x, y| Luma([if (x + y) % 2 == 0 { 0 } else { 255 }]))
    }

    fn square(x0: i32, y0: i32, size: i32) -> Vec<Point> {
        (y0..y0 + size)
            .flat_map(|y| (x0..x0 + size).map(move |x| Point::new(x, y)))
            .collect()
    }

    #[test]
    fn tiny_regions_are_neutral() {
        let analyzer = TextureAnalyzer::default();
        let gray = checkerboard(10);
        assert_eq!(analyzer.features(&gray, &[]), TextureFeatures::neutral());
        let three = [Point::new(1, 1), Point::new(2, 1), Point::new(3, 1)];
        assert_eq!(analyzer.features(&gray, &three), TextureFeatures::neutral());
    }

    #[test]
    fn flat_region_has_no_texture() {
        let gray = GrayImage::from_pixel(20, 20, Luma([120]));
        let features = TextureAnalyzer::default().features(&gray, &square(2, 2, 10));
        assert_eq!(features.contrast, 0.0);
        assert!((features.homogeneity - 1.0).abs() < 1e-12);
        assert!((features.energy - 1.0).abs() < 1e-12);
        assert_eq!(features.correlation, 1.0);
        assert!(features.texture_score.abs() < 1e-9);
    }

    #[test]
    fn checkerboard_scores_high() {
        let features = TextureAnalyzer::default().features(&checkerboard(20), &square(0, 0, 20));
        assert!(features.contrast > 10.0);
        assert!(features.texture_score > 60.0);
        assert!(features.texture_score <= 100.0);
    }

    #[test]
    fn rough_detection_on_smooth_ground_has_high_ratio() {
        let gray = GrayImage::from_fn(40, 40, |x, y| {
            if (15..25).contains(&x) && (15..25).contains(&y) {
                Luma([if (x + y) % 2 == 0 { 20 } else { 230 }])
            } else {
                Luma([100])
            }
        });
        let mut aoi = AreaOfInterest::new(Point::new(20, 20), 12, 100.0);
        aoi.detected_pixels = square(15, 15, 10);
        let record = TextureAnalyzer::default().aoi_textures(&gray, &aoi);
        assert!(record.texture_ratio >= 1.0);
        assert!(record.texture_difference > 0.0);
    }

    #[test]
    fn ratio_is_never_negative() {
        let analyzer = TextureAnalyzer::default();
        let gray = GrayImage::from_fn(30, 30, |x, y| Luma([((x * 37 + y * 11) % 256) as u8]));
        for radius in [0, 2, 5, 9] {
            let mut aoi = AreaOfInterest::new(Point::new(15, 15), radius, 9.0);
            aoi.detected_pixels = square(14, 14, 3);
            let record = analyzer.aoi_textures(&gray, &aoi);
            assert!(record.texture_ratio >= 0.0);
            assert_eq!(record.texture_ratio == 0.0, record.aoi_texture.texture_score == 0.0);
        }
    }

    #[test]
    fn filter_keeps_unscored_aois() {
        let unscored = AreaOfInterest::new(Point::new(0, 0), 1, 1.0);
        let mut scored = AreaOfInterest::new(Point::new(5, 5), 1, 1.0);
        let mut detected = TextureFeatures::neutral();
        detected.texture_score = 10.0;
        let mut surrounding = TextureFeatures::neutral();
        surrounding.texture_score = 20.0;
        scored.texture_data = Some(TextureRecord::new(detected, surrounding));

        let filter = TextureFilter {
            min_ratio: Some(0.8),
            ..Default::default()
        };
        let kept = filter.apply(vec![unscored.clone(), scored.clone()]);
        assert_eq!(kept, vec![unscored]);

        let permissive = TextureFilter {
            max_ratio: Some(0.6),
            min_difference: Some(-15.0),
            ..Default::default()
        };
        assert!(permissive.keeps(&scored));
    }
}
