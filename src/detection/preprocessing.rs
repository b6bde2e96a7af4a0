//! Image-wide adjustments applied identically to every frame before detection.

use std::path::Path;

use anyhow::Context;
use image::{GrayImage, RgbImage};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::index::sample;

pub fn rgb_to_grayscale(img: &RgbImage) -> GrayImage {
    image::imageops::grayscale(img)
}

/// Per-channel histogram matching against a reference image.
#[derive(Debug, Clone)]
pub struct HistogramMatcher {
    /// Cumulative distribution of each reference channel, as (quantile, value)
    /// pairs for the values that occur.
    reference: [Vec<(f64, f64)>; 3],
}

impl HistogramMatcher {
    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let img = image::open(path)
            .with_context(|| format!("Failed to open histogram reference {:?}", path))?;
        Ok(Self::new(&img.to_rgb8()))
    }

    pub fn new(reference: &RgbImage) -> Self {
        let histograms = channel_histograms(reference);
        Self {
            reference: histograms.map(|h| quantile_points(&h)),
        }
    }

    pub fn apply(&self, src: &RgbImage) -> RgbImage {
        let histograms = channel_histograms(src);
        let mut luts = [[0u8; 256]; 3];
        for c in 0..3 {
            let src_points = quantile_points(&histograms[c]);
            for (quantile, value) in src_points {
                let mapped = interpolate(quantile, &self.reference[c]);
                luts[c][value as usize] = mapped.round().clamp(0.0, 255.0) as u8;
            }
        }

        let mut out = src.clone();
        for pixel in out.pixels_mut() {
            for c in 0..3 {
                pixel[c] = luts[c][pixel[c] as usize];
            }
        }
        out
    }
}

fn channel_histograms(img: &RgbImage) -> [[u64; 256]; 3] {
    let mut hist = [[0u64; 256]; 3];
    for pixel in img.pixels() {
        for c in 0..3 {
            hist[c][pixel[c] as usize] += 1;
        }
    }
    hist
}

fn quantile_points(hist: &[u64; 256]) -> Vec<(f64, f64)> {
    let total: u64 = hist.iter().sum();
    if total == 0 {
        return Vec::new();
    }
    let mut cumulative = 0u64;
    let mut points = Vec::new();
    for (value, &count) in hist.iter().enumerate() {
        if count == 0 {
            continue;
        }
        cumulative += count;
        points.push((cumulative as f64 / total as f64, value as f64));
    }
    points
}

/// Piecewise-linear lookup of `x` in ascending `(x, y)` points, clamped at
/// both ends.
fn interpolate(x: f64, points: &[(f64, f64)]) -> f64 {
    match points {
        [] => x * 255.0,
        [only] => only.1,
        _ => {
            if x <= points[0].0 {
                return points[0].1;
            }
            for pair in points.windows(2) {
                let (x0, y0) = pair[0];
                let (x1, y1) = pair[1];
                if x <= x1 {
                    let t = if x1 > x0 { (x - x0) / (x1 - x0) } else { 0.0 };
                    return y0 + t * (y1 - y0);
                }
            }
            points[points.len() - 1].1
        }
    }
}

/// Color quantization to a fixed number of clusters.
#[derive(Debug, Clone)]
pub struct KMeansQuantizer {
    pub clusters: usize,
    pub attempts: usize,
    pub max_iterations: usize,
    pub epsilon: f32,
    /// Centers are fitted on at most this many pixels; every pixel is then
    /// assigned to its nearest center.
    pub sample_limit: usize,
    pub seed: u64,
}

impl KMeansQuantizer {
    pub fn new(clusters: usize) -> Self {
        Self {
            clusters,
            attempts: 3,
            max_iterations: 10,
            epsilon: 0.2,
            sample_limit: 100_000,
            seed: 0x5eed,
        }
    }

    pub fn apply(&self, src: &RgbImage) -> RgbImage {
        let pixels: Vec<[f32; 3]> = src
            .pixels()
            .map(|p| [p[0] as f32, p[1] as f32, p[2] as f32])
            .collect();
        if pixels.is_empty() || self.clusters == 0 {
            return src.clone();
        }

        let step = (pixels.len() / self.sample_limit.max(1)).max(1);
        let training: Vec<[f32; 3]> = pixels.iter().step_by(step).copied().collect();
        let centers = self.fit(&training);

        let mut out = src.clone();
        for (pixel, value) in out.pixels_mut().zip(&pixels) {
            let center = centers[nearest(value, &centers)];
            for c in 0..3 {
                pixel[c] = center[c].round().clamp(0.0, 255.0) as u8;
            }
        }
        out
    }

    fn fit(&self, points: &[[f32; 3]]) -> Vec<[f32; 3]> {
        let k = self.clusters.min(points.len());
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut best: Option<(f64, Vec<[f32; 3]>)> = None;

        for _ in 0..self.attempts.max(1) {
            let mut centers: Vec<[f32; 3]> = sample(&mut rng, points.len(), k)
                .into_iter()
                .map(|i| points[i])
                .collect();

            let mut compactness = 0.0;
            for _ in 0..self.max_iterations.max(1) {
                let mut sums = vec![[0f64; 3]; k];
                let mut counts = vec![0usize; k];
                compactness = 0.0;
                for p in points {
                    let idx = nearest(p, &centers);
                    compactness += distance_sq(p, &centers[idx]) as f64;
                    counts[idx] += 1;
                    for c in 0..3 {
                        sums[idx][c] += p[c] as f64;
                    }
                }

                let mut shift = 0f32;
                for i in 0..k {
                    if counts[i] == 0 {
                        continue;
                    }
                    let updated = [
                        (sums[i][0] / counts[i] as f64) as f32,
                        (sums[i][1] / counts[i] as f64) as f32,
                        (sums[i][2] / counts[i] as f64) as f32,
                    ];
                    shift = shift.max(distance_sq(&updated, &centers[i]).sqrt());
                    centers[i] = updated;
                }
                if shift < self.epsilon {
                    break;
                }
            }

            if best.as_ref().is_none_or(|(score, _)| compactness < *score) {
                best = Some((compactness, centers));
            }
        }

        best.map(|(_, centers)| centers).unwrap_or_default()
    }
}

fn distance_sq(a: &[f32; 3], b: &[f32; 3]) -> f32 {
    let d0 = a[0] - b[0];
    let d1 = a[1] - b[1];
    let d2 = a[2] - b[2];
    d0 * d0 + d1 * d1 + d2 * d2
}

fn nearest(p: &[f32; 3], centers: &[[f32; 3]]) -> usize {
    let mut best = 0;
    let mut best_dist = f32::MAX;
    for (i, c) in centers.iter().enumerate() {
        let d = distance_sq(p, c);
        if d < best_dist {
            best_dist = d;
            best = i;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use std::collections::HashSet;

    #[test]
    fn kmeans_limits_palette() {
        let img = RgbImage::from_fn(40, 40, |x, y| {
            Rgb([(x * 6) as u8, (y * 6) as u8, ((x + y) * 3) as u8])
        });
        let out = KMeansQuantizer::new(4).apply(&img);
        let colors: HashSet<[u8; 3]> = out.pixels().map(|p| p.0).collect();
        assert!(colors.len() <= 4);
        assert_eq!(out.dimensions(), img.dimensions());
    }

    #[test]
    fn histogram_matching_against_itself_is_identity() {
        let img = RgbImage::from_fn(16, 16, |x, y| Rgb([(x * 16) as u8, (y * 16) as u8, 128]));
        let matcher = HistogramMatcher::new(&img);
        assert_eq!(matcher.apply(&img), img);
    }

    #[test]
    fn histogram_matching_shifts_toward_reference() {
        let dark = RgbImage::from_fn(8, 8, |x, _| Rgb([(x * 4) as u8; 3]));
        let bright = RgbImage::from_fn(8, 8, |x, _| Rgb([(200 + x * 4) as u8; 3]));
        let out = HistogramMatcher::new(&bright).apply(&dark);
        assert!(out.pixels().all(|p| p[0] >= 200));
    }
}
