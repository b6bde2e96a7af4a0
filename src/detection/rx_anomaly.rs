use anyhow::Result;
use image::{GrayImage, Luma};

use super::spectral::{BackgroundModel, to_vec3};
use super::{Detector, DetectorOptions, Frame};
use crate::error::OptionError;

/// Reed-Xiaoli anomaly detector: pixels far from their tile's color
/// distribution, in Mahalanobis distance, are flagged.
#[derive(Debug, Clone, PartialEq)]
pub struct RxAnomalyDetector {
    pub sensitivity: u32,
    pub segments: u32,
    /// Squared-distance cutoff derived from `sensitivity`.
    pub threshold: f64,
}

impl RxAnomalyDetector {
    pub fn new(sensitivity: u32, segments: u32) -> Self {
        Self {
            sensitivity,
            segments: segments.max(1),
            threshold: chi_square3_quantile(detection_probability(sensitivity)),
        }
    }

    pub fn from_options(options: &DetectorOptions) -> Result<Self, OptionError> {
        let sensitivity = options
            .get_u32("sensitivity")?
            .ok_or_else(|| OptionError::Missing("sensitivity".to_string()))?;
        if sensitivity > 10 {
            return Err(OptionError::invalid("sensitivity", "expected a value between 0 and 10"));
        }
        let segments = options.get_u32("segments")?.unwrap_or(1);
        if segments == 0 {
            return Err(OptionError::invalid("segments", "at least one segment is required"));
        }
        Ok(Self::new(sensitivity, segments))
    }
}

/// Higher sensitivity pushes the cutoff quantile closer to 1, so fewer
/// pixels qualify: `1 - 10^-(sensitivity + 5)`.
pub fn detection_probability(sensitivity: u32) -> f64 {
    1.0 - 10f64.powi(-(sensitivity as i32 + 5))
}

/// Complementary error function, fractional error below 1.2e-7.
fn erfc(x: f64) -> f64 {
    let z = x.abs();
    let t = 1.0 / (1.0 + 0.5 * z);
    let ans = t
        * (-z * z - 1.26551223
            + t * (1.00002368
                + t * (0.37409196
                    + t * (0.09678418
                        + t * (-0.18628806
                            + t * (0.27886807
                                + t * (-1.13520398
                                    + t * (1.48851587
                                        + t * (-0.82215223 + t * 0.17087277)))))))))
            .exp();
    if x >= 0.0 { ans } else { 2.0 - ans }
}

/// Upper tail of the chi-square distribution with three degrees of freedom.
pub fn chi_square3_survival(x: f64) -> f64 {
    if x <= 0.0 {
        return 1.0;
    }
    erfc((x / 2.0).sqrt()) + (2.0 * x / std::f64::consts::PI).sqrt() * (-x / 2.0).exp()
}

/// Inverse CDF of the chi-square distribution with three degrees of freedom.
pub fn chi_square3_quantile(p: f64) -> f64 {
    let tail = (1.0 - p).max(f64::MIN_POSITIVE);
    let (mut lo, mut hi) = (0.0f64, 1.0f64);
    while chi_square3_survival(hi) > tail && hi < 1e4 {
        hi *= 2.0;
    }
    for _ in 0..200 {
        let mid = 0.5 * (lo + hi);
        if chi_square3_survival(mid) > tail {
            lo = mid;
        } else {
            hi = mid;
        }
        if hi - lo < 1e-10 {
            break;
        }
    }
    0.5 * (lo + hi)
}

/// Rows and columns of a tile grid with `segments` cells, as square as possible.
pub fn grid_shape(segments: u32) -> (u32, u32) {
    let segments = segments.max(1);
    let mut rows = (segments as f64).sqrt().floor() as u32;
    while rows > 1 && segments % rows != 0 {
        rows -= 1;
    }
    (rows.max(1), segments / rows.max(1))
}

/// Split `len` into `parts` contiguous spans.
fn spans(len: u32, parts: u32) -> Vec<(u32, u32)> {
    let parts = parts.clamp(1, len.max(1));
    (0..parts)
        .map(|i| {
            let start = (len as u64 * i as u64 / parts as u64) as u32;
            let end = (len as u64 * (i as u64 + 1) / parts as u64) as u32;
            (start, end)
        })
        .collect()
}

impl Detector for RxAnomalyDetector {
    fn detect(&self, frame: &Frame) -> Result<GrayImage> {
        let (width, height) = frame.dimensions();
        let mut mask = GrayImage::new(width, height);
        let (rows, cols) = grid_shape(self.segments);

        for &(y0, y1) in &spans(height, rows) {
            for &(x0, x1) in &spans(width, cols) {
                let tile: Vec<[u8; 3]> = (y0..y1)
                    .flat_map(|y| (x0..x1).map(move |x| (x, y)))
                    .map(|(x, y)| frame.rgb.get_pixel(x, y).0)
                    .collect();
                let Some(model) = BackgroundModel::fit(&tile) else {
                    continue;
                };
                let tile_width = (x1 - x0) as usize;
                for (i, px) in tile.iter().enumerate() {
                    if model.mahalanobis_sq(&to_vec3(px)) > self.threshold {
                        let x = x0 + (i % tile_width) as u32;
                        let y = y0 + (i / tile_width) as u32;
                        mask.put_pixel(x, y, Luma([255]));
                    }
                }
            }
        }
        Ok(mask)
    }

    fn name(&self) -> &str {
        "RXAnomaly"
    }
}
