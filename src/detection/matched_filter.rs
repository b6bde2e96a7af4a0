use anyhow::{Result, bail};
use image::GrayImage;

use super::spectral::{BackgroundModel, dot, mat_vec, sub, to_vec3};
use super::{Detector, DetectorOptions, Frame, mask_from_rgb};
use crate::error::OptionError;
use crate::models::Color;

/// Matched filter against a target color, normalized so the target itself
/// scores 1 and the image mean scores 0.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchedFilterDetector {
    pub target: Color,
    pub threshold: f64,
}

impl MatchedFilterDetector {
    pub fn new(target: Color, threshold: f64) -> Self {
        Self { target, threshold }
    }

    pub fn from_options(options: &DetectorOptions) -> Result<Self, OptionError> {
        let target = options.require_color("selected_color")?;
        let threshold = options.require_f64("match_filter_threshold")?;
        Ok(Self::new(target, threshold))
    }
}

impl Detector for MatchedFilterDetector {
    fn detect(&self, frame: &Frame) -> Result<GrayImage> {
        let pixels: Vec<[u8; 3]> = frame.rgb.pixels().map(|p| p.0).collect();
        let Some(model) = BackgroundModel::fit(&pixels) else {
            return Ok(GrayImage::new(frame.rgb.width(), frame.rgb.height()));
        };
        let target = to_vec3(&[self.target.r, self.target.g, self.target.b]);
        let offset = sub(&target, &model.mean);
        let weights = mat_vec(&model.inverse, &offset);
        let norm = dot(&offset, &weights);
        if norm.abs() < f64::EPSILON {
            bail!("Target color matches the image background");
        }

        Ok(mask_from_rgb(&frame.rgb, |px| {
            let score = dot(&sub(&to_vec3(&px), &model.mean), &weights) / norm;
            score > self.threshold
        }))
    }

    fn name(&self) -> &str {
        "MatchedFilter"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn scene() -> RgbImage {
        RgbImage::from_fn(60, 60, |x, y| {
            if (10..16).contains(&x) && (20..26).contains(&y) {
                Rgb([230, 200, 20])
            } else {
                let v = ((x * 13 + y * 7) % 19) as u8;
                Rgb([40 + v, 90 + v / 3, 60 + v % 4])
            }
        })
    }

    #[test]
    fn target_patch_scores_above_background() {
        let detector = MatchedFilterDetector::new(Color::new(230, 200, 20), 0.5);
        let mask = detector.detect(&Frame::from_rgb(scene())).unwrap();
        assert_eq!(mask.get_pixel(12, 22)[0], 255);
        assert_eq!(mask.pixels().filter(|p| p[0] > 0).count(), 36);
    }

    #[test]
    fn lower_threshold_never_finds_fewer_pixels() {
        let frame = Frame::from_rgb(scene());
        let mut previous = 0;
        for threshold in [0.9, 0.5, 0.1, -0.5] {
            let mask = MatchedFilterDetector::new(Color::new(230, 200, 20), threshold)
                .detect(&frame)
                .unwrap();
            let hits = mask.pixels().filter(|p| p[0] > 0).count();
            assert!(hits >= previous);
            previous = hits;
        }
    }

    #[test]
    fn threshold_is_required() {
        let options = DetectorOptions::new().with("selected_color", "1,2,3");
        assert_eq!(
            MatchedFilterDetector::from_options(&options),
            Err(OptionError::Missing("match_filter_threshold".into()))
        );
    }
}
