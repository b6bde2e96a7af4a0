use anyhow::Result;
use image::GrayImage;
use palette::{IntoColor, Lab, Srgb};

use super::{Detector, DetectorOptions, Frame, mask_from_rgb};
use crate::error::OptionError;
use crate::models::Color;

const DEFAULT_THRESHOLD: f64 = 25.0;

/// CIE Lab scaled into 8-bit channels: L 0..=255, a and b offset by 128.
pub fn lab8(color: [u8; 3]) -> [u8; 3] {
    let lab: Lab = Srgb::new(color[0], color[1], color[2]).into_format::<f32>().into_color();
    [
        (lab.l * 255.0 / 100.0).round().clamp(0.0, 255.0) as u8,
        (lab.a + 128.0).round().clamp(0.0, 255.0) as u8,
        (lab.b + 128.0).round().clamp(0.0, 255.0) as u8,
    ]
}

/// Flags pixels whose 8-bit Lab value lies inside an inclusive window.
#[derive(Debug, Clone, PartialEq)]
pub struct LabColorRangeDetector {
    pub target: Color,
    pub low: [u8; 3],
    pub high: [u8; 3],
}

impl LabColorRangeDetector {
    /// `selected_color` is always required. The window comes from
    /// `lab_ranges` (picker-normalized centers with asymmetric plus/minus)
    /// or from symmetric `l_threshold`/`a_threshold`/`b_threshold`.
    pub fn from_options(options: &DetectorOptions) -> Result<Self, OptionError> {
        let target = options.require_color("selected_color")?;

        if let Some(ranges) = options.get_number_map("lab_ranges")? {
            let get = |k: &str| {
                ranges
                    .get(k)
                    .copied()
                    .ok_or_else(|| OptionError::invalid("lab_ranges", format!("missing '{k}'")))
            };
            let l_center = (get("l")? * 255.0) as i32;
            let a_center = ((get("a")? + 1.0) * 127.5) as i32;
            let b_center = ((get("b")? + 1.0) * 127.5) as i32;
            let bound = |center: i32, delta: f64, scale: f64, sign: i32| {
                (center + sign * (delta * scale) as i32).clamp(0, 255) as u8
            };
            let low = [
                bound(l_center, get("l_minus")?, 255.0, -1),
                bound(a_center, get("a_minus")?, 128.0, -1),
                bound(b_center, get("b_minus")?, 128.0, -1),
            ];
            let high = [
                bound(l_center, get("l_plus")?, 255.0, 1),
                bound(a_center, get("a_plus")?, 128.0, 1),
                bound(b_center, get("b_plus")?, 128.0, 1),
            ];
            return Ok(Self { target, low, high });
        }

        let threshold = |key: &str| -> Result<f64, OptionError> {
            Ok(options.get_f64(key)?.unwrap_or(DEFAULT_THRESHOLD).abs())
        };
        let thresholds = [
            threshold("l_threshold")?,
            threshold("a_threshold")?,
            threshold("b_threshold")?,
        ];
        let center = lab8([target.r, target.g, target.b]);
        let mut low = [0u8; 3];
        let mut high = [0u8; 3];
        for c in 0..3 {
            low[c] = (center[c] as f64 - thresholds[c]).clamp(0.0, 255.0) as u8;
            high[c] = (center[c] as f64 + thresholds[c]).clamp(0.0, 255.0) as u8;
        }
        Ok(Self { target, low, high })
    }

    fn contains(&self, lab: [u8; 3]) -> bool {
        (0..3).all(|c| self.low[c] <= lab[c] && lab[c] <= self.high[c])
    }
}

impl Detector for LabColorRangeDetector {
    fn detect(&self, frame: &Frame) -> Result<GrayImage> {
        Ok(mask_from_rgb(&frame.rgb, |px| self.contains(lab8(px))))
    }

    fn name(&self) -> &str {
        "LABColorRange"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn lab_scaling_matches_reference_points() {
        assert_eq!(lab8([0, 0, 0]), [0, 128, 128]);
        let white = lab8([255, 255, 255]);
        assert_eq!(white[0], 255);
        assert!((white[1] as i32 - 128).abs() <= 1);
        let red = lab8([255, 0, 0]);
        assert!(red[1] > 200);
    }

    #[test]
    fn missing_color_is_a_configuration_error() {
        let options = DetectorOptions::new().with("l_threshold", 10);
        assert_eq!(
            LabColorRangeDetector::from_options(&options),
            Err(OptionError::Missing("selected_color".into()))
        );
    }

    #[test]
    fn picker_ranges_map_to_eight_bit_bounds() {
        let options = DetectorOptions::new().with("selected_color", "255,0,0").with(
            "lab_ranges",
            serde_json::json!({
                "l": 0.5, "a": 0.0, "b": 0.0,
                "l_minus": 0.1, "l_plus": 0.1,
                "a_minus": 0.25, "a_plus": 2.0,
                "b_minus": 0.5, "b_plus": 0.5
            }),
        );
        let detector = LabColorRangeDetector::from_options(&options).unwrap();
        assert_eq!(detector.low, [102, 95, 63]);
        assert_eq!(detector.high, [152, 255, 191]);
    }

    #[test]
    fn finds_target_color_only() {
        let rgb = RgbImage::from_fn(20, 20, |x, _| {
            if x < 10 { Rgb([220, 30, 30]) } else { Rgb([30, 160, 40]) }
        });
        let options = DetectorOptions::new().with("selected_color", "220,30,30");
        let detector = LabColorRangeDetector::from_options(&options).unwrap();
        let mask = detector.detect(&Frame::from_rgb(rgb)).unwrap();
        assert_eq!(mask.pixels().filter(|p| p[0] > 0).count(), 200);
        assert_eq!(mask.get_pixel(15, 5)[0], 0);
    }
}
