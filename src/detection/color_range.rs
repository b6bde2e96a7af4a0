use anyhow::Result;
use image::GrayImage;

use super::{Detector, DetectorOptions, Frame, mask_from_rgb};
use crate::error::OptionError;
use crate::models::Color;

/// Flags pixels whose RGB value lies inside an inclusive box.
#[derive(Debug, Clone, PartialEq)]
pub struct ColorRangeDetector {
    pub low: Color,
    pub high: Color,
}

impl ColorRangeDetector {
    pub fn new(low: Color, high: Color) -> Self {
        Self { low, high }
    }

    /// A box of `tolerance` around a reference color, clamped to 0..=255.
    pub fn around(color: Color, tolerance: [u8; 3]) -> Self {
        let low = Color::new(
            color.r.saturating_sub(tolerance[0]),
            color.g.saturating_sub(tolerance[1]),
            color.b.saturating_sub(tolerance[2]),
        );
        let high = Color::new(
            color.r.saturating_add(tolerance[0]),
            color.g.saturating_add(tolerance[1]),
            color.b.saturating_add(tolerance[2]),
        );
        Self { low, high }
    }

    /// `color_range` as `[[r,g,b],[r,g,b]]`, or `selected_color` with
    /// `range_r`/`range_g`/`range_b` tolerances.
    pub fn from_options(options: &DetectorOptions) -> Result<Self, OptionError> {
        if let Some((a, b)) = options.get_color_pair("color_range")? {
            let low = Color::new(a.r.min(b.r), a.g.min(b.g), a.b.min(b.b));
            let high = Color::new(a.r.max(b.r), a.g.max(b.g), a.b.max(b.b));
            return Ok(Self::new(low, high));
        }

        let color = options.require_color("selected_color")?;
        let tolerance = |key: &str| -> Result<u8, OptionError> {
            let value = options.get_f64(key)?.unwrap_or(0.0);
            if value < 0.0 {
                return Err(OptionError::invalid(key, "tolerance must not be negative"));
            }
            Ok(value.min(255.0).round() as u8)
        };
        Ok(Self::around(
            color,
            [tolerance("range_r")?, tolerance("range_g")?, tolerance("range_b")?],
        ))
    }

    fn contains(&self, px: [u8; 3]) -> bool {
        (self.low.r..=self.high.r).contains(&px[0])
            && (self.low.g..=self.high.g).contains(&px[1])
            && (self.low.b..=self.high.b).contains(&px[2])
    }
}

impl Detector for ColorRangeDetector {
    fn detect(&self, frame: &Frame) -> Result<GrayImage> {
        Ok(mask_from_rgb(&frame.rgb, |px| self.contains(px)))
    }

    fn name(&self) -> &str {
        "ColorRange"
    }
}
