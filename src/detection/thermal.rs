//! Detectors working on absolute temperatures, plus the decoding boundary
//! that turns a radiometric file into a temperature map.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result, bail};
use image::{GrayImage, Luma, Rgb, RgbImage};

use super::{Detector, DetectorOptions, Frame, TemperatureMap};
use crate::config::TemperatureUnit;
use crate::error::OptionError;

/// Turns a thermal image file into a frame with a temperature map.
///
/// Vendor radiometric formats plug in here.
pub trait TemperatureDecoder: Send + Sync {
    fn decode(&self, path: &Path) -> Result<Frame>;
}

/// Reads a 16-bit single-channel image where `celsius = raw * scale + offset`.
/// The visible rendering is the temperature range stretched to 8-bit gray.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearRadiometricDecoder {
    pub scale: f64,
    pub offset: f64,
}

impl Default for LinearRadiometricDecoder {
    /// Centi-Kelvin encoding.
    fn default() -> Self {
        Self {
            scale: 0.01,
            offset: -273.15,
        }
    }
}

impl LinearRadiometricDecoder {
    pub fn temperatures(&self, raw: &image::ImageBuffer<Luma<u16>, Vec<u16>>) -> TemperatureMap {
        TemperatureMap::from_fn(raw.width(), raw.height(), |x, y| {
            Luma([(raw.get_pixel(x, y)[0] as f64 * self.scale + self.offset) as f32])
        })
    }
}

impl TemperatureDecoder for LinearRadiometricDecoder {
    fn decode(&self, path: &Path) -> Result<Frame> {
        let img = image::open(path)
            .with_context(|| format!("Failed to open thermal image {:?}", path))?;
        let temperature = self.temperatures(&img.to_luma16());
        Ok(Frame {
            rgb: render_temperatures(&temperature),
            temperature: Some(temperature),
        })
    }
}

/// Stretch temperatures to an 8-bit grayscale rendering.
pub fn render_temperatures(temperature: &TemperatureMap) -> RgbImage {
    let (min, max) = temperature
        .pixels()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), p| (lo.min(p[0]), hi.max(p[0])));
    let span = if max > min { max - min } else { 1.0 };
    RgbImage::from_fn(temperature.width(), temperature.height(), |x, y| {
        let scaled = (temperature.get_pixel(x, y)[0] - min) / span * 255.0;
        let v = scaled.round().clamp(0.0, 255.0) as u8;
        Rgb([v, v, v])
    })
}

fn temperatures(frame: &Frame) -> Result<&TemperatureMap> {
    match &frame.temperature {
        Some(t) => Ok(t),
        None => bail!("Image has no temperature data"),
    }
}

fn mask_from_temperatures(temperature: &TemperatureMap, hit: impl Fn(f32) -> bool) -> GrayImage {
    let mut mask = GrayImage::new(temperature.width(), temperature.height());
    for (x, y, t) in temperature.enumerate_pixels() {
        if hit(t[0]) {
            mask.put_pixel(x, y, Luma([255]));
        }
    }
    mask
}

/// Flags pixels strictly between two absolute temperatures.
#[derive(Debug, Clone, PartialEq)]
pub struct ThermalRangeDetector {
    /// Celsius.
    pub min_celsius: f64,
    /// Celsius.
    pub max_celsius: f64,
}

impl ThermalRangeDetector {
    pub fn new(min_celsius: f64, max_celsius: f64) -> Self {
        Self { min_celsius, max_celsius }
    }

    /// `minTemp`/`maxTemp` are given in the operator's unit and converted to
    /// Celsius here.
    pub fn from_options(
        options: &DetectorOptions,
        unit: TemperatureUnit,
    ) -> Result<Self, OptionError> {
        let min = unit.to_celsius(options.require_f64("minTemp")?);
        let max = unit.to_celsius(options.require_f64("maxTemp")?);
        if min > max {
            return Err(OptionError::invalid("minTemp", "minimum temperature exceeds maximum"));
        }
        Ok(Self::new(min, max))
    }
}

impl Detector for ThermalRangeDetector {
    fn detect(&self, frame: &Frame) -> Result<GrayImage> {
        let temperature = temperatures(frame)?;
        Ok(mask_from_temperatures(temperature, |t| {
            let t = t as f64;
            self.min_celsius < t && t < self.max_celsius
        }))
    }

    fn name(&self) -> &str {
        "ThermalRange"
    }

    fn is_thermal(&self) -> bool {
        true
    }
}

/// Which side of the mean counts as anomalous.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AnomalyDirection {
    #[default]
    Either,
    Above,
    Below,
}

impl FromStr for AnomalyDirection {
    type Err = OptionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "above or below mean" | "either" => Ok(AnomalyDirection::Either),
            "above mean" | "above" => Ok(AnomalyDirection::Above),
            "below mean" | "below" => Ok(AnomalyDirection::Below),
            other => Err(OptionError::invalid("type", format!("unknown direction '{other}'"))),
        }
    }
}

impl fmt::Display for AnomalyDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AnomalyDirection::Either => "Above or Below Mean",
            AnomalyDirection::Above => "Above Mean",
            AnomalyDirection::Below => "Below Mean",
        })
    }
}

/// Flags pixels more than `threshold` standard deviations from the image's
/// own mean temperature.
#[derive(Debug, Clone, PartialEq)]
pub struct ThermalAnomalyDetector {
    pub threshold: f64,
    pub direction: AnomalyDirection,
}

impl ThermalAnomalyDetector {
    pub fn new(threshold: f64, direction: AnomalyDirection) -> Self {
        Self { threshold, direction }
    }

    pub fn from_options(options: &DetectorOptions) -> Result<Self, OptionError> {
        let threshold = options.require_f64("threshold")?;
        if threshold < 0.0 {
            return Err(OptionError::invalid("threshold", "must not be negative"));
        }
        let direction = match options.get_str("type")? {
            Some(s) => s.parse()?,
            None => AnomalyDirection::default(),
        };
        Ok(Self::new(threshold, direction))
    }
}

impl Detector for ThermalAnomalyDetector {
    fn detect(&self, frame: &Frame) -> Result<GrayImage> {
        let temperature = temperatures(frame)?;
        let n = temperature.width() as f64 * temperature.height() as f64;
        if n == 0.0 {
            return Ok(GrayImage::new(0, 0));
        }
        let mean = temperature.pixels().map(|p| p[0] as f64).sum::<f64>() / n;
        let variance = temperature.pixels().map(|p| (p[0] as f64 - mean).powi(2)).sum::<f64>() / n;
        let spread = variance.sqrt() * self.threshold;
        let (upper, lower) = (mean + spread, mean - spread);

        Ok(mask_from_temperatures(temperature, |t| {
            let t = t as f64;
            match self.direction {
                AnomalyDirection::Either => t > upper || t < lower,
                AnomalyDirection::Above => t > upper,
                AnomalyDirection::Below => t < lower,
            }
        }))
    }

    fn name(&self) -> &str {
        "ThermalAnomaly"
    }

    fn is_thermal(&self) -> bool {
        true
    }
}
