pub mod preprocessing;
pub mod contours;
pub mod mask;
pub mod options;
pub mod spectral;
pub mod color_range;
pub mod lab_range;
pub mod rx_anomaly;
pub mod matched_filter;
pub mod thermal;

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use image::{GrayImage, ImageBuffer, Luma, RgbImage};
use tracing::{debug, warn};

use crate::aoi::AoiExtractor;
use crate::config::TemperatureUnit;
use crate::error::ConfigError;
use crate::models::{AnalysisResult, AreaOfInterest, Color, Point, mask_path_for};
use crate::texture::{TextureAnalyzer, TextureFilter};

pub use color_range::ColorRangeDetector;
pub use lab_range::LabColorRangeDetector;
pub use matched_filter::MatchedFilterDetector;
pub use options::DetectorOptions;
pub use preprocessing::{HistogramMatcher, KMeansQuantizer};
pub use rx_anomaly::RxAnomalyDetector;
pub use thermal::{
    LinearRadiometricDecoder, TemperatureDecoder, ThermalAnomalyDetector, ThermalRangeDetector,
};

/// Absolute temperature per pixel, degrees Celsius.
pub type TemperatureMap = ImageBuffer<Luma<f32>, Vec<f32>>;

/// One decoded input image.
#[derive(Debug, Clone)]
pub struct Frame {
    pub rgb: RgbImage,
    pub temperature: Option<TemperatureMap>,
}

impl Frame {
    pub fn from_rgb(rgb: RgbImage) -> Self {
        Self { rgb, temperature: None }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.rgb.dimensions()
    }
}

/// The detection algorithms available to a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlgorithmKind {
    ColorRange,
    LabColorRange,
    RxAnomaly,
    MatchedFilter,
    ThermalRange,
    ThermalAnomaly,
}

impl AlgorithmKind {
    pub const ALL: [AlgorithmKind; 6] = [
        AlgorithmKind::ColorRange,
        AlgorithmKind::LabColorRange,
        AlgorithmKind::RxAnomaly,
        AlgorithmKind::MatchedFilter,
        AlgorithmKind::ThermalRange,
        AlgorithmKind::ThermalAnomaly,
    ];

    pub fn name(self) -> &'static str {
        match self {
            AlgorithmKind::ColorRange => "ColorRange",
            AlgorithmKind::LabColorRange => "LABColorRange",
            AlgorithmKind::RxAnomaly => "RXAnomaly",
            AlgorithmKind::MatchedFilter => "MatchedFilter",
            AlgorithmKind::ThermalRange => "ThermalRange",
            AlgorithmKind::ThermalAnomaly => "ThermalAnomaly",
        }
    }

    fn kebab_name(self) -> &'static str {
        match self {
            AlgorithmKind::ColorRange => "color-range",
            AlgorithmKind::LabColorRange => "lab-color-range",
            AlgorithmKind::RxAnomaly => "rx-anomaly",
            AlgorithmKind::MatchedFilter => "matched-filter",
            AlgorithmKind::ThermalRange => "thermal-range",
            AlgorithmKind::ThermalAnomaly => "thermal-anomaly",
        }
    }

    pub fn is_thermal(self) -> bool {
        matches!(self, AlgorithmKind::ThermalRange | AlgorithmKind::ThermalAnomaly)
    }
}

impl fmt::Display for AlgorithmKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AlgorithmKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        AlgorithmKind::ALL
            .into_iter()
            .find(|kind| {
                kind.name().eq_ignore_ascii_case(wanted)
                    || kind.kebab_name().eq_ignore_ascii_case(wanted)
            })
            .ok_or_else(|| ConfigError::UnknownAlgorithm(wanted.to_string()))
    }
}

/// A detection algorithm: turns one frame into a binary mask.
///
/// Implementations read the frame only. Everything after the mask (component
/// extraction, merging, averages, texture, mask output) is shared and lives
/// in [`DetectionContext`].
pub trait Detector: Send + Sync {
    fn detect(&self, frame: &Frame) -> Result<GrayImage>;

    /// Human-readable name for this detector (used in logs)
    fn name(&self) -> &str;

    fn is_thermal(&self) -> bool {
        false
    }
}

/// Resolve an algorithm and its options into a detector. Called once per
/// batch; option problems surface here, before any image is touched.
pub fn build_detector(
    kind: AlgorithmKind,
    options: &DetectorOptions,
    unit: TemperatureUnit,
) -> Result<Arc<dyn Detector>, ConfigError> {
    let detector: Arc<dyn Detector> = match kind {
        AlgorithmKind::ColorRange => Arc::new(ColorRangeDetector::from_options(options)?),
        AlgorithmKind::LabColorRange => Arc::new(LabColorRangeDetector::from_options(options)?),
        AlgorithmKind::RxAnomaly => Arc::new(RxAnomalyDetector::from_options(options)?),
        AlgorithmKind::MatchedFilter => Arc::new(MatchedFilterDetector::from_options(options)?),
        AlgorithmKind::ThermalRange => Arc::new(ThermalRangeDetector::from_options(options, unit)?),
        AlgorithmKind::ThermalAnomaly => Arc::new(ThermalAnomalyDetector::from_options(options)?),
    };
    Ok(detector)
}

/// Shared per-batch state used to run a detector on one image.
#[derive(Clone)]
pub struct DetectionContext {
    pub extractor: AoiExtractor,
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    /// Where masks are written. A batch points this at its own run directory
    /// so earlier runs in the same output directory keep their masks.
    pub mask_dir: PathBuf,
    pub histogram: Option<Arc<HistogramMatcher>>,
    pub quantizer: Option<KMeansQuantizer>,
    pub decoder: Arc<dyn TemperatureDecoder>,
    /// Run texture analysis on every AOI and drop the ones the filter rejects.
    pub texture: Option<TextureFilter>,
}

impl DetectionContext {
    pub fn new(
        extractor: AoiExtractor,
        input_dir: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        let output_dir = output_dir.into();
        Self {
            extractor,
            input_dir: input_dir.into(),
            mask_dir: output_dir.clone(),
            output_dir,
            histogram: None,
            quantizer: None,
            decoder: Arc::new(LinearRadiometricDecoder::default()),
            texture: None,
        }
    }

    /// Load and analyze one file. Never fails: any error, including a panic
    /// inside the detector, becomes the result's `error_message`.
    pub fn process(&self, detector: &dyn Detector, source_path: &Path) -> AnalysisResult {
        let outcome = catch_unwind(AssertUnwindSafe(|| self.try_process(detector, source_path)));
        match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                warn!("{} failed on {:?}: {:#}", detector.name(), source_path, e);
                AnalysisResult::failed(source_path, &self.output_dir, format!("{:#}", e))
            }
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "detector panicked".to_string());
                warn!("{} panicked on {:?}: {}", detector.name(), source_path, reason);
                AnalysisResult::failed(source_path, &self.output_dir, reason)
            }
        }
    }

    fn try_process(&self, detector: &dyn Detector, source_path: &Path) -> Result<AnalysisResult> {
        let frame = if detector.is_thermal() {
            self.decoder.decode(source_path)?
        } else {
            let img = image::open(source_path)
                .with_context(|| format!("Failed to open image {:?}", source_path))?;
            Frame::from_rgb(img.to_rgb8())
        };
        self.analyze(detector, &frame, source_path)
    }

    /// Run the detector on an already decoded frame.
    pub fn analyze(
        &self,
        detector: &dyn Detector,
        frame: &Frame,
        source_path: &Path,
    ) -> Result<AnalysisResult> {
        let prepared = if detector.is_thermal() { None } else { self.preprocess(&frame.rgb) };
        let mask = match prepared {
            Some(rgb) => detector.detect(&Frame {
                rgb,
                temperature: frame.temperature.clone(),
            })?,
            None => detector.detect(frame)?,
        };

        let (width, height) = frame.dimensions();
        anyhow::ensure!(
            mask.dimensions() == (width, height),
            "{} produced a {:?} mask for a {}x{} image",
            detector.name(),
            mask.dimensions(),
            width,
            height
        );

        let extraction = self.extractor.extract(&mask);
        if extraction.exceeds(self.extractor.max_aois()) {
            debug!(
                "{} raw detections in {:?}, keeping the {} largest",
                extraction.base_contour_count,
                source_path,
                self.extractor.max_aois()
            );
        }
        let mut aois = extraction.aois;
        for aoi in aois.iter_mut() {
            aoi.average_color = average_color(&frame.rgb, aoi);
            aoi.average_temperature =
                frame.temperature.as_ref().and_then(|t| average_temperature(t, aoi));
        }

        if let Some(filter) = &self.texture {
            let gray = preprocessing::rgb_to_grayscale(&frame.rgb);
            TextureAnalyzer::default().analyze_batch(&gray, &mut aois);
            aois = filter.apply(aois);
        }

        let mut result = AnalysisResult::new(source_path, &self.output_dir);
        result.base_contour_count = extraction.base_contour_count;
        if !aois.is_empty() {
            let mask_path = mask_path_for(source_path, &self.input_dir, &self.mask_dir);
            mask::store_mask(&mask::render_mask(width, height, &aois), &mask_path)?;
            debug!("Stored mask {:?} with {} AOIs", mask_path, aois.len());
            result.mask_path = Some(mask_path);
        }
        result.areas_of_interest = aois;
        Ok(result)
    }

    fn preprocess(&self, rgb: &RgbImage) -> Option<RgbImage> {
        let matched = self.histogram.as_ref().map(|m| m.apply(rgb));
        match &self.quantizer {
            Some(q) => Some(q.apply(matched.as_ref().unwrap_or(rgb))),
            None => matched,
        }
    }
}

/// Pixels an AOI's averages are taken over: its detected pixels, or its disk
/// when those are unknown.
fn sample_points(aoi: &AreaOfInterest, width: u32, height: u32) -> Vec<Point> {
    if !aoi.detected_pixels.is_empty() {
        return aoi.detected_pixels.clone();
    }
    let r = aoi.radius.max(0);
    let mut points = Vec::new();
    for y in (aoi.center.y - r).max(0)..=(aoi.center.y + r).min(height as i32 - 1) {
        for x in (aoi.center.x - r).max(0)..=(aoi.center.x + r).min(width as i32 - 1) {
            let p = Point::new(x, y);
            if aoi.contains(&p) {
                points.push(p);
            }
        }
    }
    points
}

pub fn average_color(rgb: &RgbImage, aoi: &AreaOfInterest) -> Option<Color> {
    let (width, height) = rgb.dimensions();
    let mut sums = [0u64; 3];
    let mut count = 0u64;
    for p in sample_points(aoi, width, height) {
        if p.x < 0 || p.y < 0 || p.x as u32 >= width || p.y as u32 >= height {
            continue;
        }
        let px = rgb.get_pixel(p.x as u32, p.y as u32);
        for c in 0..3 {
            sums[c] += px[c] as u64;
        }
        count += 1;
    }
    if count == 0 {
        return None;
    }
    let avg = |s: u64| ((s as f64 / count as f64).round()) as u8;
    Some(Color::new(avg(sums[0]), avg(sums[1]), avg(sums[2])))
}

pub fn average_temperature(temperature: &TemperatureMap, aoi: &AreaOfInterest) -> Option<f64> {
    let (width, height) = temperature.dimensions();
    let mut sum = 0f64;
    let mut count = 0usize;
    for p in sample_points(aoi, width, height) {
        if p.x < 0 || p.y < 0 || p.x as u32 >= width || p.y as u32 >= height {
            continue;
        }
        sum += temperature.get_pixel(p.x as u32, p.y as u32)[0] as f64;
        count += 1;
    }
    (count > 0).then(|| sum / count as f64)
}

/// Build a binary mask by testing every pixel of an RGB image.
pub fn mask_from_rgb(rgb: &RgbImage, hit: impl Fn([u8; 3]) -> bool) -> GrayImage {
    let mut mask = GrayImage::new(rgb.width(), rgb.height());
    for (x, y, px) in rgb.enumerate_pixels() {
        if hit(px.0) {
            mask.put_pixel(x, y, Luma([255]));
        }
    }
    mask
}
