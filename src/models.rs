use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// A pixel coordinate in image space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point) -> f64 {
        let dx = (self.x - other.x) as f64;
        let dy = (self.y - other.y) as f64;
        (dx * dx + dy * dy).sqrt()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }
}

/// A connected group of detected pixels, before it becomes an area of interest.
#[derive(Debug, Clone)]
pub struct Component {
    pub label: u32,
    pub min_x: u32,
    pub min_y: u32,
    pub max_x: u32,
    pub max_y: u32,
    /// Member pixels in raster order.
    pub pixels: Vec<Point>,
}

impl Component {
    pub fn area(&self) -> u32 {
        self.pixels.len() as u32
    }
}

/// Summary statistics of a gray-level co-occurrence matrix.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TextureFeatures {
    pub contrast: f64,
    pub dissimilarity: f64,
    pub homogeneity: f64,
    pub energy: f64,
    pub correlation: f64,
    pub asm: f64,
    /// Composite 0-100 texture complexity.
    pub texture_score: f64,
}

impl TextureFeatures {
    /// Returned for regions too small to carry any texture.
    pub fn neutral() -> Self {
        Self {
            contrast: 0.0,
            dissimilarity: 0.0,
            homogeneity: 1.0,
            energy: 1.0,
            correlation: 0.0,
            asm: 1.0,
            texture_score: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TextureRecord {
    pub detected_texture: TextureFeatures,
    pub aoi_texture: TextureFeatures,
    pub texture_difference: f64,
    pub texture_ratio: f64,
}

impl TextureRecord {
    pub fn new(detected_texture: TextureFeatures, aoi_texture: TextureFeatures) -> Self {
        let detected = detected_texture.texture_score;
        let surrounding = aoi_texture.texture_score;
        let texture_ratio = if surrounding > 0.0 { detected / surrounding } else { 0.0 };
        Self {
            detected_texture,
            aoi_texture,
            texture_difference: detected - surrounding,
            texture_ratio,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AreaOfInterest {
    pub center: Point,
    pub radius: i32,
    /// Number of detected pixels, not the disk area.
    pub area: f64,
    pub detected_pixels: Vec<Point>,
    pub flagged: bool,
    pub average_color: Option<Color>,
    /// Degrees Celsius.
    pub average_temperature: Option<f64>,
    pub texture_data: Option<TextureRecord>,
}

impl AreaOfInterest {
    pub fn new(center: Point, radius: i32, area: f64) -> Self {
        Self {
            center,
            radius,
            area,
            detected_pixels: Vec::new(),
            flagged: false,
            average_color: None,
            average_temperature: None,
            texture_data: None,
        }
    }

    pub fn contains(&self, p: &Point) -> bool {
        let dx = (p.x - self.center.x) as i64;
        let dy = (p.y - self.center.y) as i64;
        let r = self.radius as i64;
        dx * dx + dy * dy <= r * r
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisResult {
    pub source_path: PathBuf,
    pub mask_path: Option<PathBuf>,
    pub output_dir: PathBuf,
    pub areas_of_interest: Vec<AreaOfInterest>,
    /// Qualifying components found before merging and capping.
    pub base_contour_count: usize,
    pub error_message: Option<String>,
}

impl AnalysisResult {
    pub fn new(source_path: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            source_path: source_path.into(),
            mask_path: None,
            output_dir: output_dir.into(),
            areas_of_interest: Vec::new(),
            base_contour_count: 0,
            error_message: None,
        }
    }

    pub fn failed(
        source_path: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
        error: impl std::fmt::Display,
    ) -> Self {
        Self {
            error_message: Some(error.to_string()),
            ..Self::new(source_path, output_dir)
        }
    }

    pub fn is_error(&self) -> bool {
        self.error_message.is_some()
    }

    pub fn has_aois(&self) -> bool {
        !self.is_error() && !self.areas_of_interest.is_empty()
    }

    pub fn file_name(&self) -> String {
        self.source_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.source_path.display().to_string())
    }
}

/// Mirror the source's position under `input_dir` into `mask_dir`. The full
/// file name is kept and `.mask.png` appended, so `a.png` and `a.bmp` never
/// share a mask.
pub fn mask_path_for(source_path: &Path, input_dir: &Path, mask_dir: &Path) -> PathBuf {
    let relative = source_path
        .strip_prefix(input_dir)
        .ok()
        .filter(|rel| !rel.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .or_else(|| source_path.file_name().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("image"));
    let mut path = mask_dir.join(relative).into_os_string();
    path.push(".mask.png");
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn texture_ratio_is_zero_when_surroundings_are_flat() {
        let mut detected = TextureFeatures::neutral();
        detected.texture_score = 12.0;
        let record = TextureRecord::new(detected, TextureFeatures::neutral());
        assert_eq!(record.texture_ratio, 0.0);
        assert_eq!(record.texture_difference, 12.0);
    }

    #[test]
    fn mask_path_mirrors_input_layout() {
        let path = mask_path_for(
            Path::new("/in/flight1/img_001.jpg"),
            Path::new("/in"),
            Path::new("/out"),
        );
        assert_eq!(path, PathBuf::from("/out/flight1/img_001.jpg.mask.png"));
    }

    #[test]
    fn mask_path_falls_back_to_file_name() {
        let path = mask_path_for(
            Path::new("/elsewhere/img.tif"),
            Path::new("/in"),
            Path::new("/out"),
        );
        assert_eq!(path, PathBuf::from("/out/img.tif.mask.png"));
    }

    #[test]
    fn same_stem_sources_get_distinct_masks() {
        let png = mask_path_for(Path::new("/in/a.png"), Path::new("/in"), Path::new("/out"));
        let bmp = mask_path_for(Path::new("/in/a.bmp"), Path::new("/in"), Path::new("/out"));
        assert_ne!(png, bmp);
        assert_eq!(bmp, PathBuf::from("/out/a.bmp.mask.png"));
    }
}
