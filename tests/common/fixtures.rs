use std::path::{Path, PathBuf};
use std::sync::Mutex;

use aoiscan::core::db::StoredImage;
use aoiscan::{AlgorithmKind, BatchConfig, BatchEvent, BatchObserver, CancelToken, DetectorOptions};
use image::{ImageBuffer, Rgb, RgbImage};
use tempfile::TempDir;

pub const BACKGROUND: Rgb<u8> = Rgb([40, 90, 40]);
pub const TARGET: Rgb<u8> = Rgb([255, 0, 0]);

/// A `(x, y, size)` square of `color`.
pub type Square = (u32, u32, u32, Rgb<u8>);

/// Background-colored image with the given squares painted in.
pub fn image_with_squares(width: u32, height: u32, squares: &[Square]) -> RgbImage {
    ImageBuffer::from_fn(width, height, |x, y| {
        squares
            .iter()
            .rev()
            .find(|&&(x0, y0, size, _)| x >= x0 && x < x0 + size && y >= y0 && y < y0 + size)
            .map(|&(_, _, _, color)| color)
            .unwrap_or(BACKGROUND)
    })
}

pub fn red_squares(width: u32, height: u32, squares: &[(u32, u32, u32)]) -> RgbImage {
    let painted: Vec<Square> = squares.iter().map(|&(x, y, s)| (x, y, s, TARGET)).collect();
    image_with_squares(width, height, &painted)
}

/// Input and output directories inside one temp dir, removed on drop.
pub struct Workspace {
    _dir: TempDir,
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
}

impl Workspace {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let input_dir = dir.path().join("input");
        let output_dir = dir.path().join("output");
        std::fs::create_dir_all(&input_dir).expect("Failed to create input directory");
        Self {
            _dir: dir,
            input_dir,
            output_dir,
        }
    }

    /// Save `img` under `name`, encoded in the format its extension names.
    pub fn add_image(&self, name: &str, img: &RgbImage) -> PathBuf {
        let path = self.input_dir.join(name);
        img.save(&path).expect("Failed to save test image");
        path
    }

    pub fn add_file(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.input_dir.join(name);
        std::fs::write(&path, contents).expect("Failed to write test file");
        path
    }
}

/// Options matching pure red, and only red.
pub fn red_options() -> DetectorOptions {
    DetectorOptions::new().with("color_range", serde_json::json!([[200, 0, 0], [255, 60, 60]]))
}

pub fn red_config(workspace: &Workspace) -> BatchConfig {
    BatchConfig::new(AlgorithmKind::ColorRange, &workspace.input_dir, &workspace.output_dir)
        .with_options(red_options())
        .with_max_processes(2)
}

/// Options matching anything from dark red to pure red.
pub fn wide_red_options() -> DetectorOptions {
    DetectorOptions::new().with("color_range", serde_json::json!([[120, 0, 0], [255, 60, 60]]))
}

/// Sum of the stored AOI areas of one image, which its mask must reproduce.
pub fn stored_area(image: &StoredImage) -> usize {
    image.result.areas_of_interest.iter().map(|aoi| aoi.area as usize).sum()
}

/// Observer that records every event and can cancel after the first image.
#[derive(Default)]
pub struct Recorder {
    pub events: Mutex<Vec<BatchEvent>>,
    pub cancel_after_first: Option<CancelToken>,
}

impl Recorder {
    pub fn cancelling(token: CancelToken) -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            cancel_after_first: Some(token),
        }
    }

    pub fn events(&self) -> Vec<BatchEvent> {
        self.events.lock().expect("poisoned").clone()
    }

    pub fn progress(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                BatchEvent::Progress(line) => Some(line),
                _ => None,
            })
            .collect()
    }

    pub fn image_results(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, BatchEvent::ImageResult(_)))
            .count()
    }

    pub fn limit_warnings(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, BatchEvent::AoiLimitExceeded { .. }))
            .count()
    }
}

impl BatchObserver for Recorder {
    fn on_event(&self, event: &BatchEvent) {
        if let (BatchEvent::ImageResult(_), Some(token)) = (event, &self.cancel_after_first) {
            token.cancel();
        }
        self.events.lock().expect("poisoned").push(event.clone());
    }
}

pub fn count_set_pixels(path: &Path) -> usize {
    image::open(path)
        .expect("Failed to open mask")
        .to_luma8()
        .pixels()
        .filter(|p| p[0] > 0)
        .count()
}
