pub mod aoi;
pub mod config;
pub mod core;
pub mod detection;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod texture;

pub use aoi::{AoiExtractor, Extraction};
pub use config::{BatchConfig, ExtractionParams, Settings, TemperatureUnit};
pub use detection::{AlgorithmKind, DetectionContext, Detector, DetectorOptions, Frame};
pub use error::{ConfigError, OptionError};
pub use models::{AnalysisResult, AreaOfInterest, Color, Point};
pub use pipeline::{
    BatchEvent, BatchHandle, BatchObserver, BatchScheduler, BatchState, BatchSummary, CancelToken,
};
pub use texture::{TextureAnalyzer, TextureFilter};
