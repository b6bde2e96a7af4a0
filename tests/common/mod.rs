#![allow(dead_code)]

mod fixtures;
pub use fixtures::*;

// Re-export commonly used types from aoiscan for tests
pub use aoiscan::core::db::{ImageRepository, ResultDb, RunRepository, RunSettings, StoredImage};
pub use aoiscan::{
    AlgorithmKind, AnalysisResult, AreaOfInterest, BatchConfig, BatchEvent, BatchObserver,
    BatchScheduler, BatchState, CancelToken, Color, DetectorOptions, Point,
};
