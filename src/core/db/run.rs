use std::path::PathBuf;

use time::OffsetDateTime;
use uuid::Uuid;

use crate::config::BatchConfig;
use crate::models::Color;

/// The settings block written once per batch run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSettings {
    pub run_id: Uuid,
    pub started_at: OffsetDateTime,
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub algorithm: String,
    pub identifier_color: Color,
    pub min_area: u32,
    pub max_area: u32,
    pub num_processes: usize,
    pub max_aois: usize,
    pub aoi_radius: u32,
    pub combine_aois: bool,
    pub hist_ref_path: Option<PathBuf>,
    pub kmeans_clusters: Option<usize>,
    pub thermal: bool,
    /// Algorithm options as `name -> text`.
    pub options: Vec<(String, String)>,
}

impl RunSettings {
    pub fn from_config(run_id: Uuid, config: &BatchConfig) -> Self {
        Self {
            run_id,
            started_at: OffsetDateTime::now_utc(),
            input_dir: config.input_dir.clone(),
            output_dir: config.output_dir.clone(),
            algorithm: config.algorithm.name().to_string(),
            identifier_color: config.identifier_color,
            min_area: config.extraction.min_area,
            max_area: config.extraction.max_area,
            num_processes: config.max_processes,
            max_aois: config.extraction.max_aois,
            aoi_radius: config.extraction.aoi_radius,
            combine_aois: config.extraction.combine_aois,
            hist_ref_path: config.histogram_reference.clone(),
            kmeans_clusters: config.kmeans_clusters,
            thermal: config.algorithm.is_thermal(),
            options: config.options.to_string_pairs(),
        }
    }

    pub fn option(&self, name: &str) -> Option<&str> {
        self.options.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }
}

pub trait RunRepository {
    fn record_settings(&self, settings: &RunSettings)
    -> impl Future<Output = anyhow::Result<()>> + Send;
    fn get_runs(&self) -> impl Future<Output = anyhow::Result<Vec<RunSettings>>> + Send;
    fn get_run(&self, run_id: Uuid)
    -> impl Future<Output = anyhow::Result<Option<RunSettings>>> + Send;
    fn latest_run(&self) -> impl Future<Output = anyhow::Result<Option<RunSettings>>> + Send;
}
