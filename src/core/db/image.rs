use uuid::Uuid;

use crate::models::{AnalysisResult, TextureRecord};

/// A persisted image block.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredImage {
    pub id: i64,
    pub run_id: Uuid,
    pub hidden: bool,
    /// AOIs come back without detected pixels; recover them from the mask.
    pub result: AnalysisResult,
}

pub trait ImageRepository {
    /// Insert or replace the block for `result.source_path` within a run.
    fn record_result(
        &self,
        run_id: Uuid,
        result: &AnalysisResult,
    ) -> impl Future<Output = anyhow::Result<i64>> + Send;
    fn get_images(&self, run_id: Uuid)
    -> impl Future<Output = anyhow::Result<Vec<StoredImage>>> + Send;
    fn get_image(&self, image_id: i64)
    -> impl Future<Output = anyhow::Result<Option<StoredImage>>> + Send;
    fn set_image_hidden(
        &self,
        image_id: i64,
        hidden: bool,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;
    /// `ordinal` is the AOI's index within its image.
    fn set_aoi_flagged(
        &self,
        image_id: i64,
        ordinal: usize,
        flagged: bool,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;
    fn set_aoi_texture(
        &self,
        image_id: i64,
        ordinal: usize,
        texture: Option<&TextureRecord>,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;
    /// Remove AOIs and renumber the remaining ones of the image.
    fn delete_aois(
        &self,
        image_id: i64,
        ordinals: &[usize],
    ) -> impl Future<Output = anyhow::Result<()>> + Send;
}
