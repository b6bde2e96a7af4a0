//! Review-side operations on a stored run.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use uuid::Uuid;

use crate::core::db::{ImageRepository, ResultDb, StoredImage};
use crate::detection::mask::{load_mask, pixels_in_disk};
use crate::models::TextureRecord;
use crate::texture::{TextureAnalyzer, TextureFilter};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReanalysisSummary {
    pub images_analyzed: usize,
    pub aois_analyzed: usize,
    pub aois_removed: usize,
    /// Images whose source or mask could not be read, with the reason.
    pub skipped: Vec<(PathBuf, String)>,
}

/// Texture records for every AOI of one stored image, in ordinal order.
/// Detected pixels come from the mask, restricted to each AOI's disk.
fn texture_records(stored: &StoredImage) -> anyhow::Result<Vec<TextureRecord>> {
    let mask_path = stored.result.mask_path.as_ref().context("Image has no mask")?;
    let mask = load_mask(mask_path)?;
    let gray = image::open(&stored.result.source_path)
        .with_context(|| format!("Failed to open image {:?}", stored.result.source_path))?
        .to_luma8();
    anyhow::ensure!(
        gray.dimensions() == mask.dimensions(),
        "Mask {:?} does not match its image size",
        mask_path
    );

    let analyzer = TextureAnalyzer::default();
    Ok(stored
        .result
        .areas_of_interest
        .iter()
        .map(|aoi| {
            let mut aoi = aoi.clone();
            aoi.detected_pixels = pixels_in_disk(&mask, &aoi);
            analyzer.aoi_textures(&gray, &aoi)
        })
        .collect())
}

/// Recompute texture data for every AOI of a run and write it back. With a
/// filter, AOIs it rejects are deleted from the store.
pub async fn reanalyze_run(
    db: &ResultDb,
    run_id: Uuid,
    filter: Option<TextureFilter>,
) -> anyhow::Result<ReanalysisSummary> {
    let mut summary = ReanalysisSummary::default();

    for image in db.get_images(run_id).await? {
        if image.result.is_error() || image.result.areas_of_interest.is_empty() {
            continue;
        }

        let image = Arc::new(image);
        let computed = {
            let image = Arc::clone(&image);
            tokio::task::spawn_blocking(move || texture_records(&image)).await?
        };
        let records = match computed {
            Ok(records) => records,
            Err(e) => {
                warn!("Skipping texture analysis of {:?}: {:#}", image.result.source_path, e);
                summary.skipped.push((image.result.source_path.clone(), format!("{:#}", e)));
                continue;
            }
        };

        let mut rejected = Vec::new();
        let scored_pairs = image.result.areas_of_interest.iter().zip(&records);
        for (ordinal, (aoi, record)) in scored_pairs.enumerate() {
            db.set_aoi_texture(image.id, ordinal, Some(record)).await?;
            let mut scored = aoi.clone();
            scored.texture_data = Some(*record);
            if filter.is_some_and(|f| !f.keeps(&scored)) {
                rejected.push(ordinal);
            }
        }
        if !rejected.is_empty() {
            db.delete_aois(image.id, &rejected).await?;
        }

        summary.images_analyzed += 1;
        summary.aois_analyzed += records.len();
        summary.aois_removed += rejected.len();
    }

    info!(
        "Texture analysis of run {}: {} images, {} AOIs, {} removed",
        run_id, summary.images_analyzed, summary.aois_analyzed, summary.aois_removed
    );
    Ok(summary)
}
