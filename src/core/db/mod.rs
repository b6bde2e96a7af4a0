mod image;
mod model;
mod run;
mod state;

use std::{collections::HashMap, path::Path, sync::Arc};

use anyhow::Context;
use sqlx::{Row, sqlite::SqliteRow};
use state::StoreState;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use tracing::debug;
use uuid::Uuid;

use crate::models::{AnalysisResult, AreaOfInterest, Point, TextureRecord};
use model::{color_from_i64, color_to_i64, path_to_text, text_to_path};

pub use image::{ImageRepository, StoredImage};
pub use run::{RunRepository, RunSettings};
pub use state::DB_FILE_NAME;

/// Result store for one output directory.
#[derive(Debug, Clone)]
pub struct ResultDb {
    state: Arc<StoreState>,
}

impl ResultDb {
    pub async fn open<P: AsRef<Path>>(output_dir: P) -> anyhow::Result<Self> {
        Ok(Self {
            state: Arc::new(StoreState::new(output_dir).await?),
        })
    }

    pub fn output_dir(&self) -> &Path {
        self.state.output_dir()
    }

    pub fn db_file(&self) -> &Path {
        self.state.db_file()
    }

    /// Checkpoint and close. Any later query fails.
    pub async fn close(&self) -> anyhow::Result<()> {
        self.state.close().await
    }
}

fn run_from_row(row: &SqliteRow, options: Vec<(String, String)>) -> anyhow::Result<RunSettings> {
    let run_id: String = row.try_get("run_id")?;
    let started_at: String = row.try_get("started_at")?;
    Ok(RunSettings {
        run_id: Uuid::parse_str(&run_id).with_context(|| format!("Invalid run id {run_id:?}"))?,
        started_at: OffsetDateTime::parse(&started_at, &Rfc3339)?,
        input_dir: text_to_path(row.try_get("input_dir")?),
        output_dir: text_to_path(row.try_get("output_dir")?),
        algorithm: row.try_get("algorithm")?,
        identifier_color: color_from_i64(row.try_get("identifier_color")?),
        min_area: row.try_get::<i64, _>("min_area")? as u32,
        max_area: row.try_get::<i64, _>("max_area")? as u32,
        num_processes: row.try_get::<i64, _>("num_processes")? as usize,
        max_aois: row.try_get::<i64, _>("max_aois")? as usize,
        aoi_radius: row.try_get::<i64, _>("aoi_radius")? as u32,
        combine_aois: row.try_get("combine_aois")?,
        hist_ref_path: row.try_get::<Option<String>, _>("hist_ref_path")?.map(text_to_path),
        kmeans_clusters: row.try_get::<Option<i64>, _>("kmeans_clusters")?.map(|k| k as usize),
        thermal: row.try_get("thermal")?,
        options,
    })
}

fn aoi_from_row(row: &SqliteRow) -> anyhow::Result<AreaOfInterest> {
    let center = Point::new(row.try_get("center_x")?, row.try_get("center_y")?);
    let mut aoi = AreaOfInterest::new(center, row.try_get("radius")?, row.try_get("area")?);
    aoi.flagged = row.try_get("flagged")?;
    aoi.average_color = row.try_get::<Option<i64>, _>("average_color")?.map(color_from_i64);
    aoi.average_temperature = row.try_get("average_temperature")?;
    aoi.texture_data = row
        .try_get::<Option<String>, _>("texture_json")?
        .map(|json| serde_json::from_str::<TextureRecord>(&json))
        .transpose()
        .context("Corrupt texture data")?;
    Ok(aoi)
}

fn image_from_row(
    row: &SqliteRow,
    areas_of_interest: Vec<AreaOfInterest>,
) -> anyhow::Result<StoredImage> {
    let run_id: String = row.try_get("run_id")?;
    let mut result = AnalysisResult::new(
        text_to_path(row.try_get("source_path")?),
        text_to_path(row.try_get("output_dir")?),
    );
    result.mask_path = row.try_get::<Option<String>, _>("mask_path")?.map(text_to_path);
    result.base_contour_count = row.try_get::<i64, _>("base_contour_count")? as usize;
    result.error_message = row.try_get("error_message")?;
    result.areas_of_interest = areas_of_interest;
    Ok(StoredImage {
        id: row.try_get("id")?,
        run_id: Uuid::parse_str(&run_id)?,
        hidden: row.try_get("hidden")?,
        result,
    })
}

const RUN_COLUMNS: &str = "run_id, started_at, input_dir, output_dir, algorithm, identifier_color, min_area, \
     max_area, num_processes, max_aois, aoi_radius, combine_aois, hist_ref_path, kmeans_clusters, thermal";

const AOI_COLUMNS: &str = "image_id, ordinal, center_x, center_y, radius, area, flagged, average_color, \
     average_temperature, texture_json";

impl ResultDb {
    async fn run_options(&self, run_id: &str) -> anyhow::Result<Vec<(String, String)>> {
        let mut conn = self.state.conn().await?;
        let rows = sqlx::query("SELECT name, value FROM run_option WHERE run_id = $1 ORDER BY name")
            .bind(run_id)
            .fetch_all(&mut **conn)
            .await?;
        rows.iter()
            .map(|row| Ok((row.try_get("name")?, row.try_get("value")?)))
            .collect()
    }

    async fn runs_where(
        &self,
        clause: &str,
        run_id: Option<String>,
    ) -> anyhow::Result<Vec<RunSettings>> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM run_settings {clause}");
        let rows = {
            let mut conn = self.state.conn().await?;
            let mut query = sqlx::query(&sql);
            if let Some(run_id) = run_id {
                query = query.bind(run_id);
            }
            query.fetch_all(&mut **conn).await?
        };

        let mut runs = Vec::with_capacity(rows.len());
        for row in &rows {
            let run_id: String = row.try_get("run_id")?;
            let options = self.run_options(&run_id).await?;
            runs.push(run_from_row(row, options)?);
        }
        Ok(runs)
    }

    async fn images_where(&self, clause: &str, key: String) -> anyhow::Result<Vec<StoredImage>> {
        let mut conn = self.state.conn().await?;
        let image_sql = format!(
            "SELECT id, run_id, source_path, mask_path, output_dir, base_contour_count, error_message, hidden \
             FROM image_result {clause} ORDER BY source_path"
        );
        let image_rows = sqlx::query(&image_sql).bind(&key).fetch_all(&mut **conn).await?;

        let aoi_sql = format!(
            "SELECT {AOI_COLUMNS} FROM area_of_interest WHERE image_id IN \
             (SELECT id FROM image_result {clause}) ORDER BY image_id, ordinal"
        );
        let aoi_rows = sqlx::query(&aoi_sql).bind(&key).fetch_all(&mut **conn).await?;

        let mut aois_by_image: HashMap<i64, Vec<AreaOfInterest>> = HashMap::new();
        for row in &aoi_rows {
            let image_id: i64 = row.try_get("image_id")?;
            aois_by_image.entry(image_id).or_default().push(aoi_from_row(row)?);
        }

        image_rows
            .iter()
            .map(|row| {
                let id: i64 = row.try_get("id")?;
                image_from_row(row, aois_by_image.remove(&id).unwrap_or_default())
            })
            .collect()
    }
}

impl RunRepository for ResultDb {
    async fn record_settings(&self, settings: &RunSettings) -> anyhow::Result<()> {
        let mut conn = self.state.conn().await?;
        let mut tx = conn.begin_transaction().await?;
        let run_id = settings.run_id.to_string();

        sqlx::query(
            r#"INSERT INTO run_settings (run_id, started_at, input_dir, output_dir, algorithm, identifier_color,
                min_area, max_area, num_processes, max_aois, aoi_radius, combine_aois, hist_ref_path,
                kmeans_clusters, thermal)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)"#,
        )
        .bind(&run_id)
        .bind(settings.started_at.format(&Rfc3339)?)
        .bind(path_to_text(&settings.input_dir))
        .bind(path_to_text(&settings.output_dir))
        .bind(&settings.algorithm)
        .bind(color_to_i64(settings.identifier_color))
        .bind(settings.min_area as i64)
        .bind(settings.max_area as i64)
        .bind(settings.num_processes as i64)
        .bind(settings.max_aois as i64)
        .bind(settings.aoi_radius as i64)
        .bind(settings.combine_aois)
        .bind(settings.hist_ref_path.as_deref().map(path_to_text))
        .bind(settings.kmeans_clusters.map(|k| k as i64))
        .bind(settings.thermal)
        .execute(&mut *tx)
        .await?;

        for (name, value) in &settings.options {
            sqlx::query("INSERT INTO run_option (run_id, name, value) VALUES ($1, $2, $3)")
                .bind(&run_id)
                .bind(name)
                .bind(value)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        debug!("Recorded settings for run {}", run_id);
        Ok(())
    }

    async fn get_runs(&self) -> anyhow::Result<Vec<RunSettings>> {
        self.runs_where("ORDER BY started_at, rowid", None).await
    }

    async fn get_run(&self, run_id: Uuid) -> anyhow::Result<Option<RunSettings>> {
        let mut runs = self.runs_where("WHERE run_id = $1", Some(run_id.to_string())).await?;
        Ok(runs.pop())
    }

    async fn latest_run(&self) -> anyhow::Result<Option<RunSettings>> {
        let mut runs = self.runs_where("ORDER BY started_at DESC, rowid DESC LIMIT 1", None).await?;
        Ok(runs.pop())
    }
}

impl ImageRepository for ResultDb {
    async fn record_result(&self, run_id: Uuid, result: &AnalysisResult) -> anyhow::Result<i64> {
        let mut conn = self.state.conn().await?;
        let mut tx = conn.begin_transaction().await?;
        let run_id = run_id.to_string();
        let source_path = path_to_text(&result.source_path);

        sqlx::query("DELETE FROM image_result WHERE run_id = $1 AND source_path = $2")
            .bind(&run_id)
            .bind(&source_path)
            .execute(&mut *tx)
            .await?;

        let image_id = sqlx::query(
            r#"INSERT INTO image_result (run_id, source_path, mask_path, output_dir, base_contour_count, error_message)
            VALUES ($1, $2, $3, $4, $5, $6)"#,
        )
        .bind(&run_id)
        .bind(&source_path)
        .bind(result.mask_path.as_deref().map(path_to_text))
        .bind(path_to_text(&result.output_dir))
        .bind(result.base_contour_count as i64)
        .bind(result.error_message.as_deref())
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        for (ordinal, aoi) in result.areas_of_interest.iter().enumerate() {
            let texture_json = aoi.texture_data.as_ref().map(serde_json::to_string).transpose()?;
            sqlx::query(
                r#"INSERT INTO area_of_interest (image_id, ordinal, center_x, center_y, radius, area, flagged,
                    average_color, average_temperature, texture_json)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"#,
            )
            .bind(image_id)
            .bind(ordinal as i64)
            .bind(aoi.center.x)
            .bind(aoi.center.y)
            .bind(aoi.radius)
            .bind(aoi.area)
            .bind(aoi.flagged)
            .bind(aoi.average_color.map(color_to_i64))
            .bind(aoi.average_temperature)
            .bind(texture_json)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(image_id)
    }

    async fn get_images(&self, run_id: Uuid) -> anyhow::Result<Vec<StoredImage>> {
        self.images_where("WHERE run_id = $1", run_id.to_string()).await
    }

    async fn get_image(&self, image_id: i64) -> anyhow::Result<Option<StoredImage>> {
        let mut images = self
            .images_where("WHERE id = CAST($1 AS INTEGER)", image_id.to_string())
            .await?;
        Ok(images.pop())
    }

    async fn set_image_hidden(&self, image_id: i64, hidden: bool) -> anyhow::Result<()> {
        let mut conn = self.state.conn().await?;
        let updated = sqlx::query("UPDATE image_result SET hidden = $1 WHERE id = $2")
            .bind(hidden)
            .bind(image_id)
            .execute(&mut **conn)
            .await?
            .rows_affected();
        anyhow::ensure!(updated == 1, "No image with id {}", image_id);
        Ok(())
    }

    async fn set_aoi_flagged(
        &self,
        image_id: i64,
        ordinal: usize,
        flagged: bool,
    ) -> anyhow::Result<()> {
        let mut conn = self.state.conn().await?;
        let updated = sqlx::query(
            "UPDATE area_of_interest SET flagged = $1 WHERE image_id = $2 AND ordinal = $3",
        )
        .bind(flagged)
        .bind(image_id)
        .bind(ordinal as i64)
        .execute(&mut **conn)
        .await?
        .rows_affected();
        anyhow::ensure!(updated == 1, "No AOI {} for image {}", ordinal, image_id);
        Ok(())
    }

    async fn set_aoi_texture(
        &self,
        image_id: i64,
        ordinal: usize,
        texture: Option<&TextureRecord>,
    ) -> anyhow::Result<()> {
        let texture_json = texture.map(serde_json::to_string).transpose()?;
        let mut conn = self.state.conn().await?;
        let updated = sqlx::query(
            "UPDATE area_of_interest SET texture_json = $1 WHERE image_id = $2 AND ordinal = $3",
        )
        .bind(texture_json)
        .bind(image_id)
        .bind(ordinal as i64)
        .execute(&mut **conn)
        .await?
        .rows_affected();
        anyhow::ensure!(updated == 1, "No AOI {} for image {}", ordinal, image_id);
        Ok(())
    }

    async fn delete_aois(&self, image_id: i64, ordinals: &[usize]) -> anyhow::Result<()> {
        let mut conn = self.state.conn().await?;
        let mut tx = conn.begin_transaction().await?;
        for &ordinal in ordinals {
            sqlx::query("DELETE FROM area_of_interest WHERE image_id = $1 AND ordinal = $2")
                .bind(image_id)
                .bind(ordinal as i64)
                .execute(&mut *tx)
                .await?;
        }

        // Ascending renumbering never collides: every new ordinal is at most the old one.
        let ids: Vec<i64> =
            sqlx::query("SELECT id FROM area_of_interest WHERE image_id = $1 ORDER BY ordinal")
                .bind(image_id)
                .fetch_all(&mut *tx)
                .await?
                .iter()
                .map(|row| row.try_get::<i64, _>("id"))
                .collect::<Result<_, _>>()?;
        for (ordinal, id) in ids.into_iter().enumerate() {
            sqlx::query("UPDATE area_of_interest SET ordinal = $1 WHERE id = $2")
                .bind(ordinal as i64)
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}
