//! Persisted operator settings and batch configuration.
//!
//! Settings are read once when a batch starts: an optional settings file
//! (TOML, YAML or JSON, anything `config` understands) layered under
//! `AOISCAN_*` environment variables. Nothing here watches the file
//! afterwards.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

use crate::detection::{AlgorithmKind, DetectorOptions};
use crate::error::ConfigError;
use crate::models::Color;
use crate::texture::TextureFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum TemperatureUnit {
    #[default]
    #[serde(alias = "fahrenheit", alias = "F")]
    Fahrenheit,
    #[serde(alias = "celsius", alias = "C")]
    Celsius,
}

impl TemperatureUnit {
    /// Convert a user-facing temperature into Celsius.
    pub fn to_celsius(self, value: f64) -> f64 {
        match self {
            TemperatureUnit::Celsius => value,
            TemperatureUnit::Fahrenheit => (value - 32.0) * 5.0 / 9.0,
        }
    }
}

/// Operator preferences (`MinObjectArea`, `MaxProcesses`, ...).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub min_object_area: u32,
    /// 0 disables the upper bound.
    pub max_object_area: u32,
    pub max_processes: usize,
    pub max_aois: usize,
    pub aoi_radius: u32,
    pub combine_aois: bool,
    /// `"r,g,b"`
    pub identifier_color: String,
    pub temp_unit: TemperatureUnit,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            min_object_area: 10,
            max_object_area: 0,
            max_processes: 10,
            max_aois: 100,
            aoi_radius: 15,
            combine_aois: true,
            identifier_color: "0,255,0".to_string(),
            temp_unit: TemperatureUnit::Fahrenheit,
        }
    }
}

impl Settings {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(config::Environment::with_prefix("AOISCAN").try_parsing(true));
        let settings = builder
            .build()
            .context("Failed to read settings")?
            .try_deserialize()
            .context("Failed to parse settings")?;
        Ok(settings)
    }

    pub fn identifier_color(&self) -> Result<Color, ConfigError> {
        parse_color(&self.identifier_color).ok_or_else(|| {
            ConfigError::Setting("identifier_color".into(), self.identifier_color.clone())
        })
    }
}

/// Parse `"r,g,b"`, tolerating brackets and whitespace.
pub fn parse_color(s: &str) -> Option<Color> {
    let cleaned = s.trim().trim_start_matches(['(', '[']).trim_end_matches([')', ']']);
    let parts: Vec<u8> = cleaned
        .split(',')
        .map(|p| p.trim().parse::<u8>())
        .collect::<Result<_, _>>()
        .ok()?;
    match parts.as_slice() {
        [r, g, b] => Some(Color::new(*r, *g, *b)),
        _ => None,
    }
}

/// Parameters shared by every detector for turning masks into areas of interest.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExtractionParams {
    pub min_area: u32,
    /// 0 disables the upper bound.
    pub max_area: u32,
    pub aoi_radius: u32,
    pub combine_aois: bool,
    /// 0 disables the cap.
    pub max_aois: usize,
}

impl Default for ExtractionParams {
    fn default() -> Self {
        Self {
            min_area: 10,
            max_area: 0,
            aoi_radius: 15,
            combine_aois: true,
            max_aois: 100,
        }
    }
}

impl ExtractionParams {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_area > 0 && self.min_area > self.max_area {
            return Err(ConfigError::AreaRange {
                min: self.min_area,
                max: self.max_area,
            });
        }
        Ok(())
    }
}

/// Everything a batch needs besides the job list.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub algorithm: AlgorithmKind,
    pub options: DetectorOptions,
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub identifier_color: Color,
    pub extraction: ExtractionParams,
    pub max_processes: usize,
    pub histogram_reference: Option<PathBuf>,
    pub kmeans_clusters: Option<usize>,
    pub temperature_unit: TemperatureUnit,
    /// Run texture analysis on every AOI, dropping the ones the filter rejects.
    pub texture: Option<TextureFilter>,
}

impl BatchConfig {
    pub fn new(
        algorithm: AlgorithmKind,
        input_dir: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            algorithm,
            options: DetectorOptions::default(),
            input_dir: input_dir.into(),
            output_dir: output_dir.into(),
            identifier_color: Color::new(0, 255, 0),
            extraction: ExtractionParams::default(),
            max_processes: 10,
            histogram_reference: None,
            kmeans_clusters: None,
            temperature_unit: TemperatureUnit::default(),
            texture: None,
        }
    }

    /// Seed a configuration from persisted settings.
    pub fn from_settings(
        settings: &Settings,
        algorithm: AlgorithmKind,
        input_dir: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
    ) -> Result<Self, ConfigError> {
        let mut config = Self::new(algorithm, input_dir, output_dir);
        config.identifier_color = settings.identifier_color()?;
        config.max_processes = settings.max_processes;
        config.temperature_unit = settings.temp_unit;
        config.extraction = ExtractionParams {
            min_area: settings.min_object_area,
            max_area: settings.max_object_area,
            aoi_radius: settings.aoi_radius,
            combine_aois: settings.combine_aois,
            max_aois: settings.max_aois,
        };
        Ok(config)
    }

    pub fn with_options(mut self, options: DetectorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_extraction(mut self, extraction: ExtractionParams) -> Self {
        self.extraction = extraction;
        self
    }

    pub fn with_max_processes(mut self, max_processes: usize) -> Self {
        self.max_processes = max_processes;
        self
    }

    /// Structural checks that need no file access. Detector options are
    /// validated separately when the detector is built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_processes == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if self.kmeans_clusters == Some(0) {
            return Err(ConfigError::NoClusters);
        }
        self.extraction.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fahrenheit_converts_to_celsius() {
        let unit = TemperatureUnit::Fahrenheit;
        assert!((unit.to_celsius(212.0) - 100.0).abs() < 1e-9);
        assert!((unit.to_celsius(32.0)).abs() < 1e-9);
    }

    #[test]
    fn parses_colors_in_several_spellings() {
        assert_eq!(parse_color("255,0,0"), Some(Color::new(255, 0, 0)));
        assert_eq!(parse_color("(0, 255, 0)"), Some(Color::new(0, 255, 0)));
        assert_eq!(parse_color("[1,2,3]"), Some(Color::new(1, 2, 3)));
        assert_eq!(parse_color("1,2"), None);
        assert_eq!(parse_color("300,0,0"), None);
    }

    #[test]
    fn rejects_inverted_area_range() {
        let mut config = BatchConfig::new(AlgorithmKind::ColorRange, "/in", "/out");
        config.extraction.min_area = 500;
        config.extraction.max_area = 100;
        assert!(matches!(config.validate(), Err(ConfigError::AreaRange { .. })));
    }

    #[test]
    fn rejects_empty_worker_pool() {
        let config =
            BatchConfig::new(AlgorithmKind::ColorRange, "/in", "/out").with_max_processes(0);
        assert!(matches!(config.validate(), Err(ConfigError::NoWorkers)));
    }

    #[test]
    fn settings_file_overrides_defaults() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("settings.toml");
        std::fs::write(
            &path,
            "min_object_area = 42\nmax_processes = 3\ntemp_unit = \"Celsius\"\n",
        )?;
        let settings = Settings::load(Some(&path))?;
        assert_eq!(settings.min_object_area, 42);
        assert_eq!(settings.max_processes, 3);
        assert_eq!(settings.temp_unit, TemperatureUnit::Celsius);
        assert_eq!(settings.max_aois, 100);
        Ok(())
    }
}
