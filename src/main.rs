use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing::{Level, info, warn};
use uuid::Uuid;

use aoiscan::core::db::{ImageRepository, ResultDb, RunRepository, RunSettings};
use aoiscan::core::review::reanalyze_run;
use aoiscan::{
    AlgorithmKind, BatchConfig, BatchEvent, BatchScheduler, DetectorOptions, Settings,
    TextureFilter,
};

#[derive(Parser)]
#[command(name = "aoiscan")]
#[command(about = "Find areas of interest in batches of aerial images")]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Settings file (TOML, YAML or JSON)
    #[arg(long, global = true, value_name = "FILE")]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a detector over every image below a directory
    Scan(ScanArgs),
    /// Recompute texture data for a stored run
    Texture(TextureArgs),
    /// Print a stored run
    Show(ShowArgs),
}

#[derive(Args)]
struct ScanArgs {
    #[arg(value_name = "INPUT_DIR")]
    input_dir: PathBuf,

    #[arg(value_name = "OUTPUT_DIR")]
    output_dir: PathBuf,

    /// ColorRange, LABColorRange, RXAnomaly, MatchedFilter, ThermalRange or ThermalAnomaly
    #[arg(short, long)]
    algorithm: AlgorithmKind,

    /// Algorithm option as key=value, repeatable
    #[arg(short = 'o', long = "option", value_name = "KEY=VALUE")]
    options: Vec<String>,

    #[arg(long)]
    processes: Option<usize>,

    #[arg(long)]
    min_area: Option<u32>,

    #[arg(long)]
    max_area: Option<u32>,

    #[arg(long)]
    max_aois: Option<usize>,

    #[arg(long)]
    aoi_radius: Option<u32>,

    /// Keep overlapping AOIs separate
    #[arg(long)]
    no_combine: bool,

    /// Match every image's histogram to this reference first
    #[arg(long, value_name = "IMAGE")]
    histogram_reference: Option<PathBuf>,

    /// Quantize colors into this many clusters first
    #[arg(long, value_name = "K")]
    kmeans: Option<usize>,

    #[command(flatten)]
    texture: TextureFilterArgs,

    /// Run texture analysis during detection
    #[arg(long)]
    with_texture: bool,
}

#[derive(Args)]
struct TextureFilterArgs {
    #[arg(long)]
    min_texture_difference: Option<f64>,

    #[arg(long)]
    min_texture_ratio: Option<f64>,

    #[arg(long)]
    max_texture_ratio: Option<f64>,
}

impl TextureFilterArgs {
    fn filter(&self) -> TextureFilter {
        TextureFilter {
            min_difference: self.min_texture_difference,
            min_ratio: self.min_texture_ratio,
            max_ratio: self.max_texture_ratio,
        }
    }

    fn is_set(&self) -> bool {
        self.min_texture_difference.is_some()
            || self.min_texture_ratio.is_some()
            || self.max_texture_ratio.is_some()
    }
}

#[derive(Args)]
struct TextureArgs {
    #[arg(value_name = "OUTPUT_DIR")]
    output_dir: PathBuf,

    /// Run to analyze, latest when omitted
    #[arg(long)]
    run: Option<Uuid>,

    #[command(flatten)]
    filter: TextureFilterArgs,
}

#[derive(Args)]
struct ShowArgs {
    #[arg(value_name = "OUTPUT_DIR")]
    output_dir: PathBuf,

    #[arg(long)]
    run: Option<Uuid>,
}

/// Every file below `dir`, sorted.
fn list_files(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let entries = std::fs::read_dir(&current)
            .with_context(|| format!("Failed to read directory {:?}", current))?;
        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
            } else {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

async fn scan(args: ScanArgs, settings: Settings) -> anyhow::Result<()> {
    let mut options = DetectorOptions::new();
    for pair in &args.options {
        options.insert_pair(pair)?;
    }

    let mut config =
        BatchConfig::from_settings(&settings, args.algorithm, &args.input_dir, &args.output_dir)?
            .with_options(options);
    if let Some(processes) = args.processes {
        config.max_processes = processes;
    }
    if let Some(min_area) = args.min_area {
        config.extraction.min_area = min_area;
    }
    if let Some(max_area) = args.max_area {
        config.extraction.max_area = max_area;
    }
    if let Some(max_aois) = args.max_aois {
        config.extraction.max_aois = max_aois;
    }
    if let Some(aoi_radius) = args.aoi_radius {
        config.extraction.aoi_radius = aoi_radius;
    }
    config.extraction.combine_aois = !args.no_combine;
    config.histogram_reference = args.histogram_reference;
    config.kmeans_clusters = args.kmeans;
    if args.with_texture || args.texture.is_set() {
        config.texture = Some(args.texture.filter());
    }

    let jobs = list_files(&args.input_dir)?;
    let mut handle = BatchScheduler::new(config, jobs).start().await?;

    let cancel = handle.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing images in progress");
            cancel.cancel();
        }
    });

    if let Some(mut events) = handle.take_events() {
        while let Some(event) = events.recv().await {
            if let BatchEvent::AoiLimitExceeded { max_aois, .. } = event {
                println!(
                    "More than {} areas of interest detected. Consider tightening the detection settings.",
                    max_aois
                );
            }
        }
    }

    let summary = handle.wait().await?;
    println!("\n=== Run {} ===", summary.run_id);
    println!("{}", summary.message());
    Ok(())
}

async fn resolve_run(db: &ResultDb, run: Option<Uuid>) -> anyhow::Result<RunSettings> {
    let found = match run {
        Some(run_id) => db.get_run(run_id).await?,
        None => db.latest_run().await?,
    };
    found.with_context(|| format!("No run found in {:?}", db.output_dir()))
}

async fn texture(args: TextureArgs) -> anyhow::Result<()> {
    let db = ResultDb::open(&args.output_dir).await?;
    let run = resolve_run(&db, args.run).await?;
    let filter = args.filter.is_set().then(|| args.filter.filter());
    let summary = reanalyze_run(&db, run.run_id, filter).await?;
    db.close().await?;

    println!(
        "Analyzed {} AOIs in {} images, removed {}",
        summary.aois_analyzed, summary.images_analyzed, summary.aois_removed
    );
    for (path, reason) in &summary.skipped {
        println!("  Skipped {}: {}", path.display(), reason);
    }
    Ok(())
}

async fn show(args: ShowArgs) -> anyhow::Result<()> {
    let db = ResultDb::open(&args.output_dir).await?;
    let run = resolve_run(&db, args.run).await?;
    let images = db.get_images(run.run_id).await?;
    db.close().await?;

    println!("=== Run {} ({}) ===", run.run_id, run.algorithm);
    for (name, value) in &run.options {
        println!("  {} = {}", name, value);
    }
    for image in images.iter().filter(|image| !image.hidden) {
        let result = &image.result;
        if let Some(err) = &result.error_message {
            println!("{}: error: {}", result.file_name(), err);
            continue;
        }
        println!(
            "{}: {} AOIs ({} raw)",
            result.file_name(),
            result.areas_of_interest.len(),
            result.base_contour_count
        );
        for aoi in &result.areas_of_interest {
            println!(
                "  ({}, {}) r={} area={}{}",
                aoi.center.x,
                aoi.center.y,
                aoi.radius,
                aoi.area,
                if aoi.flagged { " [flagged]" } else { "" }
            );
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose { Level::DEBUG } else { Level::INFO })
        .init();

    match cli.command {
        Command::Scan(args) => {
            let settings = Settings::load(cli.settings.as_deref())?;
            info!("Loaded settings: {:?}", settings);
            scan(args, settings).await
        }
        Command::Texture(args) => texture(args).await,
        Command::Show(args) => show(args).await,
    }
}
