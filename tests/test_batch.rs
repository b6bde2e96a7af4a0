mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use aoiscan::core::db::DB_FILE_NAME;
use aoiscan::detection::{Detector, Frame};
use aoiscan::{ConfigError, OptionError};
use common::*;
use image::{GrayImage, Rgb};

fn jobs(workspace: &Workspace) -> Vec<std::path::PathBuf> {
    let mut files: Vec<_> = std::fs::read_dir(&workspace.input_dir)
        .expect("read input dir")
        .map(|entry| entry.expect("dir entry").path())
        .collect();
    files.sort();
    files
}

#[tokio::test]
async fn batch_reports_every_image_and_completes() -> anyhow::Result<()> {
    let workspace = Workspace::new();
    workspace.add_image("a.png", &red_squares(60, 60, &[(10, 10, 12)]));
    workspace.add_image("b.png", &red_squares(60, 60, &[]));
    workspace.add_image("c.png", &red_squares(60, 60, &[(30, 30, 15)]));
    workspace.add_file("notes.txt", "flight log");

    let recorder = Arc::new(Recorder::default());
    let handle = BatchScheduler::new(red_config(&workspace), jobs(&workspace))
        .with_observer(recorder.clone())
        .start()
        .await?;
    let mut state = handle.subscribe_state();
    let summary = handle.wait().await?;

    assert_eq!(summary.images_processed, 3);
    assert_eq!(summary.images_with_aoi, 2);
    assert!(!summary.cancelled);
    assert_eq!(summary.message(), "Completed with 2 images flagged");
    assert_eq!(*state.borrow_and_update(), BatchState::Completed);

    let progress = recorder.progress();
    assert_eq!(progress[0], "Processing 4 files");
    assert!(progress.iter().any(|line| {
        line.starts_with("Skipping") && line.ends_with("notes.txt :: File is not an image")
    }));
    assert!(progress.contains(&"No areas of interest identified in b.png".to_string()));
    assert!(progress.contains(&"Areas of interest identified in a.png".to_string()));
    assert_eq!(recorder.image_results(), 3);
    assert_eq!(recorder.limit_warnings(), 0);

    let events = recorder.events();
    match events.last() {
        Some(BatchEvent::Completed(done)) => assert_eq!(done.images_with_aoi, 2),
        other => panic!("last event was {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn aoi_limit_warning_fires_once() -> anyhow::Result<()> {
    let workspace = Workspace::new();
    for i in 0..4 {
        let img = red_squares(80, 80, &[(5, 5, 6), (60, 60, 6)]);
        workspace.add_image(&format!("img_{i}.png"), &img);
    }
    let mut config = red_config(&workspace);
    config.extraction.max_aois = 3;

    let recorder = Arc::new(Recorder::default());
    let handle = BatchScheduler::new(config, jobs(&workspace))
        .with_observer(recorder.clone())
        .start()
        .await?;
    let summary = handle.wait().await?;

    assert_eq!(summary.images_processed, 4);
    assert_eq!(recorder.limit_warnings(), 1);
    let warning = recorder.events().into_iter().find_map(|e| match e {
        BatchEvent::AoiLimitExceeded { total, max_aois } => Some((total, max_aois)),
        _ => None,
    });
    let (total, max_aois) = warning.expect("warning event");
    assert_eq!(max_aois, 3);
    assert!(total > 3);
    Ok(())
}

#[tokio::test]
async fn crowded_image_is_capped_and_warned_once() -> anyhow::Result<()> {
    let workspace = Workspace::new();
    let squares: Vec<(u32, u32, u32)> =
        (0..50).map(|i| (5 + 20 * (i % 10), 5 + 20 * (i / 10), 4)).collect();
    workspace.add_image("crowded.png", &red_squares(200, 100, &squares));
    let mut config = red_config(&workspace);
    config.extraction.max_aois = 10;

    let recorder = Arc::new(Recorder::default());
    let handle = BatchScheduler::new(config, jobs(&workspace))
        .with_observer(recorder.clone())
        .start()
        .await?;
    handle.wait().await?;

    assert_eq!(recorder.limit_warnings(), 1);
    let result = recorder.events().into_iter().find_map(|e| match e {
        BatchEvent::ImageResult(result) => Some(result),
        _ => None,
    });
    let result = result.expect("image result");
    assert_eq!(result.base_contour_count, 50);
    assert!(result.areas_of_interest.len() <= 10);
    Ok(())
}

#[tokio::test]
async fn cancellation_stops_dispatching() -> anyhow::Result<()> {
    let workspace = Workspace::new();
    for i in 0..5 {
        workspace.add_image(&format!("img_{i}.png"), &red_squares(40, 40, &[(10, 10, 10)]));
    }
    let config = red_config(&workspace).with_max_processes(1);

    let token = CancelToken::default();
    let recorder = Arc::new(Recorder::cancelling(token.clone()));
    let handle = BatchScheduler::new(config, jobs(&workspace))
        .with_cancel_token(token)
        .with_observer(recorder.clone())
        .start()
        .await?;
    let mut state = handle.subscribe_state();
    let summary = handle.wait().await?;

    assert!(summary.cancelled);
    assert_eq!(summary.images_processed, 1);
    assert_eq!(summary.message(), "Processing cancelled");
    assert_eq!(*state.borrow_and_update(), BatchState::Cancelled);
    assert!(recorder.progress().contains(&"--- Cancelling Image Processing ---".to_string()));

    let db = ResultDb::open(&workspace.output_dir).await?;
    assert_eq!(db.get_images(summary.run_id).await?.len(), 1);
    db.close().await?;
    Ok(())
}

#[tokio::test]
async fn results_are_persisted_with_run_settings() -> anyhow::Result<()> {
    let workspace = Workspace::new();
    workspace.add_image("a.png", &red_squares(60, 60, &[(10, 10, 12)]));
    workspace.add_image("b.png", &red_squares(60, 60, &[]));

    let handle = BatchScheduler::new(red_config(&workspace), jobs(&workspace)).start().await?;
    let run_id = handle.run_id();
    let summary = handle.wait().await?;
    assert_eq!(summary.run_id, run_id);

    let db = ResultDb::open(&workspace.output_dir).await?;
    let run = db.latest_run().await?.expect("run recorded");
    assert_eq!(run.run_id, run_id);
    assert_eq!(run.algorithm, "ColorRange");
    assert_eq!(run.num_processes, 2);
    assert!(!run.thermal);
    assert!(run.option("color_range").is_some());

    let images = db.get_images(run_id).await?;
    assert_eq!(images.len(), 2);
    let flagged = images
        .iter()
        .find(|image| image.result.file_name() == "a.png")
        .expect("a.png stored");
    assert_eq!(flagged.result.areas_of_interest.len(), 1);
    assert_eq!(flagged.result.areas_of_interest[0].area, 144.0);
    let mask_path = flagged.result.mask_path.as_ref().expect("mask recorded");
    assert_eq!(
        mask_path,
        &workspace.output_dir.join(run_id.to_string()).join("a.png.mask.png")
    );
    assert_eq!(count_set_pixels(mask_path), 144);
    db.close().await?;
    Ok(())
}

#[tokio::test]
async fn missing_option_is_rejected_before_start() {
    let workspace = Workspace::new();
    workspace.add_image("a.png", &red_squares(20, 20, &[]));
    let config = BatchConfig::new(
        AlgorithmKind::LabColorRange,
        &workspace.input_dir,
        &workspace.output_dir,
    );

    let err = match BatchScheduler::new(config, jobs(&workspace)).start().await {
        Ok(_) => panic!("batch started without selected_color"),
        Err(err) => err,
    };

    assert!(matches!(
        err.downcast_ref::<ConfigError>(),
        Some(ConfigError::Option(OptionError::Missing(key))) if key == "selected_color"
    ));
    assert!(!workspace.output_dir.join(DB_FILE_NAME).exists());
}

#[tokio::test]
async fn missing_histogram_reference_is_rejected() {
    let workspace = Workspace::new();
    let mut config = red_config(&workspace);
    config.histogram_reference = Some(workspace.input_dir.join("missing.png"));

    let err = match BatchScheduler::new(config, Vec::new()).start().await {
        Ok(_) => panic!("batch started with a missing reference"),
        Err(err) => err,
    };

    assert!(matches!(
        err.downcast_ref::<ConfigError>(),
        Some(ConfigError::HistogramReference { .. })
    ));
}

#[tokio::test]
async fn runs_accumulate_in_one_output_dir() -> anyhow::Result<()> {
    let workspace = Workspace::new();
    let img = image_with_squares(
        80,
        80,
        &[(5, 5, 10, TARGET), (50, 50, 12, Rgb([150, 20, 20]))],
    );
    workspace.add_image("a.png", &img);

    let narrow = red_config(&workspace);
    let wide = red_config(&workspace).with_options(wide_red_options());
    let first = BatchScheduler::new(narrow, jobs(&workspace)).start().await?.wait().await?;
    let second = BatchScheduler::new(wide, jobs(&workspace)).start().await?.wait().await?;

    let db = ResultDb::open(&workspace.output_dir).await?;
    let runs = db.get_runs().await?;
    assert_eq!(runs.len(), 2);
    assert!(runs.iter().any(|r| r.run_id == first.run_id));
    assert!(runs.iter().any(|r| r.run_id == second.run_id));

    let first_images = db.get_images(first.run_id).await?;
    let second_images = db.get_images(second.run_id).await?;
    assert_eq!(first_images.len(), 1);
    assert_eq!(second_images.len(), 1);
    assert_eq!(stored_area(&first_images[0]), 100);
    assert_eq!(stored_area(&second_images[0]), 244);

    // The second run must not have touched the first run's mask.
    for image in first_images.iter().chain(&second_images) {
        let mask_path = image.result.mask_path.as_ref().expect("mask recorded");
        assert_eq!(count_set_pixels(mask_path), stored_area(image));
    }
    assert_ne!(first_images[0].result.mask_path, second_images[0].result.mask_path);
    db.close().await?;
    Ok(())
}

#[tokio::test]
async fn same_stem_images_get_their_own_masks() -> anyhow::Result<()> {
    let workspace = Workspace::new();
    workspace.add_image("a.png", &red_squares(60, 60, &[(10, 10, 10)]));
    workspace.add_image("a.bmp", &red_squares(60, 60, &[(20, 20, 12)]));

    let summary = BatchScheduler::new(red_config(&workspace), jobs(&workspace))
        .start()
        .await?
        .wait()
        .await?;
    assert_eq!(summary.images_with_aoi, 2);

    let db = ResultDb::open(&workspace.output_dir).await?;
    let images = db.get_images(summary.run_id).await?;
    assert_eq!(images.len(), 2);
    let masks: Vec<_> = images
        .iter()
        .map(|image| image.result.mask_path.clone().expect("mask recorded"))
        .collect();
    assert_ne!(masks[0], masks[1]);
    for image in &images {
        let mask_path = image.result.mask_path.as_ref().expect("mask recorded");
        assert_eq!(count_set_pixels(mask_path), stored_area(image));
    }
    db.close().await?;
    Ok(())
}

/// Detects nothing, slowly, and remembers how many calls overlapped.
#[derive(Default)]
struct OverlapCounter {
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl Detector for OverlapCounter {
    fn detect(&self, frame: &Frame) -> anyhow::Result<GrayImage> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(40));
        self.running.fetch_sub(1, Ordering::SeqCst);
        let (width, height) = frame.dimensions();
        Ok(GrayImage::new(width, height))
    }

    fn name(&self) -> &str {
        "OverlapCounter"
    }
}

#[tokio::test]
async fn detections_never_exceed_max_processes() -> anyhow::Result<()> {
    let workspace = Workspace::new();
    for i in 0..9 {
        workspace.add_image(&format!("img_{i}.png"), &red_squares(20, 20, &[]));
    }
    let counter = Arc::new(OverlapCounter::default());
    let config = red_config(&workspace).with_max_processes(3);

    let summary = BatchScheduler::new(config, jobs(&workspace))
        .with_detector(counter.clone())
        .start()
        .await?
        .wait()
        .await?;

    assert_eq!(summary.images_processed, 9);
    let peak = counter.peak.load(Ordering::SeqCst);
    assert!(peak <= 3, "{peak} detections ran at once");
    assert!(peak > 1, "detections never overlapped");
    Ok(())
}

#[tokio::test]
async fn cancel_after_last_dispatch_still_completes() -> anyhow::Result<()> {
    let workspace = Workspace::new();
    workspace.add_image("a.png", &red_squares(40, 40, &[(10, 10, 10)]));

    let token = CancelToken::default();
    let recorder = Arc::new(Recorder::cancelling(token.clone()));
    let handle = BatchScheduler::new(red_config(&workspace), jobs(&workspace))
        .with_cancel_token(token.clone())
        .with_observer(recorder.clone())
        .start()
        .await?;
    let mut state = handle.subscribe_state();
    let summary = handle.wait().await?;

    assert!(token.is_cancelled());
    assert!(!summary.cancelled);
    assert_eq!(summary.images_processed, 1);
    assert_eq!(summary.message(), "Completed with 1 images flagged");
    assert_eq!(*state.borrow_and_update(), BatchState::Completed);
    assert!(!recorder.progress().contains(&"--- Cancelling Image Processing ---".to_string()));
    Ok(())
}
