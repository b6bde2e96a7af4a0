//! Batch scheduling: run one detector over many images on a bounded worker
//! pool and report progress, results and completion as events.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use anyhow::Context;
use image::ImageFormat;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::aoi::AoiExtractor;
use crate::config::BatchConfig;
use crate::core::db::{ImageRepository, ResultDb, RunRepository, RunSettings};
use crate::detection::{
    DetectionContext, Detector, HistogramMatcher, KMeansQuantizer, build_detector,
};
use crate::error::ConfigError;
use crate::models::AnalysisResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Idle,
    Running,
    Completed,
    Cancelled,
}

/// How a finished batch ended.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchSummary {
    pub run_id: Uuid,
    pub images_processed: usize,
    pub images_with_aoi: usize,
    pub cancelled: bool,
    pub elapsed: Duration,
}

impl BatchSummary {
    pub fn message(&self) -> String {
        if self.cancelled {
            "Processing cancelled".to_string()
        } else if self.images_with_aoi == 0 {
            "No areas of interest found".to_string()
        } else {
            format!("Completed with {} images flagged", self.images_with_aoi)
        }
    }
}

#[derive(Debug, Clone)]
pub enum BatchEvent {
    Progress(String),
    ImageResult(AnalysisResult),
    /// Sent at most once per batch, when the raw detection total first
    /// passes `max_aois`.
    AoiLimitExceeded { total: usize, max_aois: usize },
    Completed(BatchSummary),
}

/// Synchronous event hook, called on the coordinating task before the event
/// is queued for the handle's receiver.
pub trait BatchObserver: Send + Sync {
    fn on_event(&self, event: &BatchEvent);
}

/// Cooperative cancellation flag. Workers never see it; the scheduler reads
/// it only between dispatches.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Running total of raw detections across the batch.
#[derive(Debug, Default)]
struct AoiLimit {
    total: AtomicUsize,
    warned: AtomicBool,
}

impl AoiLimit {
    /// Add one image's count. Returns the new total the first time it passes
    /// `max_aois`; 0 disables the check.
    fn add(&self, count: usize, max_aois: usize) -> Option<usize> {
        let total = self.total.fetch_add(count, Ordering::SeqCst) + count;
        if max_aois > 0 && total > max_aois && !self.warned.swap(true, Ordering::SeqCst) {
            return Some(total);
        }
        None
    }
}

pub fn is_image_file(path: &Path) -> bool {
    ImageFormat::from_path(path).is_ok()
}

pub struct BatchScheduler {
    config: BatchConfig,
    jobs: Vec<PathBuf>,
    observer: Option<Arc<dyn BatchObserver>>,
    cancel: CancelToken,
    detector: Option<Arc<dyn Detector>>,
}

impl BatchScheduler {
    pub fn new(config: BatchConfig, jobs: Vec<PathBuf>) -> Self {
        Self {
            config,
            jobs,
            observer: None,
            cancel: CancelToken::default(),
            detector: None,
        }
    }

    /// Run a caller-supplied detector instead of the one `config.algorithm`
    /// names. The configured options are still validated.
    pub fn with_detector(mut self, detector: Arc<dyn Detector>) -> Self {
        self.detector = Some(detector);
        self
    }

    /// Share a cancellation flag created before the batch starts.
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn BatchObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Everything that can be rejected without touching an input image.
    fn prepare(&self) -> Result<(Arc<dyn Detector>, DetectionContext), ConfigError> {
        self.config.validate()?;
        let built = build_detector(
            self.config.algorithm,
            &self.config.options,
            self.config.temperature_unit,
        )?;
        let detector = self.detector.clone().unwrap_or(built);

        let mut context = DetectionContext::new(
            AoiExtractor::new(self.config.extraction),
            &self.config.input_dir,
            &self.config.output_dir,
        );
        if let Some(path) = &self.config.histogram_reference {
            let matcher =
                HistogramMatcher::from_path(path).map_err(|e| ConfigError::HistogramReference {
                    path: path.clone(),
                    reason: format!("{:#}", e),
                })?;
            context.histogram = Some(Arc::new(matcher));
        }
        context.quantizer = self.config.kmeans_clusters.map(KMeansQuantizer::new);
        context.texture = self.config.texture;
        Ok((detector, context))
    }

    /// Validate, open the result store, record the run settings and start
    /// processing in the background.
    ///
    /// Configuration problems come back as a [`ConfigError`] inside the
    /// `anyhow::Error`; nothing has been dispatched in that case.
    pub async fn start(self) -> anyhow::Result<BatchHandle> {
        let (detector, mut context) = self.prepare()?;

        let store = ResultDb::open(&self.config.output_dir).await?;
        let run_id = Uuid::new_v4();
        context.mask_dir = self.config.output_dir.join(run_id.to_string());
        store
            .record_settings(&RunSettings::from_config(run_id, &self.config))
            .await
            .context("Failed to record run settings")?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(BatchState::Idle);
        let cancel = self.cancel;

        let batch = Batch {
            run_id,
            jobs: self.jobs,
            max_processes: self.config.max_processes,
            max_aois: self.config.extraction.max_aois,
            detector,
            context: Arc::new(context),
            store,
            cancel: cancel.clone(),
            limit: Arc::new(AoiLimit::default()),
            emitter: Emitter {
                events: event_tx,
                observer: self.observer,
            },
            state: state_tx,
        };
        batch.state.send_replace(BatchState::Running);
        info!("Starting run {} with {}", run_id, batch.detector.name());
        let task = tokio::spawn(batch.run());

        Ok(BatchHandle {
            run_id,
            cancel,
            state: state_rx,
            events: Some(event_rx),
            task,
        })
    }
}

pub struct BatchHandle {
    run_id: Uuid,
    cancel: CancelToken,
    state: watch::Receiver<BatchState>,
    events: Option<mpsc::UnboundedReceiver<BatchEvent>>,
    task: JoinHandle<BatchSummary>,
}

impl BatchHandle {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Stop dispatching new images. Images already running finish and are
    /// recorded.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> BatchState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<BatchState> {
        self.state.clone()
    }

    /// The event stream. Can be taken once.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<BatchEvent>> {
        self.events.take()
    }

    pub async fn wait(self) -> anyhow::Result<BatchSummary> {
        self.task.await.context("Batch coordinator failed")
    }
}

struct Emitter {
    events: mpsc::UnboundedSender<BatchEvent>,
    observer: Option<Arc<dyn BatchObserver>>,
}

impl Emitter {
    fn emit(&self, event: BatchEvent) {
        if let Some(observer) = &self.observer {
            observer.on_event(&event);
        }
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    fn progress(&self, message: String) {
        info!("{}", message);
        self.emit(BatchEvent::Progress(message));
    }
}

struct Finished {
    result: AnalysisResult,
    limit_total: Option<usize>,
}

struct Batch {
    run_id: Uuid,
    jobs: Vec<PathBuf>,
    max_processes: usize,
    max_aois: usize,
    detector: Arc<dyn Detector>,
    context: Arc<DetectionContext>,
    store: ResultDb,
    cancel: CancelToken,
    limit: Arc<AoiLimit>,
    emitter: Emitter,
    state: watch::Sender<BatchState>,
}

impl Batch {
    async fn run(mut self) -> BatchSummary {
        let started = Instant::now();
        let jobs = std::mem::take(&mut self.jobs);
        self.emitter.progress(format!("Processing {} files", jobs.len()));

        let mut pending = jobs.into_iter().peekable();
        let mut in_flight: JoinSet<Finished> = JoinSet::new();
        let mut cancelled = false;
        let mut images_processed = 0;
        let mut images_with_aoi = 0;

        loop {
            while in_flight.len() < self.max_processes && pending.peek().is_some() {
                if self.cancel.is_cancelled() {
                    if !cancelled {
                        cancelled = true;
                        self.emitter.progress("--- Cancelling Image Processing ---".to_string());
                    }
                    break;
                }
                let Some(path) = pending.next() else { break };
                if !is_image_file(&path) {
                    self.emitter
                        .progress(format!("Skipping {} :: File is not an image", path.display()));
                    continue;
                }
                self.dispatch(&mut in_flight, path);
            }

            let Some(joined) = in_flight.join_next().await else { break };
            match joined {
                Ok(finished) => {
                    images_processed += 1;
                    if finished.result.has_aois() {
                        images_with_aoi += 1;
                    }
                    self.finish_image(finished).await;
                }
                Err(e) => error!("Detection task failed: {}", e),
            }
        }

        let summary = BatchSummary {
            run_id: self.run_id,
            images_processed,
            images_with_aoi,
            cancelled,
            elapsed: started.elapsed(),
        };
        self.emitter
            .progress(format!("Total time: {:.2} seconds", summary.elapsed.as_secs_f64()));
        self.emitter
            .progress(format!("Total images processed: {}", summary.images_processed));
        self.emitter.progress(summary.message());

        if let Err(e) = self.store.close().await {
            warn!("Failed to close result store: {:#}", e);
        }
        self.state.send_replace(if cancelled {
            BatchState::Cancelled
        } else {
            BatchState::Completed
        });
        self.emitter.emit(BatchEvent::Completed(summary.clone()));
        summary
    }

    fn dispatch(&self, in_flight: &mut JoinSet<Finished>, path: PathBuf) {
        let detector = Arc::clone(&self.detector);
        let context = Arc::clone(&self.context);
        let limit = Arc::clone(&self.limit);
        let max_aois = self.max_aois;
        debug!("Dispatching {:?}", path);
        in_flight.spawn_blocking(move || {
            let result = context.process(detector.as_ref(), &path);
            let limit_total = limit.add(result.base_contour_count, max_aois);
            Finished { result, limit_total }
        });
    }

    async fn finish_image(&self, finished: Finished) {
        let Finished { result, limit_total } = finished;
        let name = result.file_name();
        let message = match &result.error_message {
            Some(err) => format!("Unable to process {} :: {}", name, err),
            None if result.areas_of_interest.is_empty() => {
                format!("No areas of interest identified in {}", name)
            }
            None => format!("Areas of interest identified in {}", name),
        };
        self.emitter.progress(message);

        if let Err(e) = self.store.record_result(self.run_id, &result).await {
            warn!("Failed to record result for {:?}: {:#}", result.source_path, e);
        }
        self.emitter.emit(BatchEvent::ImageResult(result));

        if let Some(total) = limit_total {
            warn!(
                "Detected {} areas of interest, more than the limit of {}",
                total, self.max_aois
            );
            self.emitter.emit(BatchEvent::AoiLimitExceeded {
                total,
                max_aois: self.max_aois,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aoi_limit_warns_once() {
        let limit = AoiLimit::default();
        assert_eq!(limit.add(60, 100), None);
        assert_eq!(limit.add(50, 100), Some(110));
        assert_eq!(limit.add(50, 100), None);
    }

    #[test]
    fn aoi_limit_disabled_at_zero() {
        let limit = AoiLimit::default();
        assert_eq!(limit.add(1_000, 0), None);
    }

    #[test]
    fn recognizes_image_extensions() {
        assert!(is_image_file(Path::new("a/b.JPG")));
        assert!(is_image_file(Path::new("a/b.tif")));
        assert!(!is_image_file(Path::new("a/notes.txt")));
        assert!(!is_image_file(Path::new("a/noext")));
    }

    #[test]
    fn summary_distinguishes_outcomes() {
        let mut summary = BatchSummary {
            run_id: Uuid::nil(),
            images_processed: 3,
            images_with_aoi: 0,
            cancelled: false,
            elapsed: Duration::ZERO,
        };
        assert_eq!(summary.message(), "No areas of interest found");
        summary.images_with_aoi = 2;
        assert_eq!(summary.message(), "Completed with 2 images flagged");
        summary.cancelled = true;
        assert_eq!(summary.message(), "Processing cancelled");
    }
}
