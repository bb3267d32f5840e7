//! Fetch → probe → segment → encode → optimize, with guaranteed release of intermediates.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;

use crate::backend::{FfmpegBackend, MediaBackend};
use crate::config::PipelineConfig;
use crate::error::AppError;
use crate::fetcher::{self, SOURCE_STEM};
use crate::ffmpeg::{ProgressCallback, RunControl};
use crate::optimizer::{self, ShrinkSettings};
use crate::segmenter::{TimeWindow, segment};
use crate::staging::{self, RunArtifacts, create_run_dir, normalize_extension};
use crate::transcoder::{self, SegmentJob, segment_output_path};

/// Share of overall progress spent before the first encode starts.
const PREPARE_SHARE: f64 = 0.1;

#[derive(Debug, Clone)]
pub enum VideoSource {
    Url(String),
    /// A file the caller already has on disk. It is moved into the run directory and
    /// deleted with the other intermediates.
    LocalFile {
        path: PathBuf,
        suggested_extension: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct CircleRequest {
    pub source: VideoSource,
    /// Requested window length; clamped into the configured bounds. `None` means the default.
    pub segment_seconds: Option<u32>,
    /// Discriminator for the run directory name, usually the chat id.
    pub label: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedSegment {
    pub index: usize,
    pub start: f64,
    pub length: f64,
    pub reason: String,
}

/// Ordered deliverables. Every path exists at return time and belongs to the caller.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircleOutput {
    pub segments: Vec<PathBuf>,
    pub skipped: Vec<SkippedSegment>,
    pub duration: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStage {
    Fetching,
    Probing,
    Segmenting,
    Encoding,
    Optimizing,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineProgress {
    pub progress: f64,
    pub step: PipelineStage,
}

pub type PipelineProgressCallback = Arc<dyn Fn(PipelineProgress) + Send + Sync>;

struct Reporter {
    callback: Option<PipelineProgressCallback>,
}

impl Reporter {
    fn stage(&self, step: PipelineStage, progress: f64) {
        log::info!(target: "circle_cut::pipeline", "-> {:?}", step);
        self.emit(step, progress);
    }

    fn emit(&self, step: PipelineStage, progress: f64) {
        if let Some(cb) = &self.callback {
            cb(PipelineProgress {
                progress: progress.clamp(0.0, 1.0),
                step,
            });
        }
    }

    /// Maps an encoder's 0..1 for window `index` of `total` into the overall range.
    fn encode_callback(&self, index: usize, total: usize) -> Option<ProgressCallback> {
        let cb = self.callback.clone()?;
        let share = (1.0 - PREPARE_SHARE) / total.max(1) as f64;
        let base = PREPARE_SHARE + share * index as f64;
        Some(Arc::new(move |p: f64| {
            cb(PipelineProgress {
                progress: (base + share * p.clamp(0.0, 1.0)).min(1.0),
                step: PipelineStage::Encoding,
            })
        }))
    }
}

/// Runs circle pipelines. Holds no per-run state, so one instance serves concurrent runs.
pub struct Pipeline<B: MediaBackend = FfmpegBackend> {
    config: Arc<PipelineConfig>,
    backend: B,
}

impl Pipeline<FfmpegBackend> {
    pub fn new(config: Arc<PipelineConfig>) -> Self {
        let backend = FfmpegBackend::new(Arc::clone(&config));
        Self { config, backend }
    }
}

impl<B: MediaBackend> Pipeline<B> {
    pub fn with_backend(config: Arc<PipelineConfig>, backend: B) -> Self {
        Self { config, backend }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Runs one request to completion. On every exit path all files except the returned
    /// segments are removed; the caller deletes those (see [`staging::release_segments`]).
    pub fn run(
        &self,
        request: CircleRequest,
        control: &RunControl,
        progress: Option<PipelineProgressCallback>,
    ) -> Result<CircleOutput, AppError> {
        let staging_dir = self.config.effective_staging_dir();
        let run_dir = match create_run_dir(&staging_dir, request.label.as_deref()) {
            Ok(dir) => dir,
            Err(e) => {
                if let VideoSource::LocalFile { path, .. } = &request.source {
                    staging::remove_file_logged(path);
                }
                return Err(e.into());
            }
        };
        log::info!(
            target: "circle_cut::pipeline",
            "Run started in {}",
            run_dir.display()
        );
        let mut artifacts = RunArtifacts::new(run_dir);
        let reporter = Reporter { callback: progress };

        let result = self.run_in(&request, &mut artifacts, control, &reporter);
        match &result {
            Ok(output) => log::info!(
                target: "circle_cut::pipeline",
                "-> Done: {} segment(s), {} skipped",
                output.segments.len(),
                output.skipped.len()
            ),
            Err(e) => log::error!(target: "circle_cut::pipeline", "-> Failed: {}", e),
        }
        result
    }

    fn run_in(
        &self,
        request: &CircleRequest,
        artifacts: &mut RunArtifacts,
        control: &RunControl,
        reporter: &Reporter,
    ) -> Result<CircleOutput, AppError> {
        let run_dir = artifacts.run_dir().to_path_buf();
        let source = match &request.source {
            VideoSource::Url(url) => {
                reporter.stage(PipelineStage::Fetching, 0.0);
                let path = fetcher::fetch(&self.backend, url, &run_dir, control)?;
                artifacts.track(&path);
                path
            }
            VideoSource::LocalFile {
                path,
                suggested_extension,
            } => {
                artifacts.track(path);
                let dest = upload_destination(&run_dir, path, suggested_extension.as_deref());
                staging::move_file(path, &dest)?;
                artifacts.track(&dest);
                dest
            }
        };

        control.ensure_active()?;
        reporter.stage(PipelineStage::Probing, PREPARE_SHARE / 2.0);
        self.backend.ensure_engine()?;
        let duration = self.backend.probe_duration(&source, control)?;
        log::info!(
            target: "circle_cut::pipeline",
            "Source duration {:.2}s",
            duration
        );

        control.ensure_active()?;
        reporter.stage(PipelineStage::Segmenting, PREPARE_SHARE);
        let length = self.config.clamp_segment_seconds(request.segment_seconds);
        let windows = segment(
            duration,
            length,
            self.config.effective_min_segment_seconds() as f64,
            self.config.effective_max_segment_seconds() as f64,
        );
        if windows.is_empty() {
            return Err(AppError::NoSegmentsProduced);
        }
        log::info!(
            target: "circle_cut::pipeline",
            "{} window(s) of up to {}s",
            windows.len(),
            length
        );

        let spec = self.config.encode_spec();
        let shrink = ShrinkSettings::from_config(&self.config);
        let ceiling = self.config.effective_max_file_size();
        let mut segments = Vec::with_capacity(windows.len());
        let mut skipped = Vec::new();

        for (index, window) in windows.iter().enumerate() {
            control.ensure_active()?;
            reporter.stage(
                PipelineStage::Encoding,
                PREPARE_SHARE + (1.0 - PREPARE_SHARE) * index as f64 / windows.len() as f64,
            );
            let job = SegmentJob {
                index,
                source: &source,
                window: *window,
                output: segment_output_path(&run_dir, index),
                spec: &spec,
            };
            artifacts.track(&job.output);
            let encoded = match transcoder::encode(
                &self.backend,
                &job,
                control,
                reporter.encode_callback(index, windows.len()),
            ) {
                Ok(path) => path,
                Err(e) if !e.is_fatal() => {
                    log::error!(target: "circle_cut::pipeline", "Skipping segment: {}", e);
                    skipped.push(skipped_segment(index, window, &e));
                    continue;
                }
                Err(e) => return Err(e),
            };

            reporter.emit(
                PipelineStage::Optimizing,
                PREPARE_SHARE + (1.0 - PREPARE_SHARE) * (index + 1) as f64 / windows.len() as f64,
            );
            let delivered =
                optimizer::fit(&self.backend, &encoded, ceiling, &spec, &shrink, control);
            artifacts.track(&delivered);
            segments.push(delivered);
        }

        // A cancel during the last shrink leaves a usable file, but the caller asked to stop.
        control.ensure_active()?;
        if segments.is_empty() {
            return Err(AppError::NoSegmentsProduced);
        }
        for path in &segments {
            artifacts.deliver(path);
        }
        reporter.emit(PipelineStage::Done, 1.0);
        Ok(CircleOutput {
            segments,
            skipped,
            duration,
        })
    }
}

fn skipped_segment(index: usize, window: &TimeWindow, error: &AppError) -> SkippedSegment {
    let reason = match error {
        AppError::Encode { code, stderr, .. } => {
            crate::ffmpeg::parse_ffmpeg_error(stderr, Some(*code)).summary
        }
        other => other.to_string(),
    };
    SkippedSegment {
        index,
        start: window.start,
        length: window.length,
        reason,
    }
}

/// `run_dir/source.<ext>`: the suggested extension, else the upload's own, else `mp4`.
fn upload_destination(run_dir: &Path, upload: &Path, suggested: Option<&str>) -> PathBuf {
    let ext = suggested
        .and_then(normalize_extension)
        .or_else(|| {
            upload
                .extension()
                .and_then(|e| e.to_str())
                .and_then(normalize_extension)
        })
        .unwrap_or_else(|| "mp4".to_string());
    run_dir.join(format!("{}.{}", SOURCE_STEM, ext))
}
