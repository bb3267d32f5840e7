//! The boundary between the pipeline's algorithms and the external programs they drive.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use url::Url;

use crate::config::{EncodeSpec, PipelineConfig};
use crate::error::AppError;
use crate::ffmpeg::builder::{build_segment_args, build_shrink_args};
use crate::ffmpeg::probe::get_duration;
use crate::ffmpeg::{
    ProgressCallback, RunControl, RunOptions, ToolPaths, ensure_ffmpeg, path_to_string, run_tool,
};
use crate::fetcher::run_downloader;
use crate::transcoder::SegmentJob;

/// Primitive media operations. Each call blocks until its child process finishes.
pub trait MediaBackend: Send + Sync {
    /// Fails with `ToolUnavailable` when the encoding engine cannot run.
    fn ensure_engine(&self) -> Result<(), AppError>;

    fn probe_duration(&self, source: &Path, control: &RunControl) -> Result<f64, AppError>;

    /// Writes `job.output`. A zero exit without that file is the caller's concern.
    fn encode_window(
        &self,
        job: &SegmentJob<'_>,
        control: &RunControl,
        progress: Option<ProgressCallback>,
    ) -> Result<(), AppError>;

    /// Re-encodes `input` into `output` with an already relaxed spec.
    fn reencode(
        &self,
        input: &Path,
        output: &Path,
        spec: &EncodeSpec,
        control: &RunControl,
    ) -> Result<(), AppError>;

    /// Downloads `url` into `run_dir` and returns the local file.
    fn download(&self, url: &Url, run_dir: &Path, control: &RunControl)
    -> Result<PathBuf, AppError>;
}

/// Backend running the real ffmpeg, ffprobe and yt-dlp binaries.
pub struct FfmpegBackend {
    tools: ToolPaths,
    config: Arc<PipelineConfig>,
}

impl FfmpegBackend {
    pub fn new(config: Arc<PipelineConfig>) -> Self {
        Self {
            tools: ToolPaths::resolve(&config),
            config,
        }
    }
}

impl MediaBackend for FfmpegBackend {
    fn ensure_engine(&self) -> Result<(), AppError> {
        ensure_ffmpeg(&self.tools, &self.config)
    }

    fn probe_duration(&self, source: &Path, control: &RunControl) -> Result<f64, AppError> {
        get_duration(&self.tools, source, &self.config, control)
    }

    fn encode_window(
        &self,
        job: &SegmentJob<'_>,
        control: &RunControl,
        progress: Option<ProgressCallback>,
    ) -> Result<(), AppError> {
        let args = build_segment_args(
            &path_to_string(job.source),
            &job.window,
            &path_to_string(&job.output),
            job.spec,
        );
        let opts = RunOptions::new(control)
            .timeout(self.config.encode_timeout())
            .progress(job.window.length, progress);
        run_tool(&self.tools.ffmpeg, &args, &opts).map(|_| ())
    }

    fn reencode(
        &self,
        input: &Path,
        output: &Path,
        spec: &EncodeSpec,
        control: &RunControl,
    ) -> Result<(), AppError> {
        let args = build_shrink_args(&path_to_string(input), &path_to_string(output), spec);
        let opts = RunOptions::new(control).timeout(self.config.encode_timeout());
        run_tool(&self.tools.ffmpeg, &args, &opts).map(|_| ())
    }

    fn download(
        &self,
        url: &Url,
        run_dir: &Path,
        control: &RunControl,
    ) -> Result<PathBuf, AppError> {
        run_downloader(&self.tools, &self.config, url, run_dir, control)
    }
}
