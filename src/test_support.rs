//! Scriptable in-process backend for exercising the pipeline without external tools.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::Mutex;
use url::Url;

use crate::backend::MediaBackend;
use crate::config::EncodeSpec;
use crate::error::AppError;
use crate::ffmpeg::{ProgressCallback, RunControl};
use crate::transcoder::SegmentJob;

type SizeFn = Box<dyn Fn(u32) -> usize + Send + Sync>;

/// Writes small placeholder files instead of media. Behaviour is set with the builder methods.
pub struct FakeBackend {
    duration: Option<f64>,
    engine_available: bool,
    failing_windows: HashSet<usize>,
    silent_windows: HashSet<usize>,
    timing_out_windows: HashSet<usize>,
    segment_bytes: usize,
    shrink_bytes: SizeFn,
    shrink_fails_below: Option<u32>,
    download_ext: Option<&'static str>,
    encode_delay: Duration,
    cancel_on_window: Option<usize>,
    encoded: Mutex<Vec<usize>>,
    reencoded: Mutex<Vec<u32>>,
}

impl FakeBackend {
    pub fn new(duration: f64) -> Self {
        Self {
            duration: Some(duration),
            engine_available: true,
            failing_windows: HashSet::new(),
            silent_windows: HashSet::new(),
            timing_out_windows: HashSet::new(),
            segment_bytes: 1024,
            shrink_bytes: Box::new(|_| 512),
            shrink_fails_below: None,
            download_ext: Some("mp4"),
            encode_delay: Duration::ZERO,
            cancel_on_window: None,
            encoded: Mutex::new(Vec::new()),
            reencoded: Mutex::new(Vec::new()),
        }
    }

    /// Windows whose encode exits non-zero.
    pub fn failing_windows(mut self, indices: impl IntoIterator<Item = usize>) -> Self {
        self.failing_windows.extend(indices);
        self
    }

    /// Windows whose encode exits cleanly without writing output.
    pub fn silent_windows(mut self, indices: impl IntoIterator<Item = usize>) -> Self {
        self.silent_windows.extend(indices);
        self
    }

    /// Windows whose encode overruns the encode timeout and is killed after a partial write.
    pub fn timing_out_windows(mut self, indices: impl IntoIterator<Item = usize>) -> Self {
        self.timing_out_windows.extend(indices);
        self
    }

    pub fn without_engine(mut self) -> Self {
        self.engine_available = false;
        self
    }

    pub fn unprobeable(mut self) -> Self {
        self.duration = None;
        self
    }

    pub fn segment_bytes(mut self, bytes: usize) -> Self {
        self.segment_bytes = bytes;
        self
    }

    /// Output size of a re-encode as a function of its side.
    pub fn shrink_bytes(mut self, f: impl Fn(u32) -> usize + Send + Sync + 'static) -> Self {
        self.shrink_bytes = Box::new(f);
        self
    }

    /// Re-encodes at sides below `side` fail after leaving a partial file behind.
    pub fn failing_shrink_below(mut self, side: u32) -> Self {
        self.shrink_fails_below = Some(side);
        self
    }

    pub fn failing_download(mut self) -> Self {
        self.download_ext = None;
        self
    }

    pub fn download_ext(mut self, ext: &'static str) -> Self {
        self.download_ext = Some(ext);
        self
    }

    pub fn encode_delay(mut self, delay: Duration) -> Self {
        self.encode_delay = delay;
        self
    }

    /// Cancels the run from inside the encode of `index`, like a user pressing stop mid-encode.
    pub fn cancel_on_window(mut self, index: usize) -> Self {
        self.cancel_on_window = Some(index);
        self
    }

    /// Window indices encoded so far, in call order.
    pub fn encoded_windows(&self) -> Vec<usize> {
        self.encoded.lock().clone()
    }

    /// Sides of every re-encode attempted so far, in call order.
    pub fn reencode_sides(&self) -> Vec<u32> {
        self.reencoded.lock().clone()
    }

    fn engine(&self) -> Result<(), AppError> {
        if self.engine_available {
            Ok(())
        } else {
            Err(AppError::ToolUnavailable("FFmpeg not found".into()))
        }
    }
}

impl MediaBackend for FakeBackend {
    fn ensure_engine(&self) -> Result<(), AppError> {
        self.engine()
    }

    fn probe_duration(&self, source: &Path, control: &RunControl) -> Result<f64, AppError> {
        control.ensure_active()?;
        if !source.is_file() {
            return Err(AppError::Probe {
                primary: format!("{} does not exist", source.display()),
                fallback: "skipped".into(),
            });
        }
        self.duration.ok_or_else(|| AppError::Probe {
            primary: "no duration in output".into(),
            fallback: "no Duration marker".into(),
        })
    }

    fn encode_window(
        &self,
        job: &SegmentJob<'_>,
        control: &RunControl,
        progress: Option<ProgressCallback>,
    ) -> Result<(), AppError> {
        self.engine()?;
        control.ensure_active()?;
        self.encoded.lock().push(job.index);
        if !self.encode_delay.is_zero() {
            std::thread::sleep(self.encode_delay);
        }
        if self.cancel_on_window == Some(job.index) {
            control.cancel();
            fs::write(&job.output, b"partial")?;
            return Err(AppError::Aborted);
        }
        if self.timing_out_windows.contains(&job.index) {
            fs::write(&job.output, b"partial")?;
            return Err(AppError::Timeout {
                tool: "ffmpeg".into(),
                timeout: Duration::from_secs(300),
            });
        }
        if self.failing_windows.contains(&job.index) {
            return Err(AppError::tool_failed(
                "ffmpeg",
                1,
                "Error while decoding stream #0:0: Invalid data found when processing input",
            ));
        }
        if let Some(cb) = progress {
            cb(0.5);
            cb(1.0);
        }
        if !self.silent_windows.contains(&job.index) {
            fs::write(&job.output, vec![0u8; self.segment_bytes])?;
        }
        Ok(())
    }

    fn reencode(
        &self,
        input: &Path,
        output: &Path,
        spec: &EncodeSpec,
        control: &RunControl,
    ) -> Result<(), AppError> {
        control.ensure_active()?;
        self.reencoded.lock().push(spec.side);
        if !input.is_file() {
            return Err(AppError::tool_failed("ffmpeg", 1, "No such file or directory"));
        }
        if self.shrink_fails_below.is_some_and(|limit| spec.side < limit) {
            fs::write(output, b"partial")?;
            return Err(AppError::tool_failed("ffmpeg", 1, "Conversion failed!"));
        }
        fs::write(output, vec![0u8; (self.shrink_bytes)(spec.side)])?;
        Ok(())
    }

    fn download(
        &self,
        url: &Url,
        run_dir: &Path,
        control: &RunControl,
    ) -> Result<PathBuf, AppError> {
        control.ensure_active()?;
        let Some(ext) = self.download_ext else {
            fs::write(run_dir.join("source.mp4.part"), b"partial")?;
            return Err(AppError::Download(format!("ERROR: Unsupported URL: {}", url)));
        };
        let path = run_dir.join(format!("source.{}", ext));
        fs::write(&path, b"downloaded")?;
        Ok(path)
    }
}
