//! Per-window square encode with per-segment failure classification.

use std::path::{Path, PathBuf};

use crate::backend::MediaBackend;
use crate::config::EncodeSpec;
use crate::error::AppError;
use crate::ffmpeg::{ProgressCallback, RunControl};
use crate::segmenter::TimeWindow;

/// One window to encode: where it comes from, where it goes, and how.
#[derive(Debug, Clone)]
pub struct SegmentJob<'a> {
    pub index: usize,
    pub source: &'a Path,
    pub window: TimeWindow,
    pub output: PathBuf,
    pub spec: &'a EncodeSpec,
}

pub fn segment_output_path(run_dir: &Path, index: usize) -> PathBuf {
    run_dir.join(format!("circle_{}.mp4", index))
}

/// Encodes one window. Failures that only concern this window come back as
/// `AppError::Encode`; a missing engine and cancellation stay fatal.
pub fn encode<B: MediaBackend + ?Sized>(
    backend: &B,
    job: &SegmentJob<'_>,
    control: &RunControl,
    progress: Option<ProgressCallback>,
) -> Result<PathBuf, AppError> {
    log::info!(
        target: "circle_cut::transcoder",
        "Encoding segment {} ({:.2}s + {:.2}s) -> {}",
        job.index,
        job.window.start,
        job.window.length,
        job.output.display()
    );
    match backend.encode_window(job, control, progress) {
        Ok(()) => {}
        Err(e @ (AppError::Aborted | AppError::ToolUnavailable(_))) => return Err(e),
        Err(AppError::ToolFailed { code, stderr, .. }) => {
            return Err(AppError::Encode {
                segment_index: job.index,
                code,
                stderr,
            });
        }
        Err(other) => {
            return Err(AppError::Encode {
                segment_index: job.index,
                code: -1,
                stderr: other.to_string(),
            });
        }
    }
    if !job.output.is_file() {
        return Err(AppError::Encode {
            segment_index: job.index,
            code: 0,
            stderr: format!(
                "encoder exited cleanly but {} was not created",
                job.output.display()
            ),
        });
    }
    Ok(job.output.clone())
}
