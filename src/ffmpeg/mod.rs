pub mod builder;
pub mod discovery;
mod error;
pub mod probe;
mod progress;
pub mod runner;

pub use discovery::{ToolPaths, ToolReport, check_tools, ensure_ffmpeg};
pub use error::{FfmpegErrorPayload, parse_ffmpeg_error};
pub use progress::parse_duration_marker;
pub use runner::{ProgressCallback, RunControl, RunOptions, ToolOutput, run_tool};

/// Path to string for FFmpeg args or logging.
pub fn path_to_string(path: &(impl AsRef<std::path::Path> + ?Sized)) -> String {
    path.as_ref().to_string_lossy().to_string()
}
