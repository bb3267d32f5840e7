//! Source duration lookup: ffprobe first, then the `Duration:` line ffmpeg prints.

use std::path::Path;

use crate::config::PipelineConfig;
use crate::error::AppError;

use super::builder::{build_diagnostic_args, build_probe_args};
use super::discovery::ToolPaths;
use super::progress::parse_duration_marker;
use super::runner::{RunControl, RunOptions, run_tool, run_tool_diagnostic};
use super::path_to_string;

/// Parses ffprobe's bare `format=duration` output. `N/A`, empty and negative values are rejected.
pub fn parse_probe_duration(stdout: &str) -> Option<f64> {
    let value: f64 = stdout.lines().next()?.trim().parse().ok()?;
    (value.is_finite() && value >= 0.0).then_some(value)
}

fn probe_with_ffprobe(
    tools: &ToolPaths,
    path: &Path,
    config: &PipelineConfig,
    control: &RunControl,
) -> Result<f64, String> {
    let opts = RunOptions::new(control).timeout(config.probe_timeout());
    let output = run_tool(&tools.ffprobe, &build_probe_args(&path_to_string(path)), &opts)
        .map_err(|e| e.to_string())?;
    parse_probe_duration(&output.stdout)
        .ok_or_else(|| format!("unusable output {:?}", output.stdout.trim()))
}

fn probe_with_ffmpeg(
    tools: &ToolPaths,
    path: &Path,
    config: &PipelineConfig,
    control: &RunControl,
) -> Result<f64, AppError> {
    let opts = RunOptions::new(control).timeout(config.probe_timeout());
    let output = run_tool_diagnostic(
        &tools.ffmpeg,
        &build_diagnostic_args(&path_to_string(path)),
        &opts,
    )?;
    parse_duration_marker(&output.stderr).ok_or_else(|| {
        AppError::from(format!(
            "no Duration marker in ffmpeg output (exit {})",
            output.code
        ))
    })
}

/// Total duration of `path` in seconds.
pub fn get_duration(
    tools: &ToolPaths,
    path: &Path,
    config: &PipelineConfig,
    control: &RunControl,
) -> Result<f64, AppError> {
    log::debug!(
        target: "circle_cut::ffmpeg::probe",
        "get_duration: path={}",
        path.display()
    );
    let primary = match probe_with_ffprobe(tools, path, config, control) {
        Ok(duration) => return Ok(duration),
        Err(e) => e,
    };
    control.ensure_active()?;
    log::warn!(
        target: "circle_cut::ffmpeg::probe",
        "ffprobe could not read duration ({}), falling back to ffmpeg",
        primary
    );
    match probe_with_ffmpeg(tools, path, config, control) {
        Ok(duration) => Ok(duration),
        Err(AppError::Aborted) => Err(AppError::Aborted),
        Err(AppError::ToolUnavailable(msg)) => Err(AppError::ToolUnavailable(msg)),
        Err(e) => Err(AppError::Probe {
            primary,
            fallback: e.to_string(),
        }),
    }
}
