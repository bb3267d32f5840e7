//! Locating the external tools and checking that they run.

use std::path::{Path, PathBuf};

use crate::config::PipelineConfig;
use crate::error::AppError;

use super::runner::{RunControl, RunOptions, run_tool};

#[cfg(target_os = "windows")]
const FFMPEG_NAME: &str = "ffmpeg.exe";
#[cfg(not(target_os = "windows"))]
const FFMPEG_NAME: &str = "ffmpeg";
#[cfg(target_os = "windows")]
const FFPROBE_NAME: &str = "ffprobe.exe";
#[cfg(not(target_os = "windows"))]
const FFPROBE_NAME: &str = "ffprobe";
const YTDLP_NAME: &str = "yt-dlp";

const INSTALL_HINT: &str = "Please install FFmpeg on your system:\n  - macOS: brew install ffmpeg\n  - Linux: sudo apt install ffmpeg\n  - Windows: Download from https://ffmpeg.org/download.html\nor set ffmpegPath / FFMPEG_PATH to its full path.";

/// Resolved program paths for one configuration. Bare names are looked up on PATH at spawn time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolPaths {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
    pub ytdlp: PathBuf,
}

impl ToolPaths {
    pub fn resolve(config: &PipelineConfig) -> Self {
        let ffmpeg = config
            .ffmpeg_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(FFMPEG_NAME));
        let ffprobe = config.ffprobe_path.clone().unwrap_or_else(|| {
            config
                .ffmpeg_path
                .as_deref()
                .and_then(|p| ffprobe_candidates(p).into_iter().find(|c| c.exists()))
                .unwrap_or_else(|| PathBuf::from(FFPROBE_NAME))
        });
        let ytdlp = config
            .ytdlp_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(YTDLP_NAME));
        log::debug!(
            target: "circle_cut::ffmpeg::discovery",
            "Tool paths: ffmpeg={}, ffprobe={}, yt-dlp={}",
            ffmpeg.display(),
            ffprobe.display(),
            ytdlp.display()
        );
        Self {
            ffmpeg,
            ffprobe,
            ytdlp,
        }
    }
}

/// Paths to try for ffprobe given an explicit ffmpeg binary path (suffixed first, then plain).
pub fn ffprobe_candidates(ffmpeg_path: &Path) -> Vec<PathBuf> {
    let parent = match ffmpeg_path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => return vec![],
    };
    let mut candidates = Vec::with_capacity(2);
    if let Some(suffix) = ffmpeg_path
        .file_stem()
        .and_then(|s| s.to_str())
        .and_then(|stem| stem.strip_prefix("ffmpeg"))
        .filter(|suffix| !suffix.is_empty())
    {
        #[cfg(target_os = "windows")]
        candidates.push(parent.join(format!("ffprobe{suffix}.exe")));
        #[cfg(not(target_os = "windows"))]
        candidates.push(parent.join(format!("ffprobe{suffix}")));
    }
    candidates.push(parent.join(FFPROBE_NAME));
    candidates
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolStatus {
    pub path: String,
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolReport {
    pub ffmpeg: ToolStatus,
    pub ffprobe: ToolStatus,
    pub ytdlp: ToolStatus,
}

fn version_of(program: &Path, flag: &str, config: &PipelineConfig) -> ToolStatus {
    let control = RunControl::new();
    let opts = RunOptions::new(&control).timeout(config.version_check_timeout());
    match run_tool(program, &[flag.to_string()], &opts) {
        Ok(out) => ToolStatus {
            path: program.display().to_string(),
            available: true,
            version: out.stdout.lines().next().map(|l| l.trim().to_string()),
            error: None,
        },
        Err(e) => ToolStatus {
            path: program.display().to_string(),
            available: false,
            version: None,
            error: Some(e.to_string()),
        },
    }
}

/// Runs each tool's version query. Only a missing ffmpeg is an error for the caller;
/// without ffprobe durations come from ffmpeg, without yt-dlp only URL input fails.
pub fn check_tools(tools: &ToolPaths, config: &PipelineConfig) -> ToolReport {
    let report = ToolReport {
        ffmpeg: version_of(&tools.ffmpeg, "-version", config),
        ffprobe: version_of(&tools.ffprobe, "-version", config),
        ytdlp: version_of(&tools.ytdlp, "--version", config),
    };
    if !report.ffprobe.available {
        log::warn!(
            target: "circle_cut::ffmpeg::discovery",
            "ffprobe unavailable, durations will be read from ffmpeg output"
        );
    }
    if !report.ytdlp.available {
        log::warn!(
            target: "circle_cut::ffmpeg::discovery",
            "yt-dlp unavailable, URL input will fail"
        );
    }
    report
}

/// Fails with `ToolUnavailable` unless the encoding engine answers its version query.
pub fn ensure_ffmpeg(tools: &ToolPaths, config: &PipelineConfig) -> Result<(), AppError> {
    let status = version_of(&tools.ffmpeg, "-version", config);
    if status.available {
        return Ok(());
    }
    log::error!(
        target: "circle_cut::ffmpeg::discovery",
        "FFmpeg unavailable at {}: {}",
        status.path,
        status.error.as_deref().unwrap_or("unknown error")
    );
    Err(AppError::ToolUnavailable(format!(
        "FFmpeg is not usable at '{}'. {}",
        status.path, INSTALL_HINT
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ffprobe_candidates_plain_ffmpeg() {
        #[cfg(not(target_os = "windows"))]
        {
            let candidates = ffprobe_candidates(Path::new("/usr/bin/ffmpeg"));
            assert_eq!(candidates, vec![PathBuf::from("/usr/bin/ffprobe")]);
        }
    }

    #[test]
    fn ffprobe_candidates_bundled_suffix() {
        #[cfg(not(target_os = "windows"))]
        {
            let candidates =
                ffprobe_candidates(Path::new("/app/bin/ffmpeg-aarch64-apple-darwin"));
            assert_eq!(
                candidates,
                vec![
                    PathBuf::from("/app/bin/ffprobe-aarch64-apple-darwin"),
                    PathBuf::from("/app/bin/ffprobe"),
                ]
            );
        }
    }

    #[test]
    fn ffprobe_candidates_bare_name_has_none() {
        assert!(ffprobe_candidates(Path::new("ffmpeg")).is_empty());
    }

    #[test]
    fn resolve_defaults_to_search_path_names() {
        let tools = ToolPaths::resolve(&PipelineConfig::default());
        assert_eq!(tools.ffmpeg, PathBuf::from(FFMPEG_NAME));
        assert_eq!(tools.ffprobe, PathBuf::from(FFPROBE_NAME));
        assert_eq!(tools.ytdlp, PathBuf::from(YTDLP_NAME));
    }

    #[test]
    fn resolve_prefers_sibling_ffprobe_of_explicit_ffmpeg() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ffmpeg = dir.path().join(FFMPEG_NAME);
        let ffprobe = dir.path().join(FFPROBE_NAME);
        std::fs::write(&ffmpeg, b"").expect("write");
        std::fs::write(&ffprobe, b"").expect("write");
        let config = PipelineConfig {
            ffmpeg_path: Some(ffmpeg.clone()),
            ..Default::default()
        };
        let tools = ToolPaths::resolve(&config);
        assert_eq!(tools.ffmpeg, ffmpeg);
        assert_eq!(tools.ffprobe, ffprobe);
    }

    #[test]
    fn ensure_ffmpeg_reports_missing_binary() {
        let config = PipelineConfig {
            ffmpeg_path: Some(PathBuf::from("/nonexistent/dir/ffmpeg")),
            ..Default::default()
        };
        let tools = ToolPaths::resolve(&config);
        let err = ensure_ffmpeg(&tools, &config).unwrap_err();
        assert!(matches!(err, AppError::ToolUnavailable(_)));
        assert!(err.to_string().contains("/nonexistent/dir/ffmpeg"));
    }
}
