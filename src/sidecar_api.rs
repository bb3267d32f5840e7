use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::backend::MediaBackend;
use crate::config::{FrameFit, PipelineConfig};
use crate::error::{AppError, ErrorKind};
use crate::ffmpeg::{RunControl, ToolPaths, ToolReport, check_tools, parse_ffmpeg_error};
use crate::pipeline::{CircleOutput, CircleRequest, Pipeline, PipelineProgress, VideoSource};
use crate::staging;

pub type SidecarProgressEmitter = Arc<dyn Fn(PipelineProgress) + Send + Sync>;

pub const PROTOCOL_VERSION: u8 = 1;

#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentLimits {
    pub default_seconds: u32,
    pub min_seconds: u32,
    pub max_seconds: u32,
    pub video_size: u32,
    pub max_file_size: u64,
    pub frame_fit: FrameFit,
}

#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppCapabilitiesResult {
    pub protocol_version: u8,
    pub tools: ToolReport,
    pub limits: SegmentLimits,
}

pub fn app_capabilities(config: &PipelineConfig) -> AppCapabilitiesResult {
    let tools = ToolPaths::resolve(config);
    AppCapabilitiesResult {
        protocol_version: PROTOCOL_VERSION,
        tools: check_tools(&tools, config),
        limits: SegmentLimits {
            default_seconds: config.effective_default_segment_seconds(),
            min_seconds: config.effective_min_segment_seconds(),
            max_seconds: config.effective_max_segment_seconds(),
            video_size: config.effective_video_size(),
            max_file_size: config.effective_max_file_size(),
            frame_fit: config.effective_frame_fit(),
        },
    }
}

/// Error body for replies and job events. `summary` is safe to show in chat;
/// `detail` carries the diagnostics.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub kind: ErrorKind,
    pub summary: String,
    pub detail: String,
}

pub fn error_payload(err: &AppError) -> ErrorPayload {
    match err {
        AppError::Aborted => ErrorPayload {
            kind: err.kind(),
            summary: "Aborted".to_string(),
            detail: "Aborted".to_string(),
        },
        AppError::ToolFailed { code, stderr, .. } if *code != -1 => {
            let parsed = parse_ffmpeg_error(stderr, Some(*code));
            ErrorPayload {
                kind: err.kind(),
                summary: parsed.summary,
                detail: parsed.detail,
            }
        }
        AppError::InvalidRequest(message) => ErrorPayload {
            kind: err.kind(),
            summary: message.clone(),
            detail: message.clone(),
        },
        _ => ErrorPayload {
            kind: err.kind(),
            summary: err.user_message(),
            detail: err.to_string(),
        },
    }
}

/// Runs one circle job. Uploads are checked before a run directory is made.
pub fn process_circles<B: MediaBackend>(
    pipeline: &Pipeline<B>,
    request: CircleRequest,
    control: &RunControl,
    event_emitter: Option<SidecarProgressEmitter>,
) -> Result<CircleOutput, AppError> {
    if let VideoSource::LocalFile { path, .. } = &request.source
        && !path.is_file()
    {
        return Err(AppError::InvalidRequest(format!(
            "Input file not found: {}",
            path.display()
        )));
    }
    pipeline.run(request, control, event_emitter)
}

/// Deletes delivered segments the caller has finished with. Only files inside a run
/// directory of the configured staging root are accepted; missing files are skipped.
pub fn release_segments(config: &PipelineConfig, paths: &[PathBuf]) -> Result<usize, AppError> {
    let Ok(root) = config.effective_staging_dir().canonicalize() else {
        return Ok(0);
    };
    let mut owned = Vec::with_capacity(paths.len());
    for path in paths {
        let Ok(real) = path.canonicalize() else {
            continue;
        };
        if !is_in_run_dir(&root, &real) {
            return Err(AppError::InvalidRequest(format!(
                "Refusing to release {}: not a staged segment",
                path.display()
            )));
        }
        owned.push(real);
    }
    staging::release_segments(&owned);
    Ok(owned.len())
}

fn is_in_run_dir(root: &Path, file: &Path) -> bool {
    file.parent().and_then(Path::parent) == Some(root)
}

/// Clears run directories left by a previous process.
pub fn cleanup_startup_staging(config: &PipelineConfig, max_age: Duration) -> usize {
    staging::cleanup_stale_runs(&config.effective_staging_dir(), max_age)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeBackend;
    use std::fs;

    fn config_for(staging: &Path) -> PipelineConfig {
        PipelineConfig {
            staging_dir: Some(staging.to_path_buf()),
            ..Default::default()
        }
    }

    #[test]
    fn error_payload_classifies_kinds() {
        let p = error_payload(&AppError::Download("ERROR: Unsupported URL".into()));
        assert_eq!(p.kind, ErrorKind::DownloadFailure);
        assert!(p.detail.contains("Unsupported URL"));

        let p = error_payload(&AppError::ToolUnavailable("not found".into()));
        assert_eq!(p.kind, ErrorKind::ToolMissing);
        assert!(p.summary.contains("FFmpeg"));

        let p = error_payload(&AppError::tool_failed("ffmpeg", 69, "rate"));
        assert_eq!(p.kind, ErrorKind::GenericError);
        assert_eq!(p.summary, "Encoding rate limit exceeded.");

        let p = error_payload(&AppError::Aborted);
        assert_eq!(p.summary, "Aborted");
    }

    #[test]
    fn error_payload_serializes_kind_kebab_case() {
        let v = serde_json::to_value(error_payload(&AppError::NoSegmentsProduced)).unwrap();
        assert_eq!(v["kind"], "generic-error");
        assert_eq!(v["summary"], "Could not produce any segments from this video.");
    }

    #[test]
    fn missing_upload_is_invalid_request() {
        let staging = tempfile::tempdir().expect("tempdir");
        let config = Arc::new(config_for(staging.path()));
        let pipeline = Pipeline::with_backend(config, FakeBackend::new(10.0));
        let request = CircleRequest {
            source: VideoSource::LocalFile {
                path: staging.path().join("nope.mp4"),
                suggested_extension: None,
            },
            segment_seconds: None,
            label: None,
        };
        let err = process_circles(&pipeline, request, &RunControl::new(), None).unwrap_err();
        assert!(matches!(err, AppError::InvalidRequest(_)));
        assert_eq!(fs::read_dir(staging.path()).unwrap().count(), 0);
    }

    #[test]
    fn release_accepts_staged_segments_only() {
        let staging = tempfile::tempdir().expect("tempdir");
        let config = config_for(staging.path());
        let run_dir = staging::create_run_dir(staging.path(), None).expect("run dir");
        let segment = run_dir.join("circle_0.mp4");
        fs::write(&segment, b"x").expect("write");

        let outside = tempfile::NamedTempFile::new().expect("outside file");
        let err = release_segments(&config, &[outside.path().to_path_buf()]).unwrap_err();
        assert!(matches!(err, AppError::InvalidRequest(_)));
        assert!(outside.path().exists());

        let released =
            release_segments(&config, &[segment.clone(), run_dir.join("gone.mp4")]).unwrap();
        assert_eq!(released, 1);
        assert!(!segment.exists());
        assert!(!run_dir.exists());
        assert!(staging.path().exists());
    }

    #[test]
    fn capabilities_report_limits() {
        let config = PipelineConfig {
            ffmpeg_path: Some(PathBuf::from("/nonexistent/ffmpeg")),
            ffprobe_path: Some(PathBuf::from("/nonexistent/ffprobe")),
            ytdlp_path: Some(PathBuf::from("/nonexistent/yt-dlp")),
            ..Default::default()
        };
        let caps = app_capabilities(&config);
        assert_eq!(caps.protocol_version, PROTOCOL_VERSION);
        assert!(!caps.tools.ffmpeg.available);
        assert_eq!(caps.limits.min_seconds, 5);
        assert_eq!(caps.limits.max_seconds, 15);
        let v = serde_json::to_value(&caps).unwrap();
        assert_eq!(v["limits"]["frameFit"], "pad");
        assert_eq!(v["protocolVersion"], 1);
    }
}
