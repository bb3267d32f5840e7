//! App error type for pipeline runs and sidecar commands. Implements Display and Serialize for
//! the front end.

use crate::ffmpeg::parse_ffmpeg_error;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    ToolUnavailable(String),

    #[error("Download failed: {0}")]
    Download(String),

    #[error("Could not determine video duration (ffprobe: {primary}; ffmpeg: {fallback})")]
    Probe { primary: String, fallback: String },

    #[error("Segment {segment_index} failed (code {code}): {stderr}")]
    Encode {
        segment_index: usize,
        code: i32,
        stderr: String,
    },

    #[error("No segments were produced")]
    NoSegmentsProduced,

    #[error("{tool} failed (code {code}): {stderr}")]
    ToolFailed {
        tool: String,
        code: i32,
        stderr: String,
    },

    #[error("{tool} timed out after {timeout:?}")]
    Timeout {
        tool: String,
        timeout: std::time::Duration,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("{0}")]
    InvalidRequest(String),

    #[error("Aborted")]
    Aborted,
}

/// Coarse failure class shown to end users. Lets the front end pick actionable wording
/// without exposing internal diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    ToolMissing,
    DownloadFailure,
    GenericError,
}

impl AppError {
    pub fn aborted() -> Self {
        Self::Aborted
    }

    pub fn tool_failed(tool: impl Into<String>, code: i32, stderr: impl Into<String>) -> Self {
        Self::ToolFailed {
            tool: tool.into(),
            code,
            stderr: stderr.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::ToolUnavailable(_) => ErrorKind::ToolMissing,
            AppError::Download(_) => ErrorKind::DownloadFailure,
            _ => ErrorKind::GenericError,
        }
    }

    /// Short message suitable for a chat reply.
    pub fn user_message(&self) -> String {
        match self.kind() {
            ErrorKind::ToolMissing => {
                "Video processing is unavailable: make sure FFmpeg is installed and reachable."
                    .to_string()
            }
            ErrorKind::DownloadFailure => {
                "Could not download the video. Check the link or try another site.".to_string()
            }
            ErrorKind::GenericError => match self {
                AppError::NoSegmentsProduced => {
                    "Could not produce any segments from this video.".to_string()
                }
                AppError::Probe { .. } => "Could not read the video duration.".to_string(),
                AppError::Aborted => "Processing was cancelled.".to_string(),
                _ => "Something went wrong while processing the video.".to_string(),
            },
        }
    }

    /// Whether the run must stop. Per-segment encode failures are absorbed by the pipeline.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, AppError::Encode { .. })
    }
}

impl serde::Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            AppError::ToolFailed { code, stderr, .. } | AppError::Encode { code, stderr, .. } => {
                let payload = parse_ffmpeg_error(stderr, Some(*code));
                let json = serde_json::json!({
                    "kind": self.kind(),
                    "summary": payload.summary,
                    "detail": payload.detail,
                });
                serializer.serialize_str(&json.to_string())
            }
            _ => serializer.serialize_str(&self.to_string()),
        }
    }
}

impl From<String> for AppError {
    fn from(s: String) -> Self {
        if s == "Aborted" {
            AppError::Aborted
        } else {
            AppError::ToolFailed {
                tool: "process".to_string(),
                code: -1,
                stderr: s,
            }
        }
    }
}

impl From<&str> for AppError {
    fn from(s: &str) -> Self {
        s.to_string().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_aborted_string() {
        let e = AppError::from("Aborted");
        assert!(matches!(e, AppError::Aborted));
    }

    #[test]
    fn from_other_string() {
        let e = AppError::from("some error message");
        match &e {
            AppError::ToolFailed { code, stderr, .. } => {
                assert_eq!(*code, -1);
                assert_eq!(stderr, "some error message");
            }
            _ => panic!("expected ToolFailed"),
        }
    }

    #[test]
    fn kind_is_taken_from_variant_not_text() {
        let e = AppError::from("download ffmpeg ffprobe yt-dlp");
        assert_eq!(e.kind(), ErrorKind::GenericError);
        assert_eq!(
            AppError::ToolUnavailable("x".into()).kind(),
            ErrorKind::ToolMissing
        );
        assert_eq!(
            AppError::Download("x".into()).kind(),
            ErrorKind::DownloadFailure
        );
        assert_eq!(AppError::NoSegmentsProduced.kind(), ErrorKind::GenericError);
    }

    #[test]
    fn sub_second_timeout_keeps_its_precision() {
        let e = AppError::Timeout {
            tool: "ffprobe".into(),
            timeout: std::time::Duration::from_millis(200),
        };
        assert_eq!(e.to_string(), "ffprobe timed out after 200ms");
    }

    #[test]
    fn encode_errors_are_not_fatal() {
        let e = AppError::Encode {
            segment_index: 2,
            code: 1,
            stderr: String::new(),
        };
        assert!(!e.is_fatal());
        assert!(AppError::NoSegmentsProduced.is_fatal());
        assert!(AppError::Download("bad".into()).is_fatal());
    }

    #[test]
    fn serialize_process_failure_uses_exit_code_summary() {
        let e = AppError::tool_failed("ffmpeg", 1, "Invalid data found");
        let s = serde_json::to_string(&e).expect("serialize");
        let inner: String = serde_json::from_str(&s).expect("string");
        let v: serde_json::Value = serde_json::from_str(&inner).expect("json");
        assert_eq!(v["summary"], "FFmpeg failed.");
        assert_eq!(v["detail"], "Invalid data found");
        assert_eq!(v["kind"], "generic-error");
    }
}
