//! Pipeline configuration. Built once at startup and passed by reference into every run.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::AppError;

/// Shortest window the segmenter ever emits, independent of the configured minimum.
pub const MIN_WINDOW_SECS: f64 = 1.0;

/// Environment variable naming an optional JSON config file.
pub const CONFIG_ENV: &str = "CIRCLE_CUT_CONFIG";
pub const STAGING_DIR_ENV: &str = "CIRCLE_CUT_STAGING_DIR";

/// How a non-square frame is fitted into the square output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameFit {
    /// Scale to fit inside the square and pad the rest with black.
    #[default]
    Pad,
    /// Scale to cover the square and crop the overflow around the centre.
    Crop,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct PipelineConfig {
    /// Side of the square output, in pixels. Default 640.
    pub video_size: Option<u32>,
    pub default_segment_seconds: Option<u32>,
    pub min_segment_seconds: Option<u32>,
    pub max_segment_seconds: Option<u32>,
    /// Byte ceiling for a delivered segment. Default 10 MiB.
    pub max_file_size: Option<u64>,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub preset: Option<String>,
    pub crf: Option<u32>,
    pub audio_bitrate: Option<String>,
    /// CRF used by the size optimizer's re-encodes. Default 28.
    pub shrink_crf: Option<u32>,
    pub shrink_audio_bitrate: Option<String>,
    pub shrink_step: Option<u32>,
    pub shrink_floor: Option<u32>,
    pub frame_fit: Option<FrameFit>,
    pub staging_dir: Option<PathBuf>,
    pub ffmpeg_path: Option<PathBuf>,
    pub ffprobe_path: Option<PathBuf>,
    pub ytdlp_path: Option<PathBuf>,
    /// yt-dlp format selector. Default prefers mp4, else best of anything.
    pub download_format: Option<String>,
    pub version_check_timeout_secs: Option<u64>,
    pub probe_timeout_secs: Option<u64>,
    pub encode_timeout_secs: Option<u64>,
    pub download_timeout_secs: Option<u64>,
    pub max_concurrent_runs: Option<usize>,
}

/// Encoder settings for one run. The optimizer only varies the side, CRF and audio bitrate.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeSpec {
    pub side: u32,
    pub video_codec: String,
    pub preset: String,
    pub crf: u32,
    pub audio_codec: String,
    pub audio_bitrate: String,
    pub fast_start: bool,
    pub frame_fit: FrameFit,
}

impl EncodeSpec {
    /// Relaxed settings for a size-driven re-encode at `side`.
    pub fn shrunk(&self, side: u32, crf: u32, audio_bitrate: &str) -> Self {
        Self {
            side,
            crf,
            audio_bitrate: audio_bitrate.to_string(),
            ..self.clone()
        }
    }
}

impl PipelineConfig {
    /// Reads the optional JSON file named by `CIRCLE_CUT_CONFIG`, then applies
    /// `FFMPEG_PATH`, `FFPROBE_PATH`, `YTDLP_PATH` and `CIRCLE_CUT_STAGING_DIR`.
    pub fn from_env() -> Result<Self, AppError> {
        let mut config = match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        let env_path = |name: &str| {
            std::env::var_os(name)
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
        };
        if let Some(p) = env_path("FFMPEG_PATH") {
            config.ffmpeg_path = Some(p);
        }
        if let Some(p) = env_path("FFPROBE_PATH") {
            config.ffprobe_path = Some(p);
        }
        if let Some(p) = env_path("YTDLP_PATH") {
            config.ytdlp_path = Some(p);
        }
        if let Some(p) = env_path(STAGING_DIR_ENV) {
            config.staging_dir = Some(p);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, AppError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            AppError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&text)
            .map_err(|e| AppError::Config(format!("cannot parse {}: {}", path.display(), e)))
    }

    pub fn validate(&self) -> Result<(), AppError> {
        let min = self.effective_min_segment_seconds();
        let max = self.effective_max_segment_seconds();
        if (min as f64) < MIN_WINDOW_SECS {
            return Err(AppError::Config(format!(
                "minSegmentSeconds must be at least {}",
                MIN_WINDOW_SECS
            )));
        }
        if min > max {
            return Err(AppError::Config(format!(
                "minSegmentSeconds ({}) exceeds maxSegmentSeconds ({})",
                min, max
            )));
        }
        if self.effective_video_size() == 0 || self.effective_max_file_size() == 0 {
            return Err(AppError::Config(
                "videoSize and maxFileSize must be positive".into(),
            ));
        }
        if self.effective_shrink_step() == 0 {
            return Err(AppError::Config("shrinkStep must be positive".into()));
        }
        if self.effective_video_size() < self.effective_shrink_floor() {
            return Err(AppError::Config(format!(
                "videoSize ({}) is below shrinkFloor ({})",
                self.effective_video_size(),
                self.effective_shrink_floor()
            )));
        }
        if self.effective_max_concurrent_runs() == 0 {
            return Err(AppError::Config("maxConcurrentRuns must be positive".into()));
        }
        Ok(())
    }

    pub fn effective_video_size(&self) -> u32 {
        self.video_size.unwrap_or(640)
    }

    pub fn effective_default_segment_seconds(&self) -> u32 {
        self.default_segment_seconds.unwrap_or(10)
    }

    pub fn effective_min_segment_seconds(&self) -> u32 {
        self.min_segment_seconds.unwrap_or(5)
    }

    pub fn effective_max_segment_seconds(&self) -> u32 {
        self.max_segment_seconds.unwrap_or(15)
    }

    pub fn effective_max_file_size(&self) -> u64 {
        self.max_file_size.unwrap_or(10 * 1024 * 1024)
    }

    pub fn effective_video_codec(&self) -> &str {
        self.video_codec.as_deref().unwrap_or("libx264")
    }

    pub fn effective_audio_codec(&self) -> &str {
        self.audio_codec.as_deref().unwrap_or("aac")
    }

    pub fn effective_preset(&self) -> &str {
        self.preset.as_deref().unwrap_or("fast")
    }

    pub fn effective_crf(&self) -> u32 {
        self.crf.unwrap_or(23).min(51)
    }

    pub fn effective_audio_bitrate(&self) -> &str {
        self.audio_bitrate.as_deref().unwrap_or("128k")
    }

    pub fn effective_shrink_crf(&self) -> u32 {
        self.shrink_crf.unwrap_or(28).min(51)
    }

    pub fn effective_shrink_audio_bitrate(&self) -> &str {
        self.shrink_audio_bitrate.as_deref().unwrap_or("96k")
    }

    pub fn effective_shrink_step(&self) -> u32 {
        self.shrink_step.unwrap_or(64)
    }

    pub fn effective_shrink_floor(&self) -> u32 {
        self.shrink_floor.unwrap_or(256)
    }

    pub fn effective_frame_fit(&self) -> FrameFit {
        self.frame_fit.unwrap_or_default()
    }

    pub fn effective_staging_dir(&self) -> PathBuf {
        self.staging_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("temp_videos"))
    }

    pub fn effective_download_format(&self) -> &str {
        self.download_format
            .as_deref()
            .unwrap_or("best[ext=mp4]/best")
    }

    pub fn version_check_timeout(&self) -> Duration {
        Duration::from_secs(self.version_check_timeout_secs.unwrap_or(5))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs.unwrap_or(30))
    }

    pub fn encode_timeout(&self) -> Duration {
        Duration::from_secs(self.encode_timeout_secs.unwrap_or(300))
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs.unwrap_or(600))
    }

    pub fn effective_max_concurrent_runs(&self) -> usize {
        self.max_concurrent_runs.unwrap_or(2)
    }

    /// Clamps a requested segment length into the configured bounds.
    /// `None` means the configured default.
    pub fn clamp_segment_seconds(&self, requested: Option<u32>) -> f64 {
        let requested = requested.unwrap_or(self.effective_default_segment_seconds());
        requested.clamp(
            self.effective_min_segment_seconds(),
            self.effective_max_segment_seconds(),
        ) as f64
    }

    pub fn encode_spec(&self) -> EncodeSpec {
        EncodeSpec {
            side: self.effective_video_size(),
            video_codec: self.effective_video_codec().to_string(),
            preset: self.effective_preset().to_string(),
            crf: self.effective_crf(),
            audio_codec: self.effective_audio_codec().to_string(),
            audio_bitrate: self.effective_audio_bitrate().to_string(),
            fast_start: true,
            frame_fit: self.effective_frame_fit(),
        }
    }
}
