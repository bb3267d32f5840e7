//! Short summaries for external tool exit codes.
//!
//! FFmpeg exit codes come from ffmpeg.c: 1 (general), 69 (rate exceeded),
//! 123 (hard exit), 255 (signal). -1 marks a spawn failure on our side.
//! The captured stderr always travels along as detail.

use serde::Serialize;

/// Summary shown in chat replies; detail is kept for logs and debugging.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FfmpegErrorPayload {
    pub summary: String,
    pub detail: String,
}

const SUMMARY_MAX_LEN: usize = 120;
const ELLIPSIS: &str = "…";

pub fn parse_ffmpeg_error(stderr: &str, exit_code: Option<i32>) -> FfmpegErrorPayload {
    let summary = match exit_code {
        Some(code) => exit_code_summary(code),
        None => first_line_truncated(stderr, SUMMARY_MAX_LEN),
    };
    FfmpegErrorPayload {
        summary,
        detail: stderr.trim().to_string(),
    }
}

fn exit_code_summary(code: i32) -> String {
    match code {
        -1 => "FFmpeg not found or failed to start.".into(),
        1 => "FFmpeg failed.".into(),
        69 => "Encoding rate limit exceeded.".into(),
        123 | 255 => "Encoding was stopped.".into(),
        other => format!("FFmpeg failed (exit code {}).", other),
    }
}

fn first_line_truncated(stderr: &str, max_len: usize) -> String {
    let first = stderr
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("");
    if first.len() <= max_len {
        return first.to_string();
    }
    let mut cut = max_len.saturating_sub(ELLIPSIS.len());
    while !first.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}{}", &first[..cut], ELLIPSIS)
}
