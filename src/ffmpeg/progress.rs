use regex::Regex;
use std::sync::LazyLock;

static DURATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Duration:\s*(\d+):(\d+):(\d+(?:\.\d+)?)").expect("invalid duration regex")
});
static TIME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"out_time_ms=(\d+)").expect("invalid time regex"));

/// Finds the first `Duration: HH:MM:SS.fraction` marker in FFmpeg diagnostic text
/// and converts it to seconds.
pub fn parse_duration_marker(text: &str) -> Option<f64> {
    let caps = DURATION_RE.captures(text)?;
    let hours: f64 = caps[1].parse().ok()?;
    let minutes: f64 = caps[2].parse().ok()?;
    let seconds: f64 = caps[3].parse().ok()?;
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// Parse one line of FFmpeg output. Returns (progress 0.0-1.0 or None, duration in seconds or None).
pub fn parse_ffmpeg_progress(
    line: &str,
    current_duration: Option<f64>,
) -> (Option<f64>, Option<f64>) {
    if let Some(duration) = parse_duration_marker(line) {
        // A known window length wins over the container duration of the source.
        return (None, current_duration.or(Some(duration)));
    }

    if let Some(caps) = TIME_RE.captures(line)
        && let Some(dur) = current_duration.filter(|d| *d > 0.0)
    {
        let current_time_us: i64 = caps[1].parse().unwrap_or(0);
        let current_time = current_time_us as f64 / 1_000_000.0;
        return (Some((current_time / dur).clamp(0.0, 1.0)), Some(dur));
    }

    (None, current_duration)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_marker_with_fraction() {
        let text = "  Duration: 00:01:23.45, start: 0.000000, bitrate: 1205 kb/s";
        let d = parse_duration_marker(text).expect("duration");
        assert!((d - 83.45).abs() < 1e-9);
    }

    #[test]
    fn duration_marker_hours() {
        assert_eq!(parse_duration_marker("Duration: 1:2:3"), Some(3723.0));
    }

    #[test]
    fn duration_marker_not_available() {
        assert_eq!(parse_duration_marker("Duration: N/A, bitrate: N/A"), None);
        assert_eq!(parse_duration_marker("random garbage"), None);
    }

    #[test]
    fn duration_line_sets_unknown_duration() {
        let (prog, dur) = parse_ffmpeg_progress("Duration: 0:1:30.5", None);
        assert_eq!(prog, None);
        assert_eq!(dur, Some(90.5));
    }

    #[test]
    fn duration_line_keeps_known_window() {
        let (_, dur) = parse_ffmpeg_progress("Duration: 0:1:30.5", Some(10.0));
        assert_eq!(dur, Some(10.0));
    }

    #[test]
    fn out_time_ms_progress() {
        let (prog, dur) = parse_ffmpeg_progress("out_time_ms=5000000", Some(10.0));
        assert_eq!(prog, Some(0.5));
        assert_eq!(dur, Some(10.0));
    }

    #[test]
    fn out_time_past_end_is_clamped() {
        let (prog, _) = parse_ffmpeg_progress("out_time_ms=12000000", Some(10.0));
        assert_eq!(prog, Some(1.0));
    }

    #[test]
    fn out_time_without_duration_is_ignored() {
        let (prog, dur) = parse_ffmpeg_progress("out_time_ms=5000000", None);
        assert_eq!(prog, None);
        assert_eq!(dur, None);
    }
}
