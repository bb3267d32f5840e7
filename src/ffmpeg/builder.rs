//! Argument vectors for ffprobe and ffmpeg. Never joined into a shell string.

use crate::config::{EncodeSpec, FrameFit};
use crate::segmenter::TimeWindow;

/// Video filter producing an exact `side x side` frame.
pub fn square_filter(side: u32, fit: FrameFit) -> String {
    match fit {
        FrameFit::Pad => format!(
            "scale={s}:{s}:force_original_aspect_ratio=decrease,\
             pad={s}:{s}:(ow-iw)/2:(oh-ih)/2:color=black,setsar=1",
            s = side
        ),
        FrameFit::Crop => format!(
            "scale={s}:{s}:force_original_aspect_ratio=increase,crop={s}:{s},setsar=1",
            s = side
        ),
    }
}

/// ffprobe query printing only the container duration as a bare decimal.
pub fn build_probe_args(input_path: &str) -> Vec<String> {
    [
        "-v",
        "error",
        "-show_entries",
        "format=duration",
        "-of",
        "default=noprint_wrappers=1:nokey=1",
        input_path,
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

/// ffmpeg with an input and no output: prints the stream header (including
/// `Duration:`) to stderr and exits.
pub fn build_diagnostic_args(input_path: &str) -> Vec<String> {
    ["-hide_banner", "-nostdin", "-i", input_path]
        .into_iter()
        .map(String::from)
        .collect()
}

fn encoder_args(spec: &EncodeSpec) -> Vec<String> {
    let mut args = vec![
        "-vf".to_string(),
        square_filter(spec.side, spec.frame_fit),
        "-c:v".to_string(),
        spec.video_codec.clone(),
        "-preset".to_string(),
        spec.preset.clone(),
        "-crf".to_string(),
        spec.crf.to_string(),
        "-pix_fmt".to_string(),
        "yuv420p".to_string(),
        "-c:a".to_string(),
        spec.audio_codec.clone(),
        "-b:a".to_string(),
        spec.audio_bitrate.clone(),
    ];
    if spec.fast_start {
        args.extend(["-movflags".to_string(), "+faststart".to_string()]);
    }
    args
}

fn common_prefix() -> Vec<String> {
    ["-nostdin", "-hide_banner", "-y", "-progress", "pipe:1"]
        .into_iter()
        .map(String::from)
        .collect()
}

/// Cuts `window` out of the source (input-side seek) and encodes it to a square clip.
pub fn build_segment_args(
    input_path: &str,
    window: &TimeWindow,
    output_path: &str,
    spec: &EncodeSpec,
) -> Vec<String> {
    log::debug!(
        target: "circle_cut::ffmpeg::builder",
        "Building segment command: start={:.3}, length={:.3}, side={}, codec={}, crf={}",
        window.start,
        window.length,
        spec.side,
        spec.video_codec,
        spec.crf
    );
    let mut args = common_prefix();
    args.extend([
        "-ss".to_string(),
        format!("{:.3}", window.start),
        "-i".to_string(),
        input_path.to_string(),
        "-t".to_string(),
        format!("{:.3}", window.length),
    ]);
    args.extend(encoder_args(spec));
    args.push(output_path.to_string());
    args
}

/// Re-encodes an existing segment with the (already relaxed) `spec`.
pub fn build_shrink_args(input_path: &str, output_path: &str, spec: &EncodeSpec) -> Vec<String> {
    let mut args = common_prefix();
    args.extend(["-i".to_string(), input_path.to_string()]);
    args.extend(encoder_args(spec));
    args.push(output_path.to_string());
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;

    fn value_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .map(String::as_str)
    }

    #[test]
    fn pad_filter_letterboxes_to_square() {
        let f = square_filter(640, FrameFit::Pad);
        assert!(f.starts_with("scale=640:640:force_original_aspect_ratio=decrease"));
        assert!(f.contains("pad=640:640:(ow-iw)/2:(oh-ih)/2:color=black"));
    }

    #[test]
    fn crop_filter_covers_square() {
        let f = square_filter(480, FrameFit::Crop);
        assert!(f.contains("force_original_aspect_ratio=increase"));
        assert!(f.contains("crop=480:480"));
        assert!(!f.contains("pad="));
    }

    #[test]
    fn segment_args_seek_before_input() {
        let spec = PipelineConfig::default().encode_spec();
        let window = TimeWindow {
            start: 10.0,
            length: 5.0,
        };
        let args = build_segment_args("in.mp4", &window, "out.mp4", &spec);
        let ss = args.iter().position(|a| a == "-ss").expect("-ss");
        let input = args.iter().position(|a| a == "-i").expect("-i");
        assert!(ss < input);
        assert_eq!(value_after(&args, "-ss"), Some("10.000"));
        assert_eq!(value_after(&args, "-t"), Some("5.000"));
        assert_eq!(value_after(&args, "-c:v"), Some("libx264"));
        assert_eq!(value_after(&args, "-preset"), Some("fast"));
        assert_eq!(value_after(&args, "-crf"), Some("23"));
        assert_eq!(value_after(&args, "-c:a"), Some("aac"));
        assert_eq!(value_after(&args, "-b:a"), Some("128k"));
        assert_eq!(value_after(&args, "-movflags"), Some("+faststart"));
        assert!(args.contains(&"-y".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("out.mp4"));
    }

    #[test]
    fn shrink_args_use_relaxed_spec() {
        let spec = PipelineConfig::default()
            .encode_spec()
            .shrunk(512, 28, "96k");
        let args = build_shrink_args("a.mp4", "b.mp4", &spec);
        assert_eq!(value_after(&args, "-crf"), Some("28"));
        assert_eq!(value_after(&args, "-b:a"), Some("96k"));
        assert!(value_after(&args, "-vf").unwrap().contains("scale=512:512"));
        assert!(!args.contains(&"-ss".to_string()));
    }

    #[test]
    fn probe_args_request_only_duration() {
        let args = build_probe_args("x.mkv");
        assert_eq!(value_after(&args, "-show_entries"), Some("format=duration"));
        assert_eq!(args.last().map(String::as_str), Some("x.mkv"));
    }

    #[test]
    fn diagnostic_args_have_no_output() {
        let args = build_diagnostic_args("x.mkv");
        assert_eq!(args.last().map(String::as_str), Some("x.mkv"));
        assert_eq!(value_after(&args, "-i"), Some("x.mkv"));
    }
}
