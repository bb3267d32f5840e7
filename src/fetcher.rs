//! Remote video acquisition through yt-dlp.

use std::path::{Path, PathBuf};

use url::Url;

use crate::backend::MediaBackend;
use crate::config::PipelineConfig;
use crate::error::AppError;
use crate::ffmpeg::{RunControl, RunOptions, ToolPaths, path_to_string, run_tool};
use crate::staging::find_with_extensions;

/// Stem of the downloaded file inside a run directory.
pub const SOURCE_STEM: &str = "source";

/// Accepts absolute http(s) URLs with a host. Anything else is a download failure
/// without spawning the downloader.
pub fn validate_url(raw: &str) -> Result<Url, AppError> {
    let url = Url::parse(raw.trim())
        .map_err(|e| AppError::Download(format!("invalid URL '{}': {}", raw, e)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(AppError::Download(format!(
            "unsupported URL scheme '{}'",
            url.scheme()
        )));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(AppError::Download(format!("URL has no host: {}", raw)));
    }
    Ok(url)
}

pub(crate) fn build_download_args(url: &Url, run_dir: &Path, format: &str) -> Vec<String> {
    let template = run_dir.join(format!("{}.%(ext)s", SOURCE_STEM));
    vec![
        "-f".to_string(),
        format.to_string(),
        "--no-playlist".to_string(),
        "--no-progress".to_string(),
        "--quiet".to_string(),
        "--no-warnings".to_string(),
        "-o".to_string(),
        path_to_string(&template),
        url.as_str().to_string(),
    ]
}

/// Last non-empty stderr line; yt-dlp puts its `ERROR:` summary there.
fn last_line(stderr: &str) -> &str {
    stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("downloader exited without output")
}

/// Runs yt-dlp into `run_dir`. Every failure except cancellation is a `Download` error.
pub(crate) fn run_downloader(
    tools: &ToolPaths,
    config: &PipelineConfig,
    url: &Url,
    run_dir: &Path,
    control: &RunControl,
) -> Result<PathBuf, AppError> {
    let args = build_download_args(url, run_dir, config.effective_download_format());
    let opts = RunOptions::new(control).timeout(config.download_timeout());
    match run_tool(&tools.ytdlp, &args, &opts) {
        Ok(_) => {}
        Err(AppError::Aborted) => return Err(AppError::Aborted),
        Err(AppError::ToolFailed { stderr, code, .. }) => {
            return Err(AppError::Download(format!(
                "yt-dlp exited with code {}: {}",
                code,
                last_line(&stderr)
            )));
        }
        Err(other) => return Err(AppError::Download(other.to_string())),
    }
    find_with_extensions(run_dir, SOURCE_STEM).ok_or_else(|| {
        AppError::Download(format!(
            "yt-dlp finished but no {}.{{mp4,webm,mkv,m4a}} appeared in {}",
            SOURCE_STEM,
            run_dir.display()
        ))
    })
}

/// Validates `raw_url` and downloads it into `run_dir` through `backend`.
pub fn fetch<B: MediaBackend + ?Sized>(
    backend: &B,
    raw_url: &str,
    run_dir: &Path,
    control: &RunControl,
) -> Result<PathBuf, AppError> {
    let url = validate_url(raw_url)?;
    control.ensure_active()?;
    log::info!(target: "circle_cut::fetcher", "Downloading {}", url);
    let path = backend.download(&url, run_dir, control)?;
    log::info!(
        target: "circle_cut::fetcher",
        "Downloaded {} to {}",
        url,
        path.display()
    );
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_http_and_https() {
        assert!(validate_url("https://example.com/watch?v=1").is_ok());
        assert!(validate_url("  http://example.com/v.mp4 ").is_ok());
    }

    #[test]
    fn rejects_other_schemes_and_garbage() {
        for raw in [
            "ftp://example.com/v.mp4",
            "file:///etc/passwd",
            "not a url",
            "",
            "https://",
        ] {
            let err = validate_url(raw).unwrap_err();
            assert!(matches!(err, AppError::Download(_)), "{raw}: {err:?}");
        }
    }

    #[test]
    fn download_args_pin_output_template() {
        let url = Url::parse("https://example.com/v").unwrap();
        let args = build_download_args(&url, Path::new("/stage/run-1"), "best[ext=mp4]/best");
        assert_eq!(args[0..2], ["-f", "best[ext=mp4]/best"]);
        assert!(args.contains(&"--no-playlist".to_string()));
        let o = args.iter().position(|a| a == "-o").unwrap();
        assert_eq!(args[o + 1], "/stage/run-1/source.%(ext)s");
        assert_eq!(args.last().unwrap(), "https://example.com/v");
    }

    #[test]
    fn last_line_skips_blank_tail() {
        assert_eq!(
            last_line("WARNING: x\nERROR: Unsupported URL\n\n"),
            "ERROR: Unsupported URL"
        );
        assert_eq!(last_line(""), "downloader exited without output");
    }

    #[cfg(unix)]
    mod with_fake_tool {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
            let path = dir.join(name);
            std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).expect("write script");
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
                .expect("chmod");
            path
        }

        fn tools(ytdlp: PathBuf) -> ToolPaths {
            ToolPaths {
                ffmpeg: PathBuf::from("ffmpeg"),
                ffprobe: PathBuf::from("ffprobe"),
                ytdlp,
            }
        }

        #[test]
        fn finds_downloaded_file() {
            let bin = tempfile::tempdir().expect("tempdir");
            let run_dir = tempfile::tempdir().expect("tempdir");
            // Writes to the path after -o with the template resolved to webm.
            let fake = script(
                bin.path(),
                "yt-dlp",
                r#"while [ "$1" != "-o" ]; do shift; done; out=$(echo "$2" | sed 's/%(ext)s/webm/'); echo data > "$out""#,
            );
            let url = Url::parse("https://example.com/v").unwrap();
            let path = run_downloader(
                &tools(fake),
                &PipelineConfig::default(),
                &url,
                run_dir.path(),
                &RunControl::new(),
            )
            .expect("download");
            assert_eq!(path, run_dir.path().join("source.webm"));
        }

        #[test]
        fn failure_becomes_download_error() {
            let bin = tempfile::tempdir().expect("tempdir");
            let run_dir = tempfile::tempdir().expect("tempdir");
            let fake = script(
                bin.path(),
                "yt-dlp",
                "echo 'ERROR: Unsupported URL' >&2; exit 1",
            );
            let url = Url::parse("https://example.com/v").unwrap();
            let err = run_downloader(
                &tools(fake),
                &PipelineConfig::default(),
                &url,
                run_dir.path(),
                &RunControl::new(),
            )
            .unwrap_err();
            match err {
                AppError::Download(msg) => assert!(msg.contains("Unsupported URL"), "{msg}"),
                other => panic!("expected Download, got {other:?}"),
            }
        }

        #[test]
        fn missing_downloader_is_download_error() {
            let run_dir = tempfile::tempdir().expect("tempdir");
            let url = Url::parse("https://example.com/v").unwrap();
            let err = run_downloader(
                &tools(PathBuf::from("/nonexistent/yt-dlp")),
                &PipelineConfig::default(),
                &url,
                run_dir.path(),
                &RunControl::new(),
            )
            .unwrap_err();
            assert!(matches!(err, AppError::Download(_)));
        }

        #[test]
        fn clean_exit_without_file_is_download_error() {
            let bin = tempfile::tempdir().expect("tempdir");
            let run_dir = tempfile::tempdir().expect("tempdir");
            let fake = script(bin.path(), "yt-dlp", "exit 0");
            let url = Url::parse("https://example.com/v").unwrap();
            let err = run_downloader(
                &tools(fake),
                &PipelineConfig::default(),
                &url,
                run_dir.path(),
                &RunControl::new(),
            )
            .unwrap_err();
            assert!(matches!(err, AppError::Download(_)));
        }
    }
}
