//! Shrinks an encoded segment until it fits the delivery size ceiling.

use std::fs;
use std::path::{Path, PathBuf};

use crate::backend::MediaBackend;
use crate::config::{EncodeSpec, PipelineConfig};
use crate::ffmpeg::RunControl;
use crate::staging::remove_file_logged;

/// Relaxed encoder settings and the resolution ladder for size-driven re-encodes.
#[derive(Debug, Clone, PartialEq)]
pub struct ShrinkSettings {
    pub crf: u32,
    pub audio_bitrate: String,
    pub step: u32,
    pub floor: u32,
}

impl ShrinkSettings {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            crf: config.effective_shrink_crf(),
            audio_bitrate: config.effective_shrink_audio_bitrate().to_string(),
            step: config.effective_shrink_step(),
            floor: config.effective_shrink_floor(),
        }
    }
}

fn file_size(path: &Path) -> Option<u64> {
    fs::metadata(path).ok().filter(|m| m.is_file()).map(|m| m.len())
}

/// `circle_3.mp4` at side 576 → `circle_3_576.mp4`, next to the original.
fn candidate_path(original: &Path, side: u32) -> PathBuf {
    let stem = original
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "segment".to_string());
    original.with_file_name(format!("{}_{}.mp4", stem, side))
}

/// Returns a path to a file no larger than `ceiling` when one can be produced, otherwise
/// the smallest-resolution result reached (or `path` itself when nothing succeeded).
///
/// Never fails: every re-encode problem ends the loop and the best file so far is kept.
/// Every file this function made, and `path` when a candidate replaces it, is deleted
/// except the one returned.
pub fn fit<B: MediaBackend + ?Sized>(
    backend: &B,
    path: &Path,
    ceiling: u64,
    spec: &EncodeSpec,
    settings: &ShrinkSettings,
    control: &RunControl,
) -> PathBuf {
    let Some(size) = file_size(path) else {
        log::warn!(
            target: "circle_cut::optimizer",
            "{} is not readable, skipping size check",
            path.display()
        );
        return path.to_path_buf();
    };
    if size <= ceiling {
        log::debug!(
            target: "circle_cut::optimizer",
            "{} is {} bytes, within {} byte ceiling",
            path.display(),
            size,
            ceiling
        );
        return path.to_path_buf();
    }

    log::info!(
        target: "circle_cut::optimizer",
        "{} is {} bytes, over {} byte ceiling; re-encoding",
        path.display(),
        size,
        ceiling
    );

    // Latest good candidate; the previous one is deleted as soon as a newer one exists.
    let mut best: Option<PathBuf> = None;
    let mut side = spec.side;
    while side >= settings.floor && side > 0 {
        if control.is_cancelled() {
            break;
        }
        let input = best.as_deref().unwrap_or(path).to_path_buf();
        let output = candidate_path(path, side);
        let relaxed = spec.shrunk(side, settings.crf, &settings.audio_bitrate);
        if let Err(e) = backend.reencode(&input, &output, &relaxed, control) {
            log::warn!(
                target: "circle_cut::optimizer",
                "Re-encode at {}px failed: {}",
                side,
                e
            );
            remove_file_logged(&output);
            break;
        }
        let Some(new_size) = file_size(&output) else {
            log::warn!(
                target: "circle_cut::optimizer",
                "Re-encode at {}px produced no file",
                side
            );
            break;
        };
        if let Some(previous) = best.replace(output.clone()) {
            remove_file_logged(&previous);
        }
        log::debug!(
            target: "circle_cut::optimizer",
            "{}px candidate is {} bytes",
            side,
            new_size
        );
        if new_size <= ceiling {
            break;
        }
        match side.checked_sub(settings.step) {
            Some(next) if next > 0 && next < side => side = next,
            _ => break,
        }
    }

    match best {
        Some(candidate) => {
            remove_file_logged(path);
            if file_size(&candidate).is_some_and(|s| s > ceiling) {
                log::warn!(
                    target: "circle_cut::optimizer",
                    "{} still exceeds {} bytes at the resolution floor",
                    candidate.display(),
                    ceiling
                );
            }
            candidate
        }
        None => path.to_path_buf(),
    }
}
