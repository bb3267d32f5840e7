//! Run-scoped staging directories and best-effort release of intermediate files.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

/// Extensions a downloader may leave behind, in lookup order.
pub const DOWNLOAD_EXTENSIONS: &[&str] = &["mp4", "webm", "mkv", "m4a"];

const RUN_DIR_PREFIX_MAX_LEN: usize = 32;

/// Short per-process-unique suffix for run directory names. Not random; uniqueness only.
fn sequence_suffix() -> String {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    format!("{}-{}", std::process::id(), SEQ.fetch_add(1, Ordering::Relaxed))
}

/// Keeps `[A-Za-z0-9_-]` of a caller-supplied label (chat id, request id).
fn sanitize_label(label: &str) -> String {
    let cleaned: String = label
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .take(RUN_DIR_PREFIX_MAX_LEN)
        .collect();
    if cleaned.is_empty() {
        "run".to_string()
    } else {
        cleaned
    }
}

/// Creates `staging/<label>-<millis>-<pid>-<seq>`. Concurrent runs never share a directory.
pub fn create_run_dir(staging: &Path, label: Option<&str>) -> io::Result<PathBuf> {
    fs::create_dir_all(staging)?;
    let millis = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    loop {
        let name = format!(
            "{}-{}-{}",
            sanitize_label(label.unwrap_or("run")),
            millis,
            sequence_suffix()
        );
        let path = staging.join(name);
        match fs::create_dir(&path) {
            Ok(()) => return Ok(path),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Removes `path`, logging instead of failing. Missing files count as removed.
pub fn remove_file_logged(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => log::warn!(
            target: "circle_cut::staging",
            "Could not remove {}: {}",
            path.display(),
            e
        ),
    }
}

fn remove_dir_if_empty(dir: &Path) {
    let is_empty = fs::read_dir(dir)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(false);
    if is_empty && let Err(e) = fs::remove_dir(dir) {
        log::warn!(
            target: "circle_cut::staging",
            "Could not remove run directory {}: {}",
            dir.display(),
            e
        );
    }
}

/// Every file a run creates, released on drop unless delivered to the caller.
/// Drop runs on success, partial success and failure alike.
pub struct RunArtifacts {
    run_dir: PathBuf,
    paths: Vec<PathBuf>,
    delivered: Vec<PathBuf>,
}

impl RunArtifacts {
    pub fn new(run_dir: PathBuf) -> Self {
        Self {
            run_dir,
            paths: Vec::new(),
            delivered: Vec::new(),
        }
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn track(&mut self, path: impl Into<PathBuf>) {
        let path = path.into();
        if !self.paths.contains(&path) {
            self.paths.push(path);
        }
    }

    /// Marks `path` as handed to the caller; it survives release.
    pub fn deliver(&mut self, path: &Path) {
        self.track(path);
        self.delivered.push(path.to_path_buf());
    }

    /// Deletes every tracked, undelivered path plus any stray files in the run directory.
    /// Returns how many files were removed.
    fn release(&mut self) -> usize {
        let mut removed = 0;
        let mut doomed: Vec<PathBuf> = self
            .paths
            .drain(..)
            .filter(|p| !self.delivered.contains(p))
            .collect();
        // Partial downloads and encoder leftovers are never tracked by name.
        if let Ok(entries) = fs::read_dir(&self.run_dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_file() && !self.delivered.contains(&path) && !doomed.contains(&path) {
                    doomed.push(path);
                }
            }
        }
        for path in &doomed {
            if path.exists() {
                remove_file_logged(path);
                removed += 1;
            }
        }
        remove_dir_if_empty(&self.run_dir);
        removed
    }
}

impl Drop for RunArtifacts {
    fn drop(&mut self) {
        let removed = self.release();
        log::debug!(
            target: "circle_cut::staging",
            "Released {} intermediate file(s) in {}",
            removed,
            self.run_dir.display()
        );
    }
}

/// Deletes delivered segments once the caller has consumed them, and any run
/// directory that becomes empty as a result.
pub fn release_segments(paths: &[PathBuf]) {
    for path in paths {
        remove_file_logged(path);
        if let Some(parent) = path.parent() {
            remove_dir_if_empty(parent);
        }
    }
}

/// Removes run directories under `staging` older than `max_age`. Used at startup to
/// clear leftovers of runs whose process died before cleanup.
pub fn cleanup_stale_runs(staging: &Path, max_age: Duration) -> usize {
    let Ok(entries) = fs::read_dir(staging) else {
        return 0;
    };
    let now = SystemTime::now();
    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let age = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|m| now.duration_since(m).ok())
            .unwrap_or_default();
        if age <= max_age {
            continue;
        }
        match fs::remove_dir_all(&path) {
            Ok(()) => removed += 1,
            Err(e) => log::warn!(
                target: "circle_cut::staging",
                "Could not remove stale run {}: {}",
                path.display(),
                e
            ),
        }
    }
    if removed > 0 {
        log::info!(
            target: "circle_cut::staging",
            "Removed {} stale run director{}",
            removed,
            if removed == 1 { "y" } else { "ies" }
        );
    }
    removed
}

fn is_cross_device_rename_error(e: &io::Error) -> bool {
    #[cfg(unix)]
    {
        e.raw_os_error() == Some(18) // EXDEV
    }
    #[cfg(windows)]
    {
        e.raw_os_error() == Some(17) // ERROR_NOT_SAME_DEVICE
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = e;
        false
    }
}

/// Moves `source` to `dest`, copying across filesystems when a rename cannot.
pub fn move_file(source: &Path, dest: &Path) -> io::Result<()> {
    match fs::rename(source, dest) {
        Ok(()) => Ok(()),
        Err(e) if is_cross_device_rename_error(&e) => {
            fs::copy(source, dest)?;
            fs::remove_file(source)
        }
        Err(e) => Err(e),
    }
}

/// Normalizes a caller-suggested extension (`".MOV"` → `"mov"`).
pub fn normalize_extension(ext: &str) -> Option<String> {
    let ext = ext.trim().trim_start_matches('.').to_ascii_lowercase();
    (!ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric())).then_some(ext)
}

/// Container extension for an uploaded file's MIME type.
pub fn extension_for_mime(mime: &str) -> &'static str {
    let mime = mime.to_ascii_lowercase();
    if mime.contains("webm") {
        "webm"
    } else if mime.contains("quicktime") || mime.contains("mov") {
        "mov"
    } else if mime.contains("matroska") {
        "mkv"
    } else {
        "mp4"
    }
}

/// First `<stem>.<ext>` in `dir` for the known download extensions.
pub fn find_with_extensions(dir: &Path, stem: &str) -> Option<PathBuf> {
    DOWNLOAD_EXTENSIONS
        .iter()
        .map(|ext| dir.join(format!("{}.{}", stem, ext)))
        .find(|p| p.is_file())
}
