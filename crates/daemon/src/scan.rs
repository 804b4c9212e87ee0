//! Initial directory scan for files that existed before watching started.

use recodex_config::WatchTarget;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Whether `path` is an engine's in-progress output (`name.tmp.ext`).
pub fn is_temporary_output(path: &Path) -> bool {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .map(|stem| stem.ends_with(".tmp"))
        .unwrap_or(false)
}

/// Lists files under the target's directory that carry an accepted extension.
///
/// This function:
/// - Descends into subdirectories only when the target is recursive
/// - Skips hidden directories (names starting with `.`)
/// - Skips in-progress engine outputs
pub fn scan_target(target: &WatchTarget) -> Vec<PathBuf> {
    if !target.path.exists() {
        return Vec::new();
    }

    let mut walker = WalkDir::new(&target.path).follow_links(false);
    if !target.recursive {
        walker = walker.max_depth(1);
    }

    walker
        .into_iter()
        .filter_entry(|entry| {
            // Allow the root directory even if it starts with '.'
            !(entry.file_type().is_dir()
                && entry.depth() > 0
                && entry
                    .file_name()
                    .to_str()
                    .map(|name| name.starts_with('.'))
                    .unwrap_or(false))
        })
        .filter_map(|e| e.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| target.accepts_extension(path) && !is_temporary_output(path))
        .collect()
}
