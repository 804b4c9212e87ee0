//! Output path naming.

use recodex_config::{Profile, ProfileTable};
use std::io;
use std::path::{Path, PathBuf};

/// Compute where the output for `source` under `profile` goes.
///
/// The directory is `output_dir` when given, otherwise the source's own
/// directory. The stem gets a `_<profile name>` suffix unless it already ends
/// with one, and the extension comes from the profile's container.
/// For example: `/in/movie.avi` with "Balanced"/mp4 -> `/in/movie_Balanced.mp4`
pub fn compute_destination(source: &Path, profile: &Profile, output_dir: Option<&Path>) -> PathBuf {
    let dir = output_dir
        .map(Path::to_path_buf)
        .or_else(|| source.parent().map(Path::to_path_buf))
        .unwrap_or_default();

    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    let suffix = format!("_{}", profile.name);
    let stem = if stem.ends_with(&suffix) {
        stem
    } else {
        format!("{}{}", stem, suffix)
    };

    dir.join(format!("{}.{}", stem, profile.container))
}

/// Create the parent directory of `destination` if it does not exist.
pub fn ensure_parent_dir(destination: &Path) -> io::Result<()> {
    match destination.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent),
        _ => Ok(()),
    }
}

/// Find an output already produced for `source` under any profile.
pub fn existing_destination(
    source: &Path,
    profiles: &ProfileTable,
    output_dir: Option<&Path>,
) -> Option<PathBuf> {
    profiles
        .values()
        .map(|profile| compute_destination(source, profile, output_dir))
        .find(|candidate| candidate.exists())
}

/// Temporary path an engine writes to before renaming onto `destination`.
///
/// `/out/movie_Balanced.mp4` -> `/out/movie_Balanced.tmp.mp4`
pub fn temporary_output(destination: &Path) -> PathBuf {
    let ext = destination
        .extension()
        .map(|e| format!("tmp.{}", e.to_string_lossy()))
        .unwrap_or_else(|| "tmp".to_string());
    destination.with_extension(ext)
}
