use cow_utils::CowUtils;
use std::path::{Path, PathBuf};
use sugar_path::SugarPath;

/// Normalize line endings to LF (\n) for cross-platform consistency
/// This ensures reproducible builds regardless of the platform where bundling occurs
pub fn normalize_line_endings(content: String) -> String {
    content
        .cow_replace("\r\n", "\n")
        .cow_replace('\r', "\n")
        .into_owned()
}

/// Lexically normalize a path: drop `.` components and fold `..` into the preceding component.
///
/// The filesystem is never consulted, so the path does not need to exist.
pub fn normalize_path(path: &Path) -> PathBuf {
    path.normalize()
}

/// Join `path` onto `base` unless it is already absolute, then normalize.
pub fn rebase(base: &Path, path: &Path) -> PathBuf {
    path.absolutize_with(base)
}

/// Forward-slash rendering of a path, used for rule matching and bundle comments
pub fn to_slash(path: &Path) -> String {
    path.to_slash_lossy().into_owned()
}

/// Render `path` relative to `root` as `./a/b.js`, falling back to the full path when it
/// lies outside `root`
pub fn display_relative(root: &Path, path: &Path) -> String {
    let relative = to_slash(&path.relative(root));
    match relative.as_str() {
        "" | "." => "./".to_owned(),
        outside if outside == ".." || outside.starts_with("../") => to_slash(path),
        inside => format!("./{inside}"),
    }
}
