/// Small filesystem helpers shared by config loading and discovery.
///
/// No collector or transport logic lives here.
use std::fs::Metadata;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Joins `path` onto `base`, letting an absolute `path` replace `base`.
///
/// Examples:
/// - ("/etc", "collectors")       -> "/etc/collectors"
/// - ("/etc", "/usr/lib/scripts") -> "/usr/lib/scripts"
pub fn resolve_path(base: &Path, path: &str) -> PathBuf {
    base.join(path)
}

/// Makes `path` absolute against the current directory without touching
/// the filesystem. Falls back to `path` itself if the current directory
/// is unavailable.
pub fn absolute_path(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

/// True when any of the user/group/other execute bits is set.
pub fn is_executable(metadata: &Metadata) -> bool {
    !metadata.is_dir() && metadata.permissions().mode() & 0o111 != 0
}
