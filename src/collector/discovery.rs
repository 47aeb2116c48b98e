use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, warn};
use tokio::fs;

use crate::collector::registry::{CollectorDescriptor, CollectorRun, Registry};
use crate::util;

/// Builds a registry from the files found in `paths`.
///
/// - The file name is the collector key (no extension stripping).
/// - Directories are scanned last to first and a key is only taken the
///   first time it is seen, so a later directory overrides an earlier one.
/// - A file without any execute bit becomes a disabled entry with an
///   empty path. Placed in a later directory it blocks a same-named
///   collector from an earlier one.
/// - Missing or unreadable directories are skipped.
///
/// Every enabled entry is bound to `runner` with its absolute path as
/// arguments.
pub async fn discover(paths: &[PathBuf], runner: Arc<dyn CollectorRun>) -> Registry {
    let mut found = Registry::new();

    for dir in paths.iter().rev() {
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) => {
                debug!("shcollectors[{}]: skipped: {e}", dir.display());
                continue;
            }
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let file_name = entry.file_name();
            let Some(key) = file_name.to_str() else {
                warn!("shcollectors[{}]: ignoring non-UTF-8 name {file_name:?}", dir.display());
                continue;
            };
            if found.contains(key) {
                continue;
            }

            let path = entry.path();
            // follows symlinks
            let Ok(metadata) = fs::metadata(&path).await else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }

            let enabled = util::is_executable(&metadata);
            let args = if enabled {
                util::absolute_path(&path).to_string_lossy().into_owned()
            } else {
                String::new()
            };

            found.register(key, CollectorDescriptor::new(runner.clone(), args, enabled));
        }
    }

    found
}
