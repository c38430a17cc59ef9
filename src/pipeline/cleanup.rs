use std::fs;
use std::path::{Path, PathBuf};

/// File name suffixes of transient artifacts left behind by the tools.
pub(super) const TRANSIENT_SUFFIXES: &[&str] = &[".tmp", ".nosex"];

pub(super) fn is_transient(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| TRANSIENT_SUFFIXES.iter().any(|suffix| name.ends_with(suffix)))
}

/// Remove transient files below `root`. Failures are logged and skipped.
/// Returns the removed paths.
pub(super) fn remove_transient_files(root: &Path) -> Vec<PathBuf> {
    let mut removed = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!(dir = %dir.display(), %err, "cleanup could not read directory");
                continue;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if file_type.is_dir() {
                pending.push(path);
            } else if is_transient(&path) {
                match fs::remove_file(&path) {
                    Ok(()) => removed.push(path),
                    Err(err) => {
                        tracing::warn!(path = %path.display(), %err, "failed to remove transient file");
                    }
                }
            }
        }
    }
    removed.sort();
    tracing::info!(removed = removed.len(), "cleanup finished");
    removed
}
