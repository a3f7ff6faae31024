//! Per-cache-directory quarantine used when a path cannot be deleted immediately.
//!
//! Grounded on `install/unlink.rs`'s `move_to_trash`/`empty_trash` (the random-suffix relocation
//! idea), adapted to the per-cache-directory `.trash` layout of §4.J.

use std::path::{Path, PathBuf};

/// Recursively removes every `.trash` subtree under each cache directory, single retry, best
/// effort. Never re-trashes a failure; a failure is just logged.
pub fn delete_trash(pkgs_dirs: &[PathBuf]) {
    for dir in pkgs_dirs {
        let trash_dir = dir.join(".trash");
        if !trash_dir.exists() {
            continue;
        }
        if std::fs::remove_dir_all(&trash_dir).is_err() {
            // One retry, then give up and log.
            if let Err(e) = std::fs::remove_dir_all(&trash_dir) {
                tracing::warn!(path = %trash_dir.display(), error = %e, "failed to empty trash");
            }
        }
    }
}

/// Moves `path` into the `.trash/<random>/<relpath-from-root>/` staging area of the first cache
/// directory that accepts it. `root` is the directory `path` is conceptually rooted at (the
/// prefix or cache directory it was linked/extracted under); the staged copy keeps `path`'s
/// position relative to `root` so a trash entry can still be traced back to where it came from.
/// When `path` isn't under `root`, falls back to just its file name. Before each attempt,
/// opportunistically calls [`delete_trash`].
///
/// Returns `true` on first success, `false` if no cache directory accepted the move.
pub fn move_path_to_trash(path: &Path, root: &Path, pkgs_dirs: &[PathBuf]) -> bool {
    for dir in pkgs_dirs {
        delete_trash(pkgs_dirs);

        let staging = dir.join(".trash").join(uuid::Uuid::new_v4().simple().to_string());
        let relpath = path.strip_prefix(root).map(Path::to_path_buf).unwrap_or_else(|_| {
            path.file_name()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("unnamed"))
        });
        let destination = staging.join(&relpath);
        let create_result = match destination.parent() {
            Some(parent) => std::fs::create_dir_all(parent),
            None => std::fs::create_dir_all(&staging),
        };
        if let Err(e) = create_result {
            tracing::debug!(path = %staging.display(), error = %e, "failed to create trash staging directory");
            continue;
        }
        match std::fs::rename(path, &destination) {
            Ok(()) => return true,
            Err(e) => {
                tracing::debug!(
                    path = %path.display(),
                    cache_dir = %dir.display(),
                    error = %e,
                    "failed to move path to trash, trying next cache directory"
                );
                let _ = std::fs::remove_dir_all(&staging);
                continue;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn move_path_to_trash_relocates_file() {
        let cache = tempfile::tempdir().unwrap();
        let victim_dir = tempfile::tempdir().unwrap();
        let victim = victim_dir.path().join("victim.txt");
        fs::write(&victim, b"data").unwrap();

        let moved = move_path_to_trash(&victim, victim_dir.path(), &[cache.path().to_path_buf()]);
        assert!(moved);
        assert!(!victim.exists());
        assert!(cache.path().join(".trash").exists());
    }

    #[test]
    fn move_path_to_trash_preserves_relative_directory_structure() {
        let cache = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let victim = root.path().join("lib/pkg/a.so");
        fs::create_dir_all(victim.parent().unwrap()).unwrap();
        fs::write(&victim, b"data").unwrap();

        let moved = move_path_to_trash(&victim, root.path(), &[cache.path().to_path_buf()]);
        assert!(moved);

        let trash_dir = cache.path().join(".trash");
        let staged = fs::read_dir(&trash_dir)
            .unwrap()
            .next()
            .unwrap()
            .unwrap()
            .path();
        assert!(staged.join("lib/pkg/a.so").exists());
    }

    #[test]
    fn delete_trash_removes_staged_entries() {
        let cache = tempfile::tempdir().unwrap();
        let trash_dir = cache.path().join(".trash").join("abc");
        fs::create_dir_all(&trash_dir).unwrap();
        fs::write(trash_dir.join("f.txt"), b"x").unwrap();

        delete_trash(&[cache.path().to_path_buf()]);
        assert!(!cache.path().join(".trash").exists());
    }

    #[test]
    fn move_path_to_trash_returns_false_with_no_cache_dirs() {
        let victim_dir = tempfile::tempdir().unwrap();
        let victim = victim_dir.path().join("victim.txt");
        fs::write(&victim, b"data").unwrap();
        let moved = move_path_to_trash(&victim, victim_dir.path(), &[]);
        assert!(!moved);
        assert!(victim.exists());
    }
}
