//! Cross-platform filesystem primitives: hard/soft link, symlink-preserving copy, and a
//! retrying recursive delete.
//!
//! Grounded on `install/link.rs`'s [`LinkMethod`] enum and on `conda/install.py`'s `_link` and
//! `rm_rf` (the retry/backoff/trash fallback shape is carried over from the latter).

use std::fs::Permissions;
use std::path::Path;
use std::thread::sleep;
use std::time::Duration;

use crate::trash;

/// The method used to place a file at its destination.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum LinkMethod {
    /// `src` and `dst` become the same inode.
    Hardlink,
    /// `dst` is a symbolic link pointing at `src`.
    Softlink,
    /// `dst` is an independent copy of `src`'s contents.
    Copy,
}

impl std::fmt::Display for LinkMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LinkMethod::Hardlink => "hard-link",
            LinkMethod::Softlink => "soft-link",
            LinkMethod::Copy => "copy",
        };
        write!(f, "{s}")
    }
}

/// Error produced by the primitives in this module.
#[derive(Debug, thiserror::Error)]
pub enum FsOpError {
    /// The requested link type is not supported between these two paths (e.g. cross-device hard
    /// link, or soft links unavailable on this Windows version).
    #[error("{0} is not supported from '{1}' to '{2}'")]
    LinkUnsupported(LinkMethod, String, String, #[source] std::io::Error),

    /// An I/O error occurred that isn't classified as [`FsOpError::LinkUnsupported`].
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Creates `dst` using the given `method`, sourcing from `src`.
///
/// Implements the special copy rule: on POSIX, a source that is a symlink with a *relative*
/// target is recreated as a symlink rather than dereferenced, regardless of `method`.
pub fn link(src: &Path, dst: &Path, method: LinkMethod) -> Result<(), FsOpError> {
    if method != LinkMethod::Softlink {
        if let Some(relative_target) = relative_symlink_target(src) {
            return soft_link_to(&relative_target, dst).map_err(|e| {
                FsOpError::LinkUnsupported(
                    LinkMethod::Softlink,
                    src.display().to_string(),
                    dst.display().to_string(),
                    e,
                )
            });
        }
    }

    match method {
        LinkMethod::Hardlink => hard_link(src, dst).map_err(|e| {
            FsOpError::LinkUnsupported(
                LinkMethod::Hardlink,
                src.display().to_string(),
                dst.display().to_string(),
                e,
            )
        }),
        LinkMethod::Softlink => {
            let target = std::fs::read_link(src).unwrap_or_else(|_| src.to_path_buf());
            soft_link_to(&target, dst).map_err(|e| {
                FsOpError::LinkUnsupported(
                    LinkMethod::Softlink,
                    src.display().to_string(),
                    dst.display().to_string(),
                    e,
                )
            })
        }
        LinkMethod::Copy => copy_preserving_mode_and_mtime(src, dst).map_err(FsOpError::Io),
    }
}

/// If `path` is a symlink whose stored target is relative, returns that target.
fn relative_symlink_target(path: &Path) -> Option<std::path::PathBuf> {
    let meta = std::fs::symlink_metadata(path).ok()?;
    if !meta.file_type().is_symlink() {
        return None;
    }
    let target = std::fs::read_link(path).ok()?;
    if target.is_relative() {
        Some(target)
    } else {
        None
    }
}

#[cfg(unix)]
fn hard_link(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::hard_link(src, dst)
}

#[cfg(windows)]
fn hard_link(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::hard_link(src, dst)
}

#[cfg(unix)]
fn soft_link_to(target: &Path, dst: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, dst)
}

#[cfg(windows)]
fn soft_link_to(target: &Path, dst: &Path) -> std::io::Result<()> {
    if target.is_dir() {
        std::os::windows::fs::symlink_dir(target, dst)
    } else {
        std::os::windows::fs::symlink_file(target, dst)
    }
}

fn copy_preserving_mode_and_mtime(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::copy(src, dst)?;
    let metadata = std::fs::metadata(src)?;
    std::fs::set_permissions(dst, Permissions::from(metadata.permissions()))?;
    let mtime = filetime::FileTime::from_last_modification_time(&metadata);
    let _ = filetime::set_file_mtime(dst, mtime);
    Ok(())
}

/// Number of retry attempts [`rm_rf`] makes on a directory before propagating the error.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Completely removes `path` (file, symlink, or directory subtree).
///
/// Dead symlinks are removed even though [`Path::exists`] would report `false` for them. For
/// directories, retries up to `max_retries` times with linear backoff (`sleep(i)` seconds on
/// attempt `i`); on the final attempt the underlying error is propagated. When `trash_dirs` is
/// non-empty and all retries are exhausted, the path is relocated into the first cache directory's
/// `.trash` subtree as a last resort before giving up.
pub fn rm_rf(path: &Path, max_retries: u32, trash_dirs: &[std::path::PathBuf]) -> std::io::Result<()> {
    let meta = std::fs::symlink_metadata(path);
    match meta {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
        Ok(meta) if meta.file_type().is_symlink() || meta.is_file() => {
            return std::fs::remove_file(path).or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "cannot remove, permission denied");
                Err(e)
            });
        }
        Ok(_) => {}
    }

    let mut last_err = None;
    for attempt in 0..max_retries {
        match std::fs::remove_dir_all(path) {
            Ok(()) => return Ok(()),
            Err(e) => {
                tracing::debug!(
                    path = %path.display(),
                    attempt,
                    error = %e,
                    "failed to remove directory, retrying"
                );
                #[cfg(windows)]
                {
                    if clear_readonly_and_retry(path).is_ok() {
                        return Ok(());
                    }
                    if run_native_rmdir(path).is_ok() && !path.exists() {
                        return Ok(());
                    }
                }
                let root = path.parent().unwrap_or(path);
                if !trash_dirs.is_empty()
                    && trash::move_path_to_trash(path, root, trash_dirs)
                    && !path.exists()
                {
                    return Ok(());
                }
                last_err = Some(e);
                if attempt + 1 < max_retries {
                    sleep(Duration::from_secs(u64::from(attempt) + 1));
                }
            }
        }
    }
    // Final attempt: propagate whatever error surfaces.
    std::fs::remove_dir_all(path).map_err(|e| last_err.unwrap_or(e))
}

#[cfg(windows)]
fn clear_readonly_and_retry(path: &Path) -> std::io::Result<()> {
    for entry in walk_all(path) {
        let mut perms = std::fs::metadata(&entry)?.permissions();
        #[allow(clippy::permissions_set_readonly_false)]
        perms.set_readonly(false);
        let _ = std::fs::set_permissions(&entry, perms);
    }
    std::fs::remove_dir_all(path)
}

#[cfg(windows)]
fn walk_all(root: &Path) -> Vec<std::path::PathBuf> {
    let mut out = vec![root.to_path_buf()];
    if let Ok(entries) = std::fs::read_dir(root) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                out.extend(walk_all(&path));
            } else {
                out.push(path);
            }
        }
    }
    out
}

#[cfg(windows)]
fn run_native_rmdir(path: &Path) -> std::io::Result<()> {
    let status = std::process::Command::new("cmd")
        .args(["/c", "rd", "/s", "/q"])
        .arg(path)
        .status()?;
    if status.success() {
        Ok(())
    } else {
        Err(std::io::Error::new(std::io::ErrorKind::Other, "rd /s /q failed"))
    }
}

/// Removes `path` if it is an existing, empty directory. A no-op otherwise (missing or
/// non-empty).
pub fn rm_empty_dir(path: &Path) {
    let _ = std::fs::remove_dir(path);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn rm_rf_removes_dead_symlink() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("gone");
        let link_path = dir.path().join("dead-link");
        #[cfg(unix)]
        std::os::unix::fs::symlink(&target, &link_path).unwrap();
        #[cfg(windows)]
        let _ = std::os::windows::fs::symlink_file(&target, &link_path);
        #[cfg(unix)]
        {
            assert!(!link_path.exists()); // exists() follows the link and reports false
            rm_rf(&link_path, DEFAULT_MAX_RETRIES, &[]).unwrap();
            assert!(fs::symlink_metadata(&link_path).is_err());
        }
    }

    #[test]
    fn rm_rf_on_missing_path_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        rm_rf(&dir.path().join("does-not-exist"), DEFAULT_MAX_RETRIES, &[]).unwrap();
    }

    #[test]
    fn rm_rf_removes_directory_tree() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("a/b");
        fs::create_dir_all(&sub).unwrap();
        fs::write(sub.join("f.txt"), b"hi").unwrap();
        rm_rf(&dir.path().join("a"), DEFAULT_MAX_RETRIES, &[]).unwrap();
        assert!(!dir.path().join("a").exists());
    }

    #[test]
    fn rm_empty_dir_is_noop_when_missing_or_nonempty() {
        let dir = tempfile::tempdir().unwrap();
        rm_empty_dir(&dir.path().join("missing"));
        fs::write(dir.path().join("f.txt"), b"x").unwrap();
        rm_empty_dir(dir.path());
        assert!(dir.path().exists());
    }

    #[test]
    fn copy_never_hardlinks_a_relative_symlink_source() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("real.txt"), b"data").unwrap();
        let link_src = dir.path().join("link.txt");
        #[cfg(unix)]
        {
            std::os::unix::fs::symlink("real.txt", &link_src).unwrap();
            let dst = dir.path().join("dst.txt");
            link(&link_src, &dst, LinkMethod::Hardlink).unwrap();
            let meta = fs::symlink_metadata(&dst).unwrap();
            assert!(meta.file_type().is_symlink());
            assert_eq!(fs::read_link(&dst).unwrap(), Path::new("real.txt"));
        }
    }

    #[test]
    fn hardlink_then_copy_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.txt");
        fs::write(&src, b"payload").unwrap();
        let dst = dir.path().join("dst.txt");
        link(&src, &dst, LinkMethod::Copy).unwrap();
        assert_eq!(fs::read(&dst).unwrap(), b"payload");
    }
}
