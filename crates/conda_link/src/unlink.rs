//! The unlink engine: the inverse of [`crate::link::link`].
//!
//! Grounded on `conda/install.py`'s `unlink` function for the flow, and on
//! `install/unlink.rs`'s `recursively_remove_empty_directories` for the deepest-first ancestor
//! cleanup shape (adapted to synchronous I/O and to stop at, rather than above, the prefix).

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::dist::Dist;
use crate::linked_data::LinkedStore;
use crate::lock::{LockError, Locked};
use crate::menu::{self, MenuInstaller};
use crate::script::{self, Action};

/// Error produced by [`unlink`].
#[derive(Debug, thiserror::Error)]
pub enum UnlinkError {
    /// Acquiring the prefix lock failed.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// An I/O error occurred reading or deleting metadata.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Removes `dist` from `prefix`: its files, the metadata record, and any directory that becomes
/// empty as a result (deepest first, never crossing above `prefix` itself).
pub fn unlink(
    linked: &mut LinkedStore,
    menu_installer: &dyn MenuInstaller,
    root_prefix: &Path,
    prefix: &Path,
    dist: &Dist,
) -> Result<(), UnlinkError> {
    let key = dist.key();

    // Step 1: lock.
    let _lock = Locked::acquire(prefix)?;

    // Step 2: pre-unlink, best-effort.
    if let Err(e) = script::run_script(root_prefix, prefix, None, dist, Action::PreUnlink) {
        tracing::debug!(dist = %dist, error = %e, "pre-unlink script failed, ignoring");
    }

    // Step 3: load metadata, invoke menu removal.
    let record = match linked.load_meta(prefix, &key) {
        Some(r) => r.clone(),
        None => {
            tracing::debug!(dist = %dist, "no metadata found, nothing to unlink");
            return Ok(());
        }
    };
    let files: Vec<PathBuf> = record.files.iter().map(PathBuf::from).collect();
    menu::run_for_menu_files(menu_installer, prefix, &files, true);

    // Step 4: per-file unlink.
    for relative_path in &files {
        let path = prefix.join(relative_path);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "failed to unlink file");
                if cfg!(windows) && path.exists() {
                    let pkgs_dir = record
                        .link
                        .as_ref()
                        .and_then(|l| Path::new(&l.source).parent())
                        .map(Path::to_path_buf);
                    if let Some(pkgs_dir) = pkgs_dir {
                        crate::trash::move_path_to_trash(&path, prefix, std::slice::from_ref(&pkgs_dir));
                    }
                }
            }
        }
    }

    // Step 5: delete metadata.
    linked.delete_linked_data(prefix, &key, true)?;

    // Step 6: collapse empty ancestor directories, deepest first, down to and including
    // `conda-meta` and `prefix` itself, never above `prefix`.
    let mut candidates: BTreeSet<PathBuf> = BTreeSet::new();
    for relative_path in &files {
        let mut dir = prefix.join(relative_path);
        while let Some(parent) = dir.parent() {
            if !parent.starts_with(prefix) {
                break;
            }
            candidates.insert(parent.to_path_buf());
            if parent == prefix {
                break;
            }
            dir = parent.to_path_buf();
        }
    }
    candidates.insert(prefix.join("conda-meta"));
    candidates.insert(prefix.to_path_buf());

    let mut ordered: Vec<PathBuf> = candidates.into_iter().collect();
    ordered.sort_by_key(|p| std::cmp::Reverse(p.as_os_str().len()));
    for dir in ordered {
        crate::fsops::rm_empty_dir(&dir);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsops::LinkMethod;
    use crate::linked_data::{LinkInfo, LinkedRecord};
    use crate::menu::NoopMenuInstaller;
    use std::fs;

    fn write_linked_package(prefix: &Path, tail: &str, files: &[&str]) {
        for f in files {
            let path = prefix.join(f);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::write(&path, b"x").unwrap();
        }
        fs::create_dir_all(prefix.join("conda-meta")).unwrap();
        let record = LinkedRecord {
            fname: format!("{tail}.tar.bz2"),
            schannel: "defaults".to_string(),
            url: None,
            files: files.iter().map(|s| s.to_string()).collect(),
            link: Some(LinkInfo {
                source: "/cache/foo".to_string(),
                link_type: LinkMethod::Copy.to_string(),
            }),
            icondata: None,
            extra: Default::default(),
        };
        let json = serde_json::to_string_pretty(&record).unwrap();
        fs::write(prefix.join("conda-meta").join(format!("{tail}.json")), json).unwrap();
    }

    #[test]
    fn unlink_removes_files_metadata_and_empty_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path();
        write_linked_package(prefix, "foo-1.0-0", &["lib/pkg/a.so", "lib/pkg/b.so"]);

        let mut linked = LinkedStore::default();
        linked.load_linked_data(prefix, "foo-1.0-0", None).unwrap();
        let menu_installer = NoopMenuInstaller;
        let dist = Dist::parse("foo-1.0-0").unwrap();

        unlink(&mut linked, &menu_installer, prefix, prefix, &dist).unwrap();

        assert!(!prefix.join("lib/pkg/a.so").exists());
        assert!(!prefix.join("lib/pkg").exists());
        assert!(!prefix.join("lib").exists());
        assert!(!prefix.join("conda-meta/foo-1.0-0.json").exists());
        assert!(linked.linked(prefix).is_empty());
    }

    #[test]
    fn unlink_keeps_nonempty_sibling_directories() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path();
        write_linked_package(prefix, "foo-1.0-0", &["lib/pkg/a.so"]);
        fs::write(prefix.join("lib/other.txt"), b"keep").unwrap();

        let mut linked = LinkedStore::default();
        linked.load_linked_data(prefix, "foo-1.0-0", None).unwrap();
        let menu_installer = NoopMenuInstaller;
        let dist = Dist::parse("foo-1.0-0").unwrap();

        unlink(&mut linked, &menu_installer, prefix, prefix, &dist).unwrap();

        assert!(!prefix.join("lib/pkg").exists());
        assert!(prefix.join("lib").exists());
        assert!(prefix.join("lib/other.txt").exists());
    }

    #[test]
    fn unlink_with_no_metadata_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path();
        let mut linked = LinkedStore::default();
        let menu_installer = NoopMenuInstaller;
        let dist = Dist::parse("missing-1.0-0").unwrap();
        unlink(&mut linked, &menu_installer, prefix, prefix, &dist).unwrap();
    }
}
