//! The link engine: the top-level orchestration of materializing one distribution into a prefix.
//!
//! Grounded on `conda/install.py`'s `link` function for the nine-step flow, and on
//! `install/link.rs`'s [`crate::fsops::LinkMethod`] separation of concerns for the per-file
//! primitive calls.

use std::path::{Path, PathBuf};

use base64::Engine as _;
use serde_json::Value;

use crate::cache::PackageCacheIndex;
use crate::dist::Dist;
use crate::fsops::{self, FsOpError, LinkMethod};
use crate::linked_data::{classify_schannel, LinkInfo, LinkedRecord, LinkedStore};
use crate::lock::{LockError, Locked};
use crate::manifest::Manifest;
use crate::menu::{self, MenuInstaller};
use crate::rewrite::{self, RewriteError, RewriteMode};
use crate::script::{self, Action};

/// Package name that opts a distribution out of rewriting/menus/post-link/metadata (§4.G step 5).
const CACHE_SENTINEL_PACKAGE: &str = "_cache";

/// Fatal errors from [`link`]. Per-file link/remove failures are not part of this type: they are
/// logged and do not abort the run (see the propagation policy in the error taxonomy).
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// The distribution has no extracted directory registered in the cache.
    #[error("{0} is not extracted in any configured cache directory")]
    NotExtracted(String),

    /// `pre-link` or `post-link` exited non-zero.
    #[error("{action} script failed for {dist}")]
    ScriptFailed {
        /// Which lifecycle action failed.
        action: Action,
        /// The distribution whose script failed.
        dist: String,
    },

    /// A placeholder could not absorb the new prefix.
    #[error(transparent)]
    Padding(#[from] RewriteError),

    /// Acquiring a required lock failed.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// An I/O error not covered by a more specific variant above.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Decides the link method for one file: the requested default, downgraded to [`LinkMethod::Copy`]
/// when the file carries a prefix placeholder, is in the package's `no_link` set, or its source is
/// a symlink.
fn file_link_method(
    default: LinkMethod,
    relative_path: &Path,
    manifest: &Manifest,
    source_path: &Path,
) -> LinkMethod {
    let is_has_prefix = manifest.has_prefix.iter().any(|e| e.file == relative_path);
    let is_no_link = manifest.is_no_link(relative_path);
    let is_symlink = std::fs::symlink_metadata(source_path)
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false);
    if is_has_prefix || is_no_link || is_symlink {
        LinkMethod::Copy
    } else {
        default
    }
}

/// Links `dist` into `prefix` using `linktype` as the default link method for files that don't
/// require special handling. `incoming_index` is the package's `info/index.json`-equivalent
/// metadata (already parsed), used as the base of the final metadata record.
#[allow(clippy::too_many_arguments)]
pub fn link(
    cache: &mut PackageCacheIndex,
    linked: &mut LinkedStore,
    menu_installer: &dyn MenuInstaller,
    root_prefix: &Path,
    prefix: &Path,
    dist: &Dist,
    linktype: LinkMethod,
    incoming_index: Option<Value>,
) -> Result<(), LinkError> {
    let key = dist.key();
    let source_dir = cache
        .extracted(&key)
        .ok_or_else(|| LinkError::NotExtracted(key.clone()))?;
    let pkgs_dir = source_dir
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    tracing::info!(dist = %dist, prefix = %prefix.display(), %linktype, "linking distribution");

    // Step 1: pre-link.
    let pre_link_ok = script::run_script(root_prefix, prefix, None, dist, Action::PreLink)
        .map_err(|_| LinkError::ScriptFailed { action: Action::PreLink, dist: key.clone() })?;
    if !pre_link_ok {
        return Err(LinkError::ScriptFailed { action: Action::PreLink, dist: key });
    }

    // Step 2: manifest.
    let manifest = Manifest::read(&source_dir.join("info"))?;

    // Step 3: locks.
    let _prefix_lock = Locked::acquire(prefix)?;
    let _pkgs_lock = Locked::acquire(&pkgs_dir)?;

    // Step 4: per-file link.
    for relative_path in &manifest.files {
        let src = source_dir.join(relative_path);
        let dst = prefix.join(relative_path);
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if dst.exists() || std::fs::symlink_metadata(&dst).is_ok() {
            if let Err(e) = std::fs::remove_file(&dst) {
                tracing::warn!(path = %dst.display(), error = %e, "cannot remove existing file before link");
                if cfg!(windows) {
                    crate::trash::move_path_to_trash(&dst, prefix, std::slice::from_ref(&pkgs_dir));
                }
            }
        }

        let method = file_link_method(linktype, relative_path, &manifest, &src);
        if let Err(e) = fsops::link(&src, &dst, method) {
            log_link_failure(&e, relative_path);
        }
    }

    // Step 5: _cache sentinel short-circuit.
    if dist.name() == CACHE_SENTINEL_PACKAGE {
        return Ok(());
    }

    // Step 6: prefix rewrites, sorted file order.
    let mut has_prefix_sorted = manifest.has_prefix.clone();
    has_prefix_sorted.sort_by(|a, b| a.file.cmp(&b.file));
    for entry in &has_prefix_sorted {
        let target = prefix.join(&entry.file);
        rewrite::update_prefix(&target, &prefix.display().to_string(), &entry.placeholder, entry.mode)?;
    }

    // Step 7: menus.
    menu::run_for_menu_files(menu_installer, prefix, &manifest.files, false);

    // Step 8: post-link.
    let post_link_ok = script::run_script(root_prefix, prefix, None, dist, Action::PostLink)
        .map_err(|_| LinkError::ScriptFailed { action: Action::PostLink, dist: key.clone() })?;
    if !post_link_ok {
        return Err(LinkError::ScriptFailed { action: Action::PostLink, dist: key });
    }

    // Step 9: metadata.
    persist_metadata(
        cache,
        linked,
        prefix,
        dist,
        &source_dir,
        linktype,
        &manifest,
        incoming_index,
    )?;

    Ok(())
}

fn log_link_failure(error: &FsOpError, relative_path: &Path) {
    tracing::warn!(file = %relative_path.display(), error = %error, "failed to link file, continuing with remaining files");
}

#[allow(clippy::too_many_arguments)]
fn persist_metadata(
    cache: &mut PackageCacheIndex,
    linked: &mut LinkedStore,
    prefix: &Path,
    dist: &Dist,
    source_dir: &Path,
    linktype: LinkMethod,
    manifest: &Manifest,
    incoming_index: Option<Value>,
) -> std::io::Result<()> {
    let tail = dist.tail().to_string();
    let url = cache.read_url(&dist.key());
    let schannel = classify_schannel(url.as_deref());

    let files_sidecar = prefix.join("conda-meta").join(format!("{tail}.files"));
    let files: Vec<String> = if files_sidecar.exists() {
        let contents = std::fs::read_to_string(&files_sidecar)?;
        std::fs::remove_file(&files_sidecar)?;
        contents.lines().map(str::to_string).collect()
    } else {
        manifest
            .files
            .iter()
            .map(|p| p.display().to_string())
            .collect()
    };

    let has_icon_key = matches!(&incoming_index, Some(Value::Object(map)) if map.contains_key("icon"));
    let icondata = if has_icon_key { read_icon(source_dir) } else { None };

    let mut extra = std::collections::HashMap::new();
    if let Some(Value::Object(map)) = incoming_index {
        for (k, v) in map {
            if !matches!(k.as_str(), "fn" | "schannel" | "url" | "files" | "link" | "icondata") {
                extra.insert(k, v);
            }
        }
    }

    let record = LinkedRecord {
        fname: dist.archive_filename(".tar.bz2"),
        schannel,
        url,
        files,
        link: Some(LinkInfo {
            source: source_dir.display().to_string(),
            link_type: linktype.to_string(),
        }),
        icondata,
        extra,
    };

    linked.write_record(prefix, &tail, record)
}

fn read_icon(source_dir: &Path) -> Option<String> {
    let icon_path = source_dir.join("info/icon.png");
    let bytes = std::fs::read(icon_path).ok()?;
    Some(base64::engine::general_purpose::STANDARD.encode(bytes))
}

/// Probes whether hard links are usable between `pkgs_dir`'s `info/index.json` files and
/// `prefix`, by attempting one and cleaning it up. Used to pick a default link type for a batch.
pub fn try_hard_link(pkgs_dir: &Path, tail: &str, prefix: &Path) -> bool {
    let src = pkgs_dir.join(tail).join("info/index.json");
    let dst = prefix.join(format!(".tmp-{tail}"));
    if std::fs::create_dir_all(prefix).is_err() {
        return false;
    }
    let result = std::fs::hard_link(&src, &dst).is_ok();
    let _ = std::fs::remove_file(&dst);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::menu::NoopMenuInstaller;
    use std::fs;

    fn make_package(pkgs_dir: &Path, tail: &str) -> std::path::PathBuf {
        let dir = pkgs_dir.join(tail);
        fs::create_dir_all(dir.join("info")).unwrap();
        fs::create_dir_all(dir.join("bin")).unwrap();
        fs::write(dir.join("info/index.json"), "{}").unwrap();
        fs::write(dir.join("info/files"), "bin/hello\n").unwrap();
        fs::write(dir.join("bin/hello"), b"#!/bin/sh\necho hi\n").unwrap();
        dir
    }

    #[test]
    fn links_files_and_writes_metadata() {
        let cache_dir = tempfile::tempdir().unwrap();
        let prefix_dir = tempfile::tempdir().unwrap();
        make_package(cache_dir.path(), "foo-1.0-0");

        let mut cache = PackageCacheIndex::new(vec![cache_dir.path().to_path_buf()]);
        cache.add_cached_package(cache_dir.path(), "unknown/foo-1.0-0", false, false);

        let mut linked = LinkedStore::default();
        let menu_installer = NoopMenuInstaller;
        let dist = Dist::parse("foo-1.0-0").unwrap();

        link(
            &mut cache,
            &mut linked,
            &menu_installer,
            prefix_dir.path(),
            prefix_dir.path(),
            &dist,
            LinkMethod::Copy,
            None,
        )
        .unwrap();

        assert!(prefix_dir.path().join("bin/hello").exists());
        assert!(prefix_dir.path().join("conda-meta/foo-1.0-0.json").exists());
        assert_eq!(linked.linked(prefix_dir.path()), vec!["foo-1.0-0".to_string()]);
    }

    #[test]
    fn cache_sentinel_skips_rewrite_and_metadata() {
        let cache_dir = tempfile::tempdir().unwrap();
        let prefix_dir = tempfile::tempdir().unwrap();
        make_package(cache_dir.path(), "_cache-1.0-0");

        let mut cache = PackageCacheIndex::new(vec![cache_dir.path().to_path_buf()]);
        cache.add_cached_package(cache_dir.path(), "unknown/_cache-1.0-0", false, false);

        let mut linked = LinkedStore::default();
        let menu_installer = NoopMenuInstaller;
        let dist = Dist::parse("_cache-1.0-0").unwrap();

        link(
            &mut cache,
            &mut linked,
            &menu_installer,
            prefix_dir.path(),
            prefix_dir.path(),
            &dist,
            LinkMethod::Copy,
            None,
        )
        .unwrap();

        assert!(prefix_dir.path().join("bin/hello").exists());
        assert!(!prefix_dir.path().join("conda-meta/_cache-1.0-0.json").exists());
    }

    #[test]
    fn icon_is_only_read_when_incoming_index_names_it() {
        let cache_dir = tempfile::tempdir().unwrap();
        let prefix_dir = tempfile::tempdir().unwrap();
        let dir = make_package(cache_dir.path(), "foo-1.0-0");
        fs::write(dir.join("info/icon.png"), b"not-actually-a-png").unwrap();

        let mut cache = PackageCacheIndex::new(vec![cache_dir.path().to_path_buf()]);
        cache.add_cached_package(cache_dir.path(), "unknown/foo-1.0-0", false, false);
        let mut linked = LinkedStore::default();
        let menu_installer = NoopMenuInstaller;
        let dist = Dist::parse("foo-1.0-0").unwrap();

        link(
            &mut cache,
            &mut linked,
            &menu_installer,
            prefix_dir.path(),
            prefix_dir.path(),
            &dist,
            LinkMethod::Copy,
            None,
        )
        .unwrap();

        let raw = fs::read_to_string(prefix_dir.path().join("conda-meta/foo-1.0-0.json")).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert!(parsed.get("icondata").map_or(true, |v| v.is_null()));
    }

    #[test]
    fn icon_is_read_when_incoming_index_names_it() {
        let cache_dir = tempfile::tempdir().unwrap();
        let prefix_dir = tempfile::tempdir().unwrap();
        let dir = make_package(cache_dir.path(), "foo-1.0-0");
        fs::write(dir.join("info/icon.png"), b"not-actually-a-png").unwrap();

        let mut cache = PackageCacheIndex::new(vec![cache_dir.path().to_path_buf()]);
        cache.add_cached_package(cache_dir.path(), "unknown/foo-1.0-0", false, false);
        let mut linked = LinkedStore::default();
        let menu_installer = NoopMenuInstaller;
        let dist = Dist::parse("foo-1.0-0").unwrap();
        let incoming_index = serde_json::json!({"icon": "icon.png"});

        link(
            &mut cache,
            &mut linked,
            &menu_installer,
            prefix_dir.path(),
            prefix_dir.path(),
            &dist,
            LinkMethod::Copy,
            Some(incoming_index),
        )
        .unwrap();

        let raw = fs::read_to_string(prefix_dir.path().join("conda-meta/foo-1.0-0.json")).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert!(parsed.get("icondata").and_then(|v| v.as_str()).is_some());
    }

    #[test]
    fn errors_when_dist_is_not_extracted() {
        let cache_dir = tempfile::tempdir().unwrap();
        let prefix_dir = tempfile::tempdir().unwrap();
        let mut cache = PackageCacheIndex::new(vec![cache_dir.path().to_path_buf()]);
        let mut linked = LinkedStore::default();
        let menu_installer = NoopMenuInstaller;
        let dist = Dist::parse("missing-1.0-0").unwrap();

        let result = link(
            &mut cache,
            &mut linked,
            &menu_installer,
            prefix_dir.path(),
            prefix_dir.path(),
            &dist,
            LinkMethod::Copy,
            None,
        );
        assert!(matches!(result, Err(LinkError::NotExtracted(_))));
    }
}
