//! The package cache index: an in-memory map from distribution key to cache record, bootstrapped
//! from one or more on-disk cache directories and their `urls.txt` files.
//!
//! Grounded on `conda/install.py`'s `package_cache`/`add_cached_package`/`find_new_location`, with
//! the reentrancy sentinel replaced by an explicit state machine per the engine's design notes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::dist::Dist;
use crate::lock::Locked;

/// Per-distribution cache bookkeeping: the archives, extracted directories, and source URLs known
/// for this key, each in discovery order.
#[derive(Debug, Clone, Default)]
pub struct CacheRecord {
    /// Archive paths (e.g. `<tail>.tar.bz2`) known to exist for this distribution.
    pub files: Vec<PathBuf>,
    /// Extracted directory paths known to exist for this distribution.
    pub dirs: Vec<PathBuf>,
    /// Source URLs this distribution was seen at, most-trusted first.
    pub urls: Vec<String>,
}

impl CacheRecord {
    fn push_file(&mut self, path: PathBuf) {
        if !self.files.contains(&path) {
            self.files.push(path);
        }
    }

    fn push_dir(&mut self, path: PathBuf) {
        if !self.dirs.contains(&path) {
            self.dirs.push(path);
        }
    }

    fn push_url(&mut self, url: String) {
        if !self.urls.contains(&url) {
            self.urls.push(url);
        }
    }
}

#[derive(Debug, Default)]
enum State {
    #[default]
    Uninitialized,
    Initializing,
    Ready,
}

/// In-memory index over one or more package-cache directories.
///
/// Bootstraps lazily: the first call to [`PackageCacheIndex::package_cache`] scans every
/// configured directory. The `Initializing` state exists purely to stop `add_cached_package`
/// (called during bootstrap) from triggering a second, recursive bootstrap.
#[derive(Debug, Default)]
pub struct PackageCacheIndex {
    pkgs_dirs: Vec<PathBuf>,
    records: HashMap<String, CacheRecord>,
    fname_table: HashMap<PathBuf, String>,
    state: State,
}

impl PackageCacheIndex {
    /// Creates an index over the given ordered list of cache directories. Nothing is scanned yet.
    pub fn new(pkgs_dirs: Vec<PathBuf>) -> Self {
        Self {
            pkgs_dirs,
            records: HashMap::new(),
            fname_table: HashMap::new(),
            state: State::Uninitialized,
        }
    }

    /// Returns the full index, scanning configured directories on first call.
    pub fn package_cache(&mut self) -> &HashMap<String, CacheRecord> {
        if matches!(self.state, State::Uninitialized) {
            self.bootstrap();
        }
        &self.records
    }

    fn bootstrap(&mut self) {
        self.state = State::Initializing;
        let pkgs_dirs = self.pkgs_dirs.clone();
        for pkgs_dir in &pkgs_dirs {
            self.bootstrap_one(pkgs_dir);
        }
        self.state = State::Ready;
    }

    fn bootstrap_one(&mut self, pkgs_dir: &Path) {
        let urls_txt = pkgs_dir.join("urls.txt");
        if let Ok(contents) = std::fs::read_to_string(&urls_txt) {
            // Earlier lines win ties: process in reverse so later `add_cached_package` upserts
            // (which only append-if-absent) never displace an earlier URL's position.
            for line in contents.lines().rev() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                self.add_cached_package(pkgs_dir, line, false, false);
            }
        }

        let Ok(entries) = std::fs::read_dir(pkgs_dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let is_archive = path.extension().is_some_and(|e| e == "bz2")
                && path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .map(|s| s.ends_with(".tar"))
                    .unwrap_or(false);
            let is_extracted_dir = path.is_dir()
                && path.join("info/files").exists()
                && path.join("info/index.json").exists();
            if !is_archive && !is_extracted_dir {
                continue;
            }
            let pseudo_url = format!("unknown/{}", file_stem_dist(&path));
            self.add_cached_package(pkgs_dir, &pseudo_url, false, false);
        }
    }

    /// Registers a cache entry derived from `url`, whose last path segment (minus `.tar.bz2`) is
    /// the distribution key. Existing/missing archive and extracted-directory paths are probed on
    /// disk; `overwrite` forces re-probing even if a record already exists.
    pub fn add_cached_package(
        &mut self,
        pkgs_dir: &Path,
        url: &str,
        overwrite: bool,
        record_in_urls_txt: bool,
    ) {
        let stripped_url = strip_auth_token(url);
        let tail = last_segment_without_suffix(&stripped_url, ".tar.bz2");
        let archive_path = pkgs_dir.join(format!("{tail}.tar.bz2"));

        // Mirrors the original's `if not overwrite and xpkg in fname_table: return` — an archive
        // already registered (under whatever channel first claimed it) is left alone, so a later
        // pass over the same directory (e.g. the unknown/ directory scan following urls.txt) can't
        // split one distribution across two differently-keyed records.
        if !overwrite && self.fname_table.contains_key(&archive_path) {
            return;
        }

        let channel_prefix = classify_channel_prefix(&stripped_url);
        let key = format!("{channel_prefix}{tail}");

        let dir_path = pkgs_dir.join(&tail);
        let dir_is_extracted =
            dir_path.join("info/files").exists() && dir_path.join("info/index.json").exists();

        if overwrite {
            self.records.remove(&key);
        }

        let record = self.records.entry(key).or_default();
        if archive_path.exists() {
            record.push_file(archive_path.clone());
            self.fname_table
                .insert(archive_path, channel_prefix.clone());
        }
        if dir_is_extracted {
            record.push_dir(dir_path);
        }
        record.push_url(stripped_url.clone());

        if record_in_urls_txt {
            let _ = append_line(&pkgs_dir.join("urls.txt"), &stripped_url);
        }
    }

    /// First known archive path for `dist`, if any.
    pub fn fetched(&mut self, dist: &str) -> Option<PathBuf> {
        self.package_cache();
        self.records.get(dist).and_then(|r| r.files.first().cloned())
    }

    /// First known extracted directory for `dist`, if any.
    pub fn extracted(&mut self, dist: &str) -> Option<PathBuf> {
        self.package_cache();
        self.records.get(dist).and_then(|r| r.dirs.first().cloned())
    }

    /// Whether `dist` has a known archive.
    pub fn is_fetched(&mut self, dist: &str) -> bool {
        self.fetched(dist).is_some()
    }

    /// Whether `dist` has a known extracted directory.
    pub fn is_extracted(&mut self, dist: &str) -> bool {
        self.extracted(dist).is_some()
    }

    /// First known source URL for `dist`, if any.
    pub fn read_url(&mut self, dist: &str) -> Option<String> {
        self.package_cache();
        self.records.get(dist).and_then(|r| r.urls.first().cloned())
    }

    /// Removes the cached archive (and the whole record) for `dist`, under a directory lock.
    pub fn rm_fetched(&mut self, pkgs_dir: &Path, dist: &str) -> std::io::Result<()> {
        let _lock = Locked::acquire(pkgs_dir)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        self.package_cache();
        if let Some(record) = self.records.get(dist) {
            for file in &record.files {
                crate::fsops::rm_rf(file, crate::fsops::DEFAULT_MAX_RETRIES, &[])?;
                self.fname_table.remove(file);
            }
        }
        self.records.remove(dist);
        Ok(())
    }

    /// Removes the extracted directory for `dist`, under a directory lock. The record is kept
    /// (archives, if any, remain registered) but its `dirs` entries are cleared.
    pub fn rm_extracted(&mut self, pkgs_dir: &Path, dist: &str) -> std::io::Result<()> {
        let _lock = Locked::acquire(pkgs_dir)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        self.package_cache();
        if let Some(record) = self.records.get_mut(dist) {
            for dir in std::mem::take(&mut record.dirs) {
                crate::fsops::rm_rf(&dir, crate::fsops::DEFAULT_MAX_RETRIES, &[])?;
            }
        }
        Ok(())
    }

    /// Extracts the first known archive for `dist` into `pkgs_dir/<tail>`, under a directory lock.
    /// Removes any stale directory first. On POSIX, if running as root, applies a
    /// no-same-owner policy by chowning every extracted entry to `(0, 0)`.
    pub fn extract(&mut self, pkgs_dir: &Path, dist: &str, tail: &str) -> std::io::Result<PathBuf> {
        let _lock = Locked::acquire(pkgs_dir)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        self.package_cache();

        let archive = self
            .records
            .get(dist)
            .and_then(|r| r.files.first().cloned())
            .ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::NotFound, "no archive cached for dist")
            })?;

        let dest = pkgs_dir.join(tail);
        crate::fsops::rm_rf(&dest, crate::fsops::DEFAULT_MAX_RETRIES, &[])?;
        extract_archive(&archive, &dest)?;

        #[cfg(unix)]
        apply_no_same_owner_policy(&dest);

        self.add_cached_package(pkgs_dir, &format!("unknown/{tail}"), true, false);
        Ok(dest)
    }

    /// Finds where `dist` should be placed: if already cached, returns its current directory and
    /// no disambiguating name hint. Otherwise performs two passes over the configured directories:
    /// the first prefers one where the archive filename isn't already claimed by another channel;
    /// the second accepts the first configured directory unconditionally ("last one wins" is
    /// preserved deliberately, see the engine's design notes).
    pub fn find_new_location(&mut self, dist: &Dist) -> (PathBuf, Option<String>) {
        self.package_cache();
        let key = dist.key();
        if let Some(record) = self.records.get(&key) {
            if let Some(existing) = record.dirs.first().or_else(|| record.files.first()) {
                if let Some(parent) = existing.parent() {
                    return (parent.to_path_buf(), None);
                }
            }
        }

        let fname = dist.archive_filename(".tar.bz2");
        for pkgs_dir in &self.pkgs_dirs {
            let candidate = pkgs_dir.join(&fname);
            let claimed_by_other_channel = self
                .fname_table
                .get(&candidate)
                .is_some_and(|prefix| *prefix != dist.channel_prefix());
            if !claimed_by_other_channel {
                return (pkgs_dir.clone(), None);
            }
        }

        let fallback = self
            .pkgs_dirs
            .first()
            .cloned()
            .unwrap_or_else(|| PathBuf::from("."));
        (fallback, Some(dist.key()))
    }
}

fn file_stem_dist(path: &Path) -> String {
    if path.is_dir() {
        path.file_name().and_then(|s| s.to_str()).unwrap_or("").to_string()
    } else {
        let name = path.file_name().and_then(|s| s.to_str()).unwrap_or("");
        name.strip_suffix(".tar.bz2").unwrap_or(name).to_string()
    }
}

fn last_segment_without_suffix(url: &str, suffix: &str) -> String {
    let segment = url.rsplit('/').next().unwrap_or(url);
    segment.strip_suffix(suffix).unwrap_or(segment).to_string()
}

/// Strips a binstar/anaconda.org auth token segment (`/t/<token>/`) from a URL.
fn strip_auth_token(url: &str) -> String {
    if let Some(pos) = url.find("/t/") {
        let after = &url[pos + 3..];
        if let Some(slash) = after.find('/') {
            return format!("{}{}", &url[..pos], &after[slash..]);
        }
    }
    url.to_string()
}

/// Classifies the channel-prefix string used to key a cache entry, from a source URL. Anything
/// under `unknown/` or with no recognizable channel segment is the default (no prefix).
fn classify_channel_prefix(url: &str) -> String {
    if url.starts_with("unknown/") || url.starts_with("unknown") {
        return String::new();
    }
    // A non-default channel is any URL whose second-to-last path segment isn't a standard
    // platform subdir (linux-64, noarch, etc) sitting directly under a known-default host. We
    // take the pragmatic route here: the caller (engine) passes a URL already rooted at the
    // channel, so the channel name is the path segment three places from the end
    // (.../<channel>/<platform>/<file>).
    let segments: Vec<&str> = url.split('/').filter(|s| !s.is_empty()).collect();
    if segments.len() >= 3 {
        let channel = segments[segments.len() - 3];
        if channel != "defaults" && channel != "pkgs" {
            return format!("{channel}::");
        }
    }
    String::new()
}

fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(file, "{line}")
}

/// Unpacks a `.tar.bz2` package archive into `dest`. Grounded on
/// `rattler_package_streaming::read::extract_tar_bz2` (bzip2-decompress, then `tar::unpack`).
fn extract_archive(archive: &Path, dest: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dest)?;
    let file = std::fs::File::open(archive)?;
    tar::Archive::new(bzip2::read::BzDecoder::new(file)).unpack(dest)
}

#[cfg(unix)]
fn apply_no_same_owner_policy(root: &Path) {
    if !nix_is_root() {
        return;
    }
    if let Ok(entries) = walkdir_simple(root) {
        for entry in entries {
            let _ = chown_root(&entry);
        }
    }
}

#[cfg(unix)]
fn nix_is_root() -> bool {
    // SAFETY: getuid has no preconditions and never fails.
    unsafe { libc::getuid() == 0 }
}

#[cfg(unix)]
fn walkdir_simple(root: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut out = vec![root.to_path_buf()];
    if root.is_dir() {
        for entry in std::fs::read_dir(root)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                out.extend(walkdir_simple(&path)?);
            } else {
                out.push(path);
            }
        }
    }
    Ok(out)
}

#[cfg(unix)]
fn chown_root(path: &Path) -> std::io::Result<()> {
    use std::os::unix::ffi::OsStrExt;
    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    // SAFETY: c_path is a valid NUL-terminated string for the lifetime of this call.
    let rc = unsafe { libc::chown(c_path.as_ptr(), 0, 0) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn make_extracted_dist(pkgs_dir: &Path, tail: &str) {
        let dir = pkgs_dir.join(tail);
        fs::create_dir_all(dir.join("info")).unwrap();
        fs::write(dir.join("info/files"), "bin/a\n").unwrap();
        fs::write(dir.join("info/index.json"), "{}").unwrap();
    }

    fn write_tar_bz2(path: &Path, entries: &[(&str, &[u8])]) {
        let file = fs::File::create(path).unwrap();
        let mut tar_builder = tar::Builder::new(bzip2::write::BzEncoder::new(
            file,
            bzip2::Compression::fast(),
        ));
        for (name, contents) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            tar_builder.append_data(&mut header, *name, *contents).unwrap();
        }
        tar_builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn extract_unpacks_a_real_tar_bz2_archive() {
        let cache = tempfile::tempdir().unwrap();
        write_tar_bz2(
            &cache.path().join("foo-1.0-0.tar.bz2"),
            &[
                ("info/index.json", b"{}"),
                ("info/files", b"bin/hello\n"),
                ("bin/hello", b"echo hi\n"),
            ],
        );

        let mut index = PackageCacheIndex::new(vec![cache.path().to_path_buf()]);
        index.add_cached_package(cache.path(), "unknown/foo-1.0-0", false, false);
        let dest = index
            .extract(cache.path(), "foo-1.0-0", "foo-1.0-0")
            .unwrap();

        assert_eq!(fs::read(dest.join("bin/hello")).unwrap(), b"echo hi\n");
        assert_eq!(fs::read_to_string(dest.join("info/files")).unwrap(), "bin/hello\n");
    }

    #[test]
    fn bootstraps_from_urls_txt_and_unknown_dirs() {
        let cache = tempfile::tempdir().unwrap();
        make_extracted_dist(cache.path(), "foo-1.0-0");
        fs::write(cache.path().join("foo-1.0-0.tar.bz2"), b"archive").unwrap();
        fs::write(
            cache.path().join("urls.txt"),
            "https://repo.example/linux-64/foo-1.0-0.tar.bz2\n",
        )
        .unwrap();

        let mut index = PackageCacheIndex::new(vec![cache.path().to_path_buf()]);
        // The urls.txt entry claims the channel-qualified key first; the later unknown/
        // directory-scan pass sees the same archive already in `fname_table` and must not split
        // the distribution into a second, bare-keyed record.
        assert!(index.is_extracted("repo.example::foo-1.0-0"));
        assert!(!index.package_cache().contains_key("foo-1.0-0"));
        assert_eq!(
            index.read_url("repo.example::foo-1.0-0").unwrap(),
            "https://repo.example/linux-64/foo-1.0-0.tar.bz2"
        );
    }

    #[test]
    fn add_cached_package_is_idempotent() {
        let cache = tempfile::tempdir().unwrap();
        make_extracted_dist(cache.path(), "foo-1.0-0");
        let mut index = PackageCacheIndex::new(vec![cache.path().to_path_buf()]);
        index.add_cached_package(cache.path(), "unknown/foo-1.0-0", false, false);
        index.add_cached_package(cache.path(), "unknown/foo-1.0-0", false, false);
        let record = index.package_cache().get("foo-1.0-0").unwrap();
        assert_eq!(record.urls.len(), 1);
    }

    #[test]
    fn find_new_location_prefers_unclaimed_directory() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let mut index = PackageCacheIndex::new(vec![
            dir_a.path().to_path_buf(),
            dir_b.path().to_path_buf(),
        ]);
        let dist = Dist::parse("foo-1.0-0").unwrap();
        let (chosen, hint) = index.find_new_location(&dist);
        assert_eq!(chosen, dir_a.path());
        assert!(hint.is_none());
    }

    #[test]
    fn strips_binstar_auth_token() {
        let url = "https://conda.anaconda.org/t/secret-token/defaults/linux-64/foo-1.0-0.tar.bz2";
        let stripped = strip_auth_token(url);
        assert_eq!(
            stripped,
            "https://conda.anaconda.org/defaults/linux-64/foo-1.0-0.tar.bz2"
        );
    }
}
