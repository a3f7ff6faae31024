//! The engine facade: owns configuration and the two process-wide caches, and is the single
//! entry point used by both the library's public API and the CLI driver.
//!
//! Grounded on the teacher's `InstallDriver`/`InstallDriverBuilder` (`install/driver.rs`) for the
//! "construct once, inject optional collaborators, hand out to every operation" shape, applied
//! here to instance state rather than a one-shot transaction driver.

use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::cache::PackageCacheIndex;
use crate::dist::Dist;
use crate::fsops::LinkMethod;
use crate::link::{self, LinkError};
use crate::linked_data::LinkedStore;
use crate::menu::{MenuInstaller, NoopMenuInstaller};
use crate::unlink::{self, UnlinkError};

/// Configuration injected into an [`Engine`] at construction time. The engine never reads
/// environment variables or configuration files to discover its own settings.
#[derive(Debug, Clone)]
pub struct Config {
    /// Ordered list of package-cache directories to scan; first match wins ties.
    pub pkgs_dirs: Vec<PathBuf>,
    /// The engine's own install prefix, exposed to scripts as `ROOT_PREFIX`.
    pub root_prefix: PathBuf,
    /// Retry budget for [`crate::fsops::rm_rf`] on directories.
    pub max_rmtree_retries: u32,
    /// Whether the trash fallback is attempted when a deletion cannot be completed immediately.
    pub trash_enabled: bool,
}

impl Config {
    /// A `Config` with one cache directory and `root_prefix` doubling as the package's own
    /// prefix, retry defaults, and trash enabled only on Windows.
    pub fn new(root_prefix: impl Into<PathBuf>, pkgs_dirs: Vec<PathBuf>) -> Self {
        Self {
            pkgs_dirs,
            root_prefix: root_prefix.into(),
            max_rmtree_retries: crate::fsops::DEFAULT_MAX_RETRIES,
            trash_enabled: cfg!(windows),
        }
    }

    /// Directories the trash fallback is allowed to use, or an empty slice when disabled.
    fn trash_dirs(&self) -> &[PathBuf] {
        if self.trash_enabled {
            &self.pkgs_dirs
        } else {
            &[]
        }
    }
}

/// The instance-state facade for one invocation of the library or CLI: configuration, the package
/// cache index, the per-prefix linked-metadata store, and the optional menu-installer
/// collaborator (a [`NoopMenuInstaller`] substitutes for it when none is supplied).
pub struct Engine {
    config: Config,
    cache: PackageCacheIndex,
    linked: LinkedStore,
    menu_installer: Box<dyn MenuInstaller>,
}

impl Engine {
    /// Constructs an engine from `config`, with no menu-installer collaborator.
    pub fn new(config: Config) -> Self {
        Self::with_menu_installer(config, Box::new(NoopMenuInstaller))
    }

    /// Constructs an engine from `config`, injecting `menu_installer` as the menu collaborator.
    pub fn with_menu_installer(config: Config, menu_installer: Box<dyn MenuInstaller>) -> Self {
        let cache = PackageCacheIndex::new(config.pkgs_dirs.clone());
        Self {
            config,
            cache,
            linked: LinkedStore::default(),
            menu_installer,
        }
    }

    /// The configuration this engine was constructed from.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Every distribution with an extracted directory in any configured cache directory.
    pub fn extracted_distributions(&mut self) -> Vec<String> {
        self.cache.package_cache().keys().cloned().collect()
    }

    /// Probes whether hard links are usable from `pkgs_dir` into `prefix`, using `tail` as a
    /// representative package, and returns the default link method to use for a batch:
    /// [`LinkMethod::Hardlink`] if the probe succeeds, [`LinkMethod::Copy`] otherwise.
    pub fn probe_link_type(&self, pkgs_dir: &Path, tail: &str, prefix: &Path) -> LinkMethod {
        if link::try_hard_link(pkgs_dir, tail, prefix) {
            LinkMethod::Hardlink
        } else {
            LinkMethod::Copy
        }
    }

    /// Links `dist` into `prefix` using `linktype` as the default per-file link method.
    pub fn link(
        &mut self,
        prefix: &Path,
        dist: &Dist,
        linktype: LinkMethod,
        incoming_index: Option<Value>,
    ) -> Result<(), LinkError> {
        link::link(
            &mut self.cache,
            &mut self.linked,
            self.menu_installer.as_ref(),
            &self.config.root_prefix,
            prefix,
            dist,
            linktype,
            incoming_index,
        )
    }

    /// Removes `dist` from `prefix`.
    pub fn unlink(&mut self, prefix: &Path, dist: &Dist) -> Result<(), UnlinkError> {
        unlink::unlink(
            &mut self.linked,
            self.menu_installer.as_ref(),
            &self.config.root_prefix,
            prefix,
            dist,
        )
    }

    /// Every distribution currently linked in `prefix`.
    pub fn linked(&mut self, prefix: &Path) -> Vec<String> {
        self.linked.linked(prefix)
    }

    /// Removes duplicate distributions (same package name) from `prefix`, keeping `keep_dists`
    /// and, absent any keep-set member for a name, the lexicographically greatest candidate.
    pub fn reap_duplicates(&mut self, prefix: &Path, keep_dists: &[Dist]) -> Result<Vec<Dist>, UnlinkError> {
        let linked: Vec<Dist> = self
            .linked(prefix)
            .iter()
            .filter_map(|k| Dist::parse(k).ok())
            .collect();
        let to_remove = crate::duplicates::duplicates_to_remove(&linked, keep_dists);
        for dist in &to_remove {
            tracing::info!(dist = %dist, "removing duplicate distribution");
            self.unlink(prefix, dist)?;
        }
        Ok(to_remove)
    }

    /// Best-effort removal of a path that could not be deleted immediately, honoring
    /// [`Config::trash_enabled`].
    pub fn rm_rf(&self, path: &Path) -> std::io::Result<()> {
        crate::fsops::rm_rf(path, self.config.max_rmtree_retries, self.config.trash_dirs())
    }
}
