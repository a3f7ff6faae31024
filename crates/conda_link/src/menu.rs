//! The menu-installer collaborator: an optional, injected capability for creating/removing
//! platform start-menu entries described by a package's `Menu/*.json`.
//!
//! Grounded on the teacher's pattern of injecting optional collaborators as trait objects at
//! `InstallDriver` construction time (`install/driver.rs`), generalized here into a Null Object
//! default so the link/unlink engines never need to branch on "is a menu installer configured".

use std::path::Path;

/// A collaborator capable of installing or removing a package's menu entries.
///
/// `file` is the path to a `Menu/*.json` descriptor; `remove` selects between install
/// (`false`) and removal (`true`); `prefix` is the environment the menu entry belongs to.
pub trait MenuInstaller: std::fmt::Debug {
    /// Installs or removes the menu entries described by `file`.
    fn install(&self, file: &Path, remove: bool, prefix: &Path);
}

/// The default collaborator: does nothing. Used whenever the embedding application has no menu
/// subsystem (e.g. non-interactive installs, test environments).
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMenuInstaller;

impl MenuInstaller for NoopMenuInstaller {
    fn install(&self, file: &Path, remove: bool, prefix: &Path) {
        tracing::debug!(
            file = %file.display(),
            remove,
            prefix = %prefix.display(),
            "no menu installer configured, skipping"
        );
    }
}

/// Invokes `installer` for every `Menu/*.json` descriptor present in the package's installed
/// files under `prefix`. Matching is case-insensitive (`conda/install.py`'s `mk_menus` matches
/// `f.lower().startswith('menu/')`/`f.lower().endswith('.json')`), and, mirroring that function's
/// suppression of menu entries for private environments, nothing is installed when `prefix`'s own
/// directory name starts with `_`.
pub fn run_for_menu_files(installer: &dyn MenuInstaller, prefix: &Path, files: &[std::path::PathBuf], remove: bool) {
    let prefix_is_private = prefix
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('_'));
    if prefix_is_private {
        tracing::debug!(prefix = %prefix.display(), "environment name starts with '_', skipping menu entries");
        return;
    }

    for file in files {
        let lower = file.to_string_lossy().to_lowercase();
        if lower.starts_with("menu/") && lower.ends_with(".json") {
            installer.install(&prefix.join(file), remove, prefix);
        }
    }
}
