//! Lifecycle script runner: locates and invokes a package's pre-link/post-link/pre-unlink script.
//!
//! Grounded on `install/link_script.rs`'s `LinkScriptType`/`run_link_scripts` shape, with the
//! shell dispatch done directly via [`std::process::Command`] instead of `rattler_shell`, and the
//! environment-mutation defect from the original Python installer (see Design Notes) fixed by
//! always building a fresh map rather than touching the real process environment.

use std::collections::HashMap;
use std::path::Path;

use crate::dist::Dist;

/// Which lifecycle point a script runs at.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Action {
    /// Runs before a package's files are linked into the prefix.
    PreLink,
    /// Runs after a package's files are linked and its prefix rewrites are applied.
    PostLink,
    /// Runs before a package's files are removed from the prefix.
    PreUnlink,
}

impl Action {
    fn file_stem(self) -> &'static str {
        match self {
            Action::PreLink => "pre-link",
            Action::PostLink => "post-link",
            Action::PreUnlink => "pre-unlink",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.file_stem())
    }
}

/// Error produced while locating or running a lifecycle script.
#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    /// The script could not be spawned (shell missing, permission denied, etc).
    #[error("failed to spawn {action} script at {path}")]
    Spawn {
        /// Which lifecycle action was being run.
        action: Action,
        /// Path of the script that failed to spawn.
        path: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },
}

/// Locates the script path for `dist`'s `action` under `prefix`, following the platform-specific
/// naming convention. Does not check whether the file exists.
pub fn script_path(prefix: &Path, dist: &Dist, action: Action) -> std::path::PathBuf {
    let (name, _, _) = dist.name_version_build();
    if cfg!(windows) {
        prefix
            .join("Scripts")
            .join(format!(".{name}-{}.bat", action.file_stem()))
    } else {
        prefix
            .join("bin")
            .join(format!(".{name}-{}.sh", action.file_stem()))
    }
}

/// Runs `dist`'s `action` script under `prefix`, if present. Returns `Ok(true)` iff a script was
/// found and exited zero, `Ok(false)` if no script exists, and `Err` if the script could not be
/// spawned at all. A present-but-nonzero-exit script is reported as `Ok(false)`.
pub fn run_script(
    root_prefix: &Path,
    prefix: &Path,
    env_prefix: Option<&Path>,
    dist: &Dist,
    action: Action,
) -> Result<bool, ScriptError> {
    let path = script_path(prefix, dist, action);
    if !path.exists() {
        return Ok(true);
    }

    let (name, version, buildnum) = dist.name_version_build();
    let mut env: HashMap<String, String> = std::env::vars().collect();
    env.insert("ROOT_PREFIX".to_string(), root_prefix.display().to_string());
    env.insert(
        "PREFIX".to_string(),
        env_prefix.unwrap_or(prefix).display().to_string(),
    );
    env.insert("PKG_NAME".to_string(), name.to_string());
    env.insert("PKG_VERSION".to_string(), version.to_string());
    env.insert("PKG_BUILDNUM".to_string(), buildnum.to_string());
    if matches!(action, Action::PreLink) {
        env.insert("SOURCE_DIR".to_string(), prefix.display().to_string());
    }

    tracing::info!(%action, dist = %dist, path = %path.display(), "running lifecycle script");

    let mut command = shell_command(&path);
    command.envs(&env);

    let status = command.status().map_err(|source| ScriptError::Spawn {
        action,
        path: path.display().to_string(),
        source,
    })?;

    if !status.success() {
        tracing::warn!(%action, dist = %dist, status = %status, "lifecycle script exited non-zero");
    }
    Ok(status.success())
}

#[cfg(windows)]
fn shell_command(script: &Path) -> std::process::Command {
    let mut cmd = std::process::Command::new("cmd.exe");
    cmd.arg("/c").arg(script);
    cmd
}

#[cfg(not(windows))]
fn shell_command(script: &Path) -> std::process::Command {
    let shell = if cfg!(target_os = "freebsd") || cfg!(target_os = "openbsd") || cfg!(target_os = "netbsd") {
        "/bin/sh"
    } else {
        "/bin/bash"
    };
    let mut cmd = std::process::Command::new(shell);
    cmd.arg(script);
    cmd
}
