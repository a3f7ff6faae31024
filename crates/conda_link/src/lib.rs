//! A package linking engine for an environment-based package manager: given an on-disk cache of
//! extracted packages, materializes a package into a target environment prefix, runs its
//! lifecycle scripts, rewrites embedded absolute-path placeholders to the prefix, and records the
//! metadata needed to undo the operation later.
//!
//! [`Engine`] is the entry point: construct it from a [`Config`] and call [`Engine::link`] /
//! [`Engine::unlink`].

pub mod cache;
pub mod dist;
pub mod duplicates;
pub mod engine;
pub mod fsops;
pub mod link;
pub mod linked_data;
pub mod lock;
pub mod manifest;
pub mod menu;
pub mod rewrite;
pub mod script;
pub mod trash;
pub mod unlink;

pub use cache::{CacheRecord, PackageCacheIndex};
pub use dist::{Dist, ParseDistError};
pub use duplicates::duplicates_to_remove;
pub use engine::{Config, Engine};
pub use fsops::{FsOpError, LinkMethod};
pub use link::LinkError;
pub use linked_data::{LinkedRecord, LinkedStore};
pub use lock::{LockError, Locked};
pub use manifest::Manifest;
pub use menu::{MenuInstaller, NoopMenuInstaller};
pub use rewrite::{RewriteError, RewriteMode};
pub use script::{Action as ScriptAction, ScriptError};
pub use unlink::UnlinkError;
