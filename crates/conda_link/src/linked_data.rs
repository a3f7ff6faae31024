//! The linked-metadata store: `conda-meta/*.json` records for a prefix.
//!
//! Grounded on `conda/install.py`'s `linked_data`/`load_linked_data`/`delete_linked_data`, adapted
//! to a per-prefix in-memory map instead of a process-wide dict keyed by prefix string.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A `conda-meta/<tail>.json` record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkedRecord {
    /// `<tail>.tar.bz2`.
    #[serde(rename = "fn")]
    pub fname: String,
    /// Channel the package was sourced from, derived from `url`.
    pub schannel: String,
    /// Source URL this package was fetched from.
    #[serde(default)]
    pub url: Option<String>,
    /// Installed files, relative to the prefix.
    #[serde(default)]
    pub files: Vec<String>,
    /// How the files were placed: source extracted-dir and link type.
    #[serde(default)]
    pub link: Option<LinkInfo>,
    /// Base64-encoded PNG icon, if the package shipped `info/icon.png`.
    #[serde(default)]
    pub icondata: Option<String>,
    /// Everything else from the incoming index entry, preserved verbatim.
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

/// The `link` sub-object of a [`LinkedRecord`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkInfo {
    /// The extracted directory this package was linked from.
    pub source: String,
    /// `"hard-link"`, `"soft-link"`, or `"copy"`.
    #[serde(rename = "type")]
    pub link_type: String,
}

/// Derives a record's channel from its `url` field: the path segment three places from the end
/// (`.../<channel>/<platform>/<file>`), or `"defaults"` if the URL is absent/unrecognized.
pub fn classify_schannel(url: Option<&str>) -> String {
    let Some(url) = url else {
        return crate::dist::DEFAULT_CHANNEL.to_string();
    };
    let segments: Vec<&str> = url.split('/').filter(|s| !s.is_empty()).collect();
    if segments.len() >= 3 {
        let channel = segments[segments.len() - 3];
        if channel != "defaults" && channel != "pkgs" {
            return channel.to_string();
        }
    }
    crate::dist::DEFAULT_CHANNEL.to_string()
}

/// Per-prefix, in-memory view of `conda-meta/*.json`. Loaded lazily, one prefix at a time.
#[derive(Debug, Default)]
pub struct LinkedStore {
    prefixes: HashMap<PathBuf, HashMap<String, LinkedRecord>>,
}

impl LinkedStore {
    /// Returns the map of distribution key → record for `prefix`, loading every
    /// `conda-meta/*.json` on first access.
    pub fn linked_data(&mut self, prefix: &Path) -> &HashMap<String, LinkedRecord> {
        if !self.prefixes.contains_key(prefix) {
            let loaded = self.scan(prefix);
            self.prefixes.insert(prefix.to_path_buf(), loaded);
        }
        self.prefixes.get(prefix).expect("just inserted")
    }

    fn scan(&self, prefix: &Path) -> HashMap<String, LinkedRecord> {
        let mut out = HashMap::new();
        let meta_dir = prefix.join("conda-meta");
        let Ok(entries) = std::fs::read_dir(&meta_dir) else {
            return out;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(tail) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Ok(record) = read_record(&path) {
                let schannel = record.schannel.clone();
                let key = if schannel == crate::dist::DEFAULT_CHANNEL {
                    tail.to_string()
                } else {
                    format!("{schannel}::{tail}")
                };
                out.insert(key, record);
            }
        }
        out
    }

    /// Loads (or re-registers) the record for `dist` under `prefix`. If `record` is not supplied,
    /// reads `<prefix>/conda-meta/<tail>.json` from disk and derives `schannel` from its `url`.
    pub fn load_linked_data(
        &mut self,
        prefix: &Path,
        tail: &str,
        record: Option<LinkedRecord>,
    ) -> std::io::Result<()> {
        let record = match record {
            Some(r) => r,
            None => read_record(&prefix.join("conda-meta").join(format!("{tail}.json")))?,
        };
        let schannel = record.schannel.clone();
        let key = if schannel == crate::dist::DEFAULT_CHANNEL {
            tail.to_string()
        } else {
            format!("{schannel}::{tail}")
        };
        self.prefixes
            .entry(prefix.to_path_buf())
            .or_default()
            .insert(key, record);
        Ok(())
    }

    /// Drops `dist`'s record from memory, and from disk when `delete` is true.
    pub fn delete_linked_data(&mut self, prefix: &Path, dist: &str, delete: bool) -> std::io::Result<()> {
        self.linked_data(prefix); // ensure loaded
        if let Some(map) = self.prefixes.get_mut(prefix) {
            map.remove(dist);
        }
        if delete {
            let tail = dist.rsplit("::").next().unwrap_or(dist);
            let path = prefix.join("conda-meta").join(format!("{tail}.json"));
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Convenience accessor: the record for `dist` under `prefix`, if linked.
    pub fn load_meta(&mut self, prefix: &Path, dist: &str) -> Option<&LinkedRecord> {
        self.linked_data(prefix);
        self.prefixes.get(prefix).and_then(|m| m.get(dist))
    }

    /// Convenience accessor: every distribution key currently linked in `prefix`.
    pub fn linked(&mut self, prefix: &Path) -> Vec<String> {
        self.linked_data(prefix).keys().cloned().collect()
    }

    /// Writes `record` to `<prefix>/conda-meta/<tail>.json` (pretty-printed, keys sorted) and
    /// updates the in-memory store.
    pub fn write_record(&mut self, prefix: &Path, tail: &str, record: LinkedRecord) -> std::io::Result<()> {
        let meta_dir = prefix.join("conda-meta");
        std::fs::create_dir_all(&meta_dir)?;
        let sorted = sorted_keys_json(&record)?;
        std::fs::write(meta_dir.join(format!("{tail}.json")), sorted)?;
        self.load_linked_data(prefix, tail, Some(record))?;
        Ok(())
    }
}

fn read_record(path: &Path) -> std::io::Result<LinkedRecord> {
    let contents = std::fs::read_to_string(path)?;
    serde_json::from_str(&contents)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

fn sorted_keys_json(record: &LinkedRecord) -> std::io::Result<String> {
    let value = serde_json::to_value(record)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let sorted: std::collections::BTreeMap<String, Value> = match value {
        Value::Object(map) => map.into_iter().collect(),
        _ => Default::default(),
    };
    serde_json::to_string_pretty(&sorted)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}
