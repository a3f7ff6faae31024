//! Parses a package's `info/` manifest files: `files`, `has_prefix`, `no_link`, and
//! `no_softlink`.
//!
//! Grounded on `conda/install.py`'s `read_has_prefix`/`read_no_link` and on the
//! `shlex.split(line, posix=False)` tokenization conda uses for the `has_prefix` file: whitespace
//! splits tokens, matching quotes delimit a token without stripping the quote characters, and
//! backslashes are ordinary characters rather than escapes (so a Windows path like
//! `C:\Users\foo\bar.sh` survives intact).

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::rewrite::{default_placeholder, RewriteMode};

/// One line of `info/has_prefix`: a file that needs its embedded placeholder rewritten.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HasPrefixEntry {
    /// Path of the affected file, relative to the installation prefix.
    pub file: PathBuf,
    /// The placeholder string embedded in the file.
    pub placeholder: String,
    /// Whether the file should be rewritten in text or binary mode.
    pub mode: RewriteMode,
}

/// The manifest files shipped inside a package's `info/` directory.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    /// Every file the package installs, relative to the prefix (from `info/files`).
    pub files: Vec<PathBuf>,
    /// Files requiring prefix placeholder substitution (from `info/has_prefix`, if present).
    pub has_prefix: Vec<HasPrefixEntry>,
    /// Files that must never be hard-linked or soft-linked from the cache — always copied (the
    /// union of `info/no_link` and `info/no_softlink`).
    pub no_link: HashSet<PathBuf>,
}

impl Manifest {
    /// Reads the manifest out of a package's extracted `info/` directory.
    pub fn read(info_dir: &Path) -> std::io::Result<Self> {
        let files = read_files(&info_dir.join("files"))?;
        let has_prefix = read_has_prefix(&info_dir.join("has_prefix"))?;
        let mut no_link = read_path_list(&info_dir.join("no_link"))?;
        no_link.extend(read_path_list(&info_dir.join("no_softlink"))?);
        Ok(Self {
            files,
            has_prefix,
            no_link,
        })
    }

    /// Whether `file` (relative to the prefix) must be copied rather than linked.
    pub fn is_no_link(&self, file: &Path) -> bool {
        self.no_link.contains(file)
    }
}

fn read_files(path: &Path) -> std::io::Result<Vec<PathBuf>> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Ok(contents
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(PathBuf::from)
            .collect()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

fn read_path_list(path: &Path) -> std::io::Result<HashSet<PathBuf>> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Ok(contents
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(PathBuf::from)
            .collect()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashSet::new()),
        Err(e) => Err(e),
    }
}

/// Parses `info/has_prefix`. Each non-empty line is either:
///
/// - `placeholder mode file` (three whitespace-separated tokens), or
/// - `file` alone, which falls back to the default placeholder and text mode.
///
/// A line that tokenizes into something other than one or three words also falls back to the
/// default placeholder and text mode applied to the line verbatim, mirroring the original
/// installer's tolerance of malformed entries.
fn read_has_prefix(path: &Path) -> std::io::Result<Vec<HasPrefixEntry>> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut out = Vec::new();
    for line in contents.lines() {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            continue;
        }
        let entry = parse_has_prefix_line(line);
        out.push(entry);
    }
    Ok(out)
}

fn parse_has_prefix_line(line: &str) -> HasPrefixEntry {
    let words = split_shell_words_posix_false(line);
    match words.len() {
        3 => HasPrefixEntry {
            placeholder: words[0].clone(),
            mode: if words[1] == "binary" {
                RewriteMode::Binary
            } else {
                RewriteMode::Text
            },
            file: PathBuf::from(&words[2]),
        },
        1 => HasPrefixEntry {
            placeholder: default_placeholder(),
            mode: RewriteMode::Text,
            file: PathBuf::from(&words[0]),
        },
        _ => HasPrefixEntry {
            placeholder: default_placeholder(),
            mode: RewriteMode::Text,
            file: PathBuf::from(line.trim()),
        },
    }
}

/// Tokenizes `line` the way Python's `shlex.split(line, posix=False)` does: whitespace separates
/// tokens, a matching pair of single or double quotes delimits a token without removing the quote
/// characters from it, and backslashes are never treated as escapes.
fn split_shell_words_posix_false(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;

    for c in line.chars() {
        if let Some(q) = quote {
            current.push(c);
            if c == q {
                quote = None;
            }
            continue;
        }
        if c == '"' || c == '\'' {
            in_token = true;
            quote = Some(c);
            current.push(c);
            continue;
        }
        if c.is_whitespace() {
            if in_token {
                tokens.push(std::mem::take(&mut current));
                in_token = false;
            }
            continue;
        }
        in_token = true;
        current.push(c);
    }
    if in_token {
        tokens.push(current);
    }
    tokens
}
