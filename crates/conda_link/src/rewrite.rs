//! The prefix rewriter: replaces a placeholder absolute path baked into an installed file with
//! the real installation prefix, in either text or binary mode.
//!
//! Grounded on `conda/install.py`'s `update_prefix`/`binary_replace`, carried into the idiomatic
//! shape of `install/link.rs` (unlink-before-rewrite to avoid mutating a hard-linked cache
//! original, permission-bit preservation).

use std::path::Path;

/// The default placeholder baked in by the original installer. Assembled from parts so that
/// running this engine over its own source tree would not accidentally match the literal.
pub fn default_placeholder() -> String {
    let mut s = String::from("/opt/anaconda1anaconda2");
    s.push_str("anaconda3");
    s
}

/// How a file's embedded placeholder should be rewritten.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum RewriteMode {
    /// Plain byte substring replace; the file may change length.
    Text,
    /// Null-terminated-run replace; the file's length is preserved via NUL padding.
    Binary,
}

/// Error produced while rewriting a file's placeholder.
#[derive(Debug, thiserror::Error)]
pub enum RewriteError {
    /// The replacement prefix does not fit into one or more null-terminated runs that contain the
    /// placeholder: the placeholder is too short to hold the new, longer prefix.
    #[error("placeholder '{placeholder}' is too short to hold prefix '{replacement}' in {path}")]
    PaddingError {
        /// The file being rewritten.
        path: String,
        /// The placeholder that could not be padded.
        placeholder: String,
        /// The prefix that didn't fit.
        replacement: String,
    },

    /// An I/O error occurred while reading or rewriting the file.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Performs the text-mode byte substring replacement of `placeholder` with `replacement`.
pub fn text_replace(data: &[u8], placeholder: &[u8], replacement: &[u8]) -> Vec<u8> {
    if placeholder.is_empty() {
        return data.to_vec();
    }
    let mut out = Vec::with_capacity(data.len());
    let mut rest = data;
    while let Some(pos) = memchr::memmem::find(rest, placeholder) {
        out.extend_from_slice(&rest[..pos]);
        out.extend_from_slice(replacement);
        rest = &rest[pos + placeholder.len()..];
    }
    out.extend_from_slice(rest);
    out
}

/// Performs the binary-mode, length-preserving replacement.
///
/// For each maximal run matching `placeholder (non-NUL)* NUL`, every occurrence of `placeholder`
/// inside the run is replaced with `replacement`, and the run's tail is padded with NUL bytes so
/// the run's total length (and thus the file's total length) is unchanged.
pub fn binary_replace(
    data: &[u8],
    placeholder: &[u8],
    replacement: &[u8],
) -> Result<Vec<u8>, String> {
    if placeholder.is_empty() {
        return Ok(data.to_vec());
    }
    let mut out = Vec::with_capacity(data.len());
    let mut cursor = 0usize;

    while cursor < data.len() {
        match memchr::memmem::find(&data[cursor..], placeholder) {
            None => {
                out.extend_from_slice(&data[cursor..]);
                break;
            }
            Some(rel_start) => {
                let run_start = cursor + rel_start;
                // Find the end of this maximal run: the next NUL at or after run_start.
                let Some(rel_nul) = memchr::memchr(0, &data[run_start..]) else {
                    // No terminating NUL: not a valid has_prefix run, copy the remainder verbatim.
                    out.extend_from_slice(&data[cursor..]);
                    break;
                };
                let run_end = run_start + rel_nul; // index of the NUL byte itself
                let run = &data[run_start..run_end];

                out.extend_from_slice(&data[cursor..run_start]);

                let occurrences = count_occurrences(run, placeholder);
                let padding = (placeholder.len() as i64 - replacement.len() as i64) * occurrences as i64;
                if padding < 0 {
                    return Err(format!(
                        "replacement is {} bytes too long to fit {} occurrence(s) of the placeholder",
                        -padding, occurrences
                    ));
                }
                let replaced = text_replace(run, placeholder, replacement);
                out.extend_from_slice(&replaced);
                out.extend(std::iter::repeat(0u8).take(padding as usize));
                out.push(0); // the run's terminating NUL
                cursor = run_end + 1;
            }
        }
    }

    debug_assert_eq!(out.len(), data.len());
    Ok(out)
}

fn count_occurrences(haystack: &[u8], needle: &[u8]) -> usize {
    memchr::memmem::find_iter(haystack, needle).count()
}

/// Rewrites the file at `path` in place, replacing `placeholder` with `new_prefix`.
///
/// The file is unlinked before the new contents are written, so that a file shared via a hard
/// link with the package cache is never mutated in place. Permission bits are preserved across
/// the rewrite. On Windows, if `placeholder` uses unix-style separators, `new_prefix` is
/// normalized to unix-style before substitution.
pub fn update_prefix(
    path: &Path,
    new_prefix: &str,
    placeholder: &str,
    mode: RewriteMode,
) -> Result<(), RewriteError> {
    let new_prefix = normalize_prefix_for_platform(placeholder, new_prefix);

    let data = std::fs::read(path)?;
    let new_data = match mode {
        RewriteMode::Text => text_replace(&data, placeholder.as_bytes(), new_prefix.as_bytes()),
        RewriteMode::Binary => {
            binary_replace(&data, placeholder.as_bytes(), new_prefix.as_bytes()).map_err(|_| {
                RewriteError::PaddingError {
                    path: path.display().to_string(),
                    placeholder: placeholder.to_string(),
                    replacement: new_prefix.clone(),
                }
            })?
        }
    };

    if new_data == data {
        return Ok(());
    }

    let permissions = std::fs::metadata(path)?.permissions();

    // Unlink before rewriting: this is the correctness invariant that keeps a hard-linked cache
    // original untouched, not merely an optimization.
    std::fs::remove_file(path)?;
    std::fs::write(path, &new_data)?;
    std::fs::set_permissions(path, permissions)?;

    Ok(())
}

#[cfg(windows)]
fn normalize_prefix_for_platform(placeholder: &str, new_prefix: &str) -> String {
    if placeholder.contains('/') {
        new_prefix.replace('\\', "/")
    } else {
        new_prefix.to_string()
    }
}

#[cfg(not(windows))]
fn normalize_prefix_for_platform(_placeholder: &str, new_prefix: &str) -> String {
    new_prefix.to_string()
}
