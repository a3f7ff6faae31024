//! The distribution key (`dist`): `[<schannel>::]<name>-<version>-<build>`.
//!
//! Grounded on `conda/install.py`'s `_dist2pair`, `name_dist` and `_dist2filename`.

use std::cmp::Ordering;
use std::fmt;

/// The implicit default channel. Never encoded in a [`Dist`]'s textual form.
pub const DEFAULT_CHANNEL: &str = "defaults";

/// A parsed, channel-qualified distribution key.
///
/// Displays back to exactly the string it was parsed from (channel prefix omitted when it is the
/// default channel).
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct Dist {
    /// The channel the package was sourced from. `"defaults"` when the key carried no `::` prefix.
    schannel: String,
    /// The bare tail: `<name>-<version>-<build>`, without any channel prefix.
    tail: String,
}

/// Error returned when a string cannot be parsed as a [`Dist`].
#[derive(Debug, thiserror::Error)]
pub enum ParseDistError {
    /// The tail did not contain the two `-` separators required to delimit name/version/build.
    #[error("'{0}' is not a valid distribution key (expected <name>-<version>-<build>)")]
    MissingFields(String),
}

impl Dist {
    /// Parses a distribution key of the form `[<schannel>::]<name>-<version>-<build>`.
    pub fn parse(s: &str) -> Result<Self, ParseDistError> {
        let (schannel, tail) = match s.split_once("::") {
            Some((ch, tail)) => (ch.to_string(), tail.to_string()),
            None => (DEFAULT_CHANNEL.to_string(), s.to_string()),
        };
        if name_from_tail(&tail).is_none() {
            return Err(ParseDistError::MissingFields(s.to_string()));
        }
        Ok(Self { schannel, tail })
    }

    /// Constructs a `Dist` directly from a channel and a tail, without re-parsing.
    pub fn from_parts(schannel: impl Into<String>, tail: impl Into<String>) -> Self {
        Self {
            schannel: schannel.into(),
            tail: tail.into(),
        }
    }

    /// The channel this distribution was sourced from (`"defaults"` if none was encoded).
    pub fn schannel(&self) -> &str {
        &self.schannel
    }

    /// The bare `<name>-<version>-<build>` tail, with no channel prefix.
    pub fn tail(&self) -> &str {
        &self.tail
    }

    /// True iff this distribution carries a non-default channel prefix.
    pub fn has_explicit_channel(&self) -> bool {
        self.schannel != DEFAULT_CHANNEL
    }

    /// The channel-prefix string used to disambiguate a key in the cache index: empty for the
    /// default channel, `"<schannel>::"` otherwise.
    pub fn channel_prefix(&self) -> String {
        if self.has_explicit_channel() {
            format!("{}::", self.schannel)
        } else {
            String::new()
        }
    }

    /// The package name: the tail with the trailing `-<version>-<build>` removed.
    pub fn name(&self) -> &str {
        name_from_tail(&self.tail).expect("tail was validated at construction")
    }

    /// The full key as it should be used as a map key / on-disk lookup key:
    /// `<channel_prefix><tail>`.
    pub fn key(&self) -> String {
        format!("{}{}", self.channel_prefix(), self.tail)
    }

    /// The archive file name: `<tail>.tar.bz2` (or a custom suffix).
    pub fn archive_filename(&self, suffix: &str) -> String {
        format!("{}{}", self.tail, suffix)
    }

    /// The metadata file name: `<tail>.json`.
    pub fn meta_filename(&self) -> String {
        self.archive_filename(".json")
    }

    /// The three `-`-separated fields at the end of the tail: `(name, version, build)`.
    pub fn name_version_build(&self) -> (&str, &str, &str) {
        let mut parts = self.tail.rsplitn(3, '-');
        let build = parts.next().expect("validated");
        let version = parts.next().expect("validated");
        let name = parts.next().expect("validated");
        (name, version, build)
    }
}

fn name_from_tail(tail: &str) -> Option<&str> {
    let mut parts = tail.rsplitn(3, '-');
    let _build = parts.next()?;
    let _version = parts.next()?;
    let name = parts.next()?;
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

impl fmt::Display for Dist {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.channel_prefix(), self.tail)
    }
}

/// Distributions sort lexicographically on their full (channel-qualified) key.
impl Ord for Dist {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl PartialOrd for Dist {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_dist_is_stable_under_channel_prefix() {
        let a = Dist::parse("ch::foo-1.0-0").unwrap();
        let b = Dist::parse("foo-1.0-0").unwrap();
        assert_eq!(a.name(), "foo");
        assert_eq!(b.name(), "foo");
        assert_eq!(a.name(), b.name());
    }

    #[test]
    fn dist2pair_defaults_channel() {
        let d = Dist::parse("foo-1.0-0").unwrap();
        assert_eq!(d.schannel(), "defaults");
        assert_eq!(d.tail(), "foo-1.0-0");
    }

    #[test]
    fn dist2pair_explicit_channel() {
        let d = Dist::parse("ch::foo-1.0-0").unwrap();
        assert_eq!(d.schannel(), "ch");
        assert_eq!(d.tail(), "foo-1.0-0");
    }

    #[test]
    fn key_roundtrips_display() {
        for s in ["foo-1.0-0", "ch::foo-1.0-0", "numpy-1.6.2-py26_0"] {
            let d = Dist::parse(s).unwrap();
            assert_eq!(d.to_string(), s);
            assert_eq!(d.key(), s);
        }
    }

    #[test]
    fn archive_and_meta_filenames() {
        let d = Dist::parse("ch::foo-1.0-0").unwrap();
        assert_eq!(d.archive_filename(".tar.bz2"), "foo-1.0-0.tar.bz2");
        assert_eq!(d.meta_filename(), "foo-1.0-0.json");
    }

    #[test]
    fn sort_order_is_lexicographic_on_full_key() {
        let mut dists = ["foo-2-0", "ch::foo-1-0", "bar-1-0"]
            .iter()
            .map(|s| Dist::parse(s).unwrap())
            .collect::<Vec<_>>();
        dists.sort();
        let keys = dists.iter().map(Dist::key).collect::<Vec<_>>();
        assert_eq!(keys, vec!["bar-1-0", "ch::foo-1-0", "foo-2-0"]);
    }

    #[test]
    fn rejects_malformed_tail() {
        assert!(Dist::parse("not-a-dist").is_ok()); // three hyphen-separated fields is sufficient
        assert!(Dist::parse("onlyname").is_err());
        assert!(Dist::parse("ch::onlyname").is_err());
    }
}
