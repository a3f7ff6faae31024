//! The duplicate reaper: given a set of linked distributions and an inviolable keep-set, decides
//! which duplicates (same package name, different version/build) to remove.
//!
//! Grounded on `conda/install.py`'s duplicate-removal pass that runs after a transaction to
//! enforce "one distribution per name" in a prefix.

use std::collections::BTreeMap;

use crate::dist::Dist;

/// Computes which of `dist_metas` should be removed so that every package name is represented at
/// most once, given `keep_dists` as a set of distributions that must never be removed.
///
/// For each name with two or more candidates: if any candidate is in `keep_dists`, every other
/// candidate for that name is marked for removal. Otherwise, every candidate except the
/// lexicographically greatest (by full key) is marked for removal.
///
/// The result is sorted and is idempotent: re-applying this function to `dist_metas` minus the
/// returned set yields an empty set.
pub fn duplicates_to_remove(dist_metas: &[Dist], keep_dists: &[Dist]) -> Vec<Dist> {
    let mut by_name: BTreeMap<&str, Vec<&Dist>> = BTreeMap::new();
    for dist in dist_metas {
        by_name.entry(dist.name()).or_default().push(dist);
    }

    let mut to_remove = Vec::new();
    for mut group in by_name.into_values() {
        if group.len() < 2 {
            continue;
        }
        group.sort();
        if group.iter().any(|d| keep_dists.contains(d)) {
            for dist in group {
                if !keep_dists.contains(dist) {
                    to_remove.push(dist.clone());
                }
            }
        } else {
            for dist in &group[..group.len() - 1] {
                to_remove.push((*dist).clone());
            }
        }
    }

    to_remove.sort();
    to_remove
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dists(keys: &[&str]) -> Vec<Dist> {
        keys.iter().map(|k| Dist::parse(k).unwrap()).collect()
    }

    #[test]
    fn s4_keeps_the_designated_member() {
        let all = dists(&["foo-1-0", "foo-2-0", "bar-1-0"]);
        let keep = dists(&["foo-2-0"]);
        let removed = duplicates_to_remove(&all, &keep);
        assert_eq!(removed, dists(&["foo-1-0"]));
    }

    #[test]
    fn s4_keeps_sorted_max_when_no_keep_member_present() {
        let all = dists(&["foo-1-0", "foo-2-0", "bar-1-0"]);
        let removed = duplicates_to_remove(&all, &[]);
        assert_eq!(removed, dists(&["foo-1-0"]));
    }

    #[test]
    fn single_candidate_per_name_is_never_removed() {
        let all = dists(&["foo-1-0", "bar-1-0"]);
        assert!(duplicates_to_remove(&all, &[]).is_empty());
    }

    #[test]
    fn invariant_result_is_idempotent() {
        let all = dists(&["foo-1-0", "foo-2-0", "foo-3-0", "bar-1-0", "bar-2-0"]);
        let removed = duplicates_to_remove(&all, &[]);
        let remaining: Vec<Dist> = all
            .iter()
            .filter(|d| !removed.contains(d))
            .cloned()
            .collect();
        assert!(duplicates_to_remove(&remaining, &[]).is_empty());
    }

    #[test]
    fn all_non_keep_members_removed_when_multiple_are_kept() {
        let all = dists(&["foo-1-0", "foo-2-0", "foo-3-0"]);
        let keep = dists(&["foo-2-0", "foo-3-0"]);
        let removed = duplicates_to_remove(&all, &keep);
        assert_eq!(removed, dists(&["foo-1-0"]));
    }
}
