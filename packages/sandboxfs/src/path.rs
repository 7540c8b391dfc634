//! Path decoding and the visible-prefix predicate.
//!
//! ## Rationale
//!
//! Every path the kernel hands the daemon is relative to the mount root and
//! begins with a job key. We decode that once, at the edge, into a
//! `(JobKey, rel)` pair so that every callback downstream works with a plain
//! workspace-relative path instead of re-deriving the split itself.
//!
//! The visible set is stored as an ordered set of `String`s so that the
//! visible-prefix predicate can be answered with a single lower-bound lookup
//! instead of a linear scan: a path is visible if it is in the set directly,
//! or if the largest entry that is `<= path` is an ancestor directory of it.

use std::collections::BTreeSet;

/// A job's opaque key, conventionally the launcher's process id as a string.
pub type JobKey = String;

/// A workspace-relative path, using `/` separators regardless of platform
/// (the daemon only ever runs on platforms FUSE supports).
pub type RelPath = String;

/// The relative path denoting "the job's view of the workspace root".
pub const ROOT: &str = ".";

/// Split a mount-relative path into its job key and the remainder.
///
/// `rel` is `"."` when the kernel path names only the job directory itself.
/// The kernel never hands us a leading or trailing slash; callers are
/// expected to have already stripped those at the VFS boundary.
pub fn split_key(path: &str) -> (JobKey, RelPath) {
    match path.split_once('/') {
        Some((key, rest)) if !rest.is_empty() => (key.to_string(), rest.to_string()),
        Some((key, _)) => (key.to_string(), ROOT.to_string()),
        None => (path.to_string(), ROOT.to_string()),
    }
}

/// An ordered set of workspace-relative paths, supporting the visible-prefix
/// predicate required by the daemon.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathSet(BTreeSet<RelPath>);

impl PathSet {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `path` into the set. Returns `true` if it was newly inserted.
    pub fn insert(&mut self, path: impl Into<RelPath>) -> bool {
        self.0.insert(path.into())
    }

    /// Remove `path` from the set. Returns `true` if it was present.
    pub fn remove(&mut self, path: &str) -> bool {
        self.0.remove(path)
    }

    /// Whether `path` is an exact member of the set.
    pub fn contains(&self, path: &str) -> bool {
        self.0.contains(path)
    }

    /// Whether `path` is a member of the set, or a descendant of some
    /// directory that is a member of the set (the visible-prefix predicate,
    /// spec.md §3).
    ///
    /// `path == "."` (the job's root) is always visible, since it denotes the
    /// job's own view rather than a concrete workspace path.
    pub fn visible(&self, path: &str) -> bool {
        if path == ROOT {
            return true;
        }
        if self.0.contains(path) {
            return true;
        }
        // The largest entry that is <= `path` lexicographically is the only
        // candidate ancestor: if `path` starts with `D/` for some `D` in the
        // set, then `D <= path` and no entry strictly between `D` and `path`
        // can also be a `D/`-style prefix of `path` (it would have to equal
        // some prefix of `path`, which sorts `<= path` itself).
        self.0
            .range(..=path.to_string())
            .next_back()
            .is_some_and(|candidate| path.starts_with(&format!("{candidate}/")))
    }

    /// Iterate the set's paths in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = &RelPath> {
        self.0.iter()
    }

    /// Rewrite every member equal to `from` or a descendant of it (`from/…`)
    /// so that the `from` prefix is replaced with `to`. Used when a rename
    /// or hardlink moves a path within a job's read/wrote sets.
    pub fn rename_prefix(&mut self, from: &str, to: &str) {
        let moved: Vec<RelPath> = self
            .0
            .iter()
            .filter(|p| p.as_str() == from || p.starts_with(&format!("{from}/")))
            .cloned()
            .collect();
        for path in moved {
            self.0.remove(&path);
            let rewritten = if path == from {
                to.to_string()
            } else {
                format!("{to}{}", &path[from.len()..])
            };
            self.0.insert(rewritten);
        }
    }

    /// Number of entries in the set.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'a> IntoIterator for &'a PathSet {
    type Item = &'a RelPath;
    type IntoIter = std::collections::btree_set::Iter<'a, RelPath>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl FromIterator<RelPath> for PathSet {
    fn from_iter<T: IntoIterator<Item = RelPath>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_key_root_only() {
        assert_eq!(split_key("42"), ("42".to_string(), ".".to_string()));
    }

    #[test]
    fn split_key_nested() {
        assert_eq!(
            split_key("42/src/a.txt"),
            ("42".to_string(), "src/a.txt".to_string())
        );
    }

    #[test]
    fn split_key_trailing_slash_component() {
        // "42/" splits into a key and an empty remainder, which collapses to root.
        assert_eq!(split_key("42/"), ("42".to_string(), ".".to_string()));
    }

    #[test]
    fn visible_exact_match() {
        let mut set = PathSet::new();
        set.insert("src/a.txt");
        assert!(set.visible("src/a.txt"));
        assert!(!set.visible("src/b.txt"));
    }

    #[test]
    fn visible_directory_prefix() {
        let mut set = PathSet::new();
        set.insert("lib");
        assert!(set.visible("lib"));
        assert!(set.visible("lib/a.rs"));
        assert!(set.visible("lib/nested/b.rs"));
        assert!(!set.visible("liberty/c.rs"));
        assert!(!set.visible("other/lib/d.rs"));
    }

    #[test]
    fn visible_picks_nearest_ancestor_not_unrelated_entry() {
        let mut set = PathSet::new();
        set.insert("a");
        set.insert("a/b/c");
        // "a/b/x" is covered by the "a" ancestor even though "a/b/c" sorts
        // between "a" and "a/b/x".
        assert!(set.visible("a/b/x"));
    }

    #[test]
    fn rename_prefix_moves_descendants() {
        let mut set = PathSet::new();
        set.insert("in/c.txt");
        set.insert("in/dir/nested.txt");
        set.rename_prefix("in/c.txt", "out/c.txt");
        assert!(set.contains("out/c.txt"));
        assert!(!set.contains("in/c.txt"));
        // unrelated entries are untouched
        assert!(set.contains("in/dir/nested.txt"));
    }

    #[test]
    fn rename_prefix_moves_directory_and_children() {
        let mut set = PathSet::new();
        set.insert("in");
        set.insert("in/a.txt");
        set.insert("in/sub/b.txt");
        set.rename_prefix("in", "out");
        assert!(set.contains("out"));
        assert!(set.contains("out/a.txt"));
        assert!(set.contains("out/sub/b.txt"));
        assert!(!set.contains("in"));
        assert!(!set.contains("in/a.txt"));
    }
}
