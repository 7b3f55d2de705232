//! Ordered set of byte-string paths

use std::collections::BTreeSet;
use std::ops::Bound;

/// An ordered set of paths, keyed by raw bytes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathSet {
    paths: BTreeSet<Box<[u8]>>,
}

impl PathSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a path; returns false if it was already present
    pub fn insert(&mut self, path: &[u8]) -> bool {
        self.paths.insert(path.into())
    }

    pub fn contains(&self, path: &[u8]) -> bool {
        self.paths.contains(path)
    }

    /// Remove a path; returns false if it was not present
    pub fn remove(&mut self, path: &[u8]) -> bool {
        self.paths.remove(path)
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn clear(&mut self) {
        self.paths.clear();
    }

    /// The longest member that is `path` or one of its ancestors
    ///
    /// Matches whole components only: `a/b` is an ancestor of `a/b/c` but
    /// not of `a/bc`.
    pub fn find_prefix(&self, path: &[u8]) -> Option<&[u8]> {
        (0..=path.len())
            .rev()
            .filter(|&len| len == path.len() || path[len] == b'/' || (len > 0 && path[len - 1] == b'/'))
            .find_map(|len| self.paths.get(&path[..len]))
            .map(|p| &**p)
    }

    /// Members equal to or under `prefix`, in order
    pub fn with_prefix<'a>(&'a self, prefix: &'a [u8]) -> impl Iterator<Item = &'a [u8]> + 'a {
        self.paths
            .range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded))
            .map(|p| &**p)
            .take_while(move |p| p.starts_with(prefix))
            .filter(move |p| is_under(p, prefix))
    }

    pub fn iter(&self) -> impl Iterator<Item = &[u8]> {
        self.paths.iter().map(|p| &**p)
    }
}

/// Whether `path` is `dir` or lies beneath it
fn is_under(path: &[u8], dir: &[u8]) -> bool {
    path.len() == dir.len()
        || dir.is_empty()
        || dir.ends_with(b"/")
        || path.get(dir.len()) == Some(&b'/')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_find_remove() {
        let mut set = PathSet::new();
        assert!(set.insert(b"root/a"));
        assert!(!set.insert(b"root/a"));
        assert!(set.contains(b"root/a"));
        assert!(!set.contains(b"root"));
        assert!(set.remove(b"root/a"));
        assert!(set.is_empty());
    }

    #[test]
    fn test_prefix_queries() {
        let mut set = PathSet::new();
        set.insert(b"root/a");
        set.insert(b"root/a/b");
        set.insert(b"root/c");

        assert_eq!(set.find_prefix(b"root/a/b/c"), Some(&b"root/a/b"[..]));
        assert_eq!(set.find_prefix(b"other"), None);

        let under_a: Vec<_> = set.with_prefix(b"root/a").collect();
        assert_eq!(under_a, vec![&b"root/a"[..], &b"root/a/b"[..]]);
        assert_eq!(set.iter().count(), 3);
    }

    #[test]
    fn test_prefix_respects_components() {
        let mut set = PathSet::new();
        set.insert(b"/a/b");
        set.insert(b"/a/bc");
        set.insert(b"/a/b/d");

        assert_eq!(set.find_prefix(b"/a/bcd"), None);
        assert_eq!(set.find_prefix(b"/a/bc/x"), Some(&b"/a/bc"[..]));
        assert_eq!(set.find_prefix(b"/a/b"), Some(&b"/a/b"[..]));
        assert_eq!(set.find_prefix(b"/a/b/d/e"), Some(&b"/a/b/d"[..]));

        let under_b: Vec<_> = set.with_prefix(b"/a/b").collect();
        assert_eq!(under_b, vec![&b"/a/b"[..], &b"/a/b/d"[..]]);
    }

    #[test]
    fn test_prefix_outlives_query() {
        let mut set = PathSet::new();
        set.insert(b"root/a");
        let found = {
            let query = b"root/a/deep".to_vec();
            set.find_prefix(&query)
        };
        assert_eq!(found, Some(&b"root/a"[..]));
    }
}
