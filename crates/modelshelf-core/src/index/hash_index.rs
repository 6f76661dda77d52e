//! Bidirectional content-hash ↔ path index.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

/// Maps each hash to the set of paths holding that content, and each path
/// back to its hash.
///
/// Every path in a hash's set maps back to that hash, and no hash is kept
/// with an empty path set.
#[derive(Debug, Clone, Default)]
pub struct HashIndex {
    by_hash: HashMap<String, BTreeSet<PathBuf>>,
    by_path: HashMap<PathBuf, String>,
}

impl HashIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `path` to `hash`, rebinding it if it pointed elsewhere.
    ///
    /// Returns the previous hash when the path was rebound.
    pub fn add(&mut self, path: impl Into<PathBuf>, hash: impl Into<String>) -> Option<String> {
        let path = path.into();
        let hash = hash.into();

        let previous = match self.by_path.get(&path) {
            Some(existing) if *existing == hash => return None,
            Some(_) => self.remove_by_path(&path),
            None => None,
        };

        self.by_hash
            .entry(hash.clone())
            .or_default()
            .insert(path.clone());
        self.by_path.insert(path, hash);
        previous
    }

    /// Unbind `path`, pruning its hash entry when the set becomes empty.
    pub fn remove_by_path(&mut self, path: &Path) -> Option<String> {
        let hash = self.by_path.remove(path)?;
        if let Some(paths) = self.by_hash.get_mut(&hash) {
            paths.remove(path);
            if paths.is_empty() {
                self.by_hash.remove(&hash);
            }
        }
        Some(hash)
    }

    pub fn paths_for(&self, hash: &str) -> Option<&BTreeSet<PathBuf>> {
        self.by_hash.get(hash)
    }

    pub fn hash_for(&self, path: &Path) -> Option<&str> {
        self.by_path.get(path).map(String::as_str)
    }

    pub fn contains_path(&self, path: &Path) -> bool {
        self.by_path.contains_key(path)
    }

    /// Hashes bound to more than one path.
    pub fn duplicate_groups(&self) -> BTreeMap<String, BTreeSet<PathBuf>> {
        self.by_hash
            .iter()
            .filter(|(_, paths)| paths.len() > 1)
            .map(|(hash, paths)| (hash.clone(), paths.clone()))
            .collect()
    }

    /// Number of indexed paths.
    pub fn len(&self) -> usize {
        self.by_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_path.is_empty()
    }

    pub fn distinct_hashes(&self) -> usize {
        self.by_hash.len()
    }

    /// Whether `path` is bound to `hash` in both directions.
    pub fn is_bound(&self, path: &Path, hash: &str) -> bool {
        self.hash_for(path) == Some(hash)
            && self
                .by_hash
                .get(hash)
                .map(|paths| paths.contains(path))
                .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_lookup() {
        let mut index = HashIndex::new();
        assert_eq!(index.add("/m/a.bin", "h1"), None);

        assert_eq!(index.hash_for(Path::new("/m/a.bin")), Some("h1"));
        assert_eq!(index.paths_for("h1").unwrap().len(), 1);
        assert!(index.is_bound(Path::new("/m/a.bin"), "h1"));
    }

    #[test]
    fn test_duplicates_group_by_hash() {
        let mut index = HashIndex::new();
        index.add("/m/a.bin", "h1");
        index.add("/m/b.bin", "h1");
        index.add("/m/c.bin", "h2");

        let groups = index.duplicate_groups();
        assert_eq!(groups.len(), 1);
        let paths: Vec<_> = groups["h1"].iter().cloned().collect();
        assert_eq!(paths, vec![PathBuf::from("/m/a.bin"), PathBuf::from("/m/b.bin")]);
        assert!(!groups.contains_key("h2"));
    }

    #[test]
    fn test_rebind_prunes_old_hash() {
        let mut index = HashIndex::new();
        index.add("/m/a.bin", "old");
        assert_eq!(index.add("/m/a.bin", "new"), Some("old".to_string()));

        assert!(index.paths_for("old").is_none());
        assert_eq!(index.hash_for(Path::new("/m/a.bin")), Some("new"));
        assert_eq!(index.len(), 1);
        assert_eq!(index.distinct_hashes(), 1);
    }

    #[test]
    fn test_remove_last_path_prunes_hash() {
        let mut index = HashIndex::new();
        index.add("/m/a.bin", "h1");
        index.add("/m/b.bin", "h1");

        assert_eq!(index.remove_by_path(Path::new("/m/a.bin")), Some("h1".to_string()));
        assert_eq!(index.paths_for("h1").unwrap().len(), 1);
        index.remove_by_path(Path::new("/m/b.bin"));
        assert!(index.paths_for("h1").is_none());
        assert!(index.is_empty());
        assert_eq!(index.remove_by_path(Path::new("/m/b.bin")), None);
    }

    #[test]
    fn test_same_binding_is_noop() {
        let mut index = HashIndex::new();
        index.add("/m/a.bin", "h1");
        assert_eq!(index.add("/m/a.bin", "h1"), None);
        assert_eq!(index.len(), 1);
    }
}
