//! Where dataset bytes currently live for one sandbox.

use sluice_core::Md5Digest;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Map from content identity to a file path, owned by one sandbox
#[derive(Debug, Default)]
pub struct SandboxLocationMap {
    paths: HashMap<Md5Digest, PathBuf>,
}

impl SandboxLocationMap {
    /// Create an empty map
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember a location; an existing live location wins
    pub fn register(&mut self, md5: Md5Digest, path: impl Into<PathBuf>) {
        match self.paths.get(&md5) {
            Some(existing) if existing.is_file() => {}
            _ => {
                self.paths.insert(md5, path.into());
            }
        }
    }

    /// Path holding the bytes, if the file still exists
    #[must_use]
    pub fn find(&self, md5: &Md5Digest) -> Option<&Path> {
        self.paths
            .get(md5)
            .map(PathBuf::as_path)
            .filter(|p| p.is_file())
    }

    /// Drop a location known to be bad
    pub fn forget(&mut self, md5: &Md5Digest) -> Option<PathBuf> {
        self.paths.remove(md5)
    }

    /// Number of known locations
    #[must_use]
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    /// Whether nothing is known
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_requires_live_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("a.csv");
        let md5 = Md5Digest::compute(b"a");
        let mut map = SandboxLocationMap::new();

        map.register(md5, &path);
        assert_eq!(map.find(&md5), None);

        std::fs::write(&path, b"a").unwrap();
        assert_eq!(map.find(&md5), Some(path.as_path()));
    }

    #[test]
    fn test_existing_location_wins() {
        let tmp = tempfile::tempdir().unwrap();
        let first = tmp.path().join("first");
        let second = tmp.path().join("second");
        std::fs::write(&first, b"x").unwrap();
        std::fs::write(&second, b"x").unwrap();
        let md5 = Md5Digest::compute(b"x");

        let mut map = SandboxLocationMap::new();
        map.register(md5, &first);
        map.register(md5, &second);
        assert_eq!(map.find(&md5), Some(first.as_path()));

        std::fs::remove_file(&first).unwrap();
        map.register(md5, &second);
        assert_eq!(map.find(&md5), Some(second.as_path()));

        assert!(map.forget(&md5).is_some());
        assert!(map.is_empty());
    }
}
