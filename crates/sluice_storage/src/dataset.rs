//! Dataset storage for retained bytes.
//!
//! Only datasets marked for retention are registered here. Everything else
//! lives in a sandbox directory for the length of one run and survives only
//! as an identity on an ExecRecord.

use crate::error::{StoreError, StoreResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sluice_core::{ContentIdentity, Md5Digest};
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

/// A persisted dataset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetRecord {
    /// Identity of the bytes
    pub identity: ContentIdentity,
    /// Human-readable name
    pub name: String,
    /// Where the bytes live
    pub path: PathBuf,
    /// Size in bytes
    pub size: u64,
    /// When the dataset was registered
    pub registered_at: DateTime<Utc>,
}

/// Dataset I/O used by the engine
pub trait DatasetStore: Send + Sync {
    /// Open persisted bytes for reading
    ///
    /// # Errors
    ///
    /// Returns `NoData` if the bytes are not stored
    fn open_for_read(&self, md5: &Md5Digest) -> StoreResult<File>;

    /// Path of persisted bytes, if stored
    fn path_of(&self, md5: &Md5Digest) -> Option<PathBuf>;

    /// Copy a file into the store and return its identity
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or copied
    fn register(&self, path: &Path, name: &str) -> StoreResult<ContentIdentity>;

    /// Digest a file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read
    fn compute_md5(&self, path: &Path) -> StoreResult<Md5Digest> {
        Ok(Md5Digest::compute_file(path)?)
    }

    /// Whether bytes for an identity are stored
    fn has_data(&self, md5: &Md5Digest) -> bool {
        self.path_of(md5).is_some()
    }

    /// Delete stored bytes, returning whether anything was removed
    ///
    /// # Errors
    ///
    /// Returns error if the file exists but cannot be removed
    fn purge(&self, md5: &Md5Digest) -> StoreResult<bool>;

    /// Metadata for a stored dataset
    fn record(&self, md5: &Md5Digest) -> Option<DatasetRecord>;
}

/// Filesystem dataset store: one file per digest under a root directory
pub struct FsDatasetStore {
    root: PathBuf,
    index: RwLock<HashMap<Md5Digest, DatasetRecord>>,
}

impl FsDatasetStore {
    /// Open or create a store, indexing files already present
    ///
    /// # Errors
    ///
    /// Returns error if the directory cannot be created or listed
    pub fn open(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| StoreError::io(&root, &e))?;

        let mut index = HashMap::new();
        let entries = std::fs::read_dir(&root).map_err(|e| StoreError::io(&root, &e))?;
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(stem) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Ok(md5) = Md5Digest::from_hex(stem) else {
                continue;
            };
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            index.insert(
                md5,
                DatasetRecord {
                    identity: ContentIdentity::raw(md5),
                    name: stem.to_string(),
                    path,
                    size,
                    registered_at: Utc::now(),
                },
            );
        }
        tracing::debug!(root = %root.display(), datasets = index.len(), "opened dataset store");

        Ok(Self {
            root,
            index: RwLock::new(index),
        })
    }

    /// Store root
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of stored datasets
    #[must_use]
    pub fn len(&self) -> usize {
        self.index.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether the store is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Re-hash stored bytes and compare with their digest
    ///
    /// # Errors
    ///
    /// Returns `DatasetCorrupted` if the bytes changed on disk
    pub fn verify(&self, md5: &Md5Digest) -> StoreResult<()> {
        let path = self.path_of(md5).ok_or(StoreError::NoData { md5: *md5 })?;
        let actual = Md5Digest::compute_file(&path)?;
        if actual == *md5 {
            Ok(())
        } else {
            Err(StoreError::DatasetCorrupted {
                expected: *md5,
                actual,
            })
        }
    }

    fn blob_path(&self, md5: &Md5Digest) -> PathBuf {
        self.root.join(md5.to_hex())
    }
}

impl DatasetStore for FsDatasetStore {
    fn open_for_read(&self, md5: &Md5Digest) -> StoreResult<File> {
        let path = self.path_of(md5).ok_or(StoreError::NoData { md5: *md5 })?;
        File::open(&path).map_err(|e| StoreError::io(&path, &e))
    }

    fn path_of(&self, md5: &Md5Digest) -> Option<PathBuf> {
        let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
        index
            .get(md5)
            .map(|r| r.path.clone())
            .filter(|p| p.is_file())
    }

    fn register(&self, path: &Path, name: &str) -> StoreResult<ContentIdentity> {
        let md5 = self.compute_md5(path)?;
        if self.has_data(&md5) {
            return Ok(ContentIdentity::raw(md5));
        }

        let dest = self.blob_path(&md5);
        let staging = self.root.join(format!(".{}.partial", md5.to_hex()));
        let size = std::fs::copy(path, &staging).map_err(|e| StoreError::io(path, &e))?;
        std::fs::rename(&staging, &dest).map_err(|e| StoreError::io(&dest, &e))?;

        let identity = ContentIdentity::raw(md5);
        let record = DatasetRecord {
            identity: identity.clone(),
            name: name.to_string(),
            path: dest,
            size,
            registered_at: Utc::now(),
        };
        self.index
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(md5, record);
        tracing::debug!(%md5, name, size, "registered dataset");
        Ok(identity)
    }

    fn purge(&self, md5: &Md5Digest) -> StoreResult<bool> {
        let removed = self
            .index
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(md5);
        match removed {
            Some(record) => match std::fs::remove_file(&record.path) {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
                Err(e) => Err(StoreError::io(&record.path, &e)),
            },
            None => Ok(false),
        }
    }

    fn record(&self, md5: &Md5Digest) -> Option<DatasetRecord> {
        self.index
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(md5)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn scratch(dir: &Path, name: &str, body: &[u8]) -> PathBuf {
        let p = dir.join(name);
        std::fs::write(&p, body).unwrap();
        p
    }

    #[test]
    fn test_register_and_read_back() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FsDatasetStore::open(tmp.path().join("store")).unwrap();
        let src = scratch(tmp.path(), "in.csv", b"a,b\n1,2\n");

        let identity = store.register(&src, "in.csv").unwrap();
        assert_eq!(identity.md5, Md5Digest::compute(b"a,b\n1,2\n"));
        assert!(store.has_data(&identity.md5));

        let mut body = String::new();
        store
            .open_for_read(&identity.md5)
            .unwrap()
            .read_to_string(&mut body)
            .unwrap();
        assert_eq!(body, "a,b\n1,2\n");
        assert_eq!(store.record(&identity.md5).unwrap().size, 8);
    }

    #[test]
    fn test_register_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FsDatasetStore::open(tmp.path().join("store")).unwrap();
        let src = scratch(tmp.path(), "x", b"same");
        let a = store.register(&src, "x").unwrap();
        let b = store.register(&src, "x-again").unwrap();
        assert_eq!(a, b);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_reopen_finds_existing() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("store");
        let src = scratch(tmp.path(), "x", b"persist me");
        let md5 = FsDatasetStore::open(&root).unwrap().register(&src, "x").unwrap().md5;

        let reopened = FsDatasetStore::open(&root).unwrap();
        assert!(reopened.has_data(&md5));
    }

    #[test]
    fn test_purge_then_no_data() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FsDatasetStore::open(tmp.path().join("store")).unwrap();
        let src = scratch(tmp.path(), "x", b"bye");
        let md5 = store.register(&src, "x").unwrap().md5;

        assert!(store.purge(&md5).unwrap());
        assert!(!store.purge(&md5).unwrap());
        assert!(matches!(
            store.open_for_read(&md5),
            Err(StoreError::NoData { .. })
        ));
    }

    #[test]
    fn test_verify_detects_tampering() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FsDatasetStore::open(tmp.path().join("store")).unwrap();
        let src = scratch(tmp.path(), "x", b"original");
        let md5 = store.register(&src, "x").unwrap().md5;
        assert!(store.verify(&md5).is_ok());

        std::fs::write(store.path_of(&md5).unwrap(), b"tampered").unwrap();
        assert!(matches!(
            store.verify(&md5),
            Err(StoreError::DatasetCorrupted { .. })
        ));
    }
}
