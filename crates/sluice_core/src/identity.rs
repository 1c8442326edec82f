//! Content identities for dataset bytes.
//!
//! A dataset is identified by the MD5 of its bytes, independent of where the
//! bytes currently live. Typed (CSV) datasets additionally carry their row
//! count and the compound datatype they were checked against.

use crate::error::{CoreError, CoreResult};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;

const READ_CHUNK: usize = 64 * 1024;

/// MD5 digest of dataset bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Md5Digest([u8; 16]);

impl Md5Digest {
    /// Create from raw bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Digest a byte slice
    #[must_use]
    pub fn compute(data: &[u8]) -> Self {
        Self(Md5::digest(data).into())
    }

    /// Digest everything a reader yields, returning the digest and byte count
    ///
    /// # Errors
    ///
    /// Returns error if the reader fails
    pub fn compute_reader<R: Read>(mut reader: R) -> std::io::Result<(Self, u64)> {
        let mut hasher = Md5::new();
        let mut buf = vec![0u8; READ_CHUNK];
        let mut total = 0u64;
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            total += n as u64;
        }
        Ok((Self(hasher.finalize().into()), total))
    }

    /// Digest a file on disk
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read
    pub fn compute_file(path: impl AsRef<Path>) -> CoreResult<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| CoreError::io(path, &e))?;
        Self::compute_reader(file)
            .map(|(digest, _)| digest)
            .map_err(|e| CoreError::io(path, &e))
    }

    /// Get as bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Lowercase hex form
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex
    ///
    /// # Errors
    ///
    /// Returns error if the text is not 32 hex characters
    pub fn from_hex(s: &str) -> CoreResult<Self> {
        let bytes = hex::decode(s).map_err(|e| CoreError::InvalidDigest {
            reason: e.to_string(),
        })?;
        let bytes: [u8; 16] = bytes.try_into().map_err(|v: Vec<u8>| CoreError::InvalidDigest {
            reason: format!("expected 16 bytes, got {}", v.len()),
        })?;
        Ok(Self(bytes))
    }

    /// Check data against this digest
    ///
    /// # Errors
    ///
    /// Returns `DigestMismatch` if the data hashes differently
    pub fn verify(&self, data: &[u8]) -> CoreResult<()> {
        let actual = Self::compute(data);
        if actual == *self {
            Ok(())
        } else {
            Err(CoreError::DigestMismatch {
                expected: self.to_hex(),
                actual: actual.to_hex(),
            })
        }
    }
}

impl std::fmt::Display for Md5Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Location-independent identity of a dataset
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentIdentity {
    /// MD5 of the bytes
    pub md5: Md5Digest,
    /// Number of data rows, for typed datasets
    pub num_rows: Option<u64>,
    /// Compound datatype the dataset conforms to, `None` for raw
    pub compound_type: Option<String>,
}

impl ContentIdentity {
    /// Identity of raw (untyped) bytes
    #[must_use]
    pub const fn raw(md5: Md5Digest) -> Self {
        Self {
            md5,
            num_rows: None,
            compound_type: None,
        }
    }

    /// Identity of a typed dataset
    #[must_use]
    pub fn typed(md5: Md5Digest, num_rows: u64, compound_type: impl Into<String>) -> Self {
        Self {
            md5,
            num_rows: Some(num_rows),
            compound_type: Some(compound_type.into()),
        }
    }

    /// Identity of a raw file on disk
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read
    pub fn of_file(path: impl AsRef<Path>) -> CoreResult<Self> {
        Ok(Self::raw(Md5Digest::compute_file(path)?))
    }

    /// Whether this identity carries no compound type
    #[must_use]
    pub const fn is_raw(&self) -> bool {
        self.compound_type.is_none()
    }

    /// Same bytes as another identity, ignoring metadata
    #[must_use]
    pub fn same_bytes(&self, other: &Self) -> bool {
        self.md5 == other.md5
    }
}

impl std::fmt::Display for ContentIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.compound_type, self.num_rows) {
            (Some(cdt), Some(rows)) => write!(f, "{} ({} rows of {})", self.md5, rows, cdt),
            _ => write!(f, "{}", self.md5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Write;

    #[test]
    fn test_known_digest() {
        // RFC 1321 test vector
        let d = Md5Digest::compute(b"abc");
        assert_eq!(d.to_hex(), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn test_hex_round_trip() {
        let d = Md5Digest::compute(b"a,b,c\n1,2,3\n");
        assert_eq!(Md5Digest::from_hex(&d.to_hex()).unwrap(), d);
    }

    #[test]
    fn test_from_hex_rejects_wrong_length() {
        assert!(matches!(
            Md5Digest::from_hex("abcd"),
            Err(CoreError::InvalidDigest { .. })
        ));
    }

    #[test]
    fn test_verify() {
        let d = Md5Digest::compute(b"payload");
        assert!(d.verify(b"payload").is_ok());
        assert!(matches!(
            d.verify(b"tampered"),
            Err(CoreError::DigestMismatch { .. })
        ));
    }

    #[test]
    fn test_file_digest_matches_memory() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"x,y\n1,2\n").unwrap();
        let on_disk = ContentIdentity::of_file(file.path()).unwrap();
        assert_eq!(on_disk.md5, Md5Digest::compute(b"x,y\n1,2\n"));
        assert!(on_disk.is_raw());
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = Md5Digest::compute_file("/definitely/not/here").unwrap_err();
        assert!(matches!(err, CoreError::Io { .. }));
    }

    #[test]
    fn test_same_bytes_ignores_metadata() {
        let md5 = Md5Digest::compute(b"a\n1\n");
        let raw = ContentIdentity::raw(md5);
        let typed = ContentIdentity::typed(md5, 1, "single_int");
        assert_ne!(raw, typed);
        assert!(raw.same_bytes(&typed));
    }

    proptest! {
        #[test]
        fn prop_reader_matches_slice(data in proptest::collection::vec(any::<u8>(), 0..200_000)) {
            let (streamed, len) = Md5Digest::compute_reader(data.as_slice()).unwrap();
            prop_assert_eq!(streamed, Md5Digest::compute(&data));
            prop_assert_eq!(len, data.len() as u64);
        }
    }
}
