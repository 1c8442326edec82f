//! Moving data along cables.
//!
//! Trivial cables link or copy the source and then confirm the copy still
//! has the source identity. Other cables project the wired columns into the
//! destination's column order under the destination names. Output is
//! written beside the destination and renamed into place, so a destination
//! path never holds partial data. Callers serialize writers per destination.

use crate::error::CableError;
use sluice_core::{ContentIdentity, Md5Digest};
use sluice_plan::{Cable, Wire};
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Runs cables between files
#[derive(Debug, Clone, Copy, Default)]
pub struct CableRunner {
    allow_hard_links: bool,
}

impl CableRunner {
    /// Create a runner that hard-links trivial cables where possible
    #[must_use]
    pub const fn new() -> Self {
        Self {
            allow_hard_links: true,
        }
    }

    /// Always copy, never link
    #[must_use]
    pub const fn copying(mut self) -> Self {
        self.allow_hard_links = false;
        self
    }

    /// Run a cable from `source` into `dest`
    ///
    /// `source_identity` is what the source bytes should be. The returned
    /// identity describes `dest`; `dest_compound` names its compound type
    /// for projected output.
    ///
    /// # Errors
    ///
    /// Returns a recoverable error if the source is missing or wrong, and a
    /// fatal one for any other failure
    pub fn run(
        &self,
        cable: &Cable,
        source: &Path,
        dest: &Path,
        source_identity: &ContentIdentity,
        dest_compound: Option<&str>,
    ) -> Result<ContentIdentity, CableError> {
        if cable.is_trivial() {
            self.run_trivial(source, dest, source_identity)
        } else {
            Self::verify(source, &source_identity.md5)?;
            self.run_projection(&cable.wires, source, dest, dest_compound)
        }
    }

    /// Link or copy `source` to `dest` and check the bytes
    ///
    /// # Errors
    ///
    /// Returns `IdentityMismatch` if `dest` does not hash to `expected`
    pub fn run_trivial(
        &self,
        source: &Path,
        dest: &Path,
        expected: &ContentIdentity,
    ) -> Result<ContentIdentity, CableError> {
        self.place(source, dest)?;
        if let Err(e) = Self::verify(dest, &expected.md5) {
            let _ = std::fs::remove_file(dest);
            return Err(e);
        }
        debug!(source = %source.display(), dest = %dest.display(), "trivial cable");
        Ok(expected.clone())
    }

    /// Put a copy of `source` at `dest`, replacing whatever is there
    ///
    /// # Errors
    ///
    /// Returns error if neither linking nor copying works
    pub fn place(&self, source: &Path, dest: &Path) -> Result<(), CableError> {
        if !source.is_file() {
            return Err(CableError::SourceMissing {
                path: source.to_path_buf(),
            });
        }
        if source == dest {
            return Ok(());
        }
        ensure_parent(dest)?;
        let staging = staging_path(dest);
        let _ = std::fs::remove_file(&staging);
        let linked = self.allow_hard_links && std::fs::hard_link(source, &staging).is_ok();
        if !linked {
            std::fs::copy(source, &staging).map_err(|e| CableError::from_io(source, &e))?;
        }
        std::fs::rename(&staging, dest).map_err(|e| CableError::from_io(dest, &e))
    }

    /// Project wired columns from a CSV source into `dest`
    ///
    /// Destination columns are written in destination index order with
    /// destination names; source columns without a wire are dropped.
    ///
    /// # Errors
    ///
    /// Returns `MissingColumn` for a wire naming a column the source lacks
    pub fn run_projection(
        &self,
        wires: &[Wire],
        source: &Path,
        dest: &Path,
        dest_compound: Option<&str>,
    ) -> Result<ContentIdentity, CableError> {
        let mut ordered: Vec<&Wire> = wires.iter().collect();
        ordered.sort_by_key(|w| w.dest.idx);

        let mut reader = csv::Reader::from_path(source).map_err(|e| CableError::from_csv(source, e))?;
        let width = reader
            .headers()
            .map_err(|e| CableError::from_csv(source, e))?
            .len();
        let picks: Vec<usize> = ordered
            .iter()
            .map(|w| {
                let pos = usize::try_from(w.source.idx).unwrap_or(0);
                if pos == 0 || pos > width {
                    Err(CableError::MissingColumn {
                        path: source.to_path_buf(),
                        column: w.source.idx,
                    })
                } else {
                    Ok(pos - 1)
                }
            })
            .collect::<Result<_, _>>()?;

        ensure_parent(dest)?;
        let staging = staging_path(dest);
        let file = File::create(&staging).map_err(|e| CableError::from_io(&staging, &e))?;
        let mut writer = csv::Writer::from_writer(file);
        writer
            .write_record(ordered.iter().map(|w| w.dest.name.as_str()))
            .map_err(|e| CableError::from_csv(&staging, e))?;

        let mut rows = 0u64;
        for record in reader.records() {
            let record = record.map_err(|e| CableError::from_csv(source, e))?;
            writer
                .write_record(picks.iter().map(|&i| record.get(i).unwrap_or("")))
                .map_err(|e| CableError::from_csv(&staging, e))?;
            rows += 1;
        }
        writer
            .flush()
            .map_err(|e| CableError::from_io(&staging, &e))?;
        drop(writer);
        std::fs::rename(&staging, dest).map_err(|e| CableError::from_io(dest, &e))?;

        let md5 = Md5Digest::compute_file(dest).map_err(|e| CableError::Io {
            path: dest.to_path_buf(),
            kind: std::io::ErrorKind::Other,
            reason: e.to_string(),
        })?;
        debug!(source = %source.display(), dest = %dest.display(), rows, "projected cable");
        Ok(match dest_compound {
            Some(cdt) => ContentIdentity::typed(md5, rows, cdt),
            None => ContentIdentity::raw(md5),
        })
    }

    fn verify(path: &Path, expected: &Md5Digest) -> Result<(), CableError> {
        let file = File::open(path).map_err(|e| CableError::from_io(path, &e))?;
        let (found, _) = Md5Digest::compute_reader(file).map_err(|e| CableError::from_io(path, &e))?;
        if found == *expected {
            Ok(())
        } else {
            Err(CableError::IdentityMismatch {
                path: path.to_path_buf(),
                expected: *expected,
                found,
            })
        }
    }
}

fn staging_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".partial");
    dest.with_file_name(name)
}

fn ensure_parent(dest: &Path) -> Result<(), CableError> {
    match dest.parent() {
        Some(parent) => std::fs::create_dir_all(parent).map_err(|e| CableError::from_io(parent, &e)),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_plan::{CableSource, ColumnRef};

    const TABLE: &str = "a,b,c\n1,2,3\n4,5,6\n";

    fn source(dir: &Path) -> (PathBuf, ContentIdentity) {
        let path = dir.join("src.csv");
        std::fs::write(&path, TABLE).unwrap();
        let id = ContentIdentity::typed(Md5Digest::compute(TABLE.as_bytes()), 2, "triple");
        (path, id)
    }

    fn wire(src: (u32, &str), dst: (u32, &str)) -> Wire {
        Wire::new(
            ColumnRef::new(src.0, src.1, "integer"),
            ColumnRef::new(dst.0, dst.1, "integer"),
        )
    }

    #[test]
    fn test_trivial_cable_keeps_identity() {
        let tmp = tempfile::tempdir().unwrap();
        let (src, id) = source(tmp.path());
        let dest = tmp.path().join("step1/input_data/step1_in.csv");
        let cable = Cable::direct(CableSource::PipelineInput { idx: 0 });

        let out = CableRunner::new().run(&cable, &src, &dest, &id, None).unwrap();
        assert_eq!(out, id);
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), TABLE);
    }

    #[test]
    fn test_trivial_cable_detects_wrong_source() {
        let tmp = tempfile::tempdir().unwrap();
        let (src, _) = source(tmp.path());
        let wrong = ContentIdentity::raw(Md5Digest::compute(b"other"));
        let err = CableRunner::new()
            .copying()
            .run_trivial(&src, &tmp.path().join("out"), &wrong)
            .unwrap_err();
        assert!(err.is_recoverable());
        assert!(!tmp.path().join("out").exists());
    }

    #[test]
    fn test_missing_source_is_recoverable() {
        let tmp = tempfile::tempdir().unwrap();
        let id = ContentIdentity::raw(Md5Digest::compute(b"x"));
        let err = CableRunner::new()
            .run_trivial(&tmp.path().join("gone"), &tmp.path().join("out"), &id)
            .unwrap_err();
        assert!(matches!(err, CableError::SourceMissing { .. }));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_projection_permutes_and_renames() {
        let tmp = tempfile::tempdir().unwrap();
        let (src, id) = source(tmp.path());
        let dest = tmp.path().join("out.csv");
        let cable = Cable::direct(CableSource::PipelineInput { idx: 0 })
            .with_wire(wire((3, "c"), (1, "z")))
            .with_wire(wire((1, "a"), (2, "x")));

        let out = CableRunner::new()
            .run(&cable, &src, &dest, &id, Some("pair"))
            .unwrap();
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "z,x\n3,1\n6,4\n");
        assert_eq!(out.num_rows, Some(2));
        assert_eq!(out.compound_type.as_deref(), Some("pair"));
        assert!(!out.same_bytes(&id));
    }

    #[test]
    fn test_projection_rejects_missing_column() {
        let tmp = tempfile::tempdir().unwrap();
        let (src, id) = source(tmp.path());
        let cable = Cable::direct(CableSource::PipelineInput { idx: 0 })
            .with_wire(wire((9, "q"), (1, "q")));
        let err = CableRunner::new()
            .run(&cable, &src, &tmp.path().join("out.csv"), &id, None)
            .unwrap_err();
        assert!(matches!(err, CableError::MissingColumn { column: 9, .. }));
        assert!(!err.is_recoverable());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn trivial_cable_is_idempotent(bytes in proptest::collection::vec(any::<u8>(), 0..512), link in any::<bool>()) {
                let tmp = tempfile::tempdir().unwrap();
                let src = tmp.path().join("src.raw");
                std::fs::write(&src, &bytes).unwrap();
                let id = ContentIdentity::raw(Md5Digest::compute(&bytes));
                let runner = if link { CableRunner::new() } else { CableRunner::new().copying() };
                let cable = Cable::direct(CableSource::PipelineInput { idx: 0 });

                let dest = tmp.path().join("dest.raw");
                let first = runner.run(&cable, &src, &dest, &id, None).unwrap();
                let first_bytes = std::fs::read(&dest).unwrap();
                let second = runner.run(&cable, &src, &dest, &id, None).unwrap();
                let second_bytes = std::fs::read(&dest).unwrap();

                prop_assert_eq!(first, second);
                prop_assert_eq!(&first_bytes, &second_bytes);
                prop_assert_eq!(first_bytes, bytes);
            }

            #[test]
            fn projection_preserves_row_count(rows in proptest::collection::vec((0i64..1000, 0i64..1000), 0..40)) {
                let tmp = tempfile::tempdir().unwrap();
                let src = tmp.path().join("src.csv");
                let mut text = String::from("a,b\n");
                for (a, b) in &rows {
                    text.push_str(&format!("{a},{b}\n"));
                }
                std::fs::write(&src, &text).unwrap();
                let id = ContentIdentity::raw(Md5Digest::compute(text.as_bytes()));
                let cable = Cable::direct(CableSource::PipelineInput { idx: 0 })
                    .with_wire(wire((2, "b"), (1, "b")));

                let out = CableRunner::new()
                    .run(&cable, &src, &tmp.path().join("out.csv"), &id, Some("single"))
                    .unwrap();
                prop_assert_eq!(out.num_rows, Some(rows.len() as u64));
            }
        }
    }
}
