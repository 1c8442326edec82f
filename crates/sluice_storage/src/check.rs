//! Output checks: content checks against declared types, integrity checks
//! against recorded digests.
//!
//! Checks never return errors for bad data. Every problem becomes a
//! [`Defect`] on the log so a failed run still explains itself.

use serde::{Deserialize, Serialize};
use sluice_core::{ContentIdentity, Md5Digest, Stopwatch};
use sluice_plan::{CompoundDatatype, DatatypeRegistry, RowBounds};
use std::path::Path;

/// Cell errors beyond this count are not recorded individually
pub const MAX_CELL_ERRORS: usize = 100;

/// A structured content problem
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Defect {
    /// The expected file was never written
    MissingOutput,
    /// The file changed while it was being checked
    FileNotStable { before: Md5Digest, after: Md5Digest },
    /// Header row differs from the compound datatype
    BadHeader {
        expected: Vec<String>,
        found: Vec<String>,
    },
    /// Row count outside the declared bounds
    BadRowCount { rows: u64, bounds: String },
    /// A cell failed its column's type check
    CellError {
        row: u64,
        column: u32,
        reason: String,
    },
    /// The file could not be parsed as CSV
    Unreadable { reason: String },
}

/// Result of checking one dataset's contents
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentCheckLog {
    /// When the check ran
    pub stopwatch: Stopwatch,
    /// Identity of the checked bytes, if they could be read
    pub identity: Option<ContentIdentity>,
    /// Problems found
    pub defects: Vec<Defect>,
}

impl ContentCheckLog {
    /// A log recording a missing file
    #[must_use]
    pub fn missing() -> Self {
        let mut stopwatch = Stopwatch::started();
        stopwatch.stop();
        Self {
            stopwatch,
            identity: None,
            defects: vec![Defect::MissingOutput],
        }
    }

    /// Whether the check found nothing wrong
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.defects.is_empty()
    }

    /// Whether the output is missing
    #[must_use]
    pub fn is_missing(&self) -> bool {
        self.defects.contains(&Defect::MissingOutput)
    }
}

/// A digest problem
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntegrityDefect {
    /// The file could not be read
    ReadFailed { reason: String },
    /// The bytes hash differently than recorded
    Md5Conflict { expected: Md5Digest, found: Md5Digest },
}

/// Result of checking one dataset's digest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityCheckLog {
    /// When the check ran
    pub stopwatch: Stopwatch,
    /// Digest of the bytes that were read
    pub md5: Option<Md5Digest>,
    /// Problems found
    pub defects: Vec<IntegrityDefect>,
}

impl IntegrityCheckLog {
    /// Hash a file and compare with an expected digest, if one is known
    #[must_use]
    pub fn check(path: &Path, expected: Option<Md5Digest>) -> Self {
        let mut stopwatch = Stopwatch::started();
        let mut defects = Vec::new();
        let md5 = match Md5Digest::compute_file(path) {
            Ok(found) => {
                if let Some(expected) = expected.filter(|e| *e != found) {
                    defects.push(IntegrityDefect::Md5Conflict { expected, found });
                }
                Some(found)
            }
            Err(e) => {
                defects.push(IntegrityDefect::ReadFailed {
                    reason: e.to_string(),
                });
                None
            }
        };
        stopwatch.stop();
        Self {
            stopwatch,
            md5,
            defects,
        }
    }

    /// A log recording that the bytes could not be read at all
    #[must_use]
    pub fn read_failed(reason: impl Into<String>) -> Self {
        let mut stopwatch = Stopwatch::started();
        stopwatch.stop();
        Self {
            stopwatch,
            md5: None,
            defects: vec![IntegrityDefect::ReadFailed {
                reason: reason.into(),
            }],
        }
    }

    /// Whether the digest matched
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.defects.is_empty()
    }
}

/// Checks dataset files against their declared slot
pub struct ContentChecker<'a> {
    registry: &'a DatatypeRegistry,
}

impl<'a> ContentChecker<'a> {
    /// Create a checker over a datatype registry
    #[must_use]
    pub const fn new(registry: &'a DatatypeRegistry) -> Self {
        Self { registry }
    }

    /// Check a file; `compound` is `None` for raw data
    #[must_use]
    pub fn check(
        &self,
        path: &Path,
        compound: Option<&CompoundDatatype>,
        rows: &RowBounds,
    ) -> ContentCheckLog {
        if !path.is_file() {
            return ContentCheckLog::missing();
        }
        let mut stopwatch = Stopwatch::started();
        let mut defects = Vec::new();

        let before = match Md5Digest::compute_file(path) {
            Ok(d) => d,
            Err(e) => {
                stopwatch.stop();
                return ContentCheckLog {
                    stopwatch,
                    identity: None,
                    defects: vec![Defect::Unreadable {
                        reason: e.to_string(),
                    }],
                };
            }
        };

        let identity = match compound {
            None => ContentIdentity::raw(before),
            Some(cdt) => {
                let row_count = self.check_table(path, cdt, &mut defects);
                if !rows.check(row_count) {
                    defects.push(Defect::BadRowCount {
                        rows: row_count,
                        bounds: rows.to_string(),
                    });
                }
                ContentIdentity::typed(before, row_count, cdt.name.clone())
            }
        };

        match Md5Digest::compute_file(path) {
            Ok(after) if after != before => defects.push(Defect::FileNotStable { before, after }),
            Ok(_) => {}
            Err(e) => defects.push(Defect::Unreadable {
                reason: e.to_string(),
            }),
        }

        stopwatch.stop();
        ContentCheckLog {
            stopwatch,
            identity: Some(identity),
            defects,
        }
    }

    fn check_table(&self, path: &Path, cdt: &CompoundDatatype, defects: &mut Vec<Defect>) -> u64 {
        let mut reader = match csv::ReaderBuilder::new().flexible(true).from_path(path) {
            Ok(r) => r,
            Err(e) => {
                defects.push(Defect::Unreadable {
                    reason: e.to_string(),
                });
                return 0;
            }
        };

        let expected = cdt.header();
        match reader.headers() {
            Ok(found) if found.iter().eq(expected.iter().copied()) => {}
            Ok(found) => {
                defects.push(Defect::BadHeader {
                    expected: expected.iter().map(|s| (*s).to_string()).collect(),
                    found: found.iter().map(str::to_string).collect(),
                });
                return 0;
            }
            Err(e) => {
                defects.push(Defect::Unreadable {
                    reason: e.to_string(),
                });
                return 0;
            }
        }

        let checks: Vec<_> = cdt
            .columns
            .iter()
            .map(|c| (c.idx, self.registry.builtin_of(&c.datatype)))
            .collect();
        let mut rows = 0u64;
        let mut cell_errors = 0usize;
        for record in reader.records() {
            rows += 1;
            let record = match record {
                Ok(r) => r,
                Err(e) => {
                    defects.push(Defect::Unreadable {
                        reason: e.to_string(),
                    });
                    continue;
                }
            };
            if record.len() != checks.len() {
                if cell_errors < MAX_CELL_ERRORS {
                    defects.push(Defect::CellError {
                        row: rows,
                        column: 0,
                        reason: format!("expected {} fields, found {}", checks.len(), record.len()),
                    });
                }
                cell_errors += 1;
                continue;
            }
            for ((idx, builtin), value) in checks.iter().zip(record.iter()) {
                if let Err(reason) = builtin.check(value) {
                    if cell_errors < MAX_CELL_ERRORS {
                        defects.push(Defect::CellError {
                            row: rows,
                            column: *idx,
                            reason,
                        });
                    }
                    cell_errors += 1;
                }
            }
        }
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_plan::ColumnSpec;

    fn ints() -> CompoundDatatype {
        CompoundDatatype::new(
            "ints",
            vec![ColumnSpec::new(1, "x", "integer"), ColumnSpec::new(2, "y", "integer")],
        )
    }

    fn write(dir: &Path, body: &str) -> std::path::PathBuf {
        let p = dir.join("data.csv");
        std::fs::write(&p, body).unwrap();
        p
    }

    #[test]
    fn test_missing_output() {
        let reg = DatatypeRegistry::with_builtins();
        let log = ContentChecker::new(&reg).check(Path::new("/no/such"), None, &RowBounds::new());
        assert!(log.is_missing());
        assert!(log.identity.is_none());
    }

    #[test]
    fn test_good_table() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write(tmp.path(), "x,y\n1,2\n3,4\n");
        let reg = DatatypeRegistry::with_builtins();
        let log = ContentChecker::new(&reg).check(&path, Some(&ints()), &RowBounds::new());
        assert!(log.is_ok(), "{:?}", log.defects);
        let identity = log.identity.unwrap();
        assert_eq!(identity.num_rows, Some(2));
        assert_eq!(identity.compound_type.as_deref(), Some("ints"));
    }

    #[test]
    fn test_bad_header() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write(tmp.path(), "x,z\n1,2\n");
        let reg = DatatypeRegistry::with_builtins();
        let log = ContentChecker::new(&reg).check(&path, Some(&ints()), &RowBounds::new());
        assert!(matches!(log.defects[0], Defect::BadHeader { .. }));
    }

    #[test]
    fn test_cell_and_row_defects() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write(tmp.path(), "x,y\n1,oops\n");
        let reg = DatatypeRegistry::with_builtins();
        let log = ContentChecker::new(&reg).check(
            &path,
            Some(&ints()),
            &RowBounds::new().with_min(2),
        );
        assert!(log.defects.contains(&Defect::CellError {
            row: 1,
            column: 2,
            reason: "was not integer: \"oops\"".to_string(),
        }));
        assert!(log
            .defects
            .iter()
            .any(|d| matches!(d, Defect::BadRowCount { rows: 1, .. })));
    }

    #[test]
    fn test_cell_errors_are_capped() {
        let tmp = tempfile::tempdir().unwrap();
        let mut body = String::from("x,y\n");
        for _ in 0..(MAX_CELL_ERRORS + 50) {
            body.push_str("a,b\n");
        }
        let path = write(tmp.path(), &body);
        let reg = DatatypeRegistry::with_builtins();
        let log = ContentChecker::new(&reg).check(&path, Some(&ints()), &RowBounds::new());
        assert_eq!(log.defects.len(), MAX_CELL_ERRORS);
    }

    #[test]
    fn test_raw_has_raw_identity() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write(tmp.path(), "anything at all");
        let reg = DatatypeRegistry::with_builtins();
        let log = ContentChecker::new(&reg).check(&path, None, &RowBounds::new());
        assert!(log.is_ok());
        assert!(log.identity.unwrap().is_raw());
    }

    #[test]
    fn test_integrity_conflict() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write(tmp.path(), "x,y\n");
        let ok = IntegrityCheckLog::check(&path, Some(Md5Digest::compute(b"x,y\n")));
        assert!(ok.is_ok());

        let bad = IntegrityCheckLog::check(&path, Some(Md5Digest::compute(b"other")));
        assert!(matches!(bad.defects[0], IntegrityDefect::Md5Conflict { .. }));

        let gone = IntegrityCheckLog::check(&tmp.path().join("gone"), None);
        assert!(matches!(gone.defects[0], IntegrityDefect::ReadFailed { .. }));
    }
}
