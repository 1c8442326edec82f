//! SLUICE Storage
//!
//! The ExecRecord memoization store, the dataset store that holds retained
//! bytes, access control consulted before cross-principal reuse, output
//! check logs, and removal planning for datasets.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod access;
pub mod check;
pub mod dataset;
pub mod error;
pub mod execrecord;
pub mod journal;
pub mod record_store;
pub mod removal;

pub use access::{AccessPolicy, AllowList, OpenAccess, Principal};
pub use check::{ContentCheckLog, ContentChecker, Defect, IntegrityCheckLog, IntegrityDefect};
pub use dataset::{DatasetRecord, DatasetStore, FsDatasetStore};
pub use error::{StoreError, StoreResult};
pub use execrecord::{ExecRecord, ExecRecordOutput, ReuseGrade};
pub use journal::RecordJournal;
pub use record_store::{ExecRecordStore, StoreStats};
pub use removal::RemovalPlan;
