//! SLUICE Core Types
//!
//! Pure types shared by every sluice crate: identifiers, content identities,
//! stopwatches, and the core error type. Only `ContentIdentity` hashing
//! touches the filesystem.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod id;
pub mod identity;
pub mod stopwatch;

// Re-exports
pub use error::{CoreError, CoreResult};
pub use id::{ComponentId, ExecRecordId, RequestId, RunId};
pub use identity::{ContentIdentity, Md5Digest};
pub use stopwatch::Stopwatch;
