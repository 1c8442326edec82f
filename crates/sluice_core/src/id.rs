//! Unique identifiers for sluice entities.
//!
//! All IDs are random UUIDs. Their `Display` form carries a short kind prefix
//! so log lines stay readable, and `parse` accepts that form back.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            /// Create a new random identifier
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Create from UUID bytes
            #[must_use]
            pub const fn from_bytes(bytes: [u8; 16]) -> Self {
                Self(Uuid::from_bytes(bytes))
            }

            /// Get as UUID
            #[must_use]
            pub const fn as_uuid(&self) -> Uuid {
                self.0
            }

            /// Get as bytes
            #[must_use]
            pub const fn as_bytes(&self) -> &[u8; 16] {
                self.0.as_bytes()
            }

            /// Parse from the prefixed display form or a bare UUID
            ///
            /// # Errors
            ///
            /// Returns error if the text is not a valid UUID
            pub fn parse(s: &str) -> CoreResult<Self> {
                let raw = s.strip_prefix(concat!($prefix, "_")).unwrap_or(s);
                Uuid::parse_str(raw)
                    .map(Self)
                    .map_err(|e| CoreError::InvalidId {
                        reason: format!("{}: {}", s, e),
                    })
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!($prefix, "_{}"), self.0)
            }
        }
    };
}

uuid_id!(
    /// Run identifier - one execution of a pipeline over one input tuple
    RunId,
    "run"
);

uuid_id!(
    /// Run component identifier - one step or cable instance inside a run
    ComponentId,
    "rc"
);

uuid_id!(
    /// ExecRecord identifier
    ExecRecordId,
    "er"
);

uuid_id!(
    /// Run request identifier, assigned by the fleet queue
    RequestId,
    "req"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_id_display() {
        let id = RunId::from_bytes([0; 16]);
        assert_eq!(
            id.to_string(),
            "run_00000000-0000-0000-0000-000000000000"
        );
    }

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(ComponentId::new(), ComponentId::new());
        assert_ne!(ExecRecordId::new(), ExecRecordId::new());
    }

    #[test]
    fn test_parse_round_trip() {
        let id = ExecRecordId::new();
        assert_eq!(ExecRecordId::parse(&id.to_string()).unwrap(), id);
        assert_eq!(ExecRecordId::parse(&id.as_uuid().to_string()).unwrap(), id);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            RequestId::parse("req_nope"),
            Err(CoreError::InvalidId { .. })
        ));
    }
}
