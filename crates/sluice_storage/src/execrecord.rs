//! ExecRecords: memoized input/output bindings for one computation.

use crate::access::Principal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sluice_core::{ContentIdentity, ExecRecordId, Md5Digest};
use sluice_plan::Computation;

/// One recorded output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecRecordOutput {
    /// Identity of the produced bytes
    pub identity: ContentIdentity,
    /// Whether the bytes passed their content check
    pub content_ok: bool,
}

impl ExecRecordOutput {
    /// An output that passed its content check
    #[must_use]
    pub const fn checked(identity: ContentIdentity) -> Self {
        Self {
            identity,
            content_ok: true,
        }
    }

    /// An output that failed its content check
    #[must_use]
    pub const fn failed(identity: ContentIdentity) -> Self {
        Self {
            identity,
            content_ok: false,
        }
    }
}

/// How good a reusable record is; better grades sort first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ReuseGrade {
    /// Every output's bytes are stored
    HasData,
    /// Outputs are known only by identity
    SymbolicOnly,
}

/// Memoized result of one computation over one input tuple
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecRecord {
    /// Record id
    pub id: ExecRecordId,
    /// What was computed
    pub computation: Computation,
    /// Input identities in order
    pub inputs: Vec<ContentIdentity>,
    /// Output identities in order
    pub outputs: Vec<ExecRecordOutput>,
    /// Every output was produced and checked
    pub complete: bool,
    /// Some input or output was redacted
    pub redacted: bool,
    /// A deterministic rerun disagreed with this record
    pub quarantined: bool,
    /// Principal whose run produced the record
    pub owner: Principal,
    /// When the record was created
    pub created_at: DateTime<Utc>,
}

impl ExecRecord {
    /// Create a record for a finished execution
    #[must_use]
    pub fn new(
        computation: Computation,
        inputs: Vec<ContentIdentity>,
        outputs: Vec<ExecRecordOutput>,
        owner: Principal,
    ) -> Self {
        let complete = outputs.iter().all(|o| o.content_ok);
        Self {
            id: ExecRecordId::new(),
            computation,
            inputs,
            outputs,
            complete,
            redacted: false,
            quarantined: false,
            owner,
            created_at: Utc::now(),
        }
    }

    /// Input digests, the lookup key alongside the computation
    #[must_use]
    pub fn input_key(&self) -> Vec<Md5Digest> {
        self.inputs.iter().map(|i| i.md5).collect()
    }

    /// Whether the record may satisfy a run at all
    #[must_use]
    pub const fn is_usable(&self) -> bool {
        self.complete && !self.redacted && !self.quarantined
    }

    /// Output identities in order
    #[must_use]
    pub fn output_identities(&self) -> Vec<ContentIdentity> {
        self.outputs.iter().map(|o| o.identity.clone()).collect()
    }

    /// Whether the record mentions a digest as input or output
    #[must_use]
    pub fn touches(&self, md5: &Md5Digest) -> bool {
        self.inputs.iter().any(|i| i.md5 == *md5) || self.produces(md5)
    }

    /// Whether a digest is among the outputs
    #[must_use]
    pub fn produces(&self, md5: &Md5Digest) -> bool {
        self.outputs.iter().any(|o| o.identity.md5 == *md5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(body: &[u8]) -> ContentIdentity {
        ContentIdentity::raw(Md5Digest::compute(body))
    }

    fn method() -> Computation {
        Computation::Method {
            name: "sum".to_string(),
            revision: 1,
        }
    }

    #[test]
    fn test_complete_tracks_content_checks() {
        let ok = ExecRecord::new(
            method(),
            vec![identity(b"in")],
            vec![ExecRecordOutput::checked(identity(b"out"))],
            Principal::new("alice"),
        );
        assert!(ok.complete);
        assert!(ok.is_usable());

        let bad = ExecRecord::new(
            method(),
            vec![identity(b"in")],
            vec![ExecRecordOutput::failed(identity(b"out"))],
            Principal::new("alice"),
        );
        assert!(!bad.complete);
        assert!(!bad.is_usable());
    }

    #[test]
    fn test_touches() {
        let er = ExecRecord::new(
            method(),
            vec![identity(b"in")],
            vec![ExecRecordOutput::checked(identity(b"out"))],
            Principal::new("alice"),
        );
        assert!(er.touches(&Md5Digest::compute(b"in")));
        assert!(er.produces(&Md5Digest::compute(b"out")));
        assert!(!er.produces(&Md5Digest::compute(b"in")));
        assert!(!er.touches(&Md5Digest::compute(b"nope")));
    }

    #[test]
    fn test_grade_order() {
        assert!(ReuseGrade::HasData < ReuseGrade::SymbolicOnly);
    }

    #[test]
    fn test_postcard_round_trip() {
        let er = ExecRecord::new(
            method(),
            vec![ContentIdentity::typed(Md5Digest::compute(b"in"), 3, "triple")],
            vec![ExecRecordOutput::checked(identity(b"out"))],
            Principal::new("alice"),
        );
        let bytes = postcard::to_allocvec(&er).unwrap();
        let back: ExecRecord = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(back, er);
    }
}
