//! Removal plans: everything that has to go when a dataset goes.

use serde::{Deserialize, Serialize};
use sluice_core::{ExecRecordId, Md5Digest, RunId};
use std::collections::BTreeSet;

/// What removing a dataset cascades into
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovalPlan {
    /// Dataset digests to remove
    pub datasets: BTreeSet<Md5Digest>,
    /// ExecRecords to remove
    pub records: BTreeSet<ExecRecordId>,
    /// Runs that consumed or produced removed data
    pub runs: BTreeSet<RunId>,
    /// Bytes of stored data that would be reclaimed
    pub reclaim_bytes: u64,
}

impl RemovalPlan {
    /// Create an empty plan
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if plan is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.datasets.is_empty() && self.records.is_empty() && self.runs.is_empty()
    }

    /// Recompute reclaimable bytes from stored sizes
    pub fn update_stats(&mut self, size_of: impl Fn(&Md5Digest) -> Option<u64>) {
        self.reclaim_bytes = self.datasets.iter().filter_map(size_of).sum();
    }

    /// Merge another plan into this one
    pub fn merge(&mut self, other: RemovalPlan) {
        self.datasets.extend(other.datasets);
        self.records.extend(other.records);
        self.runs.extend(other.runs);
        self.reclaim_bytes += other.reclaim_bytes;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_plan() {
        let plan = RemovalPlan::new();
        assert!(plan.is_empty());
        assert_eq!(plan.reclaim_bytes, 0);
    }

    #[test]
    fn test_update_stats_skips_unstored() {
        let mut plan = RemovalPlan::new();
        let stored = Md5Digest::compute(b"stored");
        plan.datasets.insert(stored);
        plan.datasets.insert(Md5Digest::compute(b"symbolic"));
        plan.update_stats(|d| (*d == stored).then_some(10));
        assert_eq!(plan.reclaim_bytes, 10);
    }

    #[test]
    fn test_merge() {
        let mut a = RemovalPlan::new();
        a.runs.insert(RunId::new());
        let mut b = RemovalPlan::new();
        b.records.insert(ExecRecordId::new());
        b.reclaim_bytes = 5;
        a.merge(b);
        assert_eq!(a.runs.len(), 1);
        assert_eq!(a.records.len(), 1);
        assert_eq!(a.reclaim_bytes, 5);
    }
}
