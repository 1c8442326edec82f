//! Content-addressable ExecRecord store.
//!
//! Records are looked up by computation and ordered input digests. Method
//! computations match exactly; cable computations match by wiring
//! compatibility. Several records may share a key after a race, but at most
//! one may be authoritative (usable with all output bytes stored). A second
//! authoritative record is reported as corruption, never silently accepted.

use crate::access::{AccessPolicy, OpenAccess, Principal};
use crate::dataset::DatasetStore;
use crate::error::{StoreError, StoreResult};
use crate::execrecord::{ExecRecord, ExecRecordOutput, ReuseGrade};
use crate::journal::RecordJournal;
use crate::removal::RemovalPlan;
use serde::{Deserialize, Serialize};
use sluice_core::{ContentIdentity, ExecRecordId, Md5Digest};
use sluice_plan::{Computation, DatatypeRegistry};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

/// Store statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    /// Records held
    pub record_count: usize,
    /// Lookups served
    pub lookups: u64,
    /// Lookups that found a reusable record
    pub hits: u64,
    /// Corruption errors raised
    pub corruptions: u64,
}

#[derive(Default)]
struct Index {
    records: HashMap<ExecRecordId, ExecRecord>,
    by_inputs: HashMap<Vec<Md5Digest>, Vec<ExecRecordId>>,
}

impl Index {
    fn insert(&mut self, record: ExecRecord) {
        self.by_inputs
            .entry(record.input_key())
            .or_default()
            .push(record.id);
        self.records.insert(record.id, record);
    }

    fn remove(&mut self, id: &ExecRecordId) -> Option<ExecRecord> {
        let record = self.records.remove(id)?;
        if let Some(ids) = self.by_inputs.get_mut(&record.input_key()) {
            ids.retain(|other| other != id);
        }
        Some(record)
    }

    fn candidates(&self, inputs: &[Md5Digest]) -> impl Iterator<Item = &ExecRecord> {
        self.by_inputs
            .get(inputs)
            .into_iter()
            .flatten()
            .filter_map(|id| self.records.get(id))
    }
}

/// Shared memoization store
pub struct ExecRecordStore {
    index: RwLock<Index>,
    stats: RwLock<StoreStats>,
    datasets: Arc<dyn DatasetStore>,
    access: Arc<dyn AccessPolicy>,
    journal: Option<RecordJournal>,
}

impl ExecRecordStore {
    /// Create a store without a journal
    #[must_use]
    pub fn in_memory(datasets: Arc<dyn DatasetStore>) -> Self {
        Self {
            index: RwLock::new(Index::default()),
            stats: RwLock::new(StoreStats::default()),
            datasets,
            access: Arc::new(OpenAccess),
            journal: None,
        }
    }

    /// Open a journaled store, loading every record it holds
    ///
    /// # Errors
    ///
    /// Returns error if the journal cannot be opened or decoded
    pub fn open(path: impl AsRef<Path>, datasets: Arc<dyn DatasetStore>) -> StoreResult<Self> {
        let journal = RecordJournal::open(path)?;
        let mut index = Index::default();
        for record in journal.load_all()? {
            index.insert(record);
        }
        tracing::info!(records = index.records.len(), "loaded ExecRecord journal");
        let record_count = index.records.len();
        Ok(Self {
            index: RwLock::new(index),
            stats: RwLock::new(StoreStats {
                record_count,
                ..StoreStats::default()
            }),
            datasets,
            access: Arc::new(OpenAccess),
            journal: Some(journal),
        })
    }

    /// Set the access policy consulted before cross-principal reuse
    #[must_use]
    pub fn with_access_policy(mut self, access: Arc<dyn AccessPolicy>) -> Self {
        self.access = access;
        self
    }

    /// Dataset store used to decide whether outputs have data
    #[must_use]
    pub fn datasets(&self) -> &Arc<dyn DatasetStore> {
        &self.datasets
    }

    /// Grade a record, `None` if it cannot be reused
    #[must_use]
    pub fn grade(&self, record: &ExecRecord) -> Option<ReuseGrade> {
        if !record.is_usable() {
            return None;
        }
        if record
            .outputs
            .iter()
            .all(|o| self.datasets.has_data(&o.identity.md5))
        {
            Some(ReuseGrade::HasData)
        } else {
            Some(ReuseGrade::SymbolicOnly)
        }
    }

    fn matches(
        required: &Computation,
        candidate: &Computation,
        registry: &DatatypeRegistry,
    ) -> bool {
        match (required, candidate) {
            (Computation::Cable(want), Computation::Cable(have)) => want.accepts(have, registry),
            (want, have) => want == have,
        }
    }

    /// Find the best reusable record for a computation over inputs
    ///
    /// Records the principal may not access are skipped. Stored bytes are
    /// preferred over symbolic-only records; ties go to the oldest record.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateAuthoritative` if two conflicting authoritative
    /// records visible to the principal exist for the exact key
    pub fn find_reusable(
        &self,
        computation: &Computation,
        inputs: &[ContentIdentity],
        principal: &Principal,
        registry: &DatatypeRegistry,
    ) -> StoreResult<Option<(ExecRecord, ReuseGrade)>> {
        let key: Vec<Md5Digest> = inputs.iter().map(|i| i.md5).collect();
        let found = {
            let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
            let mut graded: Vec<(&ExecRecord, ReuseGrade)> = index
                .candidates(&key)
                .filter(|r| Self::matches(computation, &r.computation, registry))
                .filter_map(|r| self.grade(r).map(|g| (r, g)))
                .collect();

            graded.retain(|(r, _)| self.access.user_can_access(principal, &r.owner));

            let authoritative: Vec<&ExecRecord> = graded
                .iter()
                .filter(|(r, g)| *g == ReuseGrade::HasData && r.computation == *computation)
                .map(|(r, _)| *r)
                .collect();
            for (i, first) in authoritative.iter().enumerate() {
                if let Some(second) = authoritative[i + 1..].iter().find(|other| self.conflicts(first, other)) {
                    return Err(self.corruption(computation, first.id, second.id));
                }
            }

            graded.sort_by_key(|(r, g)| (*g, r.created_at));
            graded.first().map(|(r, g)| ((*r).clone(), *g))
        };

        let mut stats = self.stats.write().unwrap_or_else(PoisonError::into_inner);
        stats.lookups += 1;
        if found.is_some() {
            stats.hits += 1;
        }
        if let Some((record, grade)) = &found {
            tracing::debug!(record = %record.id, %computation, ?grade, "found reusable ExecRecord");
        }
        Ok(found)
    }

    /// Record a finished, verified execution
    ///
    /// # Errors
    ///
    /// Returns `DuplicateAuthoritative` if the new record conflicts with an
    /// existing authoritative record, or a journal error
    pub fn create(
        &self,
        computation: Computation,
        inputs: Vec<ContentIdentity>,
        outputs: Vec<ExecRecordOutput>,
        owner: Principal,
    ) -> StoreResult<ExecRecord> {
        let record = ExecRecord::new(computation, inputs, outputs, owner);
        let mut index = self.index.write().unwrap_or_else(PoisonError::into_inner);

        let rival = index
            .candidates(&record.input_key())
            .find(|other| self.conflicts(other, &record))
            .map(|other| other.id);
        if let Some(rival) = rival {
            drop(index);
            return Err(self.corruption(&record.computation, rival, record.id));
        }

        if let Some(journal) = &self.journal {
            journal.put(&record)?;
        }
        index.insert(record.clone());
        let count = index.records.len();
        drop(index);
        self.stats
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .record_count = count;
        tracing::debug!(record = %record.id, computation = %record.computation, "created ExecRecord");
        Ok(record)
    }

    /// Whether two records are rival authoritative results for one key
    ///
    /// Both must hold stored data for the same computation, and one owner
    /// must be able to see the other's record. Principals that cannot see
    /// each other keep independent results.
    fn conflicts(&self, a: &ExecRecord, b: &ExecRecord) -> bool {
        a.id != b.id
            && a.computation == b.computation
            && a.input_key() == b.input_key()
            && self.grade(a) == Some(ReuseGrade::HasData)
            && self.grade(b) == Some(ReuseGrade::HasData)
            && (self.access.user_can_access(&a.owner, &b.owner)
                || self.access.user_can_access(&b.owner, &a.owner))
    }

    fn corruption(
        &self,
        computation: &Computation,
        first: ExecRecordId,
        second: ExecRecordId,
    ) -> StoreError {
        self.stats
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .corruptions += 1;
        tracing::error!(%first, %second, %computation, "duplicate authoritative ExecRecords");
        StoreError::DuplicateAuthoritative {
            computation: computation.to_string(),
            first,
            second,
        }
    }

    /// Get a record by id
    #[must_use]
    pub fn get(&self, id: &ExecRecordId) -> Option<ExecRecord> {
        self.index
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .records
            .get(id)
            .cloned()
    }

    fn update(&self, id: &ExecRecordId, f: impl FnOnce(&mut ExecRecord)) -> StoreResult<ExecRecord> {
        let mut index = self.index.write().unwrap_or_else(PoisonError::into_inner);
        let record = index
            .records
            .get_mut(id)
            .ok_or(StoreError::RecordNotFound { id: *id })?;
        f(record);
        if let Some(journal) = &self.journal {
            journal.put(record)?;
        }
        Ok(record.clone())
    }

    /// Stop a record from ever being reused again
    ///
    /// # Errors
    ///
    /// Returns error if the record does not exist
    pub fn quarantine(&self, id: &ExecRecordId) -> StoreResult<ExecRecord> {
        tracing::warn!(record = %id, "quarantining ExecRecord");
        self.update(id, |r| r.quarantined = true)
    }

    /// Lift a quarantine after a successful rerun
    ///
    /// # Errors
    ///
    /// Returns error if the record does not exist
    pub fn release(&self, id: &ExecRecordId) -> StoreResult<ExecRecord> {
        self.update(id, |r| r.quarantined = false)
    }

    /// Mark every record touching a digest as redacted, returning their ids
    ///
    /// # Errors
    ///
    /// Returns error if the journal write fails
    pub fn redact(&self, md5: &Md5Digest) -> StoreResult<Vec<ExecRecordId>> {
        let ids: Vec<ExecRecordId> = {
            let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
            index
                .records
                .values()
                .filter(|r| r.touches(md5) && !r.redacted)
                .map(|r| r.id)
                .collect()
        };
        for id in &ids {
            self.update(id, |r| r.redacted = true)?;
        }
        tracing::info!(%md5, records = ids.len(), "redacted ExecRecords");
        Ok(ids)
    }

    /// Everything that must go if a dataset is removed
    ///
    /// Collects records that consumed or produced the digest, then follows
    /// the outputs of consuming records downstream.
    #[must_use]
    pub fn build_removal_plan(&self, md5: &Md5Digest) -> RemovalPlan {
        let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
        let mut plan = RemovalPlan::new();
        let mut pending = vec![*md5];
        let mut seen = BTreeSet::new();

        while let Some(current) = pending.pop() {
            if !seen.insert(current) {
                continue;
            }
            plan.datasets.insert(current);
            for record in index.records.values() {
                if record.produces(&current) {
                    plan.records.insert(record.id);
                }
                if record.inputs.iter().any(|i| i.md5 == current) {
                    plan.records.insert(record.id);
                    pending.extend(record.outputs.iter().map(|o| o.identity.md5));
                }
            }
        }
        plan.update_stats(|d| self.datasets.record(d).map(|r| r.size));
        plan
    }

    /// Carry out a removal plan
    ///
    /// # Errors
    ///
    /// Returns error on the first journal or filesystem failure
    pub fn execute_removal(&self, plan: &RemovalPlan) -> StoreResult<usize> {
        let mut removed = 0;
        {
            let mut index = self.index.write().unwrap_or_else(PoisonError::into_inner);
            for id in &plan.records {
                if index.remove(id).is_some() {
                    if let Some(journal) = &self.journal {
                        journal.remove(id)?;
                    }
                    removed += 1;
                }
            }
            self.stats
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .record_count = index.records.len();
        }
        for md5 in &plan.datasets {
            self.datasets.purge(md5)?;
        }
        tracing::info!(records = removed, datasets = plan.datasets.len(), "executed removal plan");
        Ok(removed)
    }

    /// Number of records
    #[must_use]
    pub fn len(&self) -> usize {
        self.index
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .records
            .len()
    }

    /// Whether the store holds no records
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current statistics
    #[must_use]
    pub fn stats(&self) -> StoreStats {
        self.stats
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
