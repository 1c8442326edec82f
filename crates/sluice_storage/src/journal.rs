//! Durable journal of ExecRecords backed by redb.
//!
//! Values are postcard-encoded records keyed by record id. The journal is
//! write-through: the in-memory store stays authoritative for lookups.

use crate::error::StoreResult;
use crate::execrecord::ExecRecord;
use redb::{Database, ReadableTable, TableDefinition};
use sluice_core::ExecRecordId;
use std::path::Path;

const RECORDS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("execrecords");

/// redb-backed record journal
pub struct RecordJournal {
    db: Database,
}

impl RecordJournal {
    /// Open or create a journal file
    ///
    /// # Errors
    ///
    /// Returns error if the database cannot be opened
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let db = Database::create(path.as_ref())?;
        let txn = db.begin_write()?;
        txn.open_table(RECORDS)?;
        txn.commit()?;
        Ok(Self { db })
    }

    /// Insert or replace a record
    ///
    /// # Errors
    ///
    /// Returns error if the write transaction fails
    pub fn put(&self, record: &ExecRecord) -> StoreResult<()> {
        let value = postcard::to_allocvec(record)?;
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(RECORDS)?;
            table.insert(record.id.as_bytes().as_slice(), value.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Remove a record
    ///
    /// # Errors
    ///
    /// Returns error if the write transaction fails
    pub fn remove(&self, id: &ExecRecordId) -> StoreResult<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(RECORDS)?;
            table.remove(id.as_bytes().as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Load every record
    ///
    /// # Errors
    ///
    /// Returns error if reading or decoding fails
    pub fn load_all(&self) -> StoreResult<Vec<ExecRecord>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(RECORDS)?;
        let mut records = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            records.push(postcard::from_bytes(value.value())?);
        }
        records.sort_by_key(|r: &ExecRecord| r.created_at);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::Principal;
    use crate::execrecord::ExecRecordOutput;
    use sluice_core::{ContentIdentity, Md5Digest};
    use sluice_plan::{CableSignature, Computation};

    fn record() -> ExecRecord {
        ExecRecord::new(
            Computation::Cable(CableSignature::trivial()),
            vec![ContentIdentity::raw(Md5Digest::compute(b"a"))],
            vec![ExecRecordOutput::checked(ContentIdentity::raw(
                Md5Digest::compute(b"a"),
            ))],
            Principal::new("alice"),
        )
    }

    #[test]
    fn test_put_and_reload() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("records.redb");
        let er = record();
        {
            let journal = RecordJournal::open(&path).unwrap();
            journal.put(&er).unwrap();
        }
        let reopened = RecordJournal::open(&path).unwrap();
        assert_eq!(reopened.load_all().unwrap(), vec![er]);
    }

    #[test]
    fn test_put_replaces_and_remove_deletes() {
        let tmp = tempfile::tempdir().unwrap();
        let journal = RecordJournal::open(tmp.path().join("records.redb")).unwrap();
        let mut er = record();
        journal.put(&er).unwrap();
        er.redacted = true;
        journal.put(&er).unwrap();
        let loaded = journal.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded[0].redacted);

        journal.remove(&er.id).unwrap();
        assert!(journal.load_all().unwrap().is_empty());
    }
}
