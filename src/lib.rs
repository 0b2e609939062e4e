pub mod cluster;
pub mod collection;
pub mod config;
pub mod error;
pub mod filter;
pub mod isolation;
pub mod lock;
pub mod manager;
pub mod model;
pub mod parser;
pub mod server;
pub mod storage;
pub mod transaction;

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::collection::Collection;
use crate::error::{DbError, Result};
use crate::filter::Query;
use crate::isolation::IsolationLevel;
use crate::model::{Document, NewDocument, OpAction, OpLog, Record};
use crate::storage::{decode_snapshot, encode_snapshot, BlobStore, MemoryBlobStore};
use crate::transaction::Transaction;

/// Counters exposed by the stats endpoint.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DbStats {
    pub records: usize,
    pub active_transactions: usize,
    pub lock_entries: usize,
}

/// Process-wide orchestrator: one collection, the open transactions, and the
/// snapshot blob.
pub struct TesseraDb {
    collection: Arc<Collection>,
    transactions: RwLock<HashMap<u64, Arc<Mutex<Transaction>>>>,
    blob_store: Box<dyn BlobStore>,
}

impl fmt::Debug for TesseraDb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TesseraDb")
            .field("records", &self.collection.len())
            .field("open_transactions", &self.transactions.read().map(|t| t.len()).unwrap_or(0))
            .finish()
    }
}

impl TesseraDb {
    /// Opens the store and hydrates it from the blob. A missing or corrupt
    /// snapshot leaves the store empty.
    pub fn new(blob_store: Box<dyn BlobStore>) -> Self {
        let db = Self {
            collection: Arc::new(Collection::new()),
            transactions: RwLock::new(HashMap::new()),
            blob_store,
        };
        db.load();
        db
    }

    pub fn in_memory() -> Self {
        Self::new(Box::new(MemoryBlobStore::new()))
    }

    pub fn collection(&self) -> &Arc<Collection> {
        &self.collection
    }

    // --- TRANSACTION LIFECYCLE ---

    pub fn begin_transaction(&self, level: IsolationLevel) -> Result<u64> {
        let tx = self.collection.begin(level)?;
        let id = tx.id();
        self.transactions
            .write()
            .map_err(|_| DbError::Poisoned("transaction table"))?
            .insert(id, Arc::new(Mutex::new(tx)));
        info!(transaction = id, %level, "Begin transaction");
        Ok(id)
    }

    /// Commits and returns the oplog to propagate.
    pub fn commit(&self, id: u64) -> Result<OpLog> {
        let oplog = self.with_transaction(id, |tx| tx.commit())?;
        self.forget(id)?;
        Ok(oplog)
    }

    pub fn rollback(&self, id: u64) -> Result<()> {
        self.with_transaction(id, |tx| tx.rollback())?;
        self.forget(id)
    }

    pub fn open_transactions(&self) -> Result<BTreeSet<u64>> {
        let table = self.transactions.read().map_err(|_| DbError::Poisoned("transaction table"))?;
        Ok(table.keys().copied().collect())
    }

    fn forget(&self, id: u64) -> Result<()> {
        self.transactions
            .write()
            .map_err(|_| DbError::Poisoned("transaction table"))?
            .remove(&id);
        Ok(())
    }

    /// Runs `op` against an open transaction. A conflict rolls the whole
    /// transaction back before the error is returned.
    fn with_transaction<T, F>(&self, id: u64, op: F) -> Result<T>
    where
        F: FnOnce(&mut Transaction) -> Result<T>,
    {
        let handle = {
            let table = self.transactions.read().map_err(|_| DbError::Poisoned("transaction table"))?;
            table.get(&id).cloned().ok_or(DbError::TransactionNotFound(id))?
        };
        let mut tx = handle.lock().map_err(|_| DbError::Poisoned("transaction"))?;
        if !tx.is_active() {
            return Err(DbError::TransactionNotFound(id));
        }

        match op(&mut *tx) {
            Err(err @ DbError::Conflict { .. }) => {
                warn!(transaction = id, "Conflict, rolling transaction back");
                tx.rollback()?;
                drop(tx);
                self.forget(id)?;
                Err(err)
            }
            other => other,
        }
    }

    // --- DOCUMENT OPERATIONS ---

    pub fn insert_one(&self, id: u64, name: &str, doc: Document) -> Result<u64> {
        self.with_transaction(id, |tx| tx.add_record(name, doc))
    }

    pub fn insert_many(&self, id: u64, docs: Vec<NewDocument>) -> Result<Vec<u64>> {
        self.with_transaction(id, |tx| {
            docs.into_iter()
                .map(|d| tx.add_record(&d.name, d.doc))
                .collect()
        })
    }

    pub fn find(&self, id: u64, query: &Query) -> Result<Vec<Record>> {
        self.with_transaction(id, |tx| find_in(tx, query))
    }

    /// Replaces every matched version with a new version carrying `doc`.
    /// Returns how many versions were replaced.
    pub fn update(&self, id: u64, query: &Query, doc: Document) -> Result<usize> {
        self.with_transaction(id, |tx| {
            let targets = find_in(tx, query)?;
            let ids: BTreeSet<u64> = targets.iter().map(|r| r.id).collect();
            tx.delete_where(|r| ids.contains(&r.id))?;

            let mut names: Vec<&str> = Vec::new();
            for target in &targets {
                if !names.contains(&target.name.as_str()) {
                    names.push(&target.name);
                }
            }
            for name in names {
                tx.add_record(name, doc.clone())?;
            }
            Ok(targets.len())
        })
    }

    pub fn delete(&self, id: u64, query: &Query) -> Result<usize> {
        self.with_transaction(id, |tx| {
            let ids: BTreeSet<u64> = find_in(tx, query)?.into_iter().map(|r| r.id).collect();
            tx.delete_where(|r| ids.contains(&r.id))
        })
    }

    /// Replays an oplog from a peer in a fresh local transaction. The commit
    /// here never propagates further.
    pub fn replicate(&self, oplog: &OpLog) -> Result<u64> {
        let id = self.begin_transaction(IsolationLevel::ReadCommitted)?;
        let replayed = self.with_transaction(id, |tx| {
            for entry in oplog {
                match entry.action {
                    OpAction::Insert => {
                        tx.add_record(&entry.record.name, entry.record.doc.clone())?;
                    }
                    OpAction::Delete => {
                        // One version per entry: same name and document, not
                        // one this replay just inserted
                        let shipped = &entry.record;
                        let own = tx.id();
                        let target = tx
                            .fetch(|r| r.created_id != own && r.name == shipped.name && r.doc == shipped.doc)?
                            .first()
                            .map(|r| r.id);
                        match target {
                            Some(target) => {
                                tx.delete_where(|r| r.id == target)?;
                            }
                            None => warn!(record = shipped.id, "Replicated delete matched no local version"),
                        }
                    }
                }
            }
            Ok(())
        });
        if let Err(e) = replayed {
            if self.open_transactions()?.contains(&id) {
                self.rollback(id)?;
            }
            return Err(e);
        }
        self.commit(id)?;
        info!(transaction = id, ops = oplog.len(), "Replicated oplog applied");
        Ok(id)
    }

    // --- SNAPSHOTS ---

    /// Hydrates the collection from the blob store. Never fails: unreadable
    /// data leaves the collection empty.
    pub fn load(&self) -> usize {
        let records = match self.blob_store.load() {
            Ok(Some(bytes)) => match decode_snapshot(&bytes) {
                Ok(records) => records,
                Err(e) => {
                    error!("Snapshot unreadable, starting empty: {}", e);
                    Vec::new()
                }
            },
            Ok(None) => {
                warn!("No snapshot found, starting empty");
                Vec::new()
            }
            Err(e) => {
                error!("Snapshot load failed, starting empty: {}", e);
                Vec::new()
            }
        };
        let count = records.len();
        if let Err(e) = self.collection.load(records) {
            error!("Collection load failed: {}", e);
            return 0;
        }
        count
    }

    /// Writes the committed state to the blob store.
    pub fn save(&self) -> Result<usize> {
        let records = self.collection.dump()?;
        let bytes = encode_snapshot(&records)?;
        self.blob_store.save(&bytes)?;
        info!(records = records.len(), bytes = bytes.len(), "Snapshot saved");
        Ok(records.len())
    }

    pub fn stats(&self) -> Result<DbStats> {
        Ok(DbStats {
            records: self.collection.len(),
            active_transactions: self.collection.active_ids()?.len(),
            lock_entries: self.collection.locks().len(),
        })
    }
}

fn find_in(tx: &Transaction, query: &Query) -> Result<Vec<Record>> {
    let mut hits = tx.fetch(|r| query.filter.matches(r))?;
    query.truncate(&mut hits);
    Ok(hits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::Filter;
    use serde_json::json;

    fn doc(value: serde_json::Value) -> Document {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_unknown_transaction_is_not_found() {
        let db = TesseraDb::in_memory();
        assert!(matches!(db.commit(42), Err(DbError::TransactionNotFound(42))));
        assert!(matches!(db.find(42, &Query::default()), Err(DbError::TransactionNotFound(42))));
    }

    #[test]
    fn test_committed_transaction_is_forgotten() {
        let db = TesseraDb::in_memory();
        let t = db.begin_transaction(IsolationLevel::ReadCommitted).unwrap();
        db.commit(t).unwrap();
        assert!(matches!(db.insert_one(t, "a", Document::new()), Err(DbError::TransactionNotFound(_))));
        assert!(db.open_transactions().unwrap().is_empty());
    }

    #[test]
    fn test_update_replaces_matched_versions() {
        let db = TesseraDb::in_memory();
        let t = db.begin_transaction(IsolationLevel::ReadCommitted).unwrap();
        db.insert_one(t, "a", doc(json!({"x": 1}))).unwrap();
        db.insert_one(t, "b", doc(json!({"x": 2}))).unwrap();

        let changed = db.update(t, &Query::new(Filter::eq("x", "1")), doc(json!({"x": 10}))).unwrap();
        assert_eq!(changed, 1);

        let all = db.find(t, &Query::default()).unwrap();
        let pairs: Vec<_> = all.iter().map(|r| (r.name.as_str(), r.doc["x"].clone())).collect();
        assert_eq!(pairs, vec![("b", json!(2)), ("a", json!(10))]);
        db.commit(t).unwrap();
    }

    #[test]
    fn test_delete_with_limit() {
        let db = TesseraDb::in_memory();
        let t = db.begin_transaction(IsolationLevel::ReadCommitted).unwrap();
        db.insert_many(
            t,
            (0..5).map(|i| NewDocument { name: format!("n{}", i), doc: Document::new() }).collect(),
        )
        .unwrap();

        assert_eq!(db.delete(t, &Query::default().with_limit(2)).unwrap(), 2);
        assert_eq!(db.find(t, &Query::default()).unwrap().len(), 3);
    }

    #[test]
    fn test_conflict_rolls_transaction_back() {
        let db = TesseraDb::in_memory();
        let seed = db.begin_transaction(IsolationLevel::ReadCommitted).unwrap();
        db.insert_one(seed, "a", doc(json!({"x": 1}))).unwrap();
        db.commit(seed).unwrap();

        let reader = db.begin_transaction(IsolationLevel::RepeatableRead).unwrap();
        assert_eq!(db.find(reader, &Query::new(Filter::eq("name", "a"))).unwrap().len(), 1);

        let writer = db.begin_transaction(IsolationLevel::RepeatableRead).unwrap();
        db.insert_one(writer, "side", Document::new()).unwrap();
        let err = db.delete(writer, &Query::new(Filter::eq("name", "a"))).unwrap_err();
        assert!(matches!(err, DbError::Conflict { .. }));

        // writer is gone and its insert is invisible
        assert!(matches!(db.commit(writer), Err(DbError::TransactionNotFound(_))));
        let names: Vec<_> = db.find(reader, &Query::default()).unwrap().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["a"]);
    }

    #[test]
    fn test_replicate_replays_inserts_and_deletes() {
        let origin = TesseraDb::in_memory();
        let t = origin.begin_transaction(IsolationLevel::ReadCommitted).unwrap();
        origin.insert_one(t, "a", doc(json!({"v": 1}))).unwrap();
        let oplog = origin.commit(t).unwrap();

        let replica = TesseraDb::in_memory();
        replica.replicate(&oplog).unwrap();

        let t = origin.begin_transaction(IsolationLevel::ReadCommitted).unwrap();
        origin.update(t, &Query::new(Filter::eq("name", "a")), doc(json!({"v": 2}))).unwrap();
        let oplog = origin.commit(t).unwrap();
        replica.replicate(&oplog).unwrap();

        let r = replica.begin_transaction(IsolationLevel::ReadCommitted).unwrap();
        let found = replica.find(r, &Query::new(Filter::eq("name", "a"))).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].doc["v"], json!(2));
        assert_eq!(replica.collection().active_ids().unwrap(), BTreeSet::from([r]));
    }

    fn visible(db: &TesseraDb) -> Vec<(String, Document)> {
        let t = db.begin_transaction(IsolationLevel::ReadCommitted).unwrap();
        let found = db.find(t, &Query::default()).unwrap();
        db.rollback(t).unwrap();
        found.into_iter().map(|r| (r.name, r.doc)).collect()
    }

    #[test]
    fn test_replicated_delete_expires_only_the_shipped_version() {
        let origin = TesseraDb::in_memory();
        let replica = TesseraDb::in_memory();

        let t = origin.begin_transaction(IsolationLevel::ReadCommitted).unwrap();
        origin.insert_one(t, "a", doc(json!({"x": 1}))).unwrap();
        origin.insert_one(t, "a", doc(json!({"x": 2}))).unwrap();
        replica.replicate(&origin.commit(t).unwrap()).unwrap();

        let t = origin.begin_transaction(IsolationLevel::ReadCommitted).unwrap();
        assert_eq!(origin.delete(t, &Query::new(Filter::eq("x", "1"))).unwrap(), 1);
        replica.replicate(&origin.commit(t).unwrap()).unwrap();

        assert_eq!(visible(&origin), vec![("a".to_string(), doc(json!({"x": 2})))]);
        assert_eq!(visible(&replica), visible(&origin));
    }

    #[test]
    fn test_replicated_delete_skips_versions_inserted_by_the_same_oplog() {
        let origin = TesseraDb::in_memory();
        let replica = TesseraDb::in_memory();

        let t = origin.begin_transaction(IsolationLevel::ReadCommitted).unwrap();
        origin.insert_one(t, "a", doc(json!({"v": "old"}))).unwrap();
        replica.replicate(&origin.commit(t).unwrap()).unwrap();

        let t = origin.begin_transaction(IsolationLevel::ReadCommitted).unwrap();
        origin.insert_one(t, "a", doc(json!({"v": "new"}))).unwrap();
        origin.delete(t, &Query::new(Filter::eq("v", "old"))).unwrap();
        replica.replicate(&origin.commit(t).unwrap()).unwrap();

        assert_eq!(visible(&origin), vec![("a".to_string(), doc(json!({"v": "new"})))]);
        assert_eq!(visible(&replica), visible(&origin));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.snapshot");
        {
            let db = TesseraDb::new(Box::new(crate::storage::FileBlobStore::new(&path)));
            let t = db.begin_transaction(IsolationLevel::ReadCommitted).unwrap();
            db.insert_one(t, "Turing", doc(json!({"born": 1912}))).unwrap();
            db.insert_one(t, "Babbage", doc(json!({"born": 1791}))).unwrap();
            db.commit(t).unwrap();
            assert_eq!(db.save().unwrap(), 2);
        }

        let db = TesseraDb::new(Box::new(crate::storage::FileBlobStore::new(&path)));
        let t = db.begin_transaction(IsolationLevel::ReadCommitted).unwrap();
        let records = db.find(t, &Query::default()).unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.created_id == 0));

        let fresh = db.insert_one(t, "Lovelace", Document::new()).unwrap();
        assert!(records.iter().all(|r| r.id < fresh));
    }

    #[test]
    fn test_corrupt_blob_starts_empty() {
        let store = MemoryBlobStore::new();
        store.save(b"definitely not a snapshot").unwrap();
        let db = TesseraDb::new(Box::new(store));
        assert!(db.collection().is_empty());
    }
}
