use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info};

use crate::error::{DbError, Result};
use crate::isolation::IsolationLevel;
use crate::lock::LockManager;
use crate::model::Record;
use crate::transaction::Transaction;

/// Mutable core of a collection. Every read or write of the record map goes
/// through the single mutex wrapping this struct.
#[derive(Debug)]
pub(crate) struct CollectionState {
    /// Keyed by record id, which is also insertion order
    pub(crate) records: BTreeMap<u64, Record>,
    pub(crate) active_ids: BTreeSet<u64>,
    next_id: u64,
    next_doc: u64,
}

impl CollectionState {
    pub(crate) fn identity(&mut self) -> u64 {
        let id = self.next_doc;
        self.next_doc += 1;
        id
    }
}

/// Versioned record store for one shard instance.
#[derive(Debug)]
pub struct Collection {
    state: Mutex<CollectionState>,
    locks: LockManager,
}

impl Default for Collection {
    fn default() -> Self {
        Self::new()
    }
}

impl Collection {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CollectionState {
                records: BTreeMap::new(),
                active_ids: BTreeSet::new(),
                next_id: 1,
                next_doc: 1,
            }),
            locks: LockManager::new(),
        }
    }

    pub(crate) fn state(&self) -> Result<MutexGuard<'_, CollectionState>> {
        self.state.lock().map_err(|_| DbError::Poisoned("collection state"))
    }

    pub(crate) fn locks(&self) -> &LockManager {
        &self.locks
    }

    /// Admits a new transaction. Serializable transactions capture the active
    /// set (themselves included) under the same lock.
    pub fn begin(self: &Arc<Self>, level: IsolationLevel) -> Result<Transaction> {
        let mut state = self.state()?;
        let id = state.next_id;
        state.next_id += 1;
        state.active_ids.insert(id);

        let snapshot = (level == IsolationLevel::Serializable).then(|| state.active_ids.clone());
        debug!(transaction = id, %level, "Begin transaction");
        Ok(Transaction::new(Arc::clone(self), id, level, snapshot))
    }

    /// Hands out the next document identity.
    pub fn identity(&self) -> Result<u64> {
        Ok(self.state()?.identity())
    }

    /// Replaces the record sequence with loaded data and moves the identity
    /// counter past every loaded id.
    pub fn load(&self, records: Vec<Record>) -> Result<()> {
        let mut state = self.state()?;
        let max_id = records.iter().map(|r| r.id).max().unwrap_or(0);
        state.records = records.into_iter().map(|r| (r.id, r)).collect();
        state.next_doc = state.next_doc.max(max_id + 1);
        info!(records = state.records.len(), next_doc = state.next_doc, "Collection loaded");
        Ok(())
    }

    /// Copy of the committed state: uncommitted inserts are left out,
    /// uncommitted deletes are undone, dead versions are dropped.
    pub fn dump(&self) -> Result<Vec<Record>> {
        let state = self.state()?;
        let active = &state.active_ids;
        let committed = state
            .records
            .values()
            .filter(|r| !active.contains(&r.created_id))
            .filter(|r| r.expired_id == 0 || active.contains(&r.expired_id))
            .map(|r| Record { expired_id: 0, ..r.clone() })
            .collect();
        Ok(committed)
    }

    /// Physically removes versions no transaction can see any more and drops
    /// holds owned by finished transactions.
    pub fn vacuum(&self) -> Result<usize> {
        let mut state = self.state()?;
        let CollectionState { records, active_ids, .. } = &mut *state;

        let before = records.len();
        records.retain(|_, r| r.expired_id == 0 || active_ids.contains(&r.expired_id));
        let removed = before - records.len();

        let released = self.locks.retain_active(|id| active_ids.contains(&id))?;
        debug!(removed, released, "Vacuum finished");
        Ok(removed)
    }

    pub fn active_ids(&self) -> Result<BTreeSet<u64>> {
        Ok(self.state()?.active_ids.clone())
    }

    /// Number of stored versions, live or not.
    pub fn len(&self) -> usize {
        self.state().map(|s| s.records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Document;
    use std::collections::HashSet;
    use std::thread;

    #[test]
    fn test_begin_tracks_active_ids() {
        let col = Arc::new(Collection::new());
        let mut t1 = col.begin(IsolationLevel::ReadCommitted).unwrap();
        let t2 = col.begin(IsolationLevel::Serializable).unwrap();

        assert_eq!(t1.id() + 1, t2.id());
        assert_eq!(col.active_ids().unwrap(), BTreeSet::from([t1.id(), t2.id()]));

        t1.commit().unwrap();
        assert_eq!(col.active_ids().unwrap(), BTreeSet::from([t2.id()]));
    }

    #[test]
    fn test_identity_is_unique_under_contention() {
        let col = Arc::new(Collection::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let col = Arc::clone(&col);
                thread::spawn(move || {
                    let mut ids = Vec::new();
                    for _ in 0..250 {
                        ids.push(col.identity().unwrap());
                    }
                    ids
                })
            })
            .collect();

        let mut all = HashSet::new();
        for handle in handles {
            let ids = handle.join().unwrap();
            assert!(ids.windows(2).all(|w| w[0] < w[1]));
            for id in ids {
                assert!(all.insert(id), "duplicate identity {}", id);
            }
        }
        assert_eq!(all.len(), 2000);
    }

    #[test]
    fn test_load_reseeds_identity() {
        let col = Collection::new();
        col.load(vec![
            Record::new(4, "a", Document::new(), 0),
            Record::new(9, "b", Document::new(), 0),
        ])
        .unwrap();
        assert_eq!(col.identity().unwrap(), 10);
    }

    #[test]
    fn test_dump_keeps_only_committed_state() {
        let col = Arc::new(Collection::new());
        let mut seed = col.begin(IsolationLevel::ReadCommitted).unwrap();
        seed.add_record("kept", Document::new()).unwrap();
        seed.add_record("pending_delete", Document::new()).unwrap();
        seed.commit().unwrap();

        let mut open = col.begin(IsolationLevel::ReadCommitted).unwrap();
        open.add_record("uncommitted", Document::new()).unwrap();
        open.delete_record("pending_delete").unwrap();

        let mut names: Vec<_> = col.dump().unwrap().into_iter().map(|r| r.name).collect();
        names.sort();
        assert_eq!(names, vec!["kept", "pending_delete"]);
    }

    #[test]
    fn test_vacuum_drops_rolled_back_versions() {
        let col = Arc::new(Collection::new());
        let mut t = col.begin(IsolationLevel::RepeatableRead).unwrap();
        t.add_record("ghost", Document::new()).unwrap();
        t.fetch_all_records().unwrap();
        t.rollback().unwrap();

        assert_eq!(col.len(), 1);
        assert_eq!(col.vacuum().unwrap(), 1);
        assert!(col.is_empty());
        assert!(col.locks().is_empty());
    }
}
