use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::collection::{Collection, CollectionState};
use crate::error::{DbError, Result};
use crate::isolation::{is_locked, is_visible, IsolationLevel, TxView};
use crate::model::{Document, OpAction, OpLog, OpLogEntry, Record};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Active,
    Committed,
    Aborted,
}

/// Reverse of one mutation, addressed by record id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Undo {
    /// Undoes an insert
    Remove(u64),
    /// Undoes a delete
    Restore(u64),
}

impl Undo {
    fn record_id(&self) -> u64 {
        match *self {
            Undo::Remove(id) | Undo::Restore(id) => id,
        }
    }
}

/// Unit of work bound to one collection.
#[derive(Debug)]
pub struct Transaction {
    id: u64,
    level: IsolationLevel,
    snapshot: Option<BTreeSet<u64>>,
    undo_log: Vec<Undo>,
    state: TxState,
    collection: Arc<Collection>,
}

impl Transaction {
    pub(crate) fn new(
        collection: Arc<Collection>,
        id: u64,
        level: IsolationLevel,
        snapshot: Option<BTreeSet<u64>>,
    ) -> Self {
        Self {
            id,
            level,
            snapshot,
            undo_log: Vec::new(),
            state: TxState::Active,
            collection,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn level(&self) -> IsolationLevel {
        self.level
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == TxState::Active
    }

    fn ensure_active(&self) -> Result<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(DbError::TransactionClosed(self.id))
        }
    }

    fn hold(&self, record_id: u64) -> Result<()> {
        if self.level.holds_read_locks() {
            self.collection.locks().add(self.id, record_id)?;
        }
        Ok(())
    }

    // --- WRITES ---

    pub fn add_record(&mut self, name: &str, doc: Document) -> Result<u64> {
        self.ensure_active()?;
        let mut state = self.collection.state()?;
        let id = state.identity();
        state.records.insert(id, Record::new(id, name, doc, self.id));
        self.undo_log.push(Undo::Remove(id));
        debug!(transaction = self.id, record = id, doc_name = name, "Record added");
        Ok(id)
    }

    /// Expires every visible version matching `predicate`.
    ///
    /// Stops at the first locked match with [`DbError::Conflict`]; versions
    /// expired before that stay in the undo log, so the caller must roll the
    /// whole transaction back.
    pub fn delete_where<P>(&mut self, predicate: P) -> Result<usize>
    where
        P: Fn(&Record) -> bool,
    {
        self.ensure_active()?;
        let mut guard = self.collection.state()?;
        let CollectionState { records, active_ids, .. } = &mut *guard;
        let view = TxView {
            id: self.id,
            level: self.level,
            active_ids,
            snapshot: self.snapshot.as_ref(),
        };
        let locks = self.collection.locks();

        let mut deleted = 0;
        for record in records.values_mut() {
            if !predicate(record) || !is_visible(&view, record) {
                continue;
            }
            if is_locked(&view, record, locks) {
                warn!(transaction = self.id, record = record.id, "Failed to delete: record locked by another transaction");
                return Err(DbError::Conflict {
                    transaction_id: self.id,
                    record_id: record.id,
                });
            }
            record.expired_id = self.id;
            self.undo_log.push(Undo::Restore(record.id));
            deleted += 1;
            debug!(transaction = self.id, record = record.id, "Record deleted");
        }
        Ok(deleted)
    }

    pub fn delete_record(&mut self, name: &str) -> Result<usize> {
        self.delete_where(|r| r.name == name)
    }

    /// Expires the visible versions of `name` and appends a new one.
    pub fn update_record(&mut self, name: &str, doc: Document) -> Result<u64> {
        self.delete_record(name)?;
        self.add_record(name, doc)
    }

    // --- READS ---

    /// Visible versions matching `predicate`, in id order. Repeatable-read and
    /// serializable transactions take a hold on every hit.
    pub fn fetch<P>(&self, predicate: P) -> Result<Vec<Record>>
    where
        P: Fn(&Record) -> bool,
    {
        self.ensure_active()?;
        let state = self.collection.state()?;
        let view = self.view(&state.active_ids);

        let mut hits = Vec::new();
        for record in state.records.values() {
            if is_visible(&view, record) && predicate(record) {
                self.hold(record.id)?;
                hits.push(record.clone());
            }
        }
        Ok(hits)
    }

    pub fn fetch_record(&self, name: &str) -> Result<Option<Record>> {
        self.ensure_active()?;
        let state = self.collection.state()?;
        let view = self.view(&state.active_ids);

        match state.records.values().find(|r| r.name == name && is_visible(&view, r)) {
            Some(record) => {
                self.hold(record.id)?;
                Ok(Some(record.clone()))
            }
            None => Ok(None),
        }
    }

    pub fn fetch_all_records(&self) -> Result<Vec<Record>> {
        self.fetch(|_| true)
    }

    pub fn count_records(&self) -> Result<usize> {
        self.ensure_active()?;
        let state = self.collection.state()?;
        let view = self.view(&state.active_ids);

        let mut count = 0;
        for record in state.records.values().filter(|r| is_visible(&view, r)) {
            self.hold(record.id)?;
            count += 1;
        }
        Ok(count)
    }

    fn view<'a>(&'a self, active_ids: &'a BTreeSet<u64>) -> TxView<'a> {
        TxView {
            id: self.id,
            level: self.level,
            active_ids,
            snapshot: self.snapshot.as_ref(),
        }
    }

    // --- TERMINATION ---

    /// Prunes the versions this transaction expired and leaves the active
    /// set. Returns the inserts and deletes it applied, in order.
    pub fn commit(&mut self) -> Result<OpLog> {
        self.ensure_active()?;
        let mut state = self.collection.state()?;

        let mut oplog = Vec::new();
        for undo in &self.undo_log {
            let Some(record) = state.records.get(&undo.record_id()) else {
                continue;
            };
            match undo {
                Undo::Remove(_) if record.expired_id != self.id => oplog.push(OpLogEntry {
                    action: OpAction::Insert,
                    record: record.clone(),
                }),
                Undo::Restore(_) if record.created_id != self.id => oplog.push(OpLogEntry {
                    action: OpAction::Delete,
                    record: record.clone(),
                }),
                _ => {}
            }
        }

        let mut pruned = 0;
        for id in self.undo_log.iter().map(Undo::record_id) {
            if state.records.get(&id).is_some_and(|r| r.expired_id == self.id) {
                state.records.remove(&id);
                pruned += 1;
            }
        }

        state.active_ids.remove(&self.id);
        self.state = TxState::Committed;
        info!(transaction = self.id, ops = oplog.len(), pruned, "Commit transaction");
        Ok(oplog)
    }

    /// Replays the undo log backwards and leaves the active set.
    pub fn rollback(&mut self) -> Result<()> {
        self.ensure_active()?;
        let mut state = self.collection.state()?;

        for undo in self.undo_log.iter().rev() {
            let Some(record) = state.records.get_mut(&undo.record_id()) else {
                continue;
            };
            match undo {
                Undo::Restore(_) if record.expired_id == self.id => record.expired_id = 0,
                Undo::Remove(_) => record.expired_id = self.id,
                _ => {}
            }
        }

        state.active_ids.remove(&self.id);
        self.state = TxState::Aborted;
        info!(transaction = self.id, "Rollback transaction");
        Ok(())
    }
}
