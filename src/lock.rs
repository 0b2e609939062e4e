use std::collections::BTreeSet;
use std::sync::Mutex;

use crate::error::{DbError, Result};

/// Read holds taken by repeatable-read and serializable transactions.
///
/// Keyed by `(record_id, transaction_id)` so every holder of one record is a
/// contiguous range. Entries are not released on commit or rollback: a hold
/// whose owner has left the active set simply stops mattering.
#[derive(Debug, Default)]
pub struct LockManager {
    holds: Mutex<BTreeSet<(u64, u64)>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a hold. Idempotent.
    pub fn add(&self, transaction_id: u64, record_id: u64) -> Result<()> {
        let mut holds = self.holds.lock().map_err(|_| DbError::Poisoned("lock manager"))?;
        holds.insert((record_id, transaction_id));
        Ok(())
    }

    pub fn exists(&self, transaction_id: u64, record_id: u64) -> bool {
        self.holds
            .lock()
            .map(|holds| holds.contains(&(record_id, transaction_id)))
            .unwrap_or(false)
    }

    /// True if any transaction other than `transaction_id` for which `is_active`
    /// holds `record_id`.
    pub fn held_by_other<F>(&self, transaction_id: u64, record_id: u64, is_active: F) -> bool
    where
        F: Fn(u64) -> bool,
    {
        let Ok(holds) = self.holds.lock() else {
            // A poisoned table cannot prove the record is free.
            return true;
        };
        holds
            .range((record_id, 0)..=(record_id, u64::MAX))
            .any(|&(_, holder)| holder != transaction_id && is_active(holder))
    }

    /// Drops every hold whose owner is no longer active. Returns how many went.
    pub fn retain_active<F>(&self, is_active: F) -> Result<usize>
    where
        F: Fn(u64) -> bool,
    {
        let mut holds = self.holds.lock().map_err(|_| DbError::Poisoned("lock manager"))?;
        let before = holds.len();
        holds.retain(|&(_, holder)| is_active(holder));
        Ok(before - holds.len())
    }

    pub fn len(&self) -> usize {
        self.holds.lock().map(|holds| holds.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
