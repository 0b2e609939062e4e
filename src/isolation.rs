//! Per-level visibility and lock predicates.
//!
//! Every level is a variant of [`IsolationLevel`]; the rules are plain
//! functions over a record and the reading transaction's [`TxView`].

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DbError;
use crate::lock::LockManager;
use crate::model::Record;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub const ALL: [IsolationLevel; 4] = [
        IsolationLevel::ReadUncommitted,
        IsolationLevel::ReadCommitted,
        IsolationLevel::RepeatableRead,
        IsolationLevel::Serializable,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "read_uncommitted",
            IsolationLevel::ReadCommitted => "read_committed",
            IsolationLevel::RepeatableRead => "repeatable_read",
            IsolationLevel::Serializable => "serializable",
        }
    }

    /// Whether visible hits register a read hold.
    pub fn holds_read_locks(&self) -> bool {
        matches!(self, IsolationLevel::RepeatableRead | IsolationLevel::Serializable)
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IsolationLevel {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        IsolationLevel::ALL
            .into_iter()
            .find(|level| level.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| DbError::InvalidIsolation(s.to_string()))
    }
}

/// What a transaction knows while it evaluates a record.
#[derive(Debug, Clone, Copy)]
pub struct TxView<'a> {
    pub id: u64,
    pub level: IsolationLevel,
    pub active_ids: &'a BTreeSet<u64>,
    /// Active set captured at begin; only serializable transactions carry one.
    pub snapshot: Option<&'a BTreeSet<u64>>,
}

impl TxView<'_> {
    fn is_active(&self, id: u64) -> bool {
        self.active_ids.contains(&id)
    }
}

pub fn is_visible(view: &TxView<'_>, record: &Record) -> bool {
    match view.level {
        IsolationLevel::ReadUncommitted => record.expired_id == 0,
        IsolationLevel::ReadCommitted | IsolationLevel::RepeatableRead => committed_visible(view, record),
        IsolationLevel::Serializable => {
            committed_visible(view, record)
                && record.created_id <= view.id
                && view.snapshot.is_some_and(|ids| ids.contains(&record.created_id))
        }
    }
}

/// Consulted by deletes only.
pub fn is_locked(view: &TxView<'_>, record: &Record, locks: &LockManager) -> bool {
    match view.level {
        IsolationLevel::ReadUncommitted => !is_visible(view, record),
        IsolationLevel::ReadCommitted => expired_by_active(view, record),
        IsolationLevel::RepeatableRead | IsolationLevel::Serializable => {
            expired_by_active(view, record)
                || locks.held_by_other(view.id, record.id, |holder| view.is_active(holder))
        }
    }
}

fn committed_visible(view: &TxView<'_>, record: &Record) -> bool {
    if record.created_id != view.id && view.is_active(record.created_id) {
        return false;
    }
    if record.expired_id != 0 && (record.expired_id == view.id || !view.is_active(record.expired_id)) {
        return false;
    }
    true
}

fn expired_by_active(view: &TxView<'_>, record: &Record) -> bool {
    record.expired_id != 0 && view.is_active(record.expired_id)
}
