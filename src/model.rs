use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Free-form document body.
pub type Document = Map<String, Value>;

/// One version of a logical document.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Record {
    /// Unique per collection, monotonic
    #[serde(alias = "_id")]
    pub id: u64,

    /// Logical document key; versions of one document share it
    pub name: String,

    pub doc: Document,

    /// Transaction that inserted this version (0 = loaded from a snapshot)
    #[serde(default)]
    pub created_id: u64,

    /// Transaction that expired this version (0 = live)
    #[serde(default)]
    pub expired_id: u64,
}

impl Record {
    pub fn new(id: u64, name: impl Into<String>, doc: Document, created_id: u64) -> Self {
        Self {
            id,
            name: name.into(),
            doc,
            created_id,
            expired_id: 0,
        }
    }
}

/// Insert payload: a document name plus its body.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NewDocument {
    pub name: String,
    #[serde(default)]
    pub doc: Document,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OpAction {
    Insert,
    Delete,
}

/// A mutation applied by a committed transaction, shipped to replicas.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct OpLogEntry {
    pub action: OpAction,
    pub record: Record,
}

pub type OpLog = Vec<OpLogEntry>;
