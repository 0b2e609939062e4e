//! Error types shared by the store, the HTTP layer and the shard router.

use thiserror::Error;
use warp::http::StatusCode;

pub type Result<T> = std::result::Result<T, DbError>;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Unknown isolation level: '{0}'")]
    InvalidIsolation(String),

    #[error("Transaction {0} not found")]
    TransactionNotFound(u64),

    #[error("Transaction {0} is no longer active")]
    TransactionClosed(u64),

    #[error("Record {record_id} is locked by another transaction (transaction {transaction_id} rolled back)")]
    Conflict { transaction_id: u64, record_id: u64 },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Replication failed on {failed} of {attempted} replicas: {reasons}")]
    Replication {
        failed: usize,
        attempted: usize,
        reasons: String,
    },

    #[error("Upstream {url} failed: {reason}")]
    Upstream {
        url: String,
        /// HTTP status the peer answered with, if it answered at all
        status: Option<u16>,
        /// Error code from the peer's reply body
        kind: Option<String>,
        reason: String,
    },

    #[error("Poisoned lock: {0}")]
    Poisoned(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DbError {
    /// Stable error code returned to clients. Peer failures keep the code
    /// the peer reported.
    pub fn kind(&self) -> &str {
        match self {
            DbError::Configuration(_) => "CONFIGURATION",
            DbError::InvalidIsolation(_) => "INVALID_ISOLATION",
            DbError::TransactionNotFound(_) | DbError::TransactionClosed(_) => "NOT_FOUND",
            DbError::Conflict { .. } => "CONFLICT",
            DbError::Persistence(_) | DbError::Io(_) => "PERSISTENCE",
            DbError::Replication { .. } => "REPLICATION",
            DbError::Upstream { kind: Some(kind), .. } => kind.as_str(),
            DbError::Upstream { .. } => "UPSTREAM",
            DbError::Json(_) => "BAD_REQUEST",
            DbError::Poisoned(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            DbError::InvalidIsolation(_) | DbError::Json(_) => StatusCode::BAD_REQUEST,
            DbError::TransactionNotFound(_) | DbError::TransactionClosed(_) => StatusCode::NOT_FOUND,
            DbError::Conflict { .. } => StatusCode::CONFLICT,
            DbError::Upstream { status: Some(code), .. } => {
                StatusCode::from_u16(*code).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            DbError::Replication { .. } | DbError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
