// src/cluster/types.rs
use serde::{Deserialize, Serialize};

use crate::error::DbError;
use crate::filter::{Filter, Query};
use crate::model::Document;

pub const DB_PREFIX: &str = "api/v1/db";
pub const SHARD_PREFIX: &str = "api/v1/shard";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BeginResponse {
    pub transaction_id: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    pub fn success() -> Self {
        Self { message: "Success".into() }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct InsertResponse {
    pub message: String,
    pub id: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct InsertManyResponse {
    pub ids: Vec<u64>,
}

/// Per-partition reply of a routed batch insert.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ShardInsertReply {
    pub shard: String,
    pub replica: String,
    pub ids: Vec<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CountResponse {
    pub message: String,
    pub count: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct UpdateRequest {
    #[serde(default)]
    pub filter: Filter,
    #[serde(default)]
    pub limit: Option<i64>,
    pub set: Document,
}

impl UpdateRequest {
    pub fn query(&self) -> Query {
        Query {
            filter: self.filter.clone(),
            limit: self.limit,
        }
    }
}

/// Body of every error response.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ErrorBody {
    pub kind: String,
    pub reason: String,
}

impl From<&DbError> for ErrorBody {
    fn from(err: &DbError) -> Self {
        Self {
            kind: err.kind().to_string(),
            reason: err.to_string(),
        }
    }
}
