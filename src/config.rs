use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{DbError, Result};

const HEX_DIGITS: &str = "0123456789abcdef";

/// One hash range of the document space and the nodes serving it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ShardSpec {
    pub id: String,
    /// Inclusive upper bound on the first hex char of md5(name)
    pub max_hashed_key: String,
    pub replicas: Vec<String>,
}

impl ShardSpec {
    pub fn bound(&self) -> char {
        self.max_hashed_key.chars().next().unwrap_or('f')
    }
}

/// Shard layout, sorted by bound and checked to cover `0`-`f` exactly once.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ShardTopology {
    pub shards: Vec<ShardSpec>,
}

impl ShardTopology {
    pub fn new(mut shards: Vec<ShardSpec>) -> Result<Self> {
        if shards.is_empty() {
            return Err(DbError::Configuration("shard topology has no shards".into()));
        }
        for shard in &mut shards {
            let key = shard.max_hashed_key.to_ascii_lowercase();
            if key.len() != 1 || !HEX_DIGITS.contains(key.as_str()) {
                return Err(DbError::Configuration(format!(
                    "shard '{}': max_hashed_key '{}' is not a single hex digit",
                    shard.id, shard.max_hashed_key
                )));
            }
            if shard.replicas.is_empty() {
                return Err(DbError::Configuration(format!("shard '{}' has no replicas", shard.id)));
            }
            shard.max_hashed_key = key;
        }

        shards.sort_by_key(|s| s.bound());
        for pair in shards.windows(2) {
            if pair[0].bound() == pair[1].bound() {
                return Err(DbError::Configuration(format!(
                    "shards '{}' and '{}' overlap at '{}'",
                    pair[0].id,
                    pair[1].id,
                    pair[0].bound()
                )));
            }
        }
        if let Some(last) = shards.last().filter(|s| s.bound() != 'f') {
            return Err(DbError::Configuration(format!(
                "shard ranges stop at '{}' and do not cover up to 'f'",
                last.bound()
            )));
        }
        Ok(Self { shards })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| DbError::Configuration(format!("{}: {}", path.display(), e)))?;
        let parsed: ShardTopology = serde_json::from_str(&raw)
            .map_err(|e| DbError::Configuration(format!("{}: {}", path.display(), e)))?;
        let topology = Self::new(parsed.shards)?;
        info!(shards = topology.shards.len(), "Shard topology loaded");
        Ok(topology)
    }

    /// Inclusive `(low, high)` hex range of each shard, in order.
    pub fn ranges(&self) -> Vec<(char, char)> {
        let mut low = '0';
        let mut ranges = Vec::with_capacity(self.shards.len());
        for shard in &self.shards {
            ranges.push((low, shard.bound()));
            low = next_hex(shard.bound()).unwrap_or('f');
        }
        ranges
    }
}

fn next_hex(c: char) -> Option<char> {
    let pos = HEX_DIGITS.find(c)?;
    HEX_DIGITS[pos + 1..].chars().next()
}

/// Peers that receive a node's committed oplogs.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ReplicaConfig {
    pub replicas: Vec<String>,
    /// How many replicas each commit is pushed to
    pub count: usize,
}

impl ReplicaConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| DbError::Configuration(format!("{}: {}", path.display(), e)))?;
        let config: ReplicaConfig = serde_json::from_str(&raw)
            .map_err(|e| DbError::Configuration(format!("{}: {}", path.display(), e)))?;
        if config.count > config.replicas.len() {
            return Err(DbError::Configuration(format!(
                "replica count {} exceeds the {} configured replicas",
                config.count,
                config.replicas.len()
            )));
        }
        info!(replicas = config.replicas.len(), count = config.count, "Replica set loaded");
        Ok(config)
    }
}
