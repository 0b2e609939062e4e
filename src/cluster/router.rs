use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde_json::Value;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::cluster::network::PeerClient;
use crate::cluster::types::{
    BeginResponse, CountResponse, InsertManyResponse, InsertResponse, MessageResponse, ShardInsertReply,
    UpdateRequest, DB_PREFIX,
};
use crate::config::{ShardSpec, ShardTopology};
use crate::error::{DbError, Result};
use crate::filter::Query;
use crate::isolation::IsolationLevel;
use crate::model::{NewDocument, Record};

/// First hex char of md5(name).
pub fn hash_prefix(name: &str) -> char {
    let digest = md5::compute(name.as_bytes());
    char::from_digit(u32::from(digest.0[0] >> 4), 16).unwrap_or('0')
}

/// Index of the shard owning `name`: the first bound at or above its hash prefix.
pub fn shard_index(topology: &ShardTopology, name: &str) -> usize {
    let prefix = hash_prefix(name);
    topology
        .shards
        .iter()
        .position(|s| s.bound() >= prefix)
        .unwrap_or(topology.shards.len().saturating_sub(1))
}

/// One outgoing request of a fan-out.
#[derive(Debug, Clone)]
struct Call {
    replica: String,
    route: String,
    body: Option<Value>,
}

/// Routes commands across shards. Besides the topology, the only state kept
/// is the mapping from router transaction ids to each replica's local id.
#[derive(Debug)]
pub struct ShardRouter {
    topology: ShardTopology,
    client: PeerClient,
    next_id: AtomicU64,
    sessions: Mutex<HashMap<u64, HashMap<String, u64>>>,
}

impl ShardRouter {
    pub fn new(topology: ShardTopology, client: PeerClient) -> Self {
        Self {
            topology,
            client,
            next_id: AtomicU64::new(1),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn topology(&self) -> &ShardTopology {
        &self.topology
    }

    pub fn shard_for(&self, name: &str) -> &ShardSpec {
        &self.topology.shards[shard_index(&self.topology, name)]
    }

    fn all_replicas(&self) -> Vec<String> {
        let mut replicas: Vec<String> = Vec::new();
        for shard in &self.topology.shards {
            for replica in &shard.replicas {
                if !replicas.contains(replica) {
                    replicas.push(replica.clone());
                }
            }
        }
        replicas
    }

    fn session(&self, id: u64) -> Result<HashMap<String, u64>> {
        let sessions = self.sessions.lock().map_err(|_| DbError::Poisoned("router sessions"))?;
        sessions.get(&id).cloned().ok_or(DbError::TransactionNotFound(id))
    }

    fn end_session(&self, id: u64) -> Result<HashMap<String, u64>> {
        let mut sessions = self.sessions.lock().map_err(|_| DbError::Poisoned("router sessions"))?;
        sessions.remove(&id).ok_or(DbError::TransactionNotFound(id))
    }

    fn remote_id(remote: &HashMap<String, u64>, replica: &str, id: u64) -> Result<u64> {
        remote.get(replica).copied().ok_or(DbError::TransactionNotFound(id))
    }

    /// Issues every call concurrently. Replies come back in completion order.
    async fn fan_out<Resp>(&self, calls: Vec<Call>) -> Vec<(String, Result<Resp>)>
    where
        Resp: serde::de::DeserializeOwned + Send + 'static,
    {
        let mut tasks = JoinSet::new();
        for call in calls {
            let client = self.client.clone();
            tasks.spawn(async move {
                let result = match &call.body {
                    Some(body) => client.post_json(&call.replica, &call.route, body).await,
                    None => client.post_empty(&call.replica, &call.route).await,
                };
                (call.replica, result)
            });
        }

        let mut replies = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(reply) => replies.push(reply),
                Err(e) => warn!("Shard request task failed: {}", e),
            }
        }
        replies
    }

    /// Splits replies into successes, logging every failure. Fails with the
    /// first error if any replica failed.
    fn settle<Resp>(replies: Vec<(String, Result<Resp>)>) -> Result<Vec<(String, Resp)>> {
        let mut ok = Vec::with_capacity(replies.len());
        let mut first_error = None;
        for (replica, result) in replies {
            match result {
                Ok(resp) => ok.push((replica, resp)),
                Err(e) => {
                    warn!(replica = %replica, "Shard request failed: {}", e);
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(ok),
        }
    }

    // --- TRANSACTIONS ---

    /// Opens a transaction on every replica of every shard.
    pub async fn begin(&self, level: IsolationLevel) -> Result<u64> {
        let route = format!("{}/begin/{}", DB_PREFIX, level);
        let calls = self
            .all_replicas()
            .into_iter()
            .map(|replica| Call { replica, route: route.clone(), body: None })
            .collect();

        let replies = self.fan_out::<BeginResponse>(calls).await;
        let mut remote = HashMap::new();
        let mut failure = None;
        for (replica, result) in replies {
            match result {
                Ok(reply) => {
                    remote.insert(replica, reply.transaction_id);
                }
                Err(e) => {
                    warn!(replica = %replica, "Begin failed: {}", e);
                    failure.get_or_insert(e);
                }
            }
        }

        if let Some(e) = failure {
            self.release(remote).await;
            return Err(e);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.sessions
            .lock()
            .map_err(|_| DbError::Poisoned("router sessions"))?
            .insert(id, remote);
        info!(transaction = id, %level, "Routed transaction opened");
        Ok(id)
    }

    pub async fn commit(&self, id: u64) -> Result<MessageResponse> {
        self.finish(id, "commit").await
    }

    pub async fn rollback(&self, id: u64) -> Result<MessageResponse> {
        self.finish(id, "rollback").await
    }

    /// Commits or rolls back on every replica. There is no atomicity across
    /// shards: a replica failing does not undo the others.
    async fn finish(&self, id: u64, verb: &str) -> Result<MessageResponse> {
        let remote = self.end_session(id)?;
        let calls = remote
            .into_iter()
            .map(|(replica, rid)| Call { replica, route: format!("{}/{}/{}", DB_PREFIX, verb, rid), body: None })
            .collect();
        Self::settle(self.fan_out::<MessageResponse>(calls).await)?;
        info!(transaction = id, verb, "Routed transaction finished");
        Ok(MessageResponse::success())
    }

    /// Rolls back every listed remote transaction, logging replicas that
    /// refuse.
    async fn release(&self, remote: HashMap<String, u64>) {
        let calls = remote
            .into_iter()
            .map(|(replica, rid)| Call { replica, route: format!("{}/rollback/{}", DB_PREFIX, rid), body: None })
            .collect();
        if let Err(e) = Self::settle(self.fan_out::<MessageResponse>(calls).await) {
            warn!("Rollback incomplete, replicas may keep open transactions: {}", e);
        }
    }

    /// A write that failed on any replica ends the routed transaction
    /// everywhere, so no replica can commit its part alone.
    async fn abort_on_error<T>(&self, id: u64, result: Result<T>) -> Result<T> {
        let e = match result {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        if let Ok(remote) = self.end_session(id) {
            warn!(transaction = id, "Routed write failed, rolling back every replica: {}", e);
            self.release(remote).await;
        }
        Err(e)
    }

    // --- DOCUMENTS ---

    /// Writes to every replica of the owning shard; returns the id assigned
    /// by the shard's first replica.
    pub async fn insert_one(&self, id: u64, doc: NewDocument) -> Result<InsertResponse> {
        let remote = self.session(id)?;
        let shard = self.shard_for(&doc.name);
        debug!(name = %doc.name, shard = %shard.id, "Routing insert");

        let body = serde_json::to_value(&doc)?;
        let calls = shard
            .replicas
            .iter()
            .map(|replica| {
                Ok(Call {
                    replica: replica.clone(),
                    route: format!("{}/insert_one/{}", DB_PREFIX, Self::remote_id(&remote, replica, id)?),
                    body: Some(body.clone()),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let replies = self.abort_on_error(id, Self::settle(self.fan_out::<InsertResponse>(calls).await)).await?;
        let primary = &shard.replicas[0];
        replies
            .into_iter()
            .find(|(replica, _)| replica == primary)
            .map(|(_, reply)| reply)
            .ok_or_else(|| DbError::Upstream {
                url: primary.clone(),
                status: None,
                kind: None,
                reason: "no reply from shard".into(),
            })
    }

    /// Partitions the batch by shard and sends each non-empty partition to
    /// every replica of its shard.
    pub async fn insert_many(&self, id: u64, docs: Vec<NewDocument>) -> Result<Vec<ShardInsertReply>> {
        let remote = self.session(id)?;

        let mut partitions: BTreeMap<usize, Vec<NewDocument>> = BTreeMap::new();
        for doc in docs {
            partitions.entry(shard_index(&self.topology, &doc.name)).or_default().push(doc);
        }

        let mut calls = Vec::new();
        let mut owner: HashMap<String, String> = HashMap::new();
        for (index, batch) in &partitions {
            let shard = &self.topology.shards[*index];
            let body = serde_json::to_value(batch)?;
            for replica in &shard.replicas {
                owner.insert(replica.clone(), shard.id.clone());
                calls.push(Call {
                    replica: replica.clone(),
                    route: format!("{}/insert_many/{}", DB_PREFIX, Self::remote_id(&remote, replica, id)?),
                    body: Some(body.clone()),
                });
            }
        }

        let replies =
            self.abort_on_error(id, Self::settle(self.fan_out::<InsertManyResponse>(calls).await)).await?;
        Ok(replies
            .into_iter()
            .map(|(replica, reply)| ShardInsertReply {
                shard: owner.get(&replica).cloned().unwrap_or_default(),
                replica,
                ids: reply.ids,
            })
            .collect())
    }

    /// Scatter-gather read: one replica per shard, merged by record id, then
    /// capped by the query limit.
    pub async fn find(&self, id: u64, query: &Query) -> Result<Vec<Record>> {
        let remote = self.session(id)?;
        let body = serde_json::to_value(query)?;

        let calls = self
            .topology
            .shards
            .iter()
            .map(|shard| {
                let replica = &shard.replicas[0];
                Ok(Call {
                    replica: replica.clone(),
                    route: format!("{}/find/{}", DB_PREFIX, Self::remote_id(&remote, replica, id)?),
                    body: Some(body.clone()),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut records: Vec<Record> = Self::settle(self.fan_out::<Vec<Record>>(calls).await)?
            .into_iter()
            .flat_map(|(_, found)| found)
            .collect();
        records.sort_by_key(|r| r.id);
        query.truncate(&mut records);
        Ok(records)
    }

    pub async fn update(&self, id: u64, req: &UpdateRequest) -> Result<CountResponse> {
        let body = serde_json::to_value(req)?;
        self.write_everywhere(id, "update", body).await
    }

    pub async fn delete(&self, id: u64, query: &Query) -> Result<CountResponse> {
        let body = serde_json::to_value(query)?;
        self.write_everywhere(id, "delete", body).await
    }

    /// Sends a write to every replica of every shard. The reported count sums
    /// the first replica of each shard.
    async fn write_everywhere(&self, id: u64, verb: &str, body: Value) -> Result<CountResponse> {
        let remote = self.session(id)?;
        let calls = self
            .all_replicas()
            .into_iter()
            .map(|replica| {
                let route = format!("{}/{}/{}", DB_PREFIX, verb, Self::remote_id(&remote, &replica, id)?);
                Ok(Call { replica, route, body: Some(body.clone()) })
            })
            .collect::<Result<Vec<_>>>()?;

        let replies: HashMap<String, CountResponse> = self
            .abort_on_error(id, Self::settle(self.fan_out::<CountResponse>(calls).await))
            .await?
            .into_iter()
            .collect();
        let count = self
            .topology
            .shards
            .iter()
            .filter_map(|shard| replies.get(&shard.replicas[0]))
            .map(|reply| reply.count)
            .sum();
        Ok(CountResponse { message: "Success".into(), count })
    }
}
