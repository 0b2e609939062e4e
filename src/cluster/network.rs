use std::time::Duration;

use rand::seq::SliceRandom;
use reqwest::Response;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{info, warn};

use crate::cluster::types::{BeginResponse, ErrorBody, DB_PREFIX};
use crate::config::ReplicaConfig;
use crate::error::{DbError, Result};
use crate::model::OpLog;

/// JSON-over-HTTP client shared by the router and the replicator.
#[derive(Clone, Debug)]
pub struct PeerClient {
    client: reqwest::Client,
}

impl PeerClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DbError::Configuration(format!("HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    pub async fn post_json<Req, Resp>(&self, base: &str, route: &str, req: &Req) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let url = join_url(base, route);
        let resp = self.client.post(&url).json(req).send().await;
        Self::finish(url, resp).await
    }

    pub async fn post_empty<Resp>(&self, base: &str, route: &str) -> Result<Resp>
    where
        Resp: DeserializeOwned,
    {
        let url = join_url(base, route);
        let resp = self.client.post(&url).send().await;
        Self::finish(url, resp).await
    }

    pub async fn get<Resp>(&self, base: &str, route: &str) -> Result<Resp>
    where
        Resp: DeserializeOwned,
    {
        let url = join_url(base, route);
        let resp = self.client.get(&url).send().await;
        Self::finish(url, resp).await
    }

    async fn finish<Resp>(url: String, resp: reqwest::Result<Response>) -> Result<Resp>
    where
        Resp: DeserializeOwned,
    {
        let resp = resp.map_err(|e| DbError::Upstream {
            url: url.clone(),
            status: None,
            kind: None,
            reason: e.to_string(),
        })?;

        let status = resp.status();
        if !status.is_success() {
            let (kind, reason) = match resp.json::<ErrorBody>().await {
                Ok(body) => (Some(body.kind), body.reason),
                Err(_) => (None, format!("HTTP error: {}", status)),
            };
            return Err(DbError::Upstream {
                url,
                status: Some(status.as_u16()),
                kind,
                reason,
            });
        }

        resp.json::<Resp>().await.map_err(|e| DbError::Upstream {
            url,
            status: Some(status.as_u16()),
            kind: None,
            reason: format!("malformed reply: {}", e),
        })
    }
}

pub fn join_url(base: &str, route: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), route.trim_start_matches('/'))
}

/// Pushes committed oplogs to a random subset of peer nodes.
#[derive(Clone, Debug)]
pub struct Replicator {
    client: PeerClient,
    replicas: Vec<String>,
    count: usize,
}

impl Replicator {
    pub fn new(client: PeerClient, config: ReplicaConfig) -> Self {
        Self {
            client,
            count: config.count.min(config.replicas.len()),
            replicas: config.replicas,
        }
    }

    fn pick(&self) -> Vec<String> {
        let mut rng = rand::thread_rng();
        self.replicas
            .choose_multiple(&mut rng, self.count)
            .cloned()
            .collect()
    }

    /// Delivers `oplog` to every picked replica. Every replica is attempted;
    /// failures are collected into one [`DbError::Replication`]. The local
    /// commit is never undone.
    pub async fn propagate(&self, oplog: &OpLog) -> Result<()> {
        if oplog.is_empty() || self.count == 0 {
            return Ok(());
        }

        let targets = self.pick();
        let route = format!("{}/replicate", DB_PREFIX);
        let mut failures = Vec::new();

        for replica in &targets {
            match self.client.post_json::<_, BeginResponse>(replica, &route, oplog).await {
                Ok(reply) => {
                    info!(replica = %replica, transaction = reply.transaction_id, ops = oplog.len(), "Oplog replicated");
                }
                Err(e) => {
                    warn!(replica = %replica, "Replication failed: {}", e);
                    failures.push(e.to_string());
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(DbError::Replication {
                failed: failures.len(),
                attempted: targets.len(),
                reasons: failures.join("; "),
            })
        }
    }
}
