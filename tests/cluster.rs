use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tessera::cluster::network::{PeerClient, Replicator};
use tessera::cluster::router::ShardRouter;
use tessera::cluster::types::{
    BeginResponse, CountResponse, ErrorBody, InsertResponse, MessageResponse, ShardInsertReply, UpdateRequest,
    DB_PREFIX, SHARD_PREFIX,
};
use tessera::config::{ReplicaConfig, ShardSpec, ShardTopology};
use tessera::error::DbError;
use tessera::filter::{Filter, Query};
use tessera::model::{Document, NewDocument, Record};
use tessera::server::{routes, AppContext};
use tessera::{DbStats, TesseraDb};

fn client() -> PeerClient {
    PeerClient::new(Duration::from_secs(5)).unwrap()
}

fn spawn(ctx: AppContext) -> String {
    let (addr, server) = warp::serve(routes(ctx)).bind_ephemeral(([127, 0, 0, 1], 0));
    tokio::spawn(server);
    format!("http://{}", addr)
}

fn spawn_node() -> String {
    spawn(AppContext::new(Arc::new(TesseraDb::in_memory())))
}

async fn begin(client: &PeerClient, base: &str, prefix: &str) -> u64 {
    let reply: BeginResponse = client
        .post_empty(base, &format!("{}/begin/read_committed", prefix))
        .await
        .unwrap();
    reply.transaction_id
}

async fn stats(client: &PeerClient, base: &str) -> DbStats {
    client.get(base, &format!("{}/stats", DB_PREFIX)).await.unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn router_partitions_and_merges_across_shards() {
    let low = spawn_node();
    let high = spawn_node();
    let topology = ShardTopology::new(vec![
        ShardSpec { id: "low".into(), max_hashed_key: "7".into(), replicas: vec![low.clone()] },
        ShardSpec { id: "high".into(), max_hashed_key: "f".into(), replicas: vec![high.clone()] },
    ])
    .unwrap();
    let router_ctx = AppContext::new(Arc::new(TesseraDb::in_memory())).with_router(ShardRouter::new(topology, client()));
    let router = spawn(router_ctx);
    let client = client();

    let t = begin(&client, &router, SHARD_PREFIX).await;
    let docs: Vec<NewDocument> = (0..40)
        .map(|i| NewDocument { name: format!("doc-{}", i), doc: json!({"i": i}).as_object().cloned().unwrap() })
        .collect();
    let replies: Vec<ShardInsertReply> = client
        .post_json(&router, &format!("{}/insert_many/{}", SHARD_PREFIX, t), &docs)
        .await
        .unwrap();
    assert_eq!(replies.iter().map(|r| r.ids.len()).sum::<usize>(), 40);
    assert!(replies.iter().all(|r| r.shard == "low" || r.shard == "high"));

    // both nodes hold part of the batch
    let (low_stats, high_stats) = (stats(&client, &low).await, stats(&client, &high).await);
    assert_eq!(low_stats.records + high_stats.records, 40);
    assert_eq!(low_stats.active_transactions, 1);
    assert_eq!(high_stats.active_transactions, 1);

    let found: Vec<Record> = client
        .post_json(&router, &format!("{}/find/{}", SHARD_PREFIX, t), &Query::default())
        .await
        .unwrap();
    assert_eq!(found.len(), 40);
    assert!(found.windows(2).all(|w| w[0].id <= w[1].id));

    let limited: Vec<Record> = client
        .post_json(&router, &format!("{}/find/{}", SHARD_PREFIX, t), &Query::default().with_limit(5))
        .await
        .unwrap();
    assert_eq!(limited.len(), 5);

    let update = UpdateRequest {
        filter: Filter::eq("name", "doc-3"),
        limit: None,
        set: json!({"i": 300}).as_object().cloned().unwrap(),
    };
    let updated: CountResponse = client
        .post_json(&router, &format!("{}/update/{}", SHARD_PREFIX, t), &update)
        .await
        .unwrap();
    assert_eq!(updated.count, 1);

    let deleted: CountResponse = client
        .post_json(&router, &format!("{}/delete/{}", SHARD_PREFIX, t), &Query::new(Filter::eq("name", "doc-5")))
        .await
        .unwrap();
    assert_eq!(deleted.count, 1);

    let committed: MessageResponse = client
        .post_empty(&router, &format!("{}/commit/{}", SHARD_PREFIX, t))
        .await
        .unwrap();
    assert_eq!(committed.message, "Success");
    assert_eq!(stats(&client, &low).await.active_transactions, 0);

    let t = begin(&client, &router, SHARD_PREFIX).await;
    let after: Vec<Record> = client
        .post_json(&router, &format!("{}/find/{}", SHARD_PREFIX, t), &Query::default())
        .await
        .unwrap();
    assert_eq!(after.len(), 39);
    let doc3 = after.iter().find(|r| r.name == "doc-3").unwrap();
    assert_eq!(doc3.doc["i"], json!(300));
    assert!(after.iter().all(|r| r.name != "doc-5"));

    let _: MessageResponse = client
        .post_empty(&router, &format!("{}/rollback/{}", SHARD_PREFIX, t))
        .await
        .unwrap();
    let err = client
        .post_empty::<MessageResponse>(&router, &format!("{}/commit/{}", SHARD_PREFIX, t))
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Upstream { status: Some(404), .. }));
    assert_eq!(err.kind(), "NOT_FOUND");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn commit_replicates_oplog_to_peer() {
    let replica = spawn_node();
    let replicator = Replicator::new(client(), ReplicaConfig { replicas: vec![replica.clone()], count: 1 });
    let primary = spawn(AppContext::new(Arc::new(TesseraDb::in_memory())).with_replicator(replicator));
    let client = client();

    let t = begin(&client, &primary, DB_PREFIX).await;
    let _: InsertResponse = client
        .post_json(
            &primary,
            &format!("{}/insert_one/{}", DB_PREFIX, t),
            &NewDocument { name: "Hopper".into(), doc: Document::new() },
        )
        .await
        .unwrap();
    let _: MessageResponse = client.post_empty(&primary, &format!("{}/commit/{}", DB_PREFIX, t)).await.unwrap();

    let r = begin(&client, &replica, DB_PREFIX).await;
    let found: Vec<Record> = client
        .post_json(&replica, &format!("{}/find/{}", DB_PREFIX, r), &Query::new(Filter::eq("name", "Hopper")))
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_replication_keeps_local_commit() {
    let replicator = Replicator::new(
        PeerClient::new(Duration::from_millis(500)).unwrap(),
        ReplicaConfig { replicas: vec!["http://127.0.0.1:1".into()], count: 1 },
    );
    let primary = spawn(AppContext::new(Arc::new(TesseraDb::in_memory())).with_replicator(replicator));
    let client = client();

    let t = begin(&client, &primary, DB_PREFIX).await;
    let _: InsertResponse = client
        .post_json(
            &primary,
            &format!("{}/insert_one/{}", DB_PREFIX, t),
            &NewDocument { name: "kept".into(), doc: Document::new() },
        )
        .await
        .unwrap();

    let err = client
        .post_empty::<MessageResponse>(&primary, &format!("{}/commit/{}", DB_PREFIX, t))
        .await
        .unwrap_err();
    match err {
        DbError::Upstream { status, kind, reason, .. } => {
            assert_eq!(status, Some(502));
            assert_eq!(kind.as_deref(), Some("REPLICATION"), "{}", reason);
        }
        other => panic!("unexpected {:?}", other),
    }

    let s = stats(&client, &primary).await;
    assert_eq!(s.records, 1);
    assert_eq!(s.active_transactions, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn conflict_is_reported_as_409() {
    let node = spawn_node();
    let client = client();

    let seed = begin(&client, &node, DB_PREFIX).await;
    let _: InsertResponse = client
        .post_json(
            &node,
            &format!("{}/insert_one/{}", DB_PREFIX, seed),
            &NewDocument { name: "a".into(), doc: Document::new() },
        )
        .await
        .unwrap();
    let _: MessageResponse = client.post_empty(&node, &format!("{}/commit/{}", DB_PREFIX, seed)).await.unwrap();

    let reader: BeginResponse = client.post_empty(&node, &format!("{}/begin/repeatable_read", DB_PREFIX)).await.unwrap();
    let _: Vec<Record> = client
        .post_json(&node, &format!("{}/find/{}", DB_PREFIX, reader.transaction_id), &Query::default())
        .await
        .unwrap();

    let writer: BeginResponse = client.post_empty(&node, &format!("{}/begin/repeatable_read", DB_PREFIX)).await.unwrap();
    let err = client
        .post_json::<_, CountResponse>(
            &node,
            &format!("{}/delete/{}", DB_PREFIX, writer.transaction_id),
            &Query::new(Filter::eq("name", "a")),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Upstream { status: Some(409), .. }));
    assert_eq!(err.kind(), "CONFLICT");

    let raw = reqwest::Client::new()
        .post(format!("{}/{}/commit/{}", node, DB_PREFIX, writer.transaction_id))
        .send()
        .await
        .unwrap();
    assert_eq!(raw.status().as_u16(), 404);
    let body: ErrorBody = raw.json().await.unwrap();
    assert_eq!(body.kind, "NOT_FOUND");
}

async fn seed(client: &PeerClient, base: &str, name: &str) {
    let t = begin(client, base, DB_PREFIX).await;
    let _: InsertResponse = client
        .post_json(base, &format!("{}/insert_one/{}", DB_PREFIX, t), &NewDocument { name: name.into(), doc: Document::new() })
        .await
        .unwrap();
    let _: MessageResponse = client.post_empty(base, &format!("{}/commit/{}", DB_PREFIX, t)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn routed_write_conflict_rolls_back_every_replica() {
    let held = spawn_node();
    let free = spawn_node();
    let topology = ShardTopology::new(vec![ShardSpec {
        id: "only".into(),
        max_hashed_key: "f".into(),
        replicas: vec![held.clone(), free.clone()],
    }])
    .unwrap();
    let router = spawn(AppContext::new(Arc::new(TesseraDb::in_memory())).with_router(ShardRouter::new(topology, client())));
    let client = client();
    seed(&client, &held, "a").await;
    seed(&client, &free, "a").await;

    // a repeatable-read reader on one replica holds the record
    let reader: BeginResponse = client.post_empty(&held, &format!("{}/begin/repeatable_read", DB_PREFIX)).await.unwrap();
    let _: Vec<Record> = client
        .post_json(&held, &format!("{}/find/{}", DB_PREFIX, reader.transaction_id), &Query::default())
        .await
        .unwrap();

    let routed: BeginResponse =
        client.post_empty(&router, &format!("{}/begin/repeatable_read", SHARD_PREFIX)).await.unwrap();
    let t = routed.transaction_id;
    let err = client
        .post_json::<_, CountResponse>(&router, &format!("{}/delete/{}", SHARD_PREFIX, t), &Query::new(Filter::eq("name", "a")))
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Upstream { status: Some(409), .. }));
    assert_eq!(err.kind(), "CONFLICT");

    // the routed transaction is gone, so the replica that deleted cannot commit alone
    let err = client
        .post_empty::<MessageResponse>(&router, &format!("{}/commit/{}", SHARD_PREFIX, t))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "NOT_FOUND");

    assert_eq!(stats(&client, &free).await.active_transactions, 0);
    assert_eq!(stats(&client, &held).await.active_transactions, 1);
    for base in [&held, &free] {
        let check = begin(&client, base, DB_PREFIX).await;
        let found: Vec<Record> = client
            .post_json(base, &format!("{}/find/{}", DB_PREFIX, check), &Query::new(Filter::eq("name", "a")))
            .await
            .unwrap();
        assert_eq!(found.len(), 1, "{}", base);
    }
}
