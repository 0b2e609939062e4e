use std::sync::Arc;

use warp::reply::Response;
use warp::{Filter, Rejection};

use crate::cluster::router::ShardRouter;
use crate::cluster::types::{BeginResponse, UpdateRequest};
use crate::filter::Query;
use crate::isolation::IsolationLevel;
use crate::model::NewDocument;
use crate::server::{json_body, respond};

/// Router API under `api/v1/shard`. Without a router every path falls
/// through as not found.
pub fn shard_routes(router: Option<Arc<ShardRouter>>) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
    let begin = warp::post()
        .and(warp::path!("api" / "v1" / "shard" / "begin" / String))
        .and(with_router(router.clone()))
        .and_then(|level: String, router: Arc<ShardRouter>| async move {
            let result = match level.parse::<IsolationLevel>() {
                Ok(level) => router.begin(level).await.map(|transaction_id| BeginResponse { transaction_id }),
                Err(e) => Err(e),
            };
            Ok::<_, Rejection>(respond(result))
        });

    let commit = warp::post()
        .and(warp::path!("api" / "v1" / "shard" / "commit" / u64))
        .and(with_router(router.clone()))
        .and_then(|id: u64, router: Arc<ShardRouter>| async move {
            Ok::<_, Rejection>(respond(router.commit(id).await))
        });

    let rollback = warp::post()
        .and(warp::path!("api" / "v1" / "shard" / "rollback" / u64))
        .and(with_router(router.clone()))
        .and_then(|id: u64, router: Arc<ShardRouter>| async move {
            Ok::<_, Rejection>(respond(router.rollback(id).await))
        });

    let insert_one = warp::post()
        .and(warp::path!("api" / "v1" / "shard" / "insert_one" / u64))
        .and(json_body::<NewDocument>())
        .and(with_router(router.clone()))
        .and_then(|id: u64, doc: NewDocument, router: Arc<ShardRouter>| async move {
            Ok::<_, Rejection>(respond(router.insert_one(id, doc).await))
        });

    let insert_many = warp::post()
        .and(warp::path!("api" / "v1" / "shard" / "insert_many" / u64))
        .and(json_body::<Vec<NewDocument>>())
        .and(with_router(router.clone()))
        .and_then(|id: u64, docs: Vec<NewDocument>, router: Arc<ShardRouter>| async move {
            Ok::<_, Rejection>(respond(router.insert_many(id, docs).await))
        });

    let find = warp::post()
        .and(warp::path!("api" / "v1" / "shard" / "find" / u64))
        .and(json_body::<Query>())
        .and(with_router(router.clone()))
        .and_then(|id: u64, query: Query, router: Arc<ShardRouter>| async move {
            Ok::<_, Rejection>(respond(router.find(id, &query).await))
        });

    let update = warp::post()
        .and(warp::path!("api" / "v1" / "shard" / "update" / u64))
        .and(json_body::<UpdateRequest>())
        .and(with_router(router.clone()))
        .and_then(|id: u64, req: UpdateRequest, router: Arc<ShardRouter>| async move {
            Ok::<_, Rejection>(respond(router.update(id, &req).await))
        });

    let delete = warp::post()
        .and(warp::path!("api" / "v1" / "shard" / "delete" / u64))
        .and(json_body::<Query>())
        .and(with_router(router))
        .and_then(|id: u64, query: Query, router: Arc<ShardRouter>| async move {
            Ok::<_, Rejection>(respond(router.delete(id, &query).await))
        });

    begin
        .or(commit)
        .unify()
        .or(rollback)
        .unify()
        .or(insert_one)
        .unify()
        .or(insert_many)
        .unify()
        .or(find)
        .unify()
        .or(update)
        .unify()
        .or(delete)
        .unify()
}

fn with_router(
    router: Option<Arc<ShardRouter>>,
) -> impl Filter<Extract = (Arc<ShardRouter>,), Error = Rejection> + Clone {
    warp::any().and_then(move || {
        let router = router.clone();
        async move { router.ok_or_else(warp::reject::not_found) }
    })
}
