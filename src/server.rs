use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info};
use warp::http::StatusCode;
use warp::reply::Response;
use warp::{Filter, Rejection, Reply};

use crate::cluster::api::shard_routes;
use crate::cluster::network::Replicator;
use crate::cluster::router::ShardRouter;
use crate::cluster::types::{
    BeginResponse, CountResponse, ErrorBody, InsertManyResponse, InsertResponse, MessageResponse, UpdateRequest,
};
use crate::error::{DbError, Result};
use crate::filter::Query;
use crate::isolation::IsolationLevel;
use crate::model::{NewDocument, OpLog};
use crate::TesseraDb;

// 16MB request bodies
pub const MAX_BODY_BYTES: u64 = 16 * 1024 * 1024;

/// Everything a request handler may touch. Owned by `main`, cloned into each
/// route.
#[derive(Clone, Debug)]
pub struct AppContext {
    pub db: Arc<TesseraDb>,
    pub replicator: Option<Arc<Replicator>>,
    pub router: Option<Arc<ShardRouter>>,
}

impl AppContext {
    pub fn new(db: Arc<TesseraDb>) -> Self {
        Self { db, replicator: None, router: None }
    }

    pub fn with_replicator(mut self, replicator: Replicator) -> Self {
        self.replicator = Some(Arc::new(replicator));
        self
    }

    pub fn with_router(mut self, router: ShardRouter) -> Self {
        self.router = Some(Arc::new(router));
        self
    }
}

pub struct TesseraServer {
    ctx: AppContext,
}

impl TesseraServer {
    pub fn new(ctx: AppContext) -> Self {
        Self { ctx }
    }

    pub async fn run(&self, addr: SocketAddr) {
        println!("Tessera listening on http://{}", addr);
        warp::serve(routes(self.ctx.clone())).run(addr).await;
    }

    /// Serves until `shutdown` resolves.
    pub async fn run_until<F>(&self, addr: SocketAddr, shutdown: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let (bound, server) = warp::serve(routes(self.ctx.clone())).bind_with_graceful_shutdown(addr, shutdown);
        println!("Tessera listening on http://{}", bound);
        server.await;
    }
}

/// Full HTTP surface: the node API, the router API, and JSON error bodies for
/// every rejection.
pub fn routes(ctx: AppContext) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    node_routes(ctx.clone())
        .or(shard_routes(ctx.router.clone()))
        .unify()
        .recover(handle_rejection)
}

pub fn with_context(ctx: AppContext) -> impl Filter<Extract = (AppContext,), Error = Infallible> + Clone {
    warp::any().map(move || ctx.clone())
}

pub fn json_body<T>() -> impl Filter<Extract = (T,), Error = Rejection> + Clone
where
    T: serde::de::DeserializeOwned + Send,
{
    warp::body::content_length_limit(MAX_BODY_BYTES).and(warp::body::json())
}

/// Turns a handler result into a JSON reply, mapping errors to their status.
pub fn respond<T: Serialize>(result: Result<T>) -> Response {
    match result {
        Ok(value) => warp::reply::json(&value).into_response(),
        Err(e) => error_reply(&e),
    }
}

pub fn error_reply(e: &DbError) -> Response {
    let status = e.status();
    if status.is_server_error() {
        error!(kind = e.kind(), "{}", e);
    } else {
        debug!(kind = e.kind(), "{}", e);
    }
    warp::reply::with_status(warp::reply::json(&ErrorBody::from(e)), status).into_response()
}

fn node_routes(ctx: AppContext) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
    // 1. POST begin/{isolation}
    let begin = warp::post()
        .and(warp::path!("api" / "v1" / "db" / "begin" / String))
        .and(with_context(ctx.clone()))
        .and_then(|level: String, ctx: AppContext| async move {
            let result = level
                .parse::<IsolationLevel>()
                .and_then(|level| ctx.db.begin_transaction(level))
                .map(|transaction_id| BeginResponse { transaction_id });
            Ok::<_, Rejection>(respond(result))
        });

    // 2. POST commit/{id}, then push the oplog out
    let commit = warp::post()
        .and(warp::path!("api" / "v1" / "db" / "commit" / u64))
        .and(with_context(ctx.clone()))
        .and_then(|id: u64, ctx: AppContext| async move {
            Ok::<_, Rejection>(respond(commit_and_propagate(&ctx, id).await))
        });

    // 3. POST rollback/{id}
    let rollback = warp::post()
        .and(warp::path!("api" / "v1" / "db" / "rollback" / u64))
        .and(with_context(ctx.clone()))
        .and_then(|id: u64, ctx: AppContext| async move {
            let result = ctx.db.rollback(id).map(|_| MessageResponse::success());
            Ok::<_, Rejection>(respond(result))
        });

    // 4. POST insert_one/{id}
    let insert_one = warp::post()
        .and(warp::path!("api" / "v1" / "db" / "insert_one" / u64))
        .and(json_body::<NewDocument>())
        .and(with_context(ctx.clone()))
        .and_then(|id: u64, new: NewDocument, ctx: AppContext| async move {
            let result = ctx
                .db
                .insert_one(id, &new.name, new.doc)
                .map(|id| InsertResponse { message: "Success".into(), id });
            Ok::<_, Rejection>(respond(result))
        });

    // 5. POST insert_many/{id}
    let insert_many = warp::post()
        .and(warp::path!("api" / "v1" / "db" / "insert_many" / u64))
        .and(json_body::<Vec<NewDocument>>())
        .and(with_context(ctx.clone()))
        .and_then(|id: u64, docs: Vec<NewDocument>, ctx: AppContext| async move {
            let result = ctx.db.insert_many(id, docs).map(|ids| InsertManyResponse { ids });
            Ok::<_, Rejection>(respond(result))
        });

    // 6. POST find/{id}
    let find = warp::post()
        .and(warp::path!("api" / "v1" / "db" / "find" / u64))
        .and(json_body::<Query>())
        .and(with_context(ctx.clone()))
        .and_then(|id: u64, query: Query, ctx: AppContext| async move {
            Ok::<_, Rejection>(respond(ctx.db.find(id, &query)))
        });

    // 7. POST update/{id}
    let update = warp::post()
        .and(warp::path!("api" / "v1" / "db" / "update" / u64))
        .and(json_body::<UpdateRequest>())
        .and(with_context(ctx.clone()))
        .and_then(|id: u64, req: UpdateRequest, ctx: AppContext| async move {
            let result = ctx
                .db
                .update(id, &req.query(), req.set)
                .map(|count| CountResponse { message: "Success".into(), count });
            Ok::<_, Rejection>(respond(result))
        });

    // 8. POST delete/{id}
    let delete = warp::post()
        .and(warp::path!("api" / "v1" / "db" / "delete" / u64))
        .and(json_body::<Query>())
        .and(with_context(ctx.clone()))
        .and_then(|id: u64, query: Query, ctx: AppContext| async move {
            let result = ctx
                .db
                .delete(id, &query)
                .map(|count| CountResponse { message: "Success".into(), count });
            Ok::<_, Rejection>(respond(result))
        });

    // 9. POST replicate (peer traffic)
    let replicate = warp::post()
        .and(warp::path!("api" / "v1" / "db" / "replicate"))
        .and(json_body::<OpLog>())
        .and(with_context(ctx.clone()))
        .and_then(|oplog: OpLog, ctx: AppContext| async move {
            let result = ctx.db.replicate(&oplog).map(|transaction_id| BeginResponse { transaction_id });
            Ok::<_, Rejection>(respond(result))
        });

    // 10. GET stats
    let stats = warp::get()
        .and(warp::path!("api" / "v1" / "db" / "stats"))
        .and(with_context(ctx))
        .and_then(|ctx: AppContext| async move { Ok::<_, Rejection>(respond(ctx.db.stats())) });

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
        .or(replicate)
        .unify()
        .or(stats)
        .unify()
}

/// The local commit stands even when propagation fails; the client then
/// sees the replication error.
async fn commit_and_propagate(ctx: &AppContext, id: u64) -> Result<MessageResponse> {
    let oplog = ctx.db.commit(id)?;
    info!(transaction = id, ops = oplog.len(), "Committed");
    if let Some(replicator) = &ctx.replicator {
        replicator.propagate(&oplog).await?;
    }
    Ok(MessageResponse::success())
}

pub async fn handle_rejection(err: Rejection) -> std::result::Result<Response, Infallible> {
    let (status, kind, reason) = if err.is_not_found() {
        (StatusCode::NOT_FOUND, "NOT_FOUND", "No such route".to_string())
    } else if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
        (StatusCode::BAD_REQUEST, "BAD_REQUEST", e.to_string())
    } else if err.find::<warp::reject::PayloadTooLarge>().is_some() {
        (StatusCode::PAYLOAD_TOO_LARGE, "BAD_REQUEST", "Request body too large".to_string())
    } else if err.find::<warp::reject::LengthRequired>().is_some() {
        (StatusCode::LENGTH_REQUIRED, "BAD_REQUEST", "Content-Length required".to_string())
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "BAD_REQUEST", "Method not allowed".to_string())
    } else {
        error!("Unhandled rejection: {:?}", err);
        (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", "Unhandled rejection".to_string())
    };

    let body = ErrorBody { kind: kind.to_string(), reason };
    Ok(warp::reply::with_status(warp::reply::json(&body), status).into_response())
}
