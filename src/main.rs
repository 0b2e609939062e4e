use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tessera::TesseraDb;
use tessera::cluster::network::{PeerClient, Replicator};
use tessera::cluster::router::ShardRouter;
use tessera::config::{ReplicaConfig, ShardTopology};
use tessera::error::Result;
use tessera::manager::{self, MaintenancePlan, SystemProfile};
use tessera::server::{AppContext, TesseraServer};
use tessera::storage::FileBlobStore;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Clone, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(long, default_value = "127.0.0.1:8000")]
    addr: SocketAddr,

    /// Snapshot file
    #[clap(long, default_value = "tessera.snapshot")]
    data: PathBuf,

    /// Shard topology JSON; enables the router API
    #[clap(long)]
    shards: Option<PathBuf>,

    /// Replica set JSON; enables oplog replication on commit
    #[clap(long)]
    replicas: Option<PathBuf>,

    /// Seconds between snapshots, 0 disables
    #[clap(long, default_value = "60")]
    snapshot_interval: u64,

    /// Seconds between vacuum passes, 0 disables
    #[clap(long, default_value = "30")]
    vacuum_interval: u64,

    /// Timeout for replica and shard requests, in seconds
    #[clap(long, default_value = "5")]
    peer_timeout: u64,
}

fn main() {
    let profile = SystemProfile::detect();

    println!("--- [Tessera Resource Manager] ---");
    println!("Detected Cores: {}", profile.logical_cores);
    println!("Worker Threads: {}", profile.worker_threads);
    println!("----------------------------------");

    tokio::runtime::Builder::new_multi_thread()
    .worker_threads(profile.worker_threads)
    .enable_all()
    .build()
    .unwrap()
    .block_on(async_main());
}

async fn async_main() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info,tessera=info");
    }
    tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::from_default_env())
    .with_target(false)
    .with_level(true)
    .init();

    let args = Args::parse();
    println!("--- Tessera Node {} ---", args.addr);

    println!("Loading snapshot from {}...", args.data.display());
    let db = Arc::new(TesseraDb::new(Box::new(FileBlobStore::new(&args.data))));
    info!(records = db.collection().len(), "Store ready");

    let ctx = match build_context(&args, db.clone()) {
        Ok(ctx) => ctx,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    let plan = MaintenancePlan {
        vacuum_every: secs(args.vacuum_interval),
        snapshot_every: secs(args.snapshot_interval),
    };
    manager::start_maintenance_thread(db.clone(), plan);

    let server = TesseraServer::new(ctx);
    server
        .run_until(args.addr, async {
            let _ = tokio::signal::ctrl_c().await;
            println!("Shutting down...");
        })
        .await;

    match db.save() {
        Ok(count) => info!(records = count, "Final snapshot written"),
        Err(e) => error!("Final snapshot failed: {}", e),
    }
}

fn build_context(args: &Args, db: Arc<TesseraDb>) -> Result<AppContext> {
    let client = PeerClient::new(Duration::from_secs(args.peer_timeout))?;
    let mut ctx = AppContext::new(db);

    if let Some(path) = &args.replicas {
        let config = ReplicaConfig::load(path)?;
        println!("Replicating to {} of {} peers", config.count, config.replicas.len());
        ctx = ctx.with_replicator(Replicator::new(client.clone(), config));
    }

    if let Some(path) = &args.shards {
        let topology = ShardTopology::load(path)?;
        for (shard, (lo, hi)) in topology.shards.iter().zip(topology.ranges()) {
            println!("Shard {} [{}-{}] -> {:?}", shard.id, lo, hi, shard.replicas);
        }
        ctx = ctx.with_router(ShardRouter::new(topology, client));
    }

    Ok(ctx)
}

fn secs(n: u64) -> Option<Duration> {
    (n > 0).then(|| Duration::from_secs(n))
}
