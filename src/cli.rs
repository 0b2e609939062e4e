use std::io::{self, Write};
use std::time::Duration;

use clap::Parser;
use tessera::cluster::network::PeerClient;
use tessera::cluster::types::{
    BeginResponse, CountResponse, InsertResponse, MessageResponse, UpdateRequest, DB_PREFIX,
    SHARD_PREFIX,
};
use tessera::error::{DbError, Result};
use tessera::model::{NewDocument, Record};
use tessera::parser::{self, Command};
use tessera::DbStats;

#[derive(Parser, Clone, Debug)]
#[clap(author, version, about = "Interactive shell for a Tessera node or shard router", long_about = None)]
struct Args {
    /// Base URL of the node or router
    #[clap(long, default_value = "http://127.0.0.1:8000")]
    host: String,

    /// Talk to the shard router API instead of a single node
    #[clap(long)]
    shard: bool,

    #[clap(long, default_value = "10")]
    timeout_secs: u64,
}

struct Session {
    client: PeerClient,
    host: String,
    shard: bool,
}

impl Session {
    fn prefix(&self) -> &'static str {
        if self.shard { SHARD_PREFIX } else { DB_PREFIX }
    }

    fn route(&self, verb: &str, tx: u64) -> String {
        format!("{}/{}/{}", self.prefix(), verb, tx)
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    print_banner();

    let client = match PeerClient::new(Duration::from_secs(args.timeout_secs)) {
        Ok(client) => client,
        Err(e) => {
            println!("[\u{2717}] {}", e);
            return;
        }
    };
    let session = Session { client, host: args.host.clone(), shard: args.shard };

    if session.shard {
        println!("[\u{2713}] Using shard router at {}", session.host);
    } else {
        match session.client.get::<DbStats>(&session.host, &format!("{}/stats", DB_PREFIX)).await {
            Ok(stats) => println!("[\u{2713}] Connected to Tessera at {} ({} records)", session.host, stats.records),
            Err(_) => {
                println!("[\u{2717}] Could not reach a node at {}.", session.host);
                println!("    Start one with 'cargo run --release' in another terminal.");
                return;
            }
        }
    }
    println!("Type 'HELP' for supported commands or 'EXIT' to quit.\n");

    let stdin = io::stdin();
    let mut buffer = String::new();

    loop {
        print!("tessera> ");
        let _ = io::stdout().flush();
        buffer.clear();

        match stdin.read_line(&mut buffer) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        if buffer.trim().is_empty() { continue; }

        match parser::parse_command(&buffer) {
            Ok(Command::Exit) => break,
            Ok(cmd) => {
                if let Err(e) = execute_command(&session, cmd).await {
                    println!("[\u{26a0}\u{fe0f} {}] {}", e.kind(), e);
                }
            }
            Err(e) => {
                println!("[\u{2717} Syntax Error] {}", e);
                if buffer.to_uppercase().starts_with("INSERT") {
                    println!("    \u{2139}\u{fe0f}  Hint: INSERT <tx> \"name\" {{\"field\": \"value\"}}");
                }
            }
        }
    }
}

fn print_banner() {
    println!("\n==================================================");
    println!("   Tessera CLI - Transactional Document Store");
    println!("==================================================\n");
}

fn print_help() {
    println!("\n--- Available Commands ---");
    println!("1. BEGIN:    BEGIN read_uncommitted|read_committed|repeatable_read|serializable");
    println!("2. INSERT:   INSERT <tx> \"name\" {{\"field\": \"value\"}}");
    println!("3. FIND:     FIND <tx> [WHERE field (=|!=|<|<=|>|>=) value] [LIMIT n]");
    println!("4. UPDATE:   UPDATE <tx> SET {{...}} [WHERE ...] [LIMIT n]");
    println!("5. DELETE:   DELETE <tx> [WHERE ...] [LIMIT n]");
    println!("6. COMMIT:   COMMIT <tx>");
    println!("7. ROLLBACK: ROLLBACK <tx>");
    println!("8. STATS:    Node counters");
    println!("9. EXIT:     Quit\n");
}

async fn execute_command(session: &Session, cmd: Command) -> Result<()> {
    let client = &session.client;
    let host = session.host.as_str();

    match cmd {
        Command::Help => print_help(),
        Command::Exit => {}
        Command::Begin { level } => {
            let route = format!("{}/begin/{}", session.prefix(), level);
            let reply: BeginResponse = client.post_empty(host, &route).await?;
            println!("[\u{2713} OK] Transaction {} ({})", reply.transaction_id, level);
        }
        Command::Commit { tx } => {
            let reply: MessageResponse = client.post_empty(host, &session.route("commit", tx)).await?;
            println!("[\u{2713} {}] Committed {}", reply.message, tx);
        }
        Command::Rollback { tx } => {
            let reply: MessageResponse = client.post_empty(host, &session.route("rollback", tx)).await?;
            println!("[\u{2713} {}] Rolled back {}", reply.message, tx);
        }
        Command::Insert { tx, name, doc } => {
            let reply: InsertResponse =
                client.post_json(host, &session.route("insert_one", tx), &NewDocument { name, doc }).await?;
            println!("[\u{2713} OK] Inserted ID: {}", reply.id);
        }
        Command::Find { tx, query } => {
            let records: Vec<Record> = client.post_json(host, &session.route("find", tx), &query).await?;
            println!("\nFound {} records:", records.len());
            for record in records {
                println!("  \u{2022} [{}] {} {}", record.id, record.name, serde_json::Value::Object(record.doc));
            }
            println!();
        }
        Command::Update { tx, set, query } => {
            let req = UpdateRequest { filter: query.filter, limit: query.limit, set };
            let reply: CountResponse = client.post_json(host, &session.route("update", tx), &req).await?;
            println!("[\u{2713} OK] Updated {} records", reply.count);
        }
        Command::Delete { tx, query } => {
            let reply: CountResponse = client.post_json(host, &session.route("delete", tx), &query).await?;
            println!("[\u{2713} OK] Deleted {} records", reply.count);
        }
        Command::Stats => {
            if session.shard {
                return Err(DbError::Configuration("STATS is served by nodes, not the router".into()));
            }
            let stats: DbStats = client.get(host, &format!("{}/stats", DB_PREFIX)).await?;
            println!("Records:             {}", stats.records);
            println!("Active transactions: {}", stats.active_transactions);
            println!("Lock entries:        {}", stats.lock_entries);
        }
    }
    Ok(())
}
