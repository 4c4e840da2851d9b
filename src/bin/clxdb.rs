//! CLI front-end for a single local `ClxDB` instance, backed by a plain
//! directory as the "remote" (§9).

use clap::{Parser, Subcommand};
use clxdb::{ClxConfig, ClxDB, DatabaseBackend, FileSystemBackend, InMemoryDatabase, StorageBackend};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "clxdb", about = "Content-addressed, CAS-synced document database")]
struct Cli {
    /// Directory acting as the object-store remote for this run.
    #[arg(long, default_value = "./clxdb-data")]
    data_dir: PathBuf,

    /// Database identifier stamped into a freshly created manifest.
    #[arg(long, default_value = "default")]
    db_uuid: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a document locally as a pending change.
    Put {
        id: String,
        /// Document body as a JSON literal, e.g. '{"title":"hello"}'.
        json: String,
    },
    /// Read a document's current local state.
    Get { id: String },
    /// Mark a document locally deleted (a pending tombstone).
    Delete { id: String },
    /// Pull remote changes, then push pending local changes.
    Sync,
    /// Print the sync engine's current state.
    Status,
    /// Run one compaction, vacuum, and orphan-collection pass.
    Maintain,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    std::fs::create_dir_all(&cli.data_dir)?;

    let backend: Arc<dyn StorageBackend> = Arc::new(FileSystemBackend::new(cli.data_dir.clone()));
    let database: Arc<dyn DatabaseBackend> = Arc::new(InMemoryDatabase::new());
    let now_ms = chrono::Utc::now().timestamp_millis();

    let db = ClxDB::open(backend, database, &cli.db_uuid, ClxConfig::default(), now_ms).await?;

    match cli.command {
        Command::Put { id, json } => {
            let value: serde_json::Value = serde_json::from_str(&json)?;
            db.put(&id, value, now_ms).await?;
            println!("stored {id} (pending; run `sync` to push)");
        }
        Command::Get { id } => match db.get(&id).await? {
            Some(document) => println!("{}", serde_json::to_string_pretty(&document)?),
            None => println!("not found"),
        },
        Command::Delete { id } => {
            db.delete(&id, now_ms).await?;
            println!("deleted {id} (pending; run `sync` to push)");
        }
        Command::Sync => {
            let (pulled, pushed) = db.sync_now(now_ms).await?;
            println!("pulled {pulled} document(s), pushed {pushed} document(s)");
        }
        Command::Status => {
            println!("sync state: {}", db.sync_state());
        }
        Command::Maintain => {
            let compacted = db.compact_once(now_ms).await?;
            let vacuumed = db.vacuum_once(now_ms).await?;
            let orphans = db.collect_orphans(now_ms).await;
            println!(
                "compacted a level: {compacted}, vacuumed {vacuumed} shard(s), removed {orphans} orphan(s)"
            );
        }
    }

    Ok(())
}
