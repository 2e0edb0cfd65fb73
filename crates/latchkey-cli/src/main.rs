//! Latchkey maintenance binary.
//!
//! # Usage
//!
//! ```bash
//! # Merge duplicate contacts
//! latchkey --db client.redb check-conflicts
//!
//! # Prune signed prekeys older than two weeks
//! latchkey --db client.redb clean-keys --archive-days 14
//! ```

use std::path::PathBuf;

use clap::Parser;
use latchkey_cli::{Command, run};
use latchkey_core::{RedbStore, SystemEnv};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Latchkey maintenance commands
#[derive(Parser, Debug)]
#[command(name = "latchkey")]
#[command(about = "Offline maintenance for a Latchkey record store")]
#[command(version)]
struct Args {
    /// Path to the record database
    #[arg(short, long, default_value = "latchkey.redb")]
    db: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!(db = %args.db.display(), command = ?args.command, "latchkey starting");

    let store = RedbStore::open(&args.db)?;
    let outcome = run(args.command, store, SystemEnv::new()).await?;

    tracing::info!("{outcome}");

    Ok(())
}
