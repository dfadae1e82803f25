//! # kb-sync CLI (`kbsync`)
//!
//! Watches a `<year>/<month>` document tree and uploads new files to the
//! remote knowledge-base service.
//!
//! ## Usage
//!
//! ```bash
//! kbsync --config ./config/kbsync.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `kbsync init` | Create the SQLite database and run schema migrations |
//! | `kbsync scan` | Run one pass |
//! | `kbsync run` | Run passes every `scan.interval_secs` until Ctrl-C |
//! | `kbsync serve` | Admin HTTP API plus the periodic loop |
//! | `kbsync token` | Fetch a token to check credentials |
//! | `kbsync cache status\|invalidate <folder>` | Inspect or drop a folder marker |
//! | `kbsync relations list\|search\|add` | Name → knowledge-base relations |
//! | `kbsync records list\|get\|search\|delete` | Upload records |
//! | `kbsync cleanup` | Delete expired backups |
//!
//! Log verbosity follows `RUST_LOG` (default `info`).

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use kb_sync::{commands, config, migrate};

/// kb-sync: dated document folders in, remote knowledge bases out.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/kbsync.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "kbsync",
    about = "Scan dated document folders and upload them to a remote knowledge-base service",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/kbsync.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Run one scan pass and print its report.
    ///
    /// Exits non-zero when any folder failed; those folders are retried on
    /// the next pass.
    Scan,

    /// Run scan passes periodically until Ctrl-C.
    Run,

    /// Start the admin HTTP API.
    ///
    /// Also runs the periodic loop unless `--no-schedule` is given.
    Serve {
        /// Serve the API only; passes run on `POST /scan`.
        #[arg(long)]
        no_schedule: bool,
    },

    /// Fetch a token once to verify credentials and connectivity.
    Token,

    /// Inspect or invalidate folder cache markers.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Inspect or edit name → knowledge-base relations.
    Relations {
        #[command(subcommand)]
        action: RelationsAction,
    },

    /// Inspect or edit upload records.
    Records {
        #[command(subcommand)]
        action: RecordsAction,
    },

    /// Delete backups older than `scan.clean_days`.
    Cleanup,
}

#[derive(Subcommand)]
enum CacheAction {
    /// Show whether a folder is marked processed.
    Status { folder: PathBuf },
    /// Remove a folder's marker so the next pass rescans it.
    Invalidate { folder: PathBuf },
}

#[derive(Subcommand)]
enum RelationsAction {
    /// List all relations.
    List,
    /// Relations with an exact name.
    Search { name: String },
    /// Record a relation by hand.
    Add { name: String, knowledge_id: String },
}

#[derive(Subcommand)]
enum RecordsAction {
    /// Records of one knowledge base.
    List { knowledge_id: String },
    /// One record by id.
    Get { id: i64 },
    /// Records whose file key contains a fragment.
    Search { fragment: String },
    /// Delete a record, letting its file be uploaded again.
    Delete { id: i64 },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Scan => commands::run_scan(&cfg).await?,
        Commands::Run => commands::run_loop(&cfg).await?,
        Commands::Serve { no_schedule } => commands::run_serve(&cfg, !no_schedule).await?,
        Commands::Token => commands::run_token(&cfg).await?,
        Commands::Cache { action } => match action {
            CacheAction::Status { folder } => commands::cache_status(&cfg, &folder)?,
            CacheAction::Invalidate { folder } => commands::cache_invalidate(&cfg, &folder)?,
        },
        Commands::Relations { action } => match action {
            RelationsAction::List => commands::relations_list(&cfg).await?,
            RelationsAction::Search { name } => commands::relations_search(&cfg, &name).await?,
            RelationsAction::Add { name, knowledge_id } => {
                commands::relations_add(&cfg, &name, &knowledge_id).await?
            }
        },
        Commands::Records { action } => match action {
            RecordsAction::List { knowledge_id } => {
                commands::records_list(&cfg, &knowledge_id).await?
            }
            RecordsAction::Get { id } => commands::records_get(&cfg, id).await?,
            RecordsAction::Search { fragment } => {
                commands::records_search(&cfg, &fragment).await?
            }
            RecordsAction::Delete { id } => commands::records_delete(&cfg, id).await?,
        },
        Commands::Cleanup => commands::run_cleanup(&cfg)?,
    }

    Ok(())
}
