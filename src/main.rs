//! # Graph Harvest CLI (`harvest`)
//!
//! The `harvest` binary downloads a social graph account (the account's own
//! relations and those of its connections) through a rate-limited batching
//! scheduler, keeps a deduplicated archive in SQLite and searches it.
//!
//! ## Usage
//!
//! ```bash
//! harvest --config ./config/harvest.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `harvest init` | Create the SQLite database and tables |
//! | `harvest token <TOKEN>` | Store the API access token |
//! | `harvest sync` | Harvest everything new since the last sync |
//! | `harvest search "<term>"` | Search harvested records |
//! | `harvest get <key>` | Show one record, `--fetch` loads its details |
//! | `harvest status` | Record counts and last harvest time |
//! | `harvest reset` | Forget everything harvested |
//!
//! Logging is controlled with `RUST_LOG` (default `warn`) and goes to
//! stderr together with progress output.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use graph_harvest::progress::ProgressMode;
use graph_harvest::{archive, config, get, ingest, migrate, stats};

/// Graph Harvest CLI: archive and search a social graph account.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/harvest.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "harvest",
    about = "Graph Harvest: archive and search a social graph account",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/harvest.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent: running it multiple times is safe.
    Init,

    /// Store the API access token in the database.
    Token {
        token: String,

        /// Check the token against the API before storing it.
        #[arg(long)]
        verify: bool,
    },

    /// Harvest the root account and its connections.
    ///
    /// Only records newer than the last completed sync are requested
    /// unless `--full` is given. Ctrl-C stops dispatching new calls.
    Sync {
        /// Ignore the last sync time and request everything.
        #[arg(long)]
        full: bool,

        /// Progress output on stderr. Defaults to `human` on a terminal.
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },

    /// Search harvested records.
    Search {
        term: String,

        /// Progress output while the index is built.
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },

    /// Show a record by key (`<subject id>:<record id>`).
    Get {
        key: String,

        /// Fetch the record's full details from the API.
        #[arg(long)]
        fetch: bool,
    },

    /// Show what has been harvested and when.
    Status,

    /// Delete every harvested record, the stored token and the index.
    Reset,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Token { token, verify } => {
            ingest::store_access_token(&cfg, &token, verify).await?;
        }
        Commands::Sync { full, progress } => {
            let mode = progress.unwrap_or_else(ProgressMode::default_for_tty);
            ingest::run_sync(&cfg, full, mode).await?;
        }
        Commands::Search { term, progress } => {
            let mode = progress.unwrap_or(ProgressMode::Off);
            archive::run_search(&cfg, &term, mode).await?;
        }
        Commands::Get { key, fetch } => {
            get::run_get(&cfg, &key, fetch).await?;
        }
        Commands::Status => {
            stats::run_status(&cfg).await?;
        }
        Commands::Reset => {
            archive::run_reset(&cfg).await?;
        }
    }

    Ok(())
}
