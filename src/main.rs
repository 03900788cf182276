//! # vault-search CLI (`vsearch`)
//!
//! ## Usage
//!
//! ```bash
//! vsearch --config ./config/vsearch.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `vsearch init` | Create both SQLite databases and run schema migrations |
//! | `vsearch index [--force]` | Run one incremental indexing cycle |
//! | `vsearch search "<query>"` | Ranked passages from the vault |
//! | `vsearch query "<question>"` | Answer a question from vault passages |
//! | `vsearch stats` | Index counts, coverage, and dimensionality |
//! | `vsearch serve` | Start the HTTP API |
//!
//! Logging goes to stderr and is controlled by `RUST_LOG` (default `info`).

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use vault_search::{commands, config, migrate, server, stats};

/// Incremental hybrid search over a markdown vault.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/vsearch.example.toml` for a full example.
#[derive(Parser)]
#[command(name = "vsearch", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/vsearch.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the index and state databases.
    ///
    /// Idempotent; running it multiple times is safe.
    Init,

    /// Run one indexing cycle against the configured vault.
    ///
    /// Unchanged notes are skipped by content hash, changed notes are
    /// re-chunked and re-embedded, deleted notes are purged.
    Index {
        /// Treat every note as changed.
        #[arg(long)]
        force: bool,
    },

    /// Search the index.
    Search {
        query: String,

        /// `hybrid`, `semantic`, `keyword`, or `tag`.
        #[arg(long, default_value = "hybrid")]
        mode: String,

        /// Maximum number of results to return.
        #[arg(long)]
        limit: Option<usize>,

        /// Print per-channel sub-scores for each result.
        #[arg(long)]
        explain: bool,
    },

    /// Answer a question using the configured LLM and vault passages.
    Query {
        question: String,

        /// Passages retrieved before context packing.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Show index statistics.
    Stats,

    /// Start the HTTP API on `[server].bind`.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
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
        Commands::Index { force } => {
            commands::run_index(&cfg, force).await?;
        }
        Commands::Search {
            query,
            mode,
            limit,
            explain,
        } => {
            commands::run_search(&cfg, &query, &mode, limit, explain).await?;
        }
        Commands::Query { question, limit } => {
            commands::run_query(&cfg, &question, limit).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
