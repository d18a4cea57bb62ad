//! # caseforge CLI (`forge`)
//!
//! Turns requirement text into validated test cases and executable test
//! scripts, grounded in an indexed collection of support documents.
//!
//! ## Usage
//!
//! ```bash
//! forge --config ./config/forge.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `forge init` | Create the SQLite database and schema |
//! | `forge ingest <paths...>` | Chunk, embed and index support documents |
//! | `forge retrieve "<query>"` | Show the chunks a requirement would retrieve |
//! | `forge generate "<requirement>"` | Generate test cases and scripts |
//! | `forge serve` | Start the HTTP status interface |
//! | `forge collections` | List collections (or `drop <name>`) |
//!
//! ## Examples
//!
//! ```bash
//! forge init
//! forge ingest ./docs ./ui/login.html
//! forge retrieve "user logs in" --k 3
//! forge generate "User logs in with valid credentials" --framework playwright-ts
//! forge serve
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use caseforge::{collections, config, generate, ingest, migrate, retrieve, server};

/// caseforge: requirement text in, validated test cases and scripts out.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/forge.example.toml` for every option.
#[derive(Parser)]
#[command(
    name = "forge",
    about = "caseforge: retrieval-grounded test case and test script generation",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/forge.toml")]
    config: PathBuf,

    /// Log at debug level (overridden by `RUST_LOG`).
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent; running it again is safe.
    Init,

    /// Ingest support documents into the configured collection.
    ///
    /// Each path may be a file or a directory. Directories are walked
    /// using `[ingest].include_globs` / `exclude_globs`. Chunks already in
    /// the collection (by content hash) are skipped.
    Ingest {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Show the top-k chunks retrieved for a query.
    Retrieve {
        query: String,

        /// Number of chunks (default: `[retrieval].top_k`).
        #[arg(long)]
        k: Option<usize>,
    },

    /// Generate test cases and scripts for a requirement.
    ///
    /// Runs retrieval, the test case agent and the script agent, each
    /// agent output validated and retried with feedback up to
    /// `[generation].max_retries` times.
    Generate {
        requirement: String,

        /// Target framework tag (default: `[generation].framework`).
        #[arg(long)]
        framework: Option<String>,

        /// Print the result as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Start the HTTP status interface on `[server].bind`.
    Serve,

    /// List collections, or drop one.
    Collections {
        #[command(subcommand)]
        action: Option<CollectionAction>,
    },
}

#[derive(Subcommand)]
enum CollectionAction {
    /// Delete a collection and everything in it.
    Drop { name: String },
}

fn init_tracing(verbose: bool) -> anyhow::Result<()> {
    let default = if verbose { "caseforge=debug" } else { "caseforge=info" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env().add_directive(default.parse()?))
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest { paths } => {
            ingest::run_ingest(&cfg, &paths).await?;
        }
        Commands::Retrieve { query, k } => {
            retrieve::run_retrieve(&cfg, &query, k).await?;
        }
        Commands::Generate {
            requirement,
            framework,
            json,
        } => {
            generate::run_generate(&cfg, &requirement, framework, json).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Collections { action } => match action {
            None => collections::run_list(&cfg).await?,
            Some(CollectionAction::Drop { name }) => {
                collections::run_drop(&cfg, &name).await?;
            }
        },
    }

    Ok(())
}
