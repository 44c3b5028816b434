//! # Factweave CLI
//!
//! The `factweave` binary runs the chat service and provides a few
//! operational commands.
//!
//! ## Usage
//!
//! ```bash
//! factweave --config ./config/factweave.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `factweave init` | Create the SQLite database and run schema migrations |
//! | `factweave serve` | Start the HTTP server |
//! | `factweave token --owner <id>` | Issue a signed bearer token for an owner |

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use factweave::auth::AuthKeys;
use factweave::{config, db, migrate, server};

/// Factweave — a knowledge-grounded chat service with automatic claim
/// verification.
#[derive(Parser)]
#[command(
    name = "factweave",
    about = "Factweave — a knowledge-grounded chat service with automatic claim verification",
    version,
    long_about = "Factweave routes chat turns into general conversation, fact-checking, or \
    content generation with automatic claim verification, grounding answers in a per-user \
    knowledge base built from uploaded documents via retrieval-augmented search."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/factweave.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables. This
    /// command is idempotent — running it multiple times is safe.
    Init,

    /// Start the HTTP server.
    ///
    /// Binds to the address configured in `[server].bind` and serves the
    /// chat and knowledge-base API until the process is terminated.
    Serve,

    /// Issue a signed bearer token for an owner id.
    ///
    /// Uses the configured `auth.token_secret`. Intended for development
    /// and operational tooling.
    Token {
        /// Owner id to issue the token for.
        #[arg(long)]
        owner: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            pool.close().await;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Token { owner } => {
            let keys = AuthKeys::new(&cfg.auth.token_secret);
            println!("{}", keys.issue(&owner));
        }
    }

    Ok(())
}
