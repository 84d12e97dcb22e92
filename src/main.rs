//! # Scriptoria CLI (`scriptoria`)
//!
//! Watches storage folders for scanned PDFs and turns them into Markdown
//! notes through a chain of stages (staging, OCR, cleanup, bundling).
//!
//! ## Usage
//!
//! ```bash
//! scriptoria --config ./config/scriptoria.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `scriptoria init` | Create the SQLite database and run schema migrations |
//! | `scriptoria serve` | Watch for documents and run the pipeline until interrupted |
//! | `scriptoria status <source-id>` | Show the processing record of a document |
//! | `scriptoria channels` | List Drive watch channels and their state |
//!
//! Secrets come from the environment (a `.env` file in the working
//! directory is loaded first).

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use scriptoria::{config, logging, migrate, server, status};

/// Scriptoria: scanned PDFs in, Markdown notes out.
#[derive(Parser)]
#[command(
    name = "scriptoria",
    about = "Scriptoria: turns scanned PDFs into Markdown notes",
    version,
    long_about = "Scriptoria watches local folders or Google Drive folders for scanned PDFs, \
    converts them to Markdown with an OCR service, cleans the text up with a language model, \
    and files the note with its original attachment into per-folder destinations."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/scriptoria.toml")]
    config: PathBuf,

    /// Log filter used when `RUST_LOG` is not set (e.g. `debug`, `scriptoria=trace`).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Append logs to this file instead of stderr.
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent: running it multiple times is safe.
    Init,

    /// Run the watcher and pipeline.
    ///
    /// Exits non-zero if the pipeline was stopped by repeated stage failures.
    Serve,

    /// Show the processing record for a source document.
    Status {
        /// Source id as recorded by the watcher.
        source_id: String,

        /// Source store name (defaults to `pipeline.source_store`).
        #[arg(long)]
        store: Option<String>,
    },

    /// List persisted watch channels.
    Channels,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    logging::init_logging(&cli.log_level, cli.log_file.as_deref())?;

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            server::run_service(&cfg).await?;
        }
        Commands::Status { source_id, store } => {
            status::run_status(&cfg, &source_id, store.as_deref()).await?;
        }
        Commands::Channels => {
            status::run_channels(&cfg).await?;
        }
    }

    Ok(())
}
