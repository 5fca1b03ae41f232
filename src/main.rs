//! # Memory Bank Bridge CLI (`membank-bridge`)
//!
//! The binary a host application spawns once and keeps alive. With no
//! subcommand it serves the line-delimited JSON protocol on stdin/stdout;
//! logs go to stderr (or the configured log file), never to stdout.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `membank-bridge` / `membank-bridge serve` | Announce readiness and answer requests until stdin closes |
//! | `membank-bridge repair [dir]` | Finish or undo interrupted updates, then exit |
//! | `membank-bridge check` | Build the configured embedder and embed one sample text |
//!
//! ## Examples
//!
//! ```bash
//! # Serve with the default config (./config/bridge.toml, optional)
//! membank-bridge
//!
//! # Serve with an explicit config
//! membank-bridge --config ./config/bridge.toml serve
//!
//! # Clean up after a crash
//! membank-bridge repair ./memory_banks
//! ```

use clap::{Parser, Subcommand};
use std::io;
use std::path::PathBuf;

use membank_bridge::bridge::Bridge;
use membank_bridge::transaction::{recover_dir, RecoveryAction};
use membank_bridge::{config, dispatch, embedding, logging};

/// Memory bank bridge: a persistent stdio worker that builds, searches
/// and updates memory-bank artifacts for a host application.
#[derive(Parser)]
#[command(name = "membank-bridge", version)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/bridge.toml`; when that file does not exist
    /// built-in defaults are used.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the JSON protocol on stdin/stdout (the default).
    Serve,

    /// Roll back interrupted updates and delete stale backups.
    Repair {
        /// Directory to scan. Defaults to the configured banks directory.
        dir: Option<PathBuf>,
    },

    /// Verify the configured embedder works, then exit.
    Check,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(cli.config.as_deref())?;
    let _log_guard = logging::init_logging(&cfg.logging)?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(cfg),
        Commands::Repair { dir } => {
            let dir = dir.unwrap_or_else(|| cfg.storage.banks_dir.clone());
            let actions = recover_dir(&dir)?;
            let mut touched = 0;
            for (files, action) in &actions {
                match action {
                    RecoveryAction::Clean => {}
                    RecoveryAction::RolledBack => {
                        touched += 1;
                        println!("rolled back  {}", files.name());
                    }
                    RecoveryAction::RemovedStaleBackups(n) => {
                        touched += 1;
                        println!("cleaned      {} ({} backup(s))", files.name(), n);
                    }
                }
            }
            println!("{} artifact(s) repaired under {}", touched, dir.display());
            Ok(())
        }
        Commands::Check => {
            let embedder = embedding::create_embedder(&cfg.embedding)?;
            let sample = embedder.embed(&["membank-bridge check".to_string()])?;
            let got = sample.first().map(|v| v.len()).unwrap_or(0);
            if got != embedder.dims() {
                anyhow::bail!(
                    "embedder {} returned {} dims, expected {}",
                    embedder.model_name(),
                    got,
                    embedder.dims()
                );
            }
            println!("ok: {} ({} dims)", embedder.model_name(), embedder.dims());
            Ok(())
        }
    }
}

fn serve(cfg: config::Config) -> anyhow::Result<()> {
    let bridge = Bridge::new(cfg);

    if bridge.config().storage.recover_on_start {
        match bridge.recover_all() {
            Ok(actions) => {
                let touched = actions
                    .iter()
                    .filter(|(_, a)| *a != RecoveryAction::Clean)
                    .count();
                if touched > 0 {
                    tracing::info!(touched, "Recovered interrupted updates");
                }
            }
            Err(e) => tracing::warn!("Startup recovery failed: {}", e),
        }
    }

    tracing::info!(
        banks_dir = %bridge.config().storage.banks_dir.display(),
        "Starting bridge"
    );
    let stdin = io::stdin();
    let stdout = io::stdout();
    match dispatch::serve(&bridge, stdin.lock(), stdout.lock()) {
        Ok(_) => Ok(()),
        Err(e) => {
            tracing::error!("Stream failure: {}", e);
            Err(e.into())
        }
    }
}
