//! CLI argument parsing for sd

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Inspect and manage a worker's persisted revoked set and clock
#[derive(Parser, Debug)]
#[command(name = "sd")]
#[command(author, version, about = "Store-backed worker state for task queues", long_about = None)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Store URL (redis:// or rediss://); overrides the config file
    #[arg(short, long, global = true)]
    pub url: Option<String>,

    /// Worker identity (default: $HOSTNAME)
    #[arg(short, long, global = true)]
    pub worker: Option<String>,

    /// Base key prefix
    #[arg(short = 'p', long = "key-prefix", global = true)]
    pub key_prefix: Option<String>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(short = 'l', long = "log-level", global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Check that the store is reachable
    Ping,

    /// Show the persisted state for a worker
    Show {
        /// Also list the revoked task ids
        #[arg(long)]
        ids: bool,
    },

    /// Delete the persisted state for a worker
    Clear,

    /// Import a legacy local state file into the store
    Migrate {
        /// Path to the legacy state file
        #[arg(required = true)]
        path: PathBuf,
    },

    /// Run a demo worker: restore state, revoke tasks, save on Ctrl-C
    Run {
        /// Task id to revoke after startup (repeatable)
        #[arg(short, long = "revoke")]
        revoke: Vec<String>,

        /// Seconds between background syncs (overrides config)
        #[arg(short, long)]
        interval: Option<u64>,

        /// Exit right after startup instead of waiting for Ctrl-C
        #[arg(long)]
        once: bool,

        /// Legacy state file to import before restoring (overrides config)
        #[arg(long)]
        migrate: Option<PathBuf>,
    },
}

impl Cli {
    /// Worker identity from the flag, falling back to `$HOSTNAME`
    pub fn worker_identity(&self) -> Option<String> {
        self.worker
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .filter(|w| !w.trim().is_empty())
    }
}
