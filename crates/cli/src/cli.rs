//! CLI argument parsing.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "bulwark", about = "Signature scan daemon and client")]
pub struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, short = 'c', env = "BULWARK_CONFIG")]
    pub config: Option<PathBuf>,

    /// Verbose logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// Daemon TCP address for client commands
    #[arg(long, global = true, conflicts_with = "local")]
    pub tcp: Option<String>,

    /// Daemon local socket path for client commands
    #[arg(long, global = true)]
    pub local: Option<PathBuf>,

    /// Client timeout in seconds
    #[arg(long, global = true, default_value = "120")]
    pub timeout: u64,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum ScanMode {
    /// Stop at the first infected file
    Scan,
    /// Report every file
    Cont,
    /// Report every file, scanned in parallel
    Multi,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the daemon in the foreground
    Serve {
        /// Signature database directory
        #[arg(long)]
        database: Option<PathBuf>,
        /// Listen on a TCP address (repeatable)
        #[arg(long)]
        listen_tcp: Vec<String>,
        /// Listen on a local socket path (repeatable)
        #[arg(long)]
        listen_local: Vec<PathBuf>,
        /// Maximum concurrent connections
        #[arg(long)]
        max_threads: Option<usize>,
    },
    #[command(flatten)]
    Client(ClientCommand),
}

/// Commands sent to a running daemon.
#[derive(Subcommand)]
pub enum ClientCommand {
    /// Check that the daemon answers
    Ping,
    /// Print the engine build id and signature count
    Version,
    /// Print daemon statistics
    Stats,
    /// Ask the daemon to reload its database
    Reload,
    /// Ask the daemon to shut down
    Shutdown,
    /// Scan a file or directory on the daemon host; exit 1 if anything is infected
    Scan {
        path: PathBuf,
        #[arg(long, value_enum, default_value = "cont")]
        mode: ScanMode,
    },
    /// Stream stdin to the daemon; exit 1 if infected
    Stream,
}
