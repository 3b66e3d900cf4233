//! Command-line options for the chunkd daemon

use clap::Parser;
use std::path::PathBuf;

/// Serve a directory over HTTP with buffered chunked transfers
#[derive(Clone, Debug, Parser)]
#[command(author, version, about)]
pub struct DaemonOpts {
    /// Bind address (host:port) [default: 0.0.0.0:8080]
    #[arg(long)]
    pub bind: Option<String>,

    /// Root directory to serve [default: .]
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// Directory holding the static web UI
    #[arg(long = "web-root")]
    pub web_root: Option<PathBuf>,

    /// TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log filter (overridden by RUST_LOG)
    #[arg(long = "log-level")]
    pub log_level: Option<String>,
}
