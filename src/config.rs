//! Daemon configuration
//!
//! Loaded from an optional TOML file; command-line flags override file
//! values. Every field has a default matching the reference device sizing.

use crate::buffer::{DEFAULT_SLOT_COUNT, DEFAULT_SLOT_SIZE};
use crate::cli::DaemonOpts;
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Files at or above this size use the asynchronous pipeline (1 MiB)
pub const DEFAULT_ASYNC_THRESHOLD: u64 = 1024 * 1024;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub server: ServerConfig,
    pub transfer: TransferConfig,
    pub status: StatusConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Bind address (host:port)
    pub bind: String,
    /// Root of the served file tree
    pub root: PathBuf,
    /// Root of the static web UI; disabled when unset
    pub web_root: Option<PathBuf>,
    /// Longest decoded request path accepted, in bytes
    pub max_path_len: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind: "0.0.0.0:8080".to_string(),
            root: PathBuf::from("."),
            web_root: None,
            max_path_len: 255,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransferConfig {
    /// Bytes per scratch slot
    pub slot_size: usize,
    /// Slots in circulation for an asynchronous download
    pub slot_count: usize,
    /// Smallest file size served through the i/o worker
    pub async_threshold: u64,
    /// Receive timeout for upload bodies; timeouts are retried
    pub recv_timeout_ms: u64,
    /// How long one response write may block before the peer is abandoned
    pub send_timeout_ms: u64,
    /// Concurrent i/o workers; 0 disables the asynchronous path
    pub max_workers: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        TransferConfig {
            slot_size: DEFAULT_SLOT_SIZE,
            slot_count: DEFAULT_SLOT_COUNT,
            async_threshold: DEFAULT_ASYNC_THRESHOLD,
            recv_timeout_ms: 5_000,
            send_timeout_ms: 5_000,
            max_workers: 4,
        }
    }
}

impl TransferConfig {
    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.recv_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StatusConfig {
    /// Pending status updates before new ones are dropped
    pub queue_depth: usize,
}

impl Default for StatusConfig {
    fn default() -> Self {
        StatusConfig { queue_depth: 8 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// Filter directive, e.g. "info" or "chunkd=debug"
    pub level: String,
    pub format: LogFormat,
    pub timestamps: bool,
    pub thread_names: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            timestamps: true,
            thread_names: true,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::from_toml(&data).with_context(|| format!("parse config {}", path.display()))
    }

    pub fn from_toml(data: &str) -> Result<Self> {
        let config: Config = toml::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    /// Start from the file named by `--config` (or defaults) and layer the
    /// remaining flags on top.
    pub fn from_opts(opts: &DaemonOpts) -> Result<Self> {
        let mut config = match &opts.config {
            Some(path) => Self::load(path)?,
            None => Config::default(),
        };
        if let Some(bind) = &opts.bind {
            config.server.bind = bind.clone();
        }
        if let Some(root) = &opts.root {
            config.server.root = root.clone();
        }
        if let Some(web_root) = &opts.web_root {
            config.server.web_root = Some(web_root.clone());
        }
        if let Some(level) = &opts.log_level {
            config.logging.level = level.clone();
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let t = &self.transfer;
        if t.slot_count == 0 {
            bail!("transfer.slot_count must be at least 1");
        }
        if t.slot_size < 512 {
            bail!("transfer.slot_size must be at least 512 bytes (got {})", t.slot_size);
        }
        if t.async_threshold == 0 {
            bail!("transfer.async_threshold must be positive");
        }
        if t.recv_timeout_ms == 0 {
            bail!("transfer.recv_timeout_ms must be positive");
        }
        if t.send_timeout_ms == 0 {
            bail!("transfer.send_timeout_ms must be positive");
        }
        if self.status.queue_depth == 0 {
            bail!("status.queue_depth must be at least 1");
        }
        if self.server.max_path_len == 0 {
            bail!("server.max_path_len must be positive");
        }
        Ok(())
    }
}
