use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::{info, warn};

use chunkd::cli::DaemonOpts;
use chunkd::config::Config;
use chunkd::context::ServerContext;
use chunkd::server::Server;

fn main() -> Result<()> {
    let opts = DaemonOpts::parse();
    let config = Config::from_opts(&opts)?;
    chunkd::logging::init(&config.logging)?;

    // Validate root directory exists and is a directory
    let root = &config.server.root;
    if !root.exists() {
        anyhow::bail!("Root directory does not exist: {}", root.display());
    }
    if !root.is_dir() {
        anyhow::bail!("Root path is not a directory: {}", root.display());
    }
    if let Some(web_root) = &config.server.web_root {
        if !web_root.is_dir() {
            anyhow::bail!("Web root is not a directory: {}", web_root.display());
        }
    }

    let ctx = ServerContext::from_config(&config)?;
    info!(
        root = %root.display(),
        bind = %config.server.bind,
        slots = config.transfer.slot_count,
        slot_size = config.transfer.slot_size,
        send_timeout_ms = config.transfer.send_timeout_ms,
        async_threshold = config.transfer.async_threshold,
        max_workers = config.transfer.max_workers,
        "starting chunkd"
    );
    if config.server.bind.starts_with("0.0.0.0") {
        warn!("binding to 0.0.0.0 exposes the file server on every interface; uploads and deletes are unauthenticated");
    }

    let server = Server::bind(&config.server.bind, Arc::new(ctx))?;
    let stop = server.stop_handle();
    ctrlc::set_handler(move || {
        if stop.stop() {
            warn!("second interrupt; exiting immediately");
            std::process::exit(1);
        }
        info!("interrupt received; finishing open requests");
    })
    .context("install Ctrl-C handler")?;

    server.run()
}
