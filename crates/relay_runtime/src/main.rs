//! Relay Runtime
//!
//! Minimal host that boots the script bridge and pushes one message through
//! it: the payload is read from stdin, the hook's reply is written to stdout.
//!
//! ```text
//! relay [config.json] < request.bin > reply.bin
//! ```

use anyhow::{Context, Result};
use relay_script::{Bridge, BridgeConfig, MessageBuffer};
use std::io::{Read, Write};
use std::path::Path;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    // Initialize logging; stdout carries the payload
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    tracing::info!(
        "Relay v{} ({} coprocess)",
        relay_script::VERSION,
        relay_script::COPROCESS_NAME
    );

    let config = match std::env::args_os().nth(1) {
        Some(path) => BridgeConfig::from_file(Path::new(&path))?,
        None => BridgeConfig::default(),
    };

    // Fail closed: no bridge, no serving
    let bridge = Bridge::init(config).context("script bridge failed to start")?;
    tracing::info!("Bridge initialized successfully");

    let mut input = Vec::new();
    std::io::stdin()
        .read_to_end(&mut input)
        .context("failed to read request from stdin")?;
    let request = if input.is_empty() {
        MessageBuffer::empty()
    } else {
        MessageBuffer::new(input)?
    };

    let reply = bridge.dispatch(request);
    std::io::stdout()
        .write_all(reply.as_bytes())
        .context("failed to write reply")?;

    let stats = bridge.stats();
    tracing::info!(
        dispatched = stats.dispatched,
        succeeded = stats.succeeded,
        failed = stats.failed,
        skipped = stats.skipped,
        avg_hook_ms = stats.average_hook_ms,
        max_hook_ms = stats.slowest_hook_ms,
        "Dispatch complete"
    );

    Ok(())
}
