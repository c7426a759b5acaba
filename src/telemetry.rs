use std::str::FromStr;

use anyhow::{anyhow, Result};
use tracing::Level;

/// Installs the fmt subscriber. Logs go to stderr; stdout carries command output.
pub fn init(level: &str) -> Result<()> {
    let level = Level::from_str(level).map_err(|e| anyhow!("invalid log level {level:?}: {e}"))?;
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow!("failed to install tracing subscriber: {e}"))
}
