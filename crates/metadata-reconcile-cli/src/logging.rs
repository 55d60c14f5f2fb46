use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use tracing_subscriber::EnvFilter;

/// Where log lines go. Standard output is reserved for the JSON report unless
/// `Stdout` is chosen explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTarget<'a> {
    Stderr,
    Stdout,
    File(&'a Path),
}

/// Install the global subscriber. `RUST_LOG` overrides the `info` default.
///
/// # Errors
/// Returns an error when the log file cannot be opened or a subscriber is
/// already installed.
pub fn init(target: LogTarget<'_>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);

    let installed = match target {
        LogTarget::Stderr => builder.with_writer(std::io::stderr).try_init(),
        LogTarget::Stdout => builder.with_writer(std::io::stdout).try_init(),
        LogTarget::File(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            builder.with_ansi(false).with_writer(Mutex::new(file)).try_init()
        }
    };

    installed.map_err(|err| anyhow!("failed to install log subscriber: {err}"))
}
