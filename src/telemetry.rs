use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::path::Path;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

use crate::config::Config;

const DEFAULT_FILTER: &str = "info";

/// Installs the global `tracing` subscriber
///
/// Events go to stdout, or are appended to `log_path` (`~/` expanded) when
/// `to_file` is set. `RUST_LOG` overrides the `info` default.
///
/// # Errors
/// Returns error if the log file can't be opened or a subscriber is already installed
pub fn init(to_file: bool, log_path: &str) -> Result<()> {
    let (writer, ansi, destination) = if to_file {
        let path = Config::expand_path(log_path)?;
        let file = open_log(&path)?;
        (BoxMakeWriter::new(file), false, path.display().to_string())
    } else {
        (BoxMakeWriter::new(std::io::stdout), true, "stdout".to_owned())
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter(std::env::var("RUST_LOG").ok().as_deref()))
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install subscriber: {e}"))?;

    tracing::debug!(%destination, "logging initialized");

    Ok(())
}

/// `directives` when they parse, the `info` default otherwise
fn env_filter(directives: Option<&str>) -> EnvFilter {
    directives
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
}

fn open_log(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create log directory {}", parent.display()))?;
    }

    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open log file {}", path.display()))
}
