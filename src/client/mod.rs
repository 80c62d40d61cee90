/// Per-file labelling against the service
pub mod process;
/// Copy/move destinations per label
pub mod routing;

pub use routing::{result_path, Action, ResultPathOptions};

use anyhow::{Context, Result};
use async_walkdir::{DirEntry, Filtering, WalkDir};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_stream::StreamExt;

use crate::config::Config;
use crate::model::Label;

/// Inputs of one `label` run
#[derive(Debug, Clone)]
pub struct LabelOptions {
    /// Service address, `host:port` or a full URL
    pub address: String,
    /// Maximum number of files in flight
    pub max_open_files: usize,
    /// What to do with each labelled file, if anything
    pub routing: Option<(Action, ResultPathOptions)>,
}

impl LabelOptions {
    /// Builds options from the `[client]` config section, without routing
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            address: config.client.address.clone(),
            max_open_files: config.client.max_open_files,
            routing: None,
        }
    }
}

/// Labelling outcome of a whole run
#[derive(Debug, Default)]
pub struct LabelReport {
    /// Files that were labelled, in completion order
    pub labelled: Vec<(PathBuf, Label)>,
    /// Files that failed, with the reason
    pub failed: Vec<(PathBuf, String)>,
}

/// URL the service answers on for `address`
#[must_use]
pub fn service_url(address: &str) -> String {
    if address.starts_with("http://") || address.starts_with("https://") {
        address.to_owned()
    } else {
        format!("http://{address}/")
    }
}

/// Whether the extension of `path` maps to an `audio/*` MIME type
#[must_use]
pub fn is_audio_path(path: &Path) -> bool {
    mime_guess::from_path(path)
        .iter()
        .any(|mime| mime.type_() == mime_guess::mime::AUDIO)
}

async fn is_audio_file(entry: &DirEntry) -> bool {
    let is_file = entry
        .file_type()
        .await
        .is_ok_and(|file_type| file_type.is_file());
    is_file && is_audio_path(&entry.path())
}

fn spinner() -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner} {msg}") {
        spinner.set_style(style);
    }
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner.set_message("Loading...");
    spinner
}

/// Labels `root`, a single file or a directory walked recursively for audio files
///
/// Each result is printed as `path: Label` as soon as it's known, then routed
/// when `options.routing` is set. A file that fails is reported and skipped.
///
/// # Errors
/// Returns error if the directory walk fails or a routed copy/move fails
pub async fn run(root: &Path, options: &LabelOptions) -> Result<LabelReport> {
    let url = service_url(&options.address);
    let client = reqwest::Client::new();
    let permits = Arc::new(Semaphore::new(options.max_open_files.max(1)));
    let spinner = spinner();
    let mut jobs = JoinSet::new();
    let mut report = LabelReport::default();

    let spawn = |jobs: &mut JoinSet<(PathBuf, Result<Label>)>, path: PathBuf, permit: OwnedSemaphorePermit| {
        let client = client.clone();
        let url = url.clone();
        jobs.spawn(async move {
            let _permit = permit;
            let result = process::process(&client, &url, path.clone())
                .await
                .map(|(_, label)| label);
            (path, result)
        });
    };

    if root.is_file() {
        let permit = Arc::clone(&permits)
            .acquire_owned()
            .await
            .context("failed to acquire permit")?;
        spinner.set_message(format!("Labelling {}", root.display()));
        spawn(&mut jobs, root.to_path_buf(), permit);
    } else {
        let mut entries = WalkDir::new(root).filter(|entry| async move {
            if is_audio_file(&entry).await {
                Filtering::Continue
            } else {
                Filtering::Ignore
            }
        });

        while let Some(entry) = entries.next().await {
            let entry = entry.with_context(|| format!("failed to walk {}", root.display()))?;
            let permit = Arc::clone(&permits)
                .acquire_owned()
                .await
                .context("failed to acquire permit")?;
            let path = entry.path();
            spinner.set_message(format!("Labelling {}", path.display()));
            spawn(&mut jobs, path, permit);

            while let Some(done) = jobs.try_join_next() {
                record(done?, options, &spinner, &mut report).await?;
            }
        }
    }

    spinner.set_message("Waiting for labels");
    while let Some(done) = jobs.join_next().await {
        record(done?, options, &spinner, &mut report).await?;
    }
    spinner.finish_and_clear();

    tracing::info!(
        labelled = report.labelled.len(),
        failed = report.failed.len(),
        "labelling finished"
    );

    Ok(report)
}

async fn record(
    (path, result): (PathBuf, Result<Label>),
    options: &LabelOptions,
    spinner: &ProgressBar,
    report: &mut LabelReport,
) -> Result<()> {
    let label = match result {
        Ok(label) => label,
        Err(e) => {
            let reason = format!("{e:#}");
            tracing::error!(path = %path.display(), error = %reason, "labelling failed");
            report.failed.push((path, reason));
            return Ok(());
        }
    };

    #[allow(clippy::print_stdout)]
    spinner.suspend(|| println!("{}: {label}", path.display()));

    if let Some((action, directories)) = &options.routing {
        action
            .perform(&path, label, directories)
            .await
            .with_context(|| format!("failed to {action:?} {}", path.display()))?;
    }

    report.labelled.push((path, label));
    Ok(())
}
