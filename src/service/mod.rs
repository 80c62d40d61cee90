/// Request batching worker
pub mod batcher;
/// axum routes
pub mod http;
/// Request decoding and model input preparation
pub mod input;

pub use batcher::{BatchOptions, BatchQueue, Labeler};
pub use input::ServiceError;

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::TcpListener;

use crate::config::Config;
use crate::model::{self, Classifier};

/// Inputs of one `serve` run
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    /// Listen address
    pub address: String,
    /// Exported artifact to serve
    pub model_path: PathBuf,
    /// Batch sizing
    pub batch: BatchOptions,
}

impl ServiceOptions {
    /// Builds options from the `[service]` config section
    ///
    /// # Errors
    /// Returns error if a `~/` path can't be expanded
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            address: config.service.address.clone(),
            model_path: Config::expand_path(&config.service.model_path)?,
            batch: BatchOptions {
                batch_size: config.service.batch_size,
                timeout: Duration::from_millis(config.service.timeout_ms),
            },
        })
    }
}

/// Loads the artifact, starts the batch worker and serves until Ctrl-C
///
/// # Errors
/// Returns error if the artifact can't be loaded or the address can't be bound
pub async fn serve(options: ServiceOptions) -> Result<()> {
    let model_path = options.model_path.clone();
    let classifier = tokio::task::spawn_blocking(move || {
        Classifier::from_artifact(&model_path, model::select_device())
    })
    .await
    .context("model loading task panicked")??;

    let listener = TcpListener::bind(&options.address)
        .await
        .with_context(|| format!("failed to bind {}", options.address))?;
    tracing::info!(
        address = %listener.local_addr()?,
        model = %options.model_path.display(),
        "labelling service listening"
    );

    let (queue, _worker) = batcher::spawn(classifier, options.batch);
    http::serve_on(listener, http::router(queue))
        .await
        .context("server failed")
}
