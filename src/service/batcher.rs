//! Request batching
//!
//! Handlers submit prepared inputs to a [`BatchQueue`]. A single worker owns
//! the model: it waits for a first job, keeps collecting until the batch is
//! full or the timeout since that first job has passed, then labels the whole
//! batch on a blocking thread and answers every job in it.

use candle_core::Tensor;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::input::ServiceError;
use crate::model::{Classifier, Label};

/// Jobs that may wait in the channel per batch slot
const QUEUE_DEPTH: usize = 64;

/// Something that labels a stacked `[B, T, F]` batch
#[cfg_attr(test, mockall::automock)]
pub trait Labeler {
    /// Returns one label per batch row, in order
    ///
    /// # Errors
    /// Returns error if inference fails
    fn label_batch(&self, batch: &Tensor) -> candle_core::Result<Vec<Label>>;
}

impl Labeler for Classifier {
    fn label_batch(&self, batch: &Tensor) -> candle_core::Result<Vec<Label>> {
        let batch = batch.to_device(self.device())?;
        self.label(&batch)
    }
}

/// Batch sizing
#[derive(Debug, Clone, Copy)]
pub struct BatchOptions {
    /// Maximum jobs per batch
    pub batch_size: usize,
    /// How long a batch may wait to fill after its first job
    pub timeout: Duration,
}

struct Job {
    input: Tensor,
    reply: oneshot::Sender<Result<Label, ServiceError>>,
}

/// Handle for submitting inputs to the batch worker
#[derive(Clone)]
pub struct BatchQueue {
    sender: mpsc::Sender<Job>,
}

impl BatchQueue {
    /// Queues one `[T, F]` input and waits for its label
    ///
    /// # Errors
    /// Returns error if the worker is gone or the batch failed
    pub async fn submit(&self, input: Tensor) -> Result<Label, ServiceError> {
        let (reply, receiver) = oneshot::channel();
        self.sender
            .send(Job { input, reply })
            .await
            .map_err(|_| ServiceError::Unavailable)?;
        receiver.await.map_err(|_| ServiceError::Unavailable)?
    }
}

/// Starts the batch worker on the current runtime
///
/// The worker stops once every [`BatchQueue`] clone is dropped.
pub fn spawn<L>(labeler: L, options: BatchOptions) -> (BatchQueue, JoinHandle<()>)
where
    L: Labeler + Send + Sync + 'static,
{
    let options = BatchOptions {
        batch_size: options.batch_size.max(1),
        ..options
    };
    let (sender, receiver) = mpsc::channel(options.batch_size * QUEUE_DEPTH);
    let worker = tokio::spawn(run(Arc::new(labeler), receiver, options));
    (BatchQueue { sender }, worker)
}

async fn run<L>(labeler: Arc<L>, mut receiver: mpsc::Receiver<Job>, options: BatchOptions)
where
    L: Labeler + Send + Sync + 'static,
{
    tracing::info!(
        batch_size = options.batch_size,
        timeout_ms = options.timeout.as_millis(),
        "batch worker started"
    );

    while let Some(jobs) = collect(&mut receiver, options).await {
        tracing::debug!(jobs = jobs.len(), remaining = receiver.len(), "executing batch");
        execute(Arc::clone(&labeler), jobs).await;
    }

    tracing::info!("batch worker stopped");
}

/// Waits for a first job, then fills the batch until it's full or the deadline passes
async fn collect(receiver: &mut mpsc::Receiver<Job>, options: BatchOptions) -> Option<Vec<Job>> {
    let first = receiver.recv().await?;
    let deadline = Instant::now() + options.timeout;

    let mut jobs = Vec::with_capacity(options.batch_size);
    jobs.push(first);
    while jobs.len() < options.batch_size {
        match tokio::time::timeout_at(deadline, receiver.recv()).await {
            Ok(Some(job)) => jobs.push(job),
            Ok(None) | Err(_) => break,
        }
    }

    Some(jobs)
}

async fn execute<L>(labeler: Arc<L>, jobs: Vec<Job>)
where
    L: Labeler + Send + Sync + 'static,
{
    let count = jobs.len();
    let (inputs, replies): (Vec<Tensor>, Vec<_>) =
        jobs.into_iter().map(|job| (job.input, job.reply)).unzip();

    let start = std::time::Instant::now();
    let result = tokio::task::spawn_blocking(move || {
        let batch = Tensor::stack(&inputs, 0)?;
        labeler.label_batch(&batch)
    })
    .await;

    let labels = match result {
        Ok(Ok(labels)) if labels.len() == count => Ok(labels),
        Ok(Ok(labels)) => Err(format!("expected {count} labels, got {}", labels.len())),
        Ok(Err(e)) => Err(e.to_string()),
        Err(e) => Err(format!("inference task failed: {e}")),
    };

    match labels {
        Ok(labels) => {
            tracing::debug!(
                jobs = count,
                elapsed_ms = start.elapsed().as_millis(),
                "batch labelled"
            );
            for (reply, label) in replies.into_iter().zip(labels) {
                // the client may have hung up
                let _ = reply.send(Ok(label));
            }
        }
        Err(reason) => {
            tracing::error!(jobs = count, error = %reason, "batch failed");
            for reply in replies {
                let _ = reply.send(Err(ServiceError::Inference(reason.clone())));
            }
        }
    }
}
