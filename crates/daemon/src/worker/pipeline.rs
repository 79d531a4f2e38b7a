//! Per-task pipeline: download, encode, upload, callback.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::storage::CallbackClient;
use crate::encode::{EncodeError, Encoder};
use crate::protocol::{TaskPayload, TaskResult, TaskStage};

#[derive(Debug, Error)]
pub enum FetchError {
    /// The source does not exist; retrying won't help.
    #[error("source not found: {0}")]
    NotFound(String),

    #[error("unsupported source url: {0}")]
    Malformed(String),

    #[error("source returned status {0}")]
    Status(u16),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid object key: {0}")]
    InvalidKey(String),

    #[error("callback rejected with status {0}")]
    CallbackRejected(u16),

    #[error("callback failed: {0}")]
    Callback(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("download failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("encode failed: {0}")]
    Encode(#[from] EncodeError),

    #[error("upload failed: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Whether the coordinator should stop retrying this task.
    pub fn is_fatal(&self) -> bool {
        match self {
            PipelineError::Malformed(_) => true,
            PipelineError::Fetch(FetchError::NotFound(_) | FetchError::Malformed(_)) => true,
            PipelineError::Encode(e) => e.is_fatal(),
            PipelineError::Store(StoreError::InvalidKey(_)) => true,
            _ => false,
        }
    }
}

/// Resolves and downloads a source stream.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Download `url` into `dest`, returning the number of bytes written.
    async fn fetch(&self, url: &str, dest: &Path) -> Result<u64, FetchError>;
}

/// Remote storage for encoded streams.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, reference: &str, file: &Path) -> Result<TaskResult, StoreError>;

    async fn delete(&self, reference: &str) -> Result<(), StoreError>;
}

/// Lossy stage and percentage updates from a running pipeline.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    tx: mpsc::Sender<(TaskStage, f32)>,
}

impl ProgressReporter {
    pub fn new(tx: mpsc::Sender<(TaskStage, f32)>) -> Self {
        Self { tx }
    }

    /// Drops the update if the relay is behind.
    pub fn report(&self, stage: TaskStage, percent: f32) {
        let _ = self.tx.try_send((stage, percent));
    }
}

/// A single, non-empty path component: no separators and no `.`/`..`.
pub(crate) fn is_path_segment(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\'])
}

pub struct Pipeline {
    fetcher: Arc<dyn Fetcher>,
    encoder: Arc<dyn Encoder>,
    store: Arc<dyn ObjectStore>,
    callback: CallbackClient,
    work_dir: PathBuf,
}

impl Pipeline {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        encoder: Arc<dyn Encoder>,
        store: Arc<dyn ObjectStore>,
        callback: CallbackClient,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            fetcher,
            encoder,
            store,
            callback,
            work_dir: work_dir.into(),
        }
    }

    /// Run every stage for `payload`. The scratch directory is removed
    /// whatever the outcome.
    pub async fn run(
        &self,
        payload: &TaskPayload,
        progress: &ProgressReporter,
    ) -> Result<TaskResult, PipelineError> {
        if payload.task_id.is_empty() || payload.url.is_empty() || payload.reference.is_empty() {
            return Err(PipelineError::Malformed(
                "task_id, reference and url are required".to_string(),
            ));
        }
        if !is_path_segment(&payload.task_id) {
            return Err(PipelineError::Malformed(format!(
                "task_id {:?} is not a valid directory name",
                payload.task_id
            )));
        }

        let scratch = self.work_dir.join(&payload.task_id);
        tokio::fs::create_dir_all(&scratch).await?;
        let outcome = self.run_stages(payload, progress, &scratch).await;
        if let Err(e) = tokio::fs::remove_dir_all(&scratch).await {
            debug!(task_id = %payload.task_id, error = %e, "scratch cleanup failed");
        }
        outcome
    }

    async fn run_stages(
        &self,
        payload: &TaskPayload,
        progress: &ProgressReporter,
        scratch: &Path,
    ) -> Result<TaskResult, PipelineError> {
        let source = scratch.join("source");
        let output = scratch.join(format!("{}.mkv", payload.task_id));

        progress.report(TaskStage::Downloading, 0.0);
        let bytes = self.fetcher.fetch(&payload.url, &source).await?;
        debug!(task_id = %payload.task_id, bytes, "source downloaded");
        progress.report(TaskStage::Downloading, 100.0);

        progress.report(TaskStage::Encoding, 0.0);
        let (tx, mut rx) = mpsc::channel(16);
        let encode = self.encoder.encode(&source, &output, tx);
        tokio::pin!(encode);
        loop {
            tokio::select! {
                result = &mut encode => {
                    result?;
                    break;
                }
                Some(percent) = rx.recv() => progress.report(TaskStage::Encoding, percent),
            }
        }

        progress.report(TaskStage::Uploading, 0.0);
        let result = self.store.put(&payload.reference, &output).await?;
        progress.report(TaskStage::Uploading, 100.0);

        if !payload.callback_url.is_empty() {
            if let Err(e) = self
                .callback
                .post(&payload.callback_url, &payload.callback_token, &result)
                .await
            {
                warn!(task_id = %payload.task_id, error = %e, "upload callback failed");
                if let Err(cleanup) = self.store.delete(&payload.reference).await {
                    debug!(task_id = %payload.task_id, error = %cleanup, "upload cleanup failed");
                }
                return Err(e.into());
            }
        }
        Ok(result)
    }
}
