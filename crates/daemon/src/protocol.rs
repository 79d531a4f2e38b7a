//! Message types exchanged between the coordinator and workers.
//!
//! All bodies travel as JSON over the [`Transport`](crate::transport::Transport).

use serde::{Deserialize, Serialize};

/// New task announcements, consumed by the coordinator's dispatch loop.
pub const REQUEST_QUEUE: &str = "transcoder.requests";
/// Pull signals from workers, one per free slot.
pub const WORK_REQUEST_QUEUE: &str = "transcoder.work_requests";
/// Periodic worker capacity reports.
pub const WORKER_STATUS_QUEUE: &str = "transcoder.worker_status";
/// Stage and percentage updates; lossy by design.
pub const TASK_PROGRESS_QUEUE: &str = "transcoder.task_progress";
/// Failure reports.
pub const TASK_ERRORS_QUEUE: &str = "transcoder.task_errors";
/// Success reports.
pub const TASK_DONE_QUEUE: &str = "transcoder.task_done";

/// Private reply queue of a worker.
pub fn worker_queue(worker_id: &str) -> String {
    format!("transcoder.worker.{}", worker_id)
}

/// A request to transcode one stream, as admitted by the front door.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscodeRequest {
    /// Stable task key; also the admission key.
    pub reference: String,
    /// Source location handed to the fetcher.
    pub url: String,
    /// Content hash of the source stream.
    pub content_key: String,
    /// Publishing channel, used for priority routing.
    #[serde(default)]
    pub channel: String,
    /// Support amount backing the stream.
    #[serde(default)]
    pub support_amount: f64,
}

/// Task state machine shared by the coordinator and workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStage {
    /// Published, waiting for a worker.
    Pending,
    /// A worker took the task.
    Accepted,
    Downloading,
    Encoding,
    Uploading,
    /// Worker reported success; catalog not yet updated.
    Done,
    /// Result recorded in the catalog.
    Completed,
    /// Non-fatal failure awaiting requeue.
    Failed,
    /// Requeued after the holding worker went silent; waiting for a worker.
    TimedOutRequeued,
    /// Given up on.
    FailedFatally,
}

impl Default for TaskStage {
    fn default() -> Self {
        Self::Pending
    }
}

impl TaskStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStage::Pending => "pending",
            TaskStage::Accepted => "accepted",
            TaskStage::Downloading => "downloading",
            TaskStage::Encoding => "encoding",
            TaskStage::Uploading => "uploading",
            TaskStage::Done => "done",
            TaskStage::Completed => "completed",
            TaskStage::Failed => "failed",
            TaskStage::TimedOutRequeued => "timed_out_requeued",
            TaskStage::FailedFatally => "failed_fatally",
        }
    }

    /// Completed and FailedFatally are final.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStage::Completed | TaskStage::FailedFatally)
    }

    /// Published and waiting for a worker to ask for it.
    pub fn is_waiting(&self) -> bool {
        matches!(self, TaskStage::Pending | TaskStage::TimedOutRequeued)
    }

    /// Stages during which a worker holds the task and must heartbeat.
    pub fn is_assigned(&self) -> bool {
        matches!(
            self,
            TaskStage::Accepted | TaskStage::Downloading | TaskStage::Encoding | TaskStage::Uploading
        )
    }
}

impl std::fmt::Display for TaskStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task announcement and the body a worker receives in reply to a work request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPayload {
    pub task_id: String,
    pub reference: String,
    pub url: String,
    pub content_key: String,
    /// Where the worker posts the packaged result; empty disables the callback.
    #[serde(default)]
    pub callback_url: String,
    /// Bearer token for the callback.
    #[serde(default)]
    pub callback_token: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkRequest {
    pub worker_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub worker_id: String,
    pub capacity: u32,
    pub available: u32,
    /// Unix milliseconds at which the worker produced the report.
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskProgress {
    pub worker_id: String,
    pub task_id: String,
    pub stage: TaskStage,
    pub percent: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    pub worker_id: String,
    pub task_id: String,
    pub error: String,
    /// Decided by the worker; the coordinator never reclassifies.
    pub fatal: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDone {
    pub worker_id: String,
    pub task_id: String,
    pub result: TaskResult,
}

/// Remote-storage descriptor of a finished stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    #[serde(rename = "URL", alias = "url")]
    pub url: String,
    #[serde(default)]
    pub size_bytes: u64,
}

/// Current time in Unix milliseconds.
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
