use serde::{Deserialize, Serialize};

use crate::protocol::{TaskPayload, TaskResult, TaskStage, TranscodeRequest};

/// Coordinator-side view of one in-flight task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunningRequest {
    pub task_id: String,
    /// Admission key.
    pub reference: String,
    pub url: String,
    pub content_key: String,
    #[serde(default)]
    pub channel: String,
    pub stage: TaskStage,
    pub progress: f32,
    pub ts_created: i64,
    /// When the current assignment started.
    pub ts_started: Option<i64>,
    pub ts_heartbeat: i64,
    pub ts_updated: i64,
    pub callback_token: String,
    pub failed_attempts: u32,
    pub worker_id: Option<String>,
    pub error: Option<String>,
    pub result: Option<TaskResult>,
    /// Set once the worker's upload callback authenticated.
    #[serde(default)]
    pub uploaded: bool,
}

impl RunningRequest {
    pub fn new(task_id: &str, request: &TranscodeRequest, callback_token: &str, now: i64) -> Self {
        Self {
            task_id: task_id.to_string(),
            reference: request.reference.clone(),
            url: request.url.clone(),
            content_key: request.content_key.clone(),
            channel: request.channel.clone(),
            stage: TaskStage::Pending,
            progress: 0.0,
            ts_created: now,
            ts_started: None,
            ts_heartbeat: now,
            ts_updated: now,
            callback_token: callback_token.to_string(),
            failed_attempts: 0,
            worker_id: None,
            error: None,
            result: None,
            uploaded: false,
        }
    }

    /// Payload announcing this task, with the callback rooted at `public_url`.
    /// An empty `public_url` disables the callback.
    pub fn payload(&self, public_url: &str) -> TaskPayload {
        let callback_url = if public_url.is_empty() {
            String::new()
        } else {
            format!("{}/callback/{}", public_url.trim_end_matches('/'), self.reference)
        };
        TaskPayload {
            task_id: self.task_id.clone(),
            reference: self.reference.clone(),
            url: self.url.clone(),
            content_key: self.content_key.clone(),
            callback_url,
            callback_token: self.callback_token.clone(),
        }
    }

    /// A worker holds the task, either reporting stages or just handed the payload.
    pub fn is_held(&self) -> bool {
        self.stage.is_assigned() || (self.stage.is_waiting() && self.worker_id.is_some())
    }

    /// Held, with neither a heartbeat nor an update within `timeout_ms`.
    pub fn is_timed_out(&self, now: i64, timeout_ms: i64) -> bool {
        self.is_held()
            && now - self.ts_heartbeat > timeout_ms
            && now - self.ts_updated >= timeout_ms
    }

    /// Return to the request queue for another attempt.
    pub fn reset_for_retry(&mut self, now: i64, timed_out: bool) {
        self.stage = if timed_out {
            TaskStage::TimedOutRequeued
        } else {
            TaskStage::Pending
        };
        self.progress = 0.0;
        self.worker_id = None;
        self.ts_started = None;
        self.ts_heartbeat = now;
        self.ts_updated = now;
    }
}
