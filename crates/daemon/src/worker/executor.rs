//! Task executor
//!
//! Runs one assigned task through the pipeline, relaying progress and
//! heartbeats to the coordinator and reporting the terminal outcome.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::pipeline::{Pipeline, ProgressReporter};
use crate::protocol::{
    TaskDone, TaskError, TaskPayload, TaskProgress, TaskStage, TASK_DONE_QUEUE, TASK_ERRORS_QUEUE,
    TASK_PROGRESS_QUEUE,
};
use crate::transport::{publish_json, Transport};

/// Buffered progress updates per task before new ones are dropped
const PROGRESS_BUFFER: usize = 16;
/// Attempts at publishing a terminal message
const TERMINAL_ATTEMPTS: u32 = 5;
const TERMINAL_BACKOFF: Duration = Duration::from_millis(200);

/// Handle for one outstanding assignment.
///
/// Progress flows through a bounded channel into a relay that publishes
/// each update and re-sends the latest one on every heartbeat tick.
struct ActiveTask {
    task_id: String,
    reporter: ProgressReporter,
    relay: JoinHandle<()>,
}

impl ActiveTask {
    fn start(
        worker_id: String,
        task_id: String,
        transport: Arc<dyn Transport>,
        heartbeat: Duration,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<(TaskStage, f32)>(PROGRESS_BUFFER);
        let relay_task_id = task_id.clone();

        let relay = tokio::spawn(async move {
            let mut last = (TaskStage::Accepted, 0.0f32);
            let mut ticker = tokio::time::interval(heartbeat);
            ticker.tick().await;

            loop {
                let update = tokio::select! {
                    update = rx.recv() => match update {
                        Some(update) => update,
                        None => break,
                    },
                    _ = ticker.tick() => last,
                };
                last = update;

                let message = TaskProgress {
                    worker_id: worker_id.clone(),
                    task_id: relay_task_id.clone(),
                    stage: update.0,
                    percent: update.1,
                };
                if let Err(e) = publish_json(transport.as_ref(), TASK_PROGRESS_QUEUE, &message, None).await {
                    debug!(task_id = %relay_task_id, error = %e, "progress not delivered");
                }
            }
        });

        Self {
            task_id,
            reporter: ProgressReporter::new(tx),
            relay,
        }
    }

    /// Stop the relay once every queued update is out.
    async fn finish(self) {
        drop(self.reporter);
        if let Err(e) = self.relay.await {
            warn!(task_id = %self.task_id, error = %e, "progress relay panicked");
        }
    }
}

pub struct TaskExecutor {
    worker_id: String,
    transport: Arc<dyn Transport>,
    pipeline: Arc<Pipeline>,
    heartbeat_interval: Duration,
}

impl TaskExecutor {
    pub fn new(
        worker_id: impl Into<String>,
        transport: Arc<dyn Transport>,
        pipeline: Arc<Pipeline>,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            transport,
            pipeline,
            heartbeat_interval,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Run `payload` to completion and report the outcome.
    pub async fn execute(&self, payload: TaskPayload) {
        info!(worker_id = %self.worker_id, task_id = %payload.task_id, reference = %payload.reference, "task accepted");

        let active = ActiveTask::start(
            self.worker_id.clone(),
            payload.task_id.clone(),
            self.transport.clone(),
            self.heartbeat_interval,
        );
        active.reporter.report(TaskStage::Accepted, 0.0);

        let outcome = self.pipeline.run(&payload, &active.reporter).await;
        active.finish().await;

        match outcome {
            Ok(result) => {
                info!(task_id = %payload.task_id, url = %result.url, "task done");
                let done = TaskDone {
                    worker_id: self.worker_id.clone(),
                    task_id: payload.task_id,
                    result,
                };
                self.publish_terminal(TASK_DONE_QUEUE, &done.task_id, &done).await;
            }
            Err(e) => {
                let fatal = e.is_fatal();
                warn!(task_id = %payload.task_id, fatal, error = %e, "task failed");
                self.report_error(&payload.task_id, e.to_string(), fatal).await;
            }
        }
    }

    /// Publish a task error outside of a pipeline run.
    pub async fn report_error(&self, task_id: &str, error: String, fatal: bool) {
        let message = TaskError {
            worker_id: self.worker_id.clone(),
            task_id: task_id.to_string(),
            error,
            fatal,
        };
        self.publish_terminal(TASK_ERRORS_QUEUE, task_id, &message).await;
    }

    async fn publish_terminal<T: serde::Serialize + Sync>(&self, queue: &str, task_id: &str, message: &T) {
        for attempt in 1..=TERMINAL_ATTEMPTS {
            match publish_json(self.transport.as_ref(), queue, message, None).await {
                Ok(()) => return,
                Err(e) => {
                    warn!(task_id, queue, attempt, error = %e, "terminal publish failed");
                    if attempt < TERMINAL_ATTEMPTS {
                        tokio::time::sleep(TERMINAL_BACKOFF * attempt).await;
                    }
                }
            }
        }
        error!(task_id, queue, "giving up on terminal message");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryBroker;

    #[tokio::test]
    async fn test_relay_repeats_last_stage_on_heartbeat() {
        let broker = MemoryBroker::new();
        let transport: Arc<dyn Transport> = Arc::new(broker.clone());
        let mut progress = transport.consume(TASK_PROGRESS_QUEUE).await.unwrap();

        let active = ActiveTask::start("w1".into(), "t1".into(), transport, Duration::from_millis(50));
        active.reporter.report(TaskStage::Encoding, 40.0);

        let first: TaskProgress = progress.recv().await.unwrap().decode().unwrap();
        assert_eq!(first.stage, TaskStage::Encoding);

        let beat = tokio::time::timeout(Duration::from_secs(2), progress.recv())
            .await
            .unwrap()
            .unwrap();
        let beat: TaskProgress = beat.decode().unwrap();
        assert_eq!(beat.stage, TaskStage::Encoding);
        assert_eq!(beat.percent, 40.0);

        active.finish().await;
    }
}
