//! Transcoding worker
//!
//! A worker owns a fixed number of slots. Each free slot publishes a work
//! request whose reply lands on the worker's private queue; every payload
//! received there is paired with a slot before it runs, so no more than
//! `capacity` tasks are ever open at once.

pub mod executor;
pub mod fetch;
pub mod pipeline;
pub mod storage;

pub use executor::TaskExecutor;
pub use fetch::HttpFetcher;
pub use pipeline::{
    FetchError, Fetcher, ObjectStore, Pipeline, PipelineError, ProgressReporter, StoreError,
};
pub use storage::{CallbackClient, FsObjectStore};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::concurrency::SlotPlan;
use crate::config::Config;
use crate::encode::Av1anEncoder;
use crate::protocol::{
    now_ms, worker_queue, TaskPayload, WorkRequest, WorkerStatus, WORKER_STATUS_QUEUE,
    WORK_REQUEST_QUEUE,
};
use crate::transport::{publish_json, Delivery, Transport, TransportError};

const REQUEST_BACKOFF_MIN: Duration = Duration::from_millis(100);
const REQUEST_BACKOFF_MAX: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub id: String,
    pub capacity: u32,
    pub status_interval: Duration,
    pub heartbeat_interval: Duration,
}

impl WorkerSettings {
    /// Settings for a worker with a fresh random id.
    pub fn from_config(cfg: &Config, plan: &SlotPlan) -> Self {
        Self {
            id: format!("worker-{}", uuid::Uuid::new_v4().simple()),
            capacity: plan.worker_slots.max(1),
            status_interval: Duration::from_secs(cfg.worker.status_interval_secs.max(1)),
            heartbeat_interval: Duration::from_secs(cfg.worker.heartbeat_interval_secs.max(1)),
        }
    }
}

/// Pipeline wired to the HTTP fetcher, Av1an and the filesystem store.
pub fn standard_pipeline(cfg: &Config, plan: &SlotPlan) -> Pipeline {
    let client = reqwest::Client::new();
    Pipeline::new(
        Arc::new(HttpFetcher::new(client.clone())),
        Arc::new(Av1anEncoder::new(
            cfg.encoder.binary.clone(),
            plan.encoder_workers,
            cfg.worker.work_dir.join("chunks"),
        )),
        Arc::new(FsObjectStore::new(cfg.worker.storage_dir.clone())),
        CallbackClient::new(client),
        cfg.worker.work_dir.join("tasks"),
    )
}

pub struct Worker {
    executor: Arc<TaskExecutor>,
    transport: Arc<dyn Transport>,
    capacity: u32,
    status_interval: Duration,
    slots: Arc<Semaphore>,
    running: Arc<AtomicUsize>,
    stop: CancellationToken,
}

impl Worker {
    pub fn new(
        settings: WorkerSettings,
        transport: Arc<dyn Transport>,
        pipeline: Arc<Pipeline>,
        stop: CancellationToken,
    ) -> Self {
        let capacity = settings.capacity.max(1);
        let executor = TaskExecutor::new(
            settings.id,
            transport.clone(),
            pipeline,
            settings.heartbeat_interval,
        );
        Self {
            executor: Arc::new(executor),
            transport,
            capacity,
            status_interval: settings.status_interval,
            slots: Arc::new(Semaphore::new(capacity as usize)),
            running: Arc::new(AtomicUsize::new(0)),
            stop,
        }
    }

    pub fn id(&self) -> &str {
        self.executor.worker_id()
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Tasks currently executing.
    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> WorkerStatus {
        let running = u32::try_from(self.running()).unwrap_or(u32::MAX);
        WorkerStatus {
            worker_id: self.id().to_string(),
            capacity: self.capacity,
            available: self.capacity.saturating_sub(running),
            timestamp: now_ms(),
        }
    }

    /// Serve until the stop token fires, then wait for open tasks to finish.
    pub async fn run(self: Arc<Self>) -> Result<(), WorkerError> {
        let inbox_queue = worker_queue(self.id());
        let mut inbox = self.transport.consume(&inbox_queue).await?;
        let local = self.stop.child_token();

        let (permit_tx, mut permit_rx) = mpsc::channel(self.capacity as usize);
        let puller = tokio::spawn(self.clone().pull_loop(inbox_queue, permit_tx, local.clone()));
        let status = tokio::spawn(self.clone().status_loop(local.clone()));
        info!(worker_id = %self.id(), capacity = self.capacity, "worker started");

        loop {
            let delivery = tokio::select! {
                _ = local.cancelled() => break,
                delivery = inbox.recv() => delivery,
            };
            let Some(delivery) = delivery else { break };

            let permit = tokio::select! {
                biased;
                _ = local.cancelled() => None,
                permit = permit_rx.recv() => permit,
            };
            let Some(permit) = permit else {
                self.abandon(&delivery).await;
                break;
            };

            match delivery.decode::<TaskPayload>() {
                Ok(payload) => self.spawn_task(payload, permit),
                Err(e) => self.reject(&delivery, e).await,
            }
        }

        local.cancel();
        drop(permit_rx);
        let _ = puller.await;
        let _ = status.await;

        // Every slot back means every open task has reported
        let _ = self.slots.acquire_many(self.capacity).await;
        info!(worker_id = %self.id(), "worker stopped");
        Ok(())
    }

    fn spawn_task(&self, payload: TaskPayload, permit: OwnedSemaphorePermit) {
        let executor = self.executor.clone();
        let running = self.running.clone();
        running.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            executor.execute(payload).await;
            running.fetch_sub(1, Ordering::SeqCst);
            drop(permit);
        });
    }

    /// A payload that arrived while stopping never runs.
    async fn abandon(&self, delivery: &Delivery) {
        match task_id_of(delivery) {
            Some(task_id) => {
                info!(worker_id = %self.id(), task_id = %task_id, "abandoning task on shutdown");
                self.executor
                    .report_error(&task_id, "worker shutting down".to_string(), true)
                    .await;
            }
            None => warn!(worker_id = %self.id(), "dropping unreadable payload on shutdown"),
        }
    }

    async fn reject(&self, delivery: &Delivery, error: TransportError) {
        match task_id_of(delivery) {
            Some(task_id) => {
                warn!(worker_id = %self.id(), task_id = %task_id, error = %error, "malformed payload");
                self.executor
                    .report_error(&task_id, format!("malformed payload: {}", error), true)
                    .await;
            }
            None => warn!(worker_id = %self.id(), error = %error, "dropping unreadable payload"),
        }
    }

    async fn pull_loop(
        self: Arc<Self>,
        reply_to: String,
        permits: mpsc::Sender<OwnedSemaphorePermit>,
        stop: CancellationToken,
    ) {
        let request = WorkRequest {
            worker_id: self.id().to_string(),
        };

        loop {
            let permit = tokio::select! {
                _ = stop.cancelled() => return,
                permit = self.slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
            };

            let mut backoff = REQUEST_BACKOFF_MIN;
            while let Err(e) =
                publish_json(self.transport.as_ref(), WORK_REQUEST_QUEUE, &request, Some(&reply_to)).await
            {
                warn!(worker_id = %request.worker_id, error = %e, "work request failed");
                tokio::select! {
                    _ = stop.cancelled() => return,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(REQUEST_BACKOFF_MAX);
            }
            debug!(worker_id = %request.worker_id, "requested work");

            if permits.send(permit).await.is_err() {
                return;
            }
        }
    }

    async fn status_loop(self: Arc<Self>, stop: CancellationToken) {
        let mut ticker = tokio::time::interval(self.status_interval);
        loop {
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let status = self.status();
            if let Err(e) = publish_json(self.transport.as_ref(), WORKER_STATUS_QUEUE, &status, None).await {
                debug!(worker_id = %status.worker_id, error = %e, "status not delivered");
            }
        }
    }
}

fn task_id_of(delivery: &Delivery) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(delivery.body()).ok()?;
    value.get("task_id")?.as_str().map(str::to_string)
}
