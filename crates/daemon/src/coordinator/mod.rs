//! Coordinator: turns admitted requests into tasks and tracks them to the end.
//!
//! The coordinator owns the admission pool output. For every admitted request
//! it creates a [`RunningRequest`] and a ledger row, then publishes the task
//! payload on the request queue. Workers pull payloads through work requests;
//! their progress, error and done messages drive the task state machine. A
//! periodic sweep requeues failed or silent tasks and gives up on tasks that
//! used all their attempts.

mod registry;
mod running;
mod snapshot;

pub use registry::{WorkerRegistry, WorkerSummary};
pub use running::RunningRequest;
pub use snapshot::{load_snapshot, save_snapshot, RunningSnapshot, SnapshotError};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::admission::{AdmissionPool, AdmitOutcome, Admitted};
use crate::catalog::CatalogError;
use crate::context::Context;
use crate::ledger::{LedgerError, TaskRecord};
use crate::metrics::{record, SharedMetrics};
use crate::protocol::{
    now_ms, TaskDone, TaskError, TaskPayload, TaskProgress, TaskResult, TaskStage,
    TranscodeRequest, WorkRequest, WorkerStatus, REQUEST_QUEUE, TASK_DONE_QUEUE,
    TASK_ERRORS_QUEUE, TASK_PROGRESS_QUEUE, WORKER_STATUS_QUEUE, WORK_REQUEST_QUEUE,
};
use crate::transport::{publish_json, Delivery, TransportError};

/// Liveness timeout as a multiple of the heartbeat interval.
pub const HEARTBEAT_TIMEOUT_FACTOR: i64 = 5;

const SNAPSHOT_FILE: &str = "running.json";
const PICK_BACKOFF_MIN: Duration = Duration::from_millis(100);
const PICK_BACKOFF_MAX: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("request {0} is already in flight")]
    Duplicate(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),
}

/// Answer to an admission request from the front door.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AdmitResponse {
    /// Already transcoded.
    Available { url: String },
    Queued,
    Underway,
    Forbidden,
}

/// Result of checking an upload callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackAuth {
    Accepted,
    Unauthorized,
    Unknown,
}

#[derive(Debug, Default)]
struct RunningState {
    /// Keyed by reference.
    requests: HashMap<String, RunningRequest>,
    /// Task id to reference.
    tasks: HashMap<String, String>,
}

impl RunningState {
    fn by_task(&mut self, task_id: &str) -> Option<&mut RunningRequest> {
        let reference = self.tasks.get(task_id)?;
        self.requests.get_mut(reference)
    }

    fn insert(&mut self, request: RunningRequest) {
        self.tasks
            .insert(request.task_id.clone(), request.reference.clone());
        self.requests.insert(request.reference.clone(), request);
    }
}

/// What a non-fatal failure leads to.
enum Verdict {
    Retry,
    GiveUp,
}

pub struct Coordinator {
    ctx: Context,
    pool: Arc<AdmissionPool<TranscodeRequest>>,
    state: Mutex<RunningState>,
    registry: WorkerRegistry,
    snapshot_path: PathBuf,
}

impl Coordinator {
    pub fn new(ctx: Context, pool: Arc<AdmissionPool<TranscodeRequest>>) -> Self {
        let snapshot_path = ctx.config.coordinator.state_dir.join(SNAPSHOT_FILE);
        Self {
            ctx,
            pool,
            state: Mutex::new(RunningState::default()),
            registry: WorkerRegistry::new(),
            snapshot_path,
        }
    }

    pub fn pool(&self) -> &Arc<AdmissionPool<TranscodeRequest>> {
        &self.pool
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    pub fn metrics(&self) -> &SharedMetrics {
        &self.ctx.metrics
    }

    fn heartbeat_timeout_ms(&self) -> i64 {
        self.ctx.config.coordinator.heartbeat_interval_secs as i64 * 1000 * HEARTBEAT_TIMEOUT_FACTOR
    }

    fn max_failed_attempts(&self) -> u32 {
        self.ctx.config.coordinator.max_failed_attempts
    }

    /// Current running requests, oldest first.
    pub fn running(&self) -> Vec<RunningRequest> {
        let mut requests: Vec<_> = self.state.lock().requests.values().cloned().collect();
        requests.sort_by_key(|r| r.ts_created);
        requests
    }

    pub fn get(&self, reference: &str) -> Option<RunningRequest> {
        self.state.lock().requests.get(reference).cloned()
    }

    /// Front-door admission: catalog hits short-circuit, everything else goes
    /// through the pool.
    pub async fn admit(&self, request: TranscodeRequest) -> Result<AdmitResponse, CoordinatorError> {
        if let Some(entry) = self.ctx.catalog.lookup(&request.reference).await? {
            return Ok(AdmitResponse::Available {
                url: entry.result.url,
            });
        }

        let reference = request.reference.clone();
        let outcome = self.pool.admit(&reference, request);
        match outcome {
            AdmitOutcome::Queued => record(&self.ctx.metrics, |m| m.admitted += 1).await,
            AdmitOutcome::Forbidden => record(&self.ctx.metrics, |m| m.forbidden += 1).await,
            AdmitOutcome::Underway => {}
        }
        Ok(match outcome {
            AdmitOutcome::Queued => AdmitResponse::Queued,
            AdmitOutcome::Underway => AdmitResponse::Underway,
            AdmitOutcome::Forbidden => AdmitResponse::Forbidden,
        })
    }

    /// Start tracking `request` and announce it to workers.
    ///
    /// Fails with [`CoordinatorError::Duplicate`] if the reference is already
    /// tracked. Ledger and publish failures are logged; the in-memory entry
    /// stays and the sweep picks it up again.
    pub async fn initiate_request(&self, request: TranscodeRequest) -> Result<String, CoordinatorError> {
        let now = now_ms();
        let task_id = Uuid::new_v4().to_string();
        let token = Uuid::new_v4().simple().to_string();

        let payload = {
            let mut state = self.state.lock();
            if state.requests.contains_key(&request.reference) {
                return Err(CoordinatorError::Duplicate(request.reference));
            }
            let running = RunningRequest::new(&task_id, &request, &token, now);
            let payload = running.payload(&self.ctx.config.coordinator.public_url);
            state.insert(running);
            payload
        };

        let row = TaskRecord::new(&task_id, &request.reference, &request.url, &request.content_key);
        if let Err(e) = self.ctx.ledger.create(row) {
            error!(task_id = %task_id, error = %e, "failed to create ledger record");
        }

        info!(task_id = %task_id, reference = %request.reference, "task initiated");
        self.announce(payload).await;
        self.refresh_running_metric().await;
        Ok(task_id)
    }

    /// Publish a payload on the request queue; on failure mark the task
    /// failed without charging an attempt.
    async fn announce(&self, payload: TaskPayload) {
        if let Err(e) = publish_json(self.ctx.transport.as_ref(), REQUEST_QUEUE, &payload, None).await {
            warn!(task_id = %payload.task_id, error = %e, "failed to publish task");
            let mut state = self.state.lock();
            if let Some(running) = state.by_task(&payload.task_id) {
                if running.stage.is_waiting() && running.worker_id.is_none() {
                    running.stage = TaskStage::Failed;
                    running.error = Some(e.to_string());
                }
            }
        }
    }

    /// Hand a pending task to `worker_id`. Returns `None` if the task is no
    /// longer waiting for a worker.
    pub fn assign(&self, task_id: &str, worker_id: &str) -> Option<TaskPayload> {
        let now = now_ms();
        let mut state = self.state.lock();
        let running = state.by_task(task_id)?;
        if !running.stage.is_waiting() || running.worker_id.is_some() {
            return None;
        }
        running.stage = TaskStage::Pending;
        running.worker_id = Some(worker_id.to_string());
        running.ts_started = Some(now);
        running.ts_heartbeat = now;
        running.ts_updated = now;
        Some(running.payload(&self.ctx.config.coordinator.public_url))
    }

    pub async fn handle_status(&self, status: WorkerStatus) {
        if self.registry.update(&status, now_ms()) {
            self.refresh_worker_metrics().await;
        }
    }

    pub async fn handle_progress(&self, progress: TaskProgress) {
        let now = now_ms();
        let (first, persist, stage, percent) = {
            let mut state = self.state.lock();
            let Some(running) = state.by_task(&progress.task_id) else {
                debug!(task_id = %progress.task_id, "progress for unknown task");
                return;
            };
            // Reports count only from the current holder
            if !running.is_held() || running.worker_id.as_deref() != Some(progress.worker_id.as_str()) {
                debug!(task_id = %progress.task_id, worker_id = %progress.worker_id, "progress from stale worker");
                return;
            }

            let first = running.stage == TaskStage::Pending;
            let stage = if progress.stage.is_assigned() {
                progress.stage
            } else {
                TaskStage::Accepted
            };
            let percent = progress.percent.clamp(0.0, 100.0);
            let stage_changed = stage != running.stage;
            let crossed_step = (percent / 10.0).floor() != (running.progress / 10.0).floor();

            running.ts_heartbeat = now;
            if first {
                running.ts_started.get_or_insert(now);
            }
            if stage_changed || percent != running.progress {
                running.ts_updated = now;
            }
            running.stage = stage;
            running.progress = percent;
            (first, stage_changed || crossed_step, stage, percent)
        };

        if first {
            if let Err(e) = self.ctx.ledger.mark_processing(&progress.task_id, &progress.worker_id) {
                warn!(task_id = %progress.task_id, error = %e, "ledger update failed");
            }
        }
        if persist {
            if let Err(e) = self.ctx.ledger.update_stage(&progress.task_id, stage, percent) {
                warn!(task_id = %progress.task_id, error = %e, "ledger update failed");
            }
        }
    }

    pub async fn handle_error(&self, report: TaskError) {
        let now = now_ms();
        let max_attempts = self.max_failed_attempts();
        let (reference, verdict) = {
            let mut state = self.state.lock();
            let Some(running) = state.by_task(&report.task_id) else {
                debug!(task_id = %report.task_id, "error for unknown task");
                return;
            };
            if running.stage.is_terminal()
                || matches!(running.stage, TaskStage::Done | TaskStage::Failed)
            {
                return;
            }
            if running.worker_id.as_deref() != Some(report.worker_id.as_str()) {
                debug!(task_id = %report.task_id, worker_id = %report.worker_id, "error from stale worker");
                return;
            }

            running.error = Some(report.error.clone());
            running.ts_updated = now;
            let verdict = if report.fatal {
                Verdict::GiveUp
            } else {
                running.failed_attempts += 1;
                if running.failed_attempts >= max_attempts {
                    Verdict::GiveUp
                } else {
                    Verdict::Retry
                }
            };
            running.stage = match verdict {
                Verdict::GiveUp => TaskStage::FailedFatally,
                Verdict::Retry => TaskStage::Failed,
            };
            (running.reference.clone(), verdict)
        };

        match verdict {
            Verdict::Retry => {
                warn!(task_id = %report.task_id, error = %report.error, "task failed, will retry");
            }
            Verdict::GiveUp => {
                self.give_up(&report.task_id, &reference, &report.error).await;
            }
        }
    }

    /// Success reports are accepted from any worker unless the task already finished.
    pub async fn handle_done(&self, done: TaskDone) {
        let reference = {
            let mut state = self.state.lock();
            let Some(running) = state.by_task(&done.task_id) else {
                debug!(task_id = %done.task_id, "done for unknown task");
                return;
            };
            if running.stage.is_terminal() || running.stage == TaskStage::Done {
                return;
            }
            running.stage = TaskStage::Done;
            running.progress = 100.0;
            running.result = Some(done.result.clone());
            running.worker_id = Some(done.worker_id.clone());
            running.error = None;
            running.ts_updated = now_ms();
            running.reference.clone()
        };
        info!(task_id = %done.task_id, reference = %reference, url = %done.result.url, "task done");
        self.finalize(&reference).await;
    }

    /// Record a done task in the catalog and close it out. On catalog failure
    /// the task stays done and the next sweep tries again.
    async fn finalize(&self, reference: &str) {
        let Some((task_id, url, result)) = self.done_result(reference) else {
            return;
        };

        if let Err(e) = self.ctx.catalog.add_stream(reference, &url, &result).await {
            warn!(task_id = %task_id, error = %e, "catalog update failed");
            return;
        }

        {
            let mut state = self.state.lock();
            if let Some(running) = state.requests.get_mut(reference) {
                running.stage = TaskStage::Completed;
                running.ts_updated = now_ms();
            }
        }
        if let Err(e) = self.ctx.ledger.mark_done(&task_id, &result) {
            warn!(task_id = %task_id, error = %e, "ledger update failed");
        }
        self.pool.fold(reference);
        record(&self.ctx.metrics, |m| m.completed += 1).await;
        info!(task_id = %task_id, reference, "task completed");
    }

    fn done_result(&self, reference: &str) -> Option<(String, String, TaskResult)> {
        let state = self.state.lock();
        let running = state.requests.get(reference)?;
        if running.stage != TaskStage::Done {
            return None;
        }
        let result = running.result.clone()?;
        Some((running.task_id.clone(), running.url.clone(), result))
    }

    async fn give_up(&self, task_id: &str, reference: &str, reason: &str) {
        error!(task_id, reference, error = reason, "task failed permanently");
        if let Err(e) = self.ctx.ledger.mark_failed(task_id, reason) {
            warn!(task_id, error = %e, "ledger update failed");
        }
        self.pool.fold(reference);
        record(&self.ctx.metrics, |m| m.failed += 1).await;
    }

    /// Check an upload callback against the token minted for `reference`.
    pub fn authenticate_callback(
        &self,
        reference: &str,
        token: &str,
        result: Option<TaskResult>,
    ) -> CallbackAuth {
        let mut state = self.state.lock();
        let Some(running) = state.requests.get_mut(reference) else {
            return CallbackAuth::Unknown;
        };
        if running.callback_token.is_empty() || running.callback_token != token {
            return CallbackAuth::Unauthorized;
        }
        running.uploaded = true;
        if running.result.is_none() {
            running.result = result;
        }
        running.ts_heartbeat = now_ms();
        CallbackAuth::Accepted
    }

    /// One pass over the running requests.
    ///
    /// Entries already terminal are dropped, done entries are finalized again,
    /// failed and timed-out entries are requeued or given up on.
    pub async fn sweep(&self, now: i64) {
        let timeout = self.heartbeat_timeout_ms();
        let max_attempts = self.max_failed_attempts();
        let public_url = self.ctx.config.coordinator.public_url.clone();

        let mut requeue = Vec::new();
        let mut abandon = Vec::new();
        let mut finalize = Vec::new();
        {
            let mut state = self.state.lock();
            let state = &mut *state;
            state.requests.retain(|_, r| !r.stage.is_terminal());
            let requests = &state.requests;
            state.tasks.retain(|_, reference| requests.contains_key(reference));

            for running in state.requests.values_mut() {
                let timed_out = running.is_timed_out(now, timeout);
                if timed_out {
                    running.failed_attempts += 1;
                    running.error = Some(format!(
                        "timed out: no heartbeat for {}s",
                        (now - running.ts_heartbeat) / 1000
                    ));
                    warn!(task_id = %running.task_id, worker_id = ?running.worker_id, "task timed out");
                }

                if running.stage == TaskStage::Done {
                    finalize.push(running.reference.clone());
                    continue;
                }
                if running.stage != TaskStage::Failed && !timed_out {
                    continue;
                }

                let reason = running.error.clone().unwrap_or_else(|| "failed".to_string());
                if running.failed_attempts >= max_attempts {
                    running.stage = TaskStage::FailedFatally;
                    running.ts_updated = now;
                    abandon.push((running.task_id.clone(), running.reference.clone(), reason));
                } else {
                    running.reset_for_retry(now, timed_out);
                    requeue.push((running.payload(&public_url), reason, running.stage));
                }
            }
        }

        for (payload, reason, stage) in requeue {
            if let Err(e) = self.ctx.ledger.mark_retrying(&payload.task_id, &reason, stage) {
                warn!(task_id = %payload.task_id, error = %e, "ledger update failed");
            }
            info!(task_id = %payload.task_id, reason = %reason, "requeueing task");
            record(&self.ctx.metrics, |m| m.requeued += 1).await;
            self.announce(payload).await;
        }
        for (task_id, reference, reason) in abandon {
            self.give_up(&task_id, &reference, &reason).await;
        }
        for reference in finalize {
            self.finalize(&reference).await;
        }
        self.refresh_running_metric().await;
    }

    /// Persist all non-terminal running requests.
    pub fn save_snapshot(&self) -> Result<usize, CoordinatorError> {
        let requests: Vec<_> = self
            .running()
            .into_iter()
            .filter(|r| !r.stage.is_terminal())
            .collect();
        let count = requests.len();
        save_snapshot(&self.snapshot_path, requests)?;
        Ok(count)
    }

    /// Load the snapshot written by a previous run.
    ///
    /// Restored pending tasks that no worker holds are announced again.
    pub async fn restore(&self) -> Result<usize, CoordinatorError> {
        let restored = load_snapshot(&self.snapshot_path)?;
        let public_url = self.ctx.config.coordinator.public_url.clone();
        let mut count = 0;
        let mut announce = Vec::new();
        {
            let mut state = self.state.lock();
            for running in restored {
                if running.stage.is_terminal() || state.requests.contains_key(&running.reference) {
                    continue;
                }
                if running.stage.is_waiting() && running.worker_id.is_none() {
                    announce.push(running.payload(&public_url));
                }
                state.insert(running);
                count += 1;
            }
        }
        for payload in announce {
            self.announce(payload).await;
        }
        if count > 0 {
            info!(count, "restored running requests");
        }
        self.refresh_running_metric().await;
        Ok(count)
    }

    async fn refresh_running_metric(&self) {
        let running = self.state.lock().requests.len();
        record(&self.ctx.metrics, |m| m.running = running).await;
    }

    async fn refresh_worker_metrics(&self) {
        let capacity = self.registry.capacity();
        let available = self.registry.available();
        let workers = self.registry.len();
        record(&self.ctx.metrics, |m| {
            m.capacity = capacity;
            m.available = available;
            m.workers = workers;
        })
        .await;
    }

    /// Wait for worker capacity, then initiate the next admitted request.
    async fn pick_loop(self: Arc<Self>, mut admitted: mpsc::Receiver<Admitted<TranscodeRequest>>) {
        let stop = self.ctx.stop.clone();
        loop {
            let mut backoff = PICK_BACKOFF_MIN;
            while !self.registry.try_reserve() {
                tokio::select! {
                    _ = stop.cancelled() => return,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(PICK_BACKOFF_MAX);
            }

            let next = tokio::select! {
                _ = stop.cancelled() => return,
                next = admitted.recv() => next,
            };
            let Some(admitted) = next else { return };
            let key = admitted.item.key.clone();

            match self.initiate_request(admitted.item.value).await {
                Ok(task_id) => {
                    debug!(task_id = %task_id, reference = %key, level = %admitted.level, "picked request");
                }
                Err(CoordinatorError::Duplicate(_)) => {
                    debug!(reference = %key, "request already in flight");
                    self.pool.fold(&key);
                }
                Err(e) => {
                    warn!(reference = %key, error = %e, "failed to initiate request");
                    self.pool.release(&key);
                }
            }
        }
    }

    /// Pair each work request with the next live payload on the request queue.
    async fn dispatch_loop(self: Arc<Self>) -> Result<(), CoordinatorError> {
        let stop = self.ctx.stop.clone();
        let mut work_requests = self.ctx.transport.consume(WORK_REQUEST_QUEUE).await?;
        let mut payloads = self.ctx.transport.consume(REQUEST_QUEUE).await?;

        loop {
            let delivery = tokio::select! {
                _ = stop.cancelled() => return Ok(()),
                delivery = work_requests.recv() => delivery,
            };
            let Some(delivery) = delivery else { return Ok(()) };

            let request: WorkRequest = match delivery.decode() {
                Ok(request) => request,
                Err(e) => {
                    warn!(error = %e, "dropping malformed work request");
                    continue;
                }
            };
            let Some(reply_to) = delivery.reply_to().map(str::to_string) else {
                warn!(worker_id = %request.worker_id, "work request without reply queue");
                continue;
            };

            loop {
                let next = tokio::select! {
                    _ = stop.cancelled() => return Ok(()),
                    next = payloads.recv() => next,
                };
                let Some(next) = next else { return Ok(()) };
                let payload: TaskPayload = match next.decode() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(error = %e, "dropping malformed task payload");
                        continue;
                    }
                };

                let Some(fresh) = self.assign(&payload.task_id, &request.worker_id) else {
                    debug!(task_id = %payload.task_id, "skipping stale payload");
                    continue;
                };
                match publish_json(self.ctx.transport.as_ref(), &reply_to, &fresh, None).await {
                    Ok(()) => {
                        info!(task_id = %fresh.task_id, worker_id = %request.worker_id, "task dispatched");
                        record(&self.ctx.metrics, |m| m.dispatched += 1).await;
                    }
                    Err(e) => {
                        warn!(task_id = %fresh.task_id, error = %e, "failed to reply to worker");
                        self.unassign(&fresh.task_id, &e.to_string());
                    }
                }
                break;
            }
        }
    }

    fn unassign(&self, task_id: &str, reason: &str) {
        let mut state = self.state.lock();
        if let Some(running) = state.by_task(task_id) {
            if running.stage.is_waiting() {
                running.stage = TaskStage::Failed;
                running.error = Some(reason.to_string());
            }
        }
    }

    async fn handle_delivery(&self, delivery: &Delivery) -> Result<(), TransportError> {
        match delivery.queue.as_str() {
            WORKER_STATUS_QUEUE => self.handle_status(delivery.decode()?).await,
            TASK_PROGRESS_QUEUE => self.handle_progress(delivery.decode()?).await,
            TASK_ERRORS_QUEUE => self.handle_error(delivery.decode()?).await,
            TASK_DONE_QUEUE => self.handle_done(delivery.decode()?).await,
            other => warn!(queue = other, "message on unexpected queue"),
        }
        Ok(())
    }

    async fn inbound_loop(self: Arc<Self>, queue: &'static str) -> Result<(), CoordinatorError> {
        let stop = self.ctx.stop.clone();
        let mut subscription = self.ctx.transport.consume(queue).await?;
        loop {
            let delivery = tokio::select! {
                _ = stop.cancelled() => return Ok(()),
                delivery = subscription.recv() => delivery,
            };
            let Some(delivery) = delivery else { return Ok(()) };
            if let Err(e) = self.handle_delivery(&delivery).await {
                warn!(queue, error = %e, "failed to handle message");
            }
        }
    }

    async fn watcher_loop(self: Arc<Self>) {
        let stale_ms = self.ctx.config.coordinator.worker_stale_secs as i64 * 1000;
        let mut ticker = tokio::time::interval(Duration::from_secs(
            self.ctx.config.coordinator.sweep_interval_secs.max(1),
        ));
        loop {
            tokio::select! {
                _ = self.ctx.stop.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let evicted = self.registry.tick(now_ms(), stale_ms);
            if !evicted.is_empty() {
                debug!(count = evicted.len(), "workers evicted");
            }
            self.refresh_worker_metrics().await;
        }
    }

    async fn sweep_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(
            self.ctx.config.coordinator.sweep_interval_secs.max(1),
        ));
        loop {
            tokio::select! {
                _ = self.ctx.stop.cancelled() => return,
                _ = ticker.tick() => {}
            }
            self.sweep(now_ms()).await;
        }
    }

    async fn snapshot_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(
            self.ctx.config.coordinator.snapshot_interval_secs.max(1),
        ));
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = self.ctx.stop.cancelled() => return,
                _ = ticker.tick() => {}
            }
            match self.save_snapshot() {
                Ok(count) => debug!(count, "snapshot saved"),
                Err(e) => warn!(error = %e, "snapshot failed"),
            }
        }
    }

    /// Run every coordinator loop until the stop signal fires, then dump a
    /// final snapshot.
    pub async fn run(self: Arc<Self>) -> Result<(), CoordinatorError> {
        self.restore().await?;

        let (admitted_tx, admitted_rx) = mpsc::channel(1);
        let mut handles: Vec<JoinHandle<()>> = vec![
            tokio::spawn(self.pool.clone().start(admitted_tx, self.ctx.stop.clone())),
            tokio::spawn(self.clone().pick_loop(admitted_rx)),
            tokio::spawn(self.clone().watcher_loop()),
            tokio::spawn(self.clone().sweep_loop()),
            tokio::spawn(self.clone().snapshot_loop()),
        ];

        let dispatch = self.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = dispatch.dispatch_loop().await {
                error!(error = %e, "dispatch loop stopped");
            }
        }));
        for queue in [
            WORKER_STATUS_QUEUE,
            TASK_PROGRESS_QUEUE,
            TASK_ERRORS_QUEUE,
            TASK_DONE_QUEUE,
        ] {
            let inbound = self.clone();
            handles.push(tokio::spawn(async move {
                if let Err(e) = inbound.inbound_loop(queue).await {
                    error!(queue, error = %e, "consumer stopped");
                }
            }));
        }
        info!("coordinator running");

        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "coordinator task panicked");
            }
        }

        let saved = self.save_snapshot()?;
        info!(count = saved, "coordinator stopped");
        Ok(())
    }
}
