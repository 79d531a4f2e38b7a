//! Durable per-task ledger.
//!
//! Every dispatched task gets one record keyed by its task id. Records are
//! updated one at a time; status only moves forward, except for the explicit
//! retry loop between processing and retrying.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

use crate::protocol::{now_ms, TaskResult, TaskStage};

/// Ledger-level status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerStatus {
    Pending,
    Processing,
    Retrying,
    Done,
    Failed,
}

impl Default for LedgerStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for LedgerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LedgerStatus::Pending => write!(f, "pending"),
            LedgerStatus::Processing => write!(f, "processing"),
            LedgerStatus::Retrying => write!(f, "retrying"),
            LedgerStatus::Done => write!(f, "done"),
            LedgerStatus::Failed => write!(f, "failed"),
        }
    }
}

impl LedgerStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LedgerStatus::Done | LedgerStatus::Failed)
    }

    /// Terminal statuses are final and nothing returns to pending.
    pub fn can_transition_to(&self, next: LedgerStatus) -> bool {
        !self.is_terminal() && next != LedgerStatus::Pending
    }
}

/// One ledger row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Globally unique task id (UUID).
    pub id: String,
    /// Admission key the task was created for.
    pub reference: String,
    /// Unix timestamp (milliseconds) of creation.
    pub created_at: i64,
    /// Unix timestamp (milliseconds) of the last update.
    pub updated_at: i64,
    pub status: LedgerStatus,
    /// Number of times the task went back for another attempt.
    pub retries: u32,
    pub stage: TaskStage,
    pub stage_progress: f32,
    pub error: Option<String>,
    pub worker: Option<String>,
    pub url: String,
    pub content_key: String,
    pub result: Option<TaskResult>,
}

impl TaskRecord {
    pub fn new(id: &str, reference: &str, url: &str, content_key: &str) -> Self {
        let now = now_ms();
        Self {
            id: id.to_string(),
            reference: reference.to_string(),
            created_at: now,
            updated_at: now,
            status: LedgerStatus::Pending,
            retries: 0,
            stage: TaskStage::Pending,
            stage_progress: 0.0,
            error: None,
            worker: None,
            url: url.to_string(),
            content_key: content_key.to_string(),
            result: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("task {0} not found")]
    NotFound(String),

    #[error("task {0} already exists")]
    AlreadyExists(String),

    #[error("task {id}: cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: LedgerStatus,
        to: LedgerStatus,
    },
}

/// Storage for task records.
///
/// Implementors provide row access and an atomic `transition`; the named
/// state changes are shared.
pub trait TaskLedger: Send + Sync {
    fn create(&self, record: TaskRecord) -> Result<(), LedgerError>;

    fn get(&self, id: &str) -> Result<TaskRecord, LedgerError>;

    fn list(&self) -> Result<Vec<TaskRecord>, LedgerError>;

    /// Overwrite an existing row.
    fn put(&self, record: &TaskRecord) -> Result<(), LedgerError>;

    /// Read, check, mutate and write back one row.
    ///
    /// The whole read-modify-write runs under the store's lock; see
    /// [`apply_transition`] for the rules.
    fn transition(
        &self,
        id: &str,
        status: Option<LedgerStatus>,
        apply: &mut dyn FnMut(&mut TaskRecord),
    ) -> Result<TaskRecord, LedgerError>;

    fn update_stage(
        &self,
        id: &str,
        stage: TaskStage,
        progress: f32,
    ) -> Result<TaskRecord, LedgerError> {
        self.transition(id, None, &mut |r| {
            r.stage = stage;
            r.stage_progress = progress;
        })
    }

    fn mark_processing(&self, id: &str, worker: &str) -> Result<TaskRecord, LedgerError> {
        self.transition(id, Some(LedgerStatus::Processing), &mut |r| {
            r.worker = Some(worker.to_string());
            r.stage = TaskStage::Accepted;
        })
    }

    /// Send the task around again; bumps the retry count. `stage` is the
    /// waiting stage the task was requeued into.
    fn mark_retrying(
        &self,
        id: &str,
        error: &str,
        stage: TaskStage,
    ) -> Result<TaskRecord, LedgerError> {
        self.transition(id, Some(LedgerStatus::Retrying), &mut |r| {
            r.retries += 1;
            r.error = Some(error.to_string());
            r.stage = stage;
            r.stage_progress = 0.0;
            r.worker = None;
        })
    }

    fn mark_done(&self, id: &str, result: &TaskResult) -> Result<TaskRecord, LedgerError> {
        self.transition(id, Some(LedgerStatus::Done), &mut |r| {
            r.result = Some(result.clone());
            r.stage = TaskStage::Completed;
            r.stage_progress = 100.0;
            r.error = None;
        })
    }

    fn mark_failed(&self, id: &str, error: &str) -> Result<TaskRecord, LedgerError> {
        self.transition(id, Some(LedgerStatus::Failed), &mut |r| {
            r.error = Some(error.to_string());
            r.stage = TaskStage::FailedFatally;
        })
    }
}

/// Check `status` against the record and apply the mutation in place.
///
/// Returns `false` when nothing changed: a stage-only update on a terminal
/// record is ignored.
pub fn apply_transition(
    record: &mut TaskRecord,
    status: Option<LedgerStatus>,
    apply: &mut dyn FnMut(&mut TaskRecord),
) -> Result<bool, LedgerError> {
    match status {
        Some(next) => {
            if record.status != next && !record.status.can_transition_to(next) {
                return Err(LedgerError::InvalidTransition {
                    id: record.id.clone(),
                    from: record.status,
                    to: next,
                });
            }
            record.status = next;
        }
        None if record.status.is_terminal() => return Ok(false),
        None => {}
    }
    apply(record);
    record.updated_at = now_ms();
    Ok(true)
}

/// Ledger backed by one JSON file per task.
#[derive(Debug)]
pub struct JsonLedger {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonLedger {
    /// Open (creating if needed) a ledger rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    fn write_record(&self, record: &TaskRecord) -> Result<(), LedgerError> {
        let path = self.path_for(&record.id);
        let tmp_path = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(record)?;
        {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    fn read_record(path: &Path) -> Result<TaskRecord, LedgerError> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

impl TaskLedger for JsonLedger {
    fn create(&self, record: TaskRecord) -> Result<(), LedgerError> {
        let _guard = self.write_lock.lock();
        if self.path_for(&record.id).exists() {
            return Err(LedgerError::AlreadyExists(record.id));
        }
        self.write_record(&record)
    }

    fn get(&self, id: &str) -> Result<TaskRecord, LedgerError> {
        match Self::read_record(&self.path_for(id)) {
            Err(LedgerError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                Err(LedgerError::NotFound(id.to_string()))
            }
            other => other,
        }
    }

    fn list(&self) -> Result<Vec<TaskRecord>, LedgerError> {
        let mut records = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read_record(&path) {
                Ok(record) => records.push(record),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable task record"),
            }
        }
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    fn put(&self, record: &TaskRecord) -> Result<(), LedgerError> {
        let _guard = self.write_lock.lock();
        if !self.path_for(&record.id).exists() {
            return Err(LedgerError::NotFound(record.id.clone()));
        }
        self.write_record(record)
    }

    fn transition(
        &self,
        id: &str,
        status: Option<LedgerStatus>,
        apply: &mut dyn FnMut(&mut TaskRecord),
    ) -> Result<TaskRecord, LedgerError> {
        let _guard = self.write_lock.lock();
        let mut record = self.get(id)?;
        if apply_transition(&mut record, status, apply)? {
            self.write_record(&record)?;
        }
        Ok(record)
    }
}

/// Volatile ledger.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    records: Mutex<HashMap<String, TaskRecord>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TaskLedger for MemoryLedger {
    fn create(&self, record: TaskRecord) -> Result<(), LedgerError> {
        let mut records = self.records.lock();
        if records.contains_key(&record.id) {
            return Err(LedgerError::AlreadyExists(record.id));
        }
        records.insert(record.id.clone(), record);
        Ok(())
    }

    fn get(&self, id: &str) -> Result<TaskRecord, LedgerError> {
        self.records
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(id.to_string()))
    }

    fn list(&self) -> Result<Vec<TaskRecord>, LedgerError> {
        let mut records: Vec<_> = self.records.lock().values().cloned().collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    fn put(&self, record: &TaskRecord) -> Result<(), LedgerError> {
        match self.records.lock().get_mut(&record.id) {
            Some(slot) => {
                *slot = record.clone();
                Ok(())
            }
            None => Err(LedgerError::NotFound(record.id.clone())),
        }
    }

    fn transition(
        &self,
        id: &str,
        status: Option<LedgerStatus>,
        apply: &mut dyn FnMut(&mut TaskRecord),
    ) -> Result<TaskRecord, LedgerError> {
        let mut records = self.records.lock();
        let record = records
            .get_mut(id)
            .ok_or_else(|| LedgerError::NotFound(id.to_string()))?;
        let mut next = record.clone();
        if apply_transition(&mut next, status, apply)? {
            *record = next.clone();
        }
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use tempfile::TempDir;

    fn record(id: &str) -> TaskRecord {
        TaskRecord::new(id, "ref-1", "https://cdn.example/ref-1", "sha-1")
    }

    fn result() -> TaskResult {
        TaskResult {
            url: "s3://bucket/abc".to_string(),
            size_bytes: 1024,
        }
    }

    fn status_strategy() -> impl Strategy<Value = LedgerStatus> {
        prop_oneof![
            Just(LedgerStatus::Pending),
            Just(LedgerStatus::Processing),
            Just(LedgerStatus::Retrying),
            Just(LedgerStatus::Done),
            Just(LedgerStatus::Failed),
        ]
    }

    proptest! {
        #[test]
        fn prop_terminal_status_is_final(
            from in status_strategy(),
            to in status_strategy(),
        ) {
            if from.is_terminal() || to == LedgerStatus::Pending {
                prop_assert!(!from.can_transition_to(to));
            } else {
                prop_assert!(from.can_transition_to(to));
            }
        }
    }

    #[test]
    fn test_json_ledger_round_trip() {
        let dir = TempDir::new().unwrap();
        let ledger = JsonLedger::open(dir.path().join("tasks")).unwrap();

        ledger.create(record("t1")).unwrap();
        let loaded = ledger.get("t1").unwrap();
        assert_eq!(loaded.status, LedgerStatus::Pending);
        assert_eq!(loaded.reference, "ref-1");
    }

    #[test]
    fn test_create_twice_is_rejected() {
        let dir = TempDir::new().unwrap();
        let ledger = JsonLedger::open(dir.path()).unwrap();
        ledger.create(record("t1")).unwrap();
        assert!(matches!(
            ledger.create(record("t1")),
            Err(LedgerError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_missing_record_is_not_found() {
        let dir = TempDir::new().unwrap();
        let ledger = JsonLedger::open(dir.path()).unwrap();
        assert!(matches!(ledger.get("nope"), Err(LedgerError::NotFound(_))));
        assert!(matches!(
            ledger.mark_processing("nope", "w1"),
            Err(LedgerError::NotFound(_))
        ));
    }

    #[test]
    fn test_retry_cycle_then_done() {
        let dir = TempDir::new().unwrap();
        let ledger = JsonLedger::open(dir.path()).unwrap();
        ledger.create(record("t1")).unwrap();

        ledger.mark_processing("t1", "w1").unwrap();
        let retried = ledger
            .mark_retrying("t1", "timed out", TaskStage::TimedOutRequeued)
            .unwrap();
        assert_eq!(retried.stage, TaskStage::TimedOutRequeued);
        assert_eq!(retried.retries, 1);
        assert_eq!(retried.worker, None);
        ledger.mark_processing("t1", "w2").unwrap();
        ledger.update_stage("t1", TaskStage::Encoding, 40.0).unwrap();

        let done = ledger.mark_done("t1", &result()).unwrap();
        assert_eq!(done.status, LedgerStatus::Done);
        assert_eq!(done.worker.as_deref(), Some("w2"));
        assert_eq!(done.result, Some(result()));

        let reloaded = ledger.get("t1").unwrap();
        assert_eq!(reloaded, done);
    }

    #[test]
    fn test_terminal_record_refuses_further_status() {
        let ledger = MemoryLedger::new();
        ledger.create(record("t1")).unwrap();
        ledger.mark_failed("t1", "bad payload").unwrap();

        assert!(matches!(
            ledger.mark_retrying("t1", "again", TaskStage::Pending),
            Err(LedgerError::InvalidTransition { .. })
        ));
        // Late stage reports leave the record untouched
        let after = ledger.update_stage("t1", TaskStage::Encoding, 10.0).unwrap();
        assert_eq!(after.stage, TaskStage::FailedFatally);
    }

    #[test]
    fn test_list_skips_corrupt_files() {
        let dir = TempDir::new().unwrap();
        let ledger = JsonLedger::open(dir.path()).unwrap();
        ledger.create(record("t1")).unwrap();
        ledger.create(record("t2")).unwrap();
        fs::write(dir.path().join("broken.json"), "{ nope").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let records = ledger.list().unwrap();
        assert_eq!(records.len(), 2);
    }

    fn assert_stage_updates_never_undo_done(
        ledger: Arc<dyn TaskLedger>,
        trials: usize,
        updates: usize,
    ) {
        for trial in 0..trials {
            let id = format!("t{}", trial);
            ledger.create(record(&id)).unwrap();
            ledger.mark_processing(&id, "w1").unwrap();

            let barrier = Arc::new(Barrier::new(2));
            let updater = {
                let (ledger, barrier, id) = (ledger.clone(), barrier.clone(), id.clone());
                thread::spawn(move || {
                    barrier.wait();
                    for i in 0..updates {
                        let _ = ledger.update_stage(&id, TaskStage::Encoding, i as f32 / 2.0);
                    }
                })
            };
            barrier.wait();
            ledger.mark_done(&id, &result()).unwrap();
            updater.join().unwrap();

            let after = ledger.get(&id).unwrap();
            assert_eq!(after.status, LedgerStatus::Done, "trial {}", trial);
            assert_eq!(after.stage, TaskStage::Completed);
        }
    }

    #[test]
    fn test_concurrent_stage_updates_keep_memory_record_done() {
        assert_stage_updates_never_undo_done(Arc::new(MemoryLedger::new()), 100, 500);
    }

    #[test]
    fn test_concurrent_stage_updates_keep_json_record_done() {
        let dir = TempDir::new().unwrap();
        let ledger = Arc::new(JsonLedger::open(dir.path()).unwrap());
        assert_stage_updates_never_undo_done(ledger, 10, 20);
    }

    #[test]
    fn test_memory_ledger_put_requires_existing() {
        let ledger = MemoryLedger::new();
        assert!(matches!(
            ledger.put(&record("t1")),
            Err(LedgerError::NotFound(_))
        ));
    }
}
