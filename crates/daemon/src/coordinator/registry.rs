//! Worker capacity registry.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::info;

use crate::protocol::WorkerStatus;

/// Latest report from one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSummary {
    pub worker_id: String,
    pub capacity: u32,
    pub available: u32,
    /// Timestamp carried by the report.
    pub reported_at: i64,
    /// Local receipt time of the report.
    pub last_seen: i64,
}

#[derive(Debug, Default)]
struct Inner {
    workers: HashMap<String, WorkerSummary>,
    capacity: u32,
    available: u32,
}

impl Inner {
    fn recompute(&mut self) {
        self.capacity = self.workers.values().map(|w| w.capacity).sum();
        self.available = self.workers.values().map(|w| w.available).sum();
    }
}

#[derive(Debug, Default)]
pub struct WorkerRegistry {
    inner: Mutex<Inner>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a status report. Reports older than the one already held are ignored.
    pub fn update(&self, status: &WorkerStatus, now: i64) -> bool {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.workers.get(&status.worker_id) {
            if existing.reported_at > status.timestamp {
                return false;
            }
        }
        if !inner.workers.contains_key(&status.worker_id) {
            info!(worker_id = %status.worker_id, capacity = status.capacity, "worker registered");
        }
        inner.workers.insert(
            status.worker_id.clone(),
            WorkerSummary {
                worker_id: status.worker_id.clone(),
                capacity: status.capacity,
                available: status.available.min(status.capacity),
                reported_at: status.timestamp,
                last_seen: now,
            },
        );
        inner.recompute();
        true
    }

    /// Evict workers not seen for `stale_ms` and refresh the totals.
    pub fn tick(&self, now: i64, stale_ms: i64) -> Vec<String> {
        let mut inner = self.inner.lock();
        let evicted: Vec<String> = inner
            .workers
            .values()
            .filter(|w| now - w.last_seen > stale_ms)
            .map(|w| w.worker_id.clone())
            .collect();
        for id in &evicted {
            inner.workers.remove(id);
            info!(worker_id = %id, "evicted stale worker");
        }
        inner.recompute();
        evicted
    }

    /// Claim one free slot until the next report recomputes the totals.
    pub fn try_reserve(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.available == 0 {
            return false;
        }
        inner.available -= 1;
        true
    }

    pub fn capacity(&self) -> u32 {
        self.inner.lock().capacity
    }

    pub fn available(&self) -> u32 {
        self.inner.lock().available
    }

    pub fn len(&self) -> usize {
        self.inner.lock().workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn summaries(&self) -> Vec<WorkerSummary> {
        let mut workers: Vec<_> = self.inner.lock().workers.values().cloned().collect();
        workers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        workers
    }
}
