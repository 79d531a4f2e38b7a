//! Pipeline counters
//!
//! A single snapshot struct shared between the coordinator loops and the
//! status endpoint.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Aggregate counters for the admission and dispatch pipeline
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MetricsSnapshot {
    pub timestamp_unix_ms: i64,
    /// Requests accepted into some admission level
    pub admitted: u64,
    /// Requests no level would take
    pub forbidden: u64,
    /// Task payloads handed to workers
    pub dispatched: u64,
    pub completed: u64,
    /// Tasks that failed permanently
    pub failed: u64,
    /// Tasks sent around again after a failure or timeout
    pub requeued: u64,
    /// Tracked running requests
    pub running: usize,
    /// Sum of registered worker slots
    pub capacity: u32,
    /// Sum of free worker slots
    pub available: u32,
    /// Registered workers
    pub workers: usize,
}

/// Shared metrics state for concurrent access across daemon components
pub type SharedMetrics = Arc<RwLock<MetricsSnapshot>>;

pub fn new_shared_metrics() -> SharedMetrics {
    Arc::new(RwLock::new(MetricsSnapshot::default()))
}

/// Apply `f` to the shared snapshot and stamp it.
pub async fn record<F>(metrics: &SharedMetrics, f: F)
where
    F: FnOnce(&mut MetricsSnapshot),
{
    let mut snapshot = metrics.write().await;
    f(&mut snapshot);
    snapshot.timestamp_unix_ms = crate::protocol::now_ms();
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]
        #[test]
        fn prop_snapshot_json_round_trip(
            admitted in any::<u64>(),
            forbidden in any::<u64>(),
            requeued in any::<u64>(),
            running in 0usize..10_000,
            capacity in any::<u32>(),
            available in any::<u32>(),
        ) {
            let snapshot = MetricsSnapshot {
                timestamp_unix_ms: 1,
                admitted,
                forbidden,
                requeued,
                running,
                capacity,
                available,
                ..MetricsSnapshot::default()
            };
            let json = serde_json::to_string(&snapshot).unwrap();
            let parsed: MetricsSnapshot = serde_json::from_str(&json).unwrap();
            prop_assert_eq!(snapshot, parsed);
        }
    }

    #[tokio::test]
    async fn test_record_stamps_timestamp() {
        let metrics = new_shared_metrics();
        record(&metrics, |m| m.completed += 2).await;

        let snapshot = metrics.read().await;
        assert_eq!(snapshot.completed, 2);
        assert!(snapshot.timestamp_unix_ms > 0);
    }
}
