//! Layered admission pool.
//!
//! A pool is an ordered list of levels. Each level pairs a [`FrequencyQueue`]
//! with a gatekeeper predicate and a minimum hit count. Incoming requests are
//! routed to the first level whose gatekeeper accepts them and stay there for
//! good; the output loop then drains the levels round-robin.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::frequency_queue::{FrequencyQueue, ItemStatus, QueueItem};

/// Predicate deciding whether a level takes a key.
///
/// A gatekeeper may hit the queue itself; when it accepts without doing so
/// the pool records the hit on its behalf.
pub type Gatekeeper<V> = Arc<dyn Fn(&str, &V, &FrequencyQueue<V>) -> bool + Send + Sync>;

/// Result of [`AdmissionPool::admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmitOutcome {
    /// Waiting in a level for its turn.
    Queued,
    /// Already handed out, or finished.
    Underway,
    /// No level takes the request.
    Forbidden,
}

pub struct Level<V> {
    name: String,
    min_hits: u64,
    queue: FrequencyQueue<V>,
    gatekeeper: Gatekeeper<V>,
}

impl<V> Level<V> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn min_hits(&self) -> u64 {
        self.min_hits
    }

    pub fn queue(&self) -> &FrequencyQueue<V> {
        &self.queue
    }
}

/// An item released by the output loop, tagged with its level.
#[derive(Debug, Clone, PartialEq)]
pub struct Admitted<V> {
    pub level: String,
    pub item: QueueItem<V>,
}

pub struct AdmissionPool<V> {
    levels: Vec<Level<V>>,
    cursor: AtomicUsize,
    idle_interval: Duration,
    admit_lock: Mutex<()>,
}

impl<V: Clone + Send + Sync + 'static> AdmissionPool<V> {
    /// `idle_interval` is the pause after a revolution that found nothing.
    pub fn new(idle_interval: Duration) -> Self {
        Self {
            levels: Vec::new(),
            cursor: AtomicUsize::new(0),
            idle_interval,
            admit_lock: Mutex::new(()),
        }
    }

    /// Append a level. Levels are consulted in the order they are added.
    pub fn add_level<G>(&mut self, name: &str, min_hits: u64, gatekeeper: G)
    where
        G: Fn(&str, &V, &FrequencyQueue<V>) -> bool + Send + Sync + 'static,
    {
        self.levels.push(Level {
            name: name.to_string(),
            min_hits,
            queue: FrequencyQueue::new(),
            gatekeeper: Arc::new(gatekeeper),
        });
    }

    pub fn levels(&self) -> &[Level<V>] {
        &self.levels
    }

    /// Route a request.
    ///
    /// A key already held by some level is hit again there and reported by
    /// status: queued stays queued, active and done are underway. Otherwise
    /// gatekeepers are asked in level order and the first acceptance queues
    /// the key in that level only.
    pub fn admit(&self, key: &str, value: V) -> AdmitOutcome {
        let _guard = self.admit_lock.lock();

        for level in &self.levels {
            let status = level.queue.status(key);
            if status == ItemStatus::Absent {
                continue;
            }
            level.queue.hit(key, value);
            trace!(key, level = %level.name, %status, "repeat admission");
            return match status {
                ItemStatus::Queued => AdmitOutcome::Queued,
                _ => AdmitOutcome::Underway,
            };
        }

        for level in &self.levels {
            if !(level.gatekeeper)(key, &value, &level.queue) {
                continue;
            }
            if level.queue.status(key) == ItemStatus::Absent {
                level.queue.hit(key, value);
            }
            debug!(key, level = %level.name, "admitted");
            return AdmitOutcome::Queued;
        }

        debug!(key, "no level accepted request");
        AdmitOutcome::Forbidden
    }

    /// Level name and status of `key`, if any level holds it.
    pub fn status(&self, key: &str) -> Option<(&str, ItemStatus)> {
        self.levels.iter().find_map(|level| match level.queue.status(key) {
            ItemStatus::Absent => None,
            status => Some((level.name.as_str(), status)),
        })
    }

    /// Put an active key back in line.
    pub fn release(&self, key: &str) -> bool {
        self.levels.iter().any(|level| level.queue.release(key))
    }

    /// Retire a key for good, after success or permanent failure.
    pub fn fold(&self, key: &str) -> bool {
        self.levels.iter().any(|level| level.queue.fold(key))
    }

    /// One revolution over the levels, starting where the last pop left off.
    pub fn next(&self) -> Option<Admitted<V>> {
        let count = self.levels.len();
        if count == 0 {
            return None;
        }

        let start = self.cursor.load(Ordering::Relaxed) % count;
        for offset in 0..count {
            let idx = (start + offset) % count;
            let level = &self.levels[idx];
            if let Some(item) = level.queue.pop(level.min_hits) {
                self.cursor.store((idx + 1) % count, Ordering::Relaxed);
                return Some(Admitted {
                    level: level.name.clone(),
                    item,
                });
            }
        }
        None
    }

    /// Feed admitted items into `out` until `stop` fires or the receiver goes away.
    ///
    /// An item popped but not delivered is released back to its level.
    pub async fn start(self: Arc<Self>, out: mpsc::Sender<Admitted<V>>, stop: CancellationToken) {
        loop {
            if stop.is_cancelled() {
                break;
            }

            let Some(admitted) = self.next() else {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(self.idle_interval) => continue,
                }
            };

            let key = admitted.item.key.clone();
            tokio::select! {
                _ = stop.cancelled() => {
                    self.release(&key);
                    break;
                }
                sent = out.send(admitted) => {
                    if sent.is_err() {
                        self.release(&key);
                        break;
                    }
                }
            }
        }
        debug!("admission output loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accept_all(_: &str, _: &u32, _: &FrequencyQueue<u32>) -> bool {
        true
    }

    fn reject_all(_: &str, _: &u32, _: &FrequencyQueue<u32>) -> bool {
        false
    }

    fn pool() -> AdmissionPool<u32> {
        AdmissionPool::new(Duration::from_millis(5))
    }

    #[test]
    fn test_first_accepting_level_wins() {
        let mut pool = pool();
        pool.add_level("even", 0, |_: &str, v: &u32, _: &FrequencyQueue<u32>| v % 2 == 0);
        pool.add_level("any", 0, accept_all);

        assert_eq!(pool.admit("a", 2), AdmitOutcome::Queued);
        assert_eq!(pool.admit("b", 3), AdmitOutcome::Queued);
        assert_eq!(pool.status("a"), Some(("even", ItemStatus::Queued)));
        assert_eq!(pool.status("b"), Some(("any", ItemStatus::Queued)));
    }

    #[test]
    fn test_no_accepting_level_is_forbidden() {
        let mut pool = pool();
        pool.add_level("never", 0, reject_all);
        assert_eq!(pool.admit("a", 1), AdmitOutcome::Forbidden);
        assert_eq!(pool.status("a"), None);
    }

    #[test]
    fn test_accepted_key_stays_in_its_level() {
        let mut pool = pool();
        // Accepts only the first time it is asked
        let asked = Arc::new(AtomicUsize::new(0));
        let counter = asked.clone();
        pool.add_level("once", 0, move |_: &str, _: &u32, _: &FrequencyQueue<u32>| {
            counter.fetch_add(1, Ordering::SeqCst) == 0
        });
        pool.add_level("rest", 0, accept_all);

        assert_eq!(pool.admit("a", 1), AdmitOutcome::Queued);
        for _ in 0..5 {
            assert_eq!(pool.admit("a", 1), AdmitOutcome::Queued);
        }

        assert_eq!(pool.levels()[0].queue().get("a").unwrap().hits, 6);
        assert_eq!(pool.levels()[1].queue().status("a"), ItemStatus::Absent);
        assert_eq!(asked.load(Ordering::SeqCst), 1, "known keys skip gatekeepers");
    }

    #[test]
    fn test_active_and_done_keys_are_underway() {
        let mut pool = pool();
        pool.add_level("first", 0, reject_all);
        pool.add_level("second", 0, accept_all);

        pool.admit("a", 1);
        let admitted = pool.next().unwrap();
        assert_eq!(admitted.level, "second");
        assert_eq!(pool.admit("a", 1), AdmitOutcome::Underway);

        assert!(pool.fold("a"));
        assert_eq!(pool.admit("a", 1), AdmitOutcome::Underway);
        assert_eq!(pool.status("a"), Some(("second", ItemStatus::Done)));
    }

    #[test]
    fn test_gatekeeper_may_hit_itself() {
        let mut pool = pool();
        pool.add_level("weighted", 0, |key: &str, v: &u32, q: &FrequencyQueue<u32>| {
            q.hit(key, *v);
            q.hit(key, *v);
            true
        });

        pool.admit("a", 1);
        assert_eq!(pool.levels()[0].queue().get("a").unwrap().hits, 2);
    }

    #[test]
    fn test_round_robin_services_every_level() {
        let mut pool = pool();
        for name in ["a", "b", "c"] {
            let prefix = name.to_string();
            pool.add_level(name, 0, move |key: &str, _: &u32, _: &FrequencyQueue<u32>| {
                key.starts_with(&prefix)
            });
        }
        for level in ["a", "b", "c"] {
            for i in 0..4 {
                pool.admit(&format!("{}{}", level, i), i);
            }
        }

        let mut served = Vec::new();
        for _ in 0..9 {
            served.push(pool.next().unwrap().level);
        }
        for window in served.chunks(3) {
            let mut names: Vec<_> = window.to_vec();
            names.sort();
            assert_eq!(names, vec!["a", "b", "c"]);
        }
    }

    #[test]
    fn test_empty_levels_are_skipped() {
        let mut pool = pool();
        pool.add_level("empty", 0, reject_all);
        pool.add_level("full", 0, accept_all);
        pool.admit("x", 1);
        pool.admit("y", 1);

        assert_eq!(pool.next().unwrap().level, "full");
        assert_eq!(pool.next().unwrap().level, "full");
        assert!(pool.next().is_none());
    }

    #[test]
    fn test_min_hits_holds_back_items() {
        let mut pool = pool();
        pool.add_level("common", 3, accept_all);
        pool.admit("a", 1);
        pool.admit("a", 1);
        assert!(pool.next().is_none());
        pool.admit("a", 1);
        assert_eq!(pool.next().unwrap().item.key, "a");
    }

    #[tokio::test]
    async fn test_start_emits_items_and_stops() {
        let mut pool = pool();
        pool.add_level("any", 0, accept_all);
        let pool = Arc::new(pool);
        let stop = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(4);

        let handle = tokio::spawn(pool.clone().start(tx, stop.clone()));
        pool.admit("a", 1);

        let admitted = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(admitted.item.key, "a");
        assert_eq!(pool.status("a"), Some(("any", ItemStatus::Active)));

        stop.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_undelivered_item_is_released() {
        let mut pool = pool();
        pool.add_level("any", 0, accept_all);
        let pool = Arc::new(pool);
        pool.admit("a", 1);

        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        pool.clone().start(tx, CancellationToken::new()).await;

        assert_eq!(pool.status("a"), Some(("any", ItemStatus::Queued)));
    }
}
