//! Frequency-ordered queue backing admission decisions.
//!
//! Keys are grouped into buckets that share a hit count. Buckets live in an
//! arena and are chained by index into a list of strictly increasing
//! frequency, so a hit moves a key into the neighbouring bucket (creating it
//! in place when needed) without scanning. Pops walk the list from the
//! highest frequency down.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Lifecycle of a key inside a [`FrequencyQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    /// The queue has never seen the key.
    Absent,
    /// Waiting to be popped.
    Queued,
    /// Handed out by a pop and not yet released or folded.
    Active,
    /// Folded; kept for status queries but never popped again.
    Done,
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ItemStatus::Absent => write!(f, "absent"),
            ItemStatus::Queued => write!(f, "queued"),
            ItemStatus::Active => write!(f, "active"),
            ItemStatus::Done => write!(f, "done"),
        }
    }
}

/// Copy of a queue entry handed out by lookups and pops.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueItem<V> {
    pub key: String,
    pub value: V,
    /// Hit count, equal to the frequency of the bucket holding the key.
    pub hits: u64,
    pub status: ItemStatus,
}

#[derive(Debug)]
struct Bucket {
    frequency: u64,
    keys: Vec<String>,
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Debug)]
struct Entry<V> {
    value: V,
    bucket: usize,
    slot: usize,
    status: ItemStatus,
}

#[derive(Debug)]
struct Inner<V> {
    buckets: Vec<Bucket>,
    vacant: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    entries: HashMap<String, Entry<V>>,
    total_hits: u64,
}

impl<V> Inner<V> {
    fn new() -> Self {
        Self {
            buckets: Vec::new(),
            vacant: Vec::new(),
            head: None,
            tail: None,
            entries: HashMap::new(),
            total_hits: 0,
        }
    }

    /// Link a new bucket between `prev` and `next`.
    fn insert_bucket(&mut self, frequency: u64, prev: Option<usize>, next: Option<usize>) -> usize {
        let bucket = Bucket {
            frequency,
            keys: Vec::new(),
            prev,
            next,
        };
        let idx = match self.vacant.pop() {
            Some(idx) => {
                self.buckets[idx] = bucket;
                idx
            }
            None => {
                self.buckets.push(bucket);
                self.buckets.len() - 1
            }
        };

        match prev {
            Some(p) => self.buckets[p].next = Some(idx),
            None => self.head = Some(idx),
        }
        match next {
            Some(n) => self.buckets[n].prev = Some(idx),
            None => self.tail = Some(idx),
        }
        idx
    }

    fn unlink_bucket(&mut self, idx: usize) {
        let prev = self.buckets[idx].prev;
        let next = self.buckets[idx].next;

        match prev {
            Some(p) => self.buckets[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.buckets[n].prev = prev,
            None => self.tail = prev,
        }

        let bucket = &mut self.buckets[idx];
        bucket.prev = None;
        bucket.next = None;
        bucket.keys.clear();
        self.vacant.push(idx);
    }

    fn push_key(&mut self, bucket: usize, key: &str) -> usize {
        let keys = &mut self.buckets[bucket].keys;
        keys.push(key.to_string());
        keys.len() - 1
    }

    fn remove_key(&mut self, bucket: usize, slot: usize) {
        let keys = &mut self.buckets[bucket].keys;
        keys.swap_remove(slot);
        if let Some(moved) = keys.get(slot) {
            if let Some(entry) = self.entries.get_mut(moved) {
                entry.slot = slot;
            }
        }
    }

    fn hit(&mut self, key: &str, value: V) -> u64 {
        self.total_hits += 1;

        let Some((current, slot)) = self.entries.get(key).map(|e| (e.bucket, e.slot)) else {
            let bucket = match self.head {
                Some(head) if self.buckets[head].frequency == 1 => head,
                head => self.insert_bucket(1, None, head),
            };
            let slot = self.push_key(bucket, key);
            self.entries.insert(
                key.to_string(),
                Entry {
                    value,
                    bucket,
                    slot,
                    status: ItemStatus::Queued,
                },
            );
            return 1;
        };

        let frequency = self.buckets[current].frequency + 1;
        let target = match self.buckets[current].next {
            Some(next) if self.buckets[next].frequency == frequency => next,
            next => self.insert_bucket(frequency, Some(current), next),
        };

        self.remove_key(current, slot);
        let new_slot = self.push_key(target, key);
        if let Some(entry) = self.entries.get_mut(key) {
            entry.bucket = target;
            entry.slot = new_slot;
        }
        if self.buckets[current].keys.is_empty() {
            self.unlink_bucket(current);
        }
        frequency
    }

    /// First queued key at or above `min_hits`, highest frequency first.
    ///
    /// The walk stops at the first bucket below the floor.
    fn select(&self, min_hits: u64) -> Option<&str> {
        let mut cursor = self.tail;
        while let Some(idx) = cursor {
            let bucket = &self.buckets[idx];
            if bucket.frequency < min_hits {
                return None;
            }
            let queued = bucket.keys.iter().find(|key| {
                self.entries
                    .get(key.as_str())
                    .is_some_and(|e| e.status == ItemStatus::Queued)
            });
            if let Some(key) = queued {
                return Some(key.as_str());
            }
            cursor = bucket.prev;
        }
        None
    }

    fn snapshot(&self, key: &str) -> Option<QueueItem<V>>
    where
        V: Clone,
    {
        self.entries.get(key).map(|entry| QueueItem {
            key: key.to_string(),
            value: entry.value.clone(),
            hits: self.buckets[entry.bucket].frequency,
            status: entry.status,
        })
    }
}

/// Frequency-ordered queue guarded by a single read-write lock.
#[derive(Debug)]
pub struct FrequencyQueue<V> {
    inner: RwLock<Inner<V>>,
}

impl<V> Default for FrequencyQueue<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> FrequencyQueue<V> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::new()),
        }
    }

    /// Record a hit for `key`, returning its new hit count.
    ///
    /// Unknown keys enter the lowest bucket as queued with one hit and keep
    /// `value`; known keys move up one bucket and keep their original value.
    pub fn hit(&self, key: &str, value: V) -> u64 {
        self.inner.write().hit(key, value)
    }

    pub fn status(&self, key: &str) -> ItemStatus {
        self.inner
            .read()
            .entries
            .get(key)
            .map(|e| e.status)
            .unwrap_or(ItemStatus::Absent)
    }

    /// Move an active key back to queued. Returns false for any other status.
    pub fn release(&self, key: &str) -> bool {
        let mut inner = self.inner.write();
        match inner.entries.get_mut(key) {
            Some(entry) if entry.status == ItemStatus::Active => {
                entry.status = ItemStatus::Queued;
                true
            }
            _ => false,
        }
    }

    /// Mark a key done so it is never popped again.
    pub fn fold(&self, key: &str) -> bool {
        let mut inner = self.inner.write();
        match inner.entries.get_mut(key) {
            Some(entry) => {
                entry.status = ItemStatus::Done;
                true
            }
            None => false,
        }
    }

    /// Total number of hits recorded across all keys.
    pub fn total_hits(&self) -> u64 {
        self.inner.read().total_hits
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bucket frequencies from head to tail.
    pub fn frequencies(&self) -> Vec<u64> {
        let inner = self.inner.read();
        let mut out = Vec::new();
        let mut cursor = inner.head;
        while let Some(idx) = cursor {
            out.push(inner.buckets[idx].frequency);
            cursor = inner.buckets[idx].next;
        }
        out
    }
}

impl<V: Clone> FrequencyQueue<V> {
    pub fn get(&self, key: &str) -> Option<QueueItem<V>> {
        self.inner.read().snapshot(key)
    }

    /// Return the most-hit queued item with at least `min_hits` without claiming it.
    pub fn peek(&self, min_hits: u64) -> Option<QueueItem<V>> {
        let inner = self.inner.read();
        let key = inner.select(min_hits)?;
        inner.snapshot(key)
    }

    /// Claim the most-hit queued item with at least `min_hits`, marking it active.
    pub fn pop(&self, min_hits: u64) -> Option<QueueItem<V>> {
        let mut inner = self.inner.write();
        let key = inner.select(min_hits)?.to_string();
        if let Some(entry) = inner.entries.get_mut(&key) {
            entry.status = ItemStatus::Active;
        }
        inner.snapshot(&key)
    }
}
