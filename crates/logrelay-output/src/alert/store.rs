//! Per-request context buffers for the alert sink.

use logrelay_core::CorrelationKey;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Identifies one lifetime of a key's bucket
///
/// A key that is deleted and then stored again gets a new generation, so a
/// timer armed for the old bucket cannot touch the new one.
pub type Generation = u64;

/// Outcome of [`CorrelationStore::store`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stored {
    /// The bucket did not exist before this call
    pub created: bool,
    pub generation: Generation,
}

#[derive(Debug)]
struct Bucket {
    generation: Generation,
    lines: Vec<String>,
    /// Holds an error waiting for its flush; TTL eviction leaves it alone
    escalated: bool,
}

#[derive(Debug, Default)]
struct Inner {
    buckets: HashMap<CorrelationKey, Bucket>,
    next_generation: Generation,
}

/// Key → ordered lines, guarded by one lock
///
/// Every operation is O(1) apart from the copy in [`load`](Self::load), so a
/// single coarse lock is enough.
#[derive(Debug, Default)]
pub struct CorrelationStore {
    inner: Mutex<Inner>,
}

impl CorrelationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `line` to the key's bucket, creating the bucket if needed
    pub fn store(&self, key: CorrelationKey, line: impl Into<String>) -> Stored {
        self.append(key, line.into(), false)
    }

    /// Append an error line and pin the bucket until it is taken
    ///
    /// Marking happens under the same lock as the append, so an eviction can
    /// never slip in between and drop the error before its flush is armed.
    pub fn store_escalation(&self, key: CorrelationKey, line: impl Into<String>) -> Stored {
        self.append(key, line.into(), true)
    }

    fn append(&self, key: CorrelationKey, line: String, escalate: bool) -> Stored {
        let mut inner = self.inner.lock();
        let Inner {
            buckets,
            next_generation,
        } = &mut *inner;

        let mut created = false;
        let bucket = buckets.entry(key).or_insert_with(|| {
            created = true;
            *next_generation += 1;
            Bucket {
                generation: *next_generation,
                lines: Vec::new(),
                escalated: false,
            }
        });
        bucket.lines.push(line);
        bucket.escalated |= escalate;

        Stored {
            created,
            generation: bucket.generation,
        }
    }

    /// Snapshot of the key's lines, `None` if it has no bucket
    pub fn load(&self, key: &CorrelationKey) -> Option<Vec<String>> {
        self.inner
            .lock()
            .buckets
            .get(key)
            .map(|bucket| bucket.lines.clone())
    }

    /// Remove the key's bucket; no-op when absent
    pub fn delete(&self, key: &CorrelationKey) {
        self.inner.lock().buckets.remove(key);
    }

    /// Remove and return the bucket, but only if it is still `generation`
    pub fn take(&self, key: &CorrelationKey, generation: Generation) -> Option<Vec<String>> {
        let mut inner = self.inner.lock();
        let current = inner
            .buckets
            .get(key)
            .is_some_and(|bucket| bucket.generation == generation);
        if current {
            inner.buckets.remove(key).map(|bucket| bucket.lines)
        } else {
            None
        }
    }

    /// Drop the bucket if it is still `generation` and holds no pending
    /// error; returns whether it did
    pub fn evict(&self, key: &CorrelationKey, generation: Generation) -> bool {
        let mut inner = self.inner.lock();
        let expired = inner
            .buckets
            .get(key)
            .is_some_and(|bucket| bucket.generation == generation && !bucket.escalated);
        if expired {
            inner.buckets.remove(key);
        }
        expired
    }

    /// Number of live buckets
    pub fn len(&self) -> usize {
        self.inner.lock().buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every bucket
    pub fn clear(&self) {
        self.inner.lock().buckets.clear();
    }
}
