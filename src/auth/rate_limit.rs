//! Admission control for login and TOTP endpoints.
//!
//! Two independent algorithms:
//! - [`RefillingTokenBucket`]: capacity-based, lazily refilled at access time,
//!   keyed by IP or user id.
//! - [`Throttler`]: exponential backoff over a fixed delay table, keyed by
//!   user id, reset on successful authentication.
//!
//! Both keep per-key state behind its own mutex so concurrent requests for
//! the same key are serialized without serializing unrelated keys.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

#[derive(Debug)]
struct BucketEntry {
    count: f64,
    refilled_at: DateTime<Utc>,
    last_access: DateTime<Utc>,
}

pub struct RefillingTokenBucket<K> {
    capacity: f64,
    refill_interval_seconds: f64,
    entries: RwLock<HashMap<K, Arc<Mutex<BucketEntry>>>>,
}

fn elapsed_seconds(since: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    (now - since).num_milliseconds() as f64 / 1000.0
}

impl<K> RefillingTokenBucket<K>
where
    K: Eq + Hash + Clone + Send + Sync,
{
    /// `capacity` tokens, refilled at 1 token per `refill_interval_seconds`.
    pub fn new(capacity: u32, refill_interval_seconds: f64) -> Self {
        Self {
            capacity: f64::from(capacity),
            refill_interval_seconds,
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn refilled(&self, count: f64, refilled_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
        let refill = elapsed_seconds(refilled_at, now) / self.refill_interval_seconds;
        (count + refill).min(self.capacity)
    }

    /// Read-only pre-flight check. An absent key counts as a full bucket and
    /// no entry is created.
    pub async fn check(&self, key: &K, cost: u32) -> bool {
        let entry = {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(entry) => Arc::clone(entry),
                None => return self.capacity >= f64::from(cost),
            }
        };
        let guard = entry.lock().await;
        self.refilled(guard.count, guard.refilled_at, Utc::now()) >= f64::from(cost)
    }

    /// Atomic check-and-deduct. On refusal the lazily computed refill is
    /// still persisted so it is not recomputed from a stale instant later.
    pub async fn consume(&self, key: &K, cost: u32) -> bool {
        let entry = {
            let mut entries = self.entries.write().await;
            let capacity = self.capacity;
            Arc::clone(entries.entry(key.clone()).or_insert_with(|| {
                Arc::new(Mutex::new(BucketEntry {
                    count: capacity,
                    refilled_at: Utc::now(),
                    last_access: Utc::now(),
                }))
            }))
        };

        let mut guard = entry.lock().await;
        let now = Utc::now();
        let refilled = self.refilled(guard.count, guard.refilled_at, now);
        guard.refilled_at = now;
        guard.last_access = now;
        if refilled >= f64::from(cost) {
            guard.count = refilled - f64::from(cost);
            true
        } else {
            guard.count = refilled;
            false
        }
    }

    /// Drops entries not touched within `max_idle`.
    pub async fn sweep(&self, max_idle: Duration) {
        let cutoff = Utc::now() - max_idle;
        let mut entries = self.entries.write().await;
        let mut keep = HashMap::with_capacity(entries.len());
        for (key, entry) in entries.drain() {
            let last_access = entry.lock().await.last_access;
            if last_access > cutoff {
                keep.insert(key, entry);
            }
        }
        *entries = keep;
    }
}

#[derive(Debug)]
struct ThrottleEntry {
    failure_index: usize,
    last_failure_at: DateTime<Utc>,
}

pub struct Throttler<K> {
    delays: Vec<u64>,
    entries: RwLock<HashMap<K, Arc<Mutex<ThrottleEntry>>>>,
}

impl<K> Throttler<K>
where
    K: Eq + Hash + Clone + Send + Sync,
{
    /// `delays` is an ascending table of required waits in seconds. Once the
    /// table is exhausted the last delay applies forever; nothing resets
    /// automatically.
    pub fn new(delays: Vec<u64>) -> Self {
        debug_assert!(!delays.is_empty());
        Self {
            delays,
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn required_delay(&self, failure_index: usize) -> u64 {
        self.delays[failure_index.min(self.delays.len() - 1)]
    }

    /// First attempt for a fresh key is admitted immediately; each admitted
    /// attempt arms the next delay in the table. An attempt arriving before
    /// the armed delay has elapsed is rejected without mutating state.
    pub async fn consume(&self, key: &K) -> bool {
        let entry = {
            let mut entries = self.entries.write().await;
            match entries.get(key) {
                Some(entry) => Arc::clone(entry),
                None => {
                    entries.insert(
                        key.clone(),
                        Arc::new(Mutex::new(ThrottleEntry {
                            failure_index: 1,
                            last_failure_at: Utc::now(),
                        })),
                    );
                    return true;
                }
            }
        };

        let mut guard = entry.lock().await;
        let now = Utc::now();
        let required = self.required_delay(guard.failure_index) as f64;
        if elapsed_seconds(guard.last_failure_at, now) < required {
            return false;
        }
        guard.failure_index = (guard.failure_index + 1).min(self.delays.len() - 1);
        guard.last_failure_at = now;
        true
    }

    /// Deletes the key's entry entirely; the next consume behaves like a
    /// first attempt.
    pub async fn reset(&self, key: &K) {
        self.entries.write().await.remove(key);
    }

    /// Drops entries whose last failure is older than `max_idle`.
    pub async fn sweep(&self, max_idle: Duration) {
        let cutoff = Utc::now() - max_idle;
        let mut entries = self.entries.write().await;
        let mut keep = HashMap::with_capacity(entries.len());
        for (key, entry) in entries.drain() {
            let last = entry.lock().await.last_failure_at;
            if last > cutoff {
                keep.insert(key, entry);
            }
        }
        *entries = keep;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{sleep, Duration as TokioDuration};

    #[tokio::test]
    async fn test_bucket_exhausts_then_refills() {
        let bucket = RefillingTokenBucket::new(3, 0.3);
        let key = "10.0.0.1".to_string();

        for _ in 0..3 {
            assert!(bucket.consume(&key, 1).await);
        }
        assert!(!bucket.consume(&key, 1).await);

        // one refill interval restores one token
        sleep(TokioDuration::from_millis(350)).await;
        assert!(bucket.consume(&key, 1).await);
        assert!(!bucket.consume(&key, 1).await);
    }

    #[tokio::test]
    async fn test_check_does_not_deduct_or_create() {
        let bucket = RefillingTokenBucket::new(2, 60.0);
        let key = "user-1".to_string();

        // absent key behaves as a full bucket
        assert!(bucket.check(&key, 2).await);
        assert!(!bucket.check(&key, 3).await);

        assert!(bucket.consume(&key, 1).await);
        assert!(bucket.check(&key, 1).await);
        // repeated checks never spend tokens
        assert!(bucket.check(&key, 1).await);
        assert!(bucket.consume(&key, 1).await);
        assert!(!bucket.consume(&key, 1).await);
    }

    #[tokio::test]
    async fn test_bucket_never_exceeds_capacity() {
        let bucket = RefillingTokenBucket::new(2, 0.05);
        let key = "k".to_string();
        assert!(bucket.consume(&key, 1).await);
        // long idle: refill clamps at capacity, not beyond
        sleep(TokioDuration::from_millis(500)).await;
        assert!(bucket.consume(&key, 2).await);
        assert!(!bucket.check(&key, 3).await);
    }

    #[tokio::test]
    async fn test_throttler_backoff_sequence() {
        let throttler = Throttler::new(vec![0, 1, 2, 4, 8, 16]);
        let key = "user-9".to_string();

        // fresh key is admitted immediately
        assert!(throttler.consume(&key).await);
        // second attempt within 1s is rejected without mutation
        assert!(!throttler.consume(&key).await);
        assert!(!throttler.consume(&key).await);

        sleep(TokioDuration::from_millis(1100)).await;
        assert!(throttler.consume(&key).await);
        // required delay has advanced to 2s
        sleep(TokioDuration::from_millis(1100)).await;
        assert!(!throttler.consume(&key).await);
    }

    #[tokio::test]
    async fn test_throttler_reset_restores_first_attempt() {
        let throttler = Throttler::new(vec![0, 1, 2]);
        let key = "user-3".to_string();

        assert!(throttler.consume(&key).await);
        assert!(!throttler.consume(&key).await);

        throttler.reset(&key).await;
        assert!(throttler.consume(&key).await);
    }

    #[tokio::test]
    async fn test_throttler_delay_plateaus() {
        let throttler = Throttler::new(vec![0, 0, 0]);
        let key = "user-4".to_string();
        // index clamps at the table end instead of running off it
        for _ in 0..10 {
            assert!(throttler.consume(&key).await);
        }
    }

    #[tokio::test]
    async fn test_sweep_evicts_idle_entries() {
        let bucket = RefillingTokenBucket::new(1, 600.0);
        let key = "1.2.3.4".to_string();
        assert!(bucket.consume(&key, 1).await);
        assert!(!bucket.consume(&key, 1).await);

        bucket.sweep(Duration::zero()).await;
        // entry is gone, so the key starts from a full bucket again
        assert!(bucket.consume(&key, 1).await);

        let throttler = Throttler::new(vec![0, 300]);
        let tkey = "user-5".to_string();
        assert!(throttler.consume(&tkey).await);
        assert!(!throttler.consume(&tkey).await);
        throttler.sweep(Duration::zero()).await;
        assert!(throttler.consume(&tkey).await);
    }

    #[tokio::test]
    async fn test_same_key_consumes_are_linearized() {
        let bucket = Arc::new(RefillingTokenBucket::new(50, 3600.0));
        let key = "contended".to_string();

        let mut handles = Vec::new();
        for _ in 0..100 {
            let bucket = Arc::clone(&bucket);
            let key = key.clone();
            handles.push(tokio::spawn(
                async move { bucket.consume(&key, 1).await },
            ));
        }
        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        // no double-spend: exactly capacity admissions
        assert_eq!(admitted, 50);
    }
}
