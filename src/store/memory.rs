//! In-process counter store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::{ttl_millis, CounterStore, StoreError, StoreResult};
use crate::ratelimit::{BucketState, Clock, SystemClock};

/// Value held under a key.
#[derive(Debug, Clone, PartialEq)]
enum Value {
    Counter(u64),
    Bucket(BucketState),
}

/// A stored value with its optional expiry.
#[derive(Debug, Clone)]
struct Slot {
    value: Value,
    /// Expiry in milliseconds since the Unix epoch
    expires_at_ms: Option<i64>,
}

impl Slot {
    fn is_live(&self, now_ms: i64) -> bool {
        self.expires_at_ms.map_or(true, |at| at > now_ms)
    }
}

/// Counter store backed by a sharded in-process map.
///
/// Each read-modify-write runs inside a dashmap entry guard, so updates to
/// one key are serialized by that key's shard lock. The guard is never held
/// across an `.await`. Expired entries behave as absent and are removed by
/// [`purge_expired`](Self::purge_expired) or the background sweeper.
pub struct MemoryStore {
    entries: DashMap<String, Slot>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    /// Create an empty store using the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty store that reads time from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Number of stored keys, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every key.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Drop expired entries and return how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let before = self.entries.len();
        self.entries.retain(|_, slot| slot.is_live(now));
        before.saturating_sub(self.entries.len())
    }

    /// Spawn a task that purges expired entries every `interval`.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = store.purge_expired();
                if removed > 0 {
                    debug!(removed = removed, remaining = store.len(), "Purged expired counters");
                }
            }
        })
    }

    fn expiry_from(&self, now_ms: i64, ttl: Duration) -> i64 {
        now_ms.saturating_add(ttl_millis(ttl) as i64)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::Backend(format!(
        "WRONGTYPE operation against key '{}' holding the wrong kind of value",
        key
    ))
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn incr(&self, key: &str) -> StoreResult<u64> {
        let now = self.clock.now_millis();
        let mut slot = self.entries.entry(key.to_string()).or_insert_with(|| Slot {
            value: Value::Counter(0),
            expires_at_ms: None,
        });

        let count = if slot.is_live(now) {
            match slot.value {
                Value::Counter(count) => count + 1,
                Value::Bucket(_) => return Err(wrong_type(key)),
            }
        } else {
            slot.expires_at_ms = None;
            1
        };
        slot.value = Value::Counter(count);

        trace!(key = %key, count = count, "Incremented counter");
        Ok(count)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        let now = self.clock.now_millis();
        if let Some(mut slot) = self.entries.get_mut(key) {
            if slot.is_live(now) {
                slot.expires_at_ms = Some(self.expiry_from(now, ttl));
            }
        }
        Ok(())
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        let now = self.clock.now_millis();
        let ttl = self.entries.get(key).and_then(|slot| {
            if !slot.is_live(now) {
                return None;
            }
            slot.expires_at_ms
                .map(|at| Duration::from_millis(at.saturating_sub(now).max(0) as u64))
        });
        Ok(ttl)
    }

    async fn load_bucket(&self, key: &str) -> StoreResult<Option<BucketState>> {
        let now = self.clock.now_millis();
        match self.entries.get(key) {
            Some(slot) if slot.is_live(now) => match &slot.value {
                Value::Bucket(state) => Ok(Some(state.clone())),
                Value::Counter(_) => Err(wrong_type(key)),
            },
            _ => Ok(None),
        }
    }

    async fn swap_bucket(
        &self,
        key: &str,
        expected: Option<&BucketState>,
        next: &BucketState,
        ttl: Duration,
    ) -> StoreResult<bool> {
        let now = self.clock.now_millis();
        let replacement = Slot {
            value: Value::Bucket(next.clone()),
            expires_at_ms: Some(self.expiry_from(now, ttl)),
        };

        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let current = {
                    let slot = occupied.get();
                    if !slot.is_live(now) {
                        None
                    } else {
                        match &slot.value {
                            Value::Bucket(state) => Some(state),
                            Value::Counter(_) => return Err(wrong_type(key)),
                        }
                    }
                };
                if current != expected {
                    return Ok(false);
                }
                occupied.insert(replacement);
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                if expected.is_some() {
                    return Ok(false);
                }
                vacant.insert(replacement);
                Ok(true)
            }
        }
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::ManualClock;
    use crate::store::MAX_TTL;

    fn store_with_clock() -> (MemoryStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        (MemoryStore::with_clock(clock.clone()), clock)
    }

    #[tokio::test]
    async fn test_incr_starts_at_one() {
        let store = MemoryStore::new();
        assert_eq!(store.incr("k").await.unwrap(), 1);
        assert_eq!(store.incr("k").await.unwrap(), 2);
        assert_eq!(store.incr("other").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_ttl_missing_and_without_expiry() {
        let store = MemoryStore::new();
        assert_eq!(store.ttl("missing").await.unwrap(), None);

        store.incr("k").await.unwrap();
        assert_eq!(store.ttl("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_expiry_resets_counter() {
        let (store, clock) = store_with_clock();

        store.incr("k").await.unwrap();
        store.expire("k", Duration::from_secs(60)).await.unwrap();
        store.incr("k").await.unwrap();
        assert_eq!(store.ttl("k").await.unwrap(), Some(Duration::from_secs(60)));

        clock.advance(Duration::from_secs(20));
        assert_eq!(store.ttl("k").await.unwrap(), Some(Duration::from_secs(40)));

        clock.advance(Duration::from_secs(40));
        assert_eq!(store.ttl("k").await.unwrap(), None);
        assert_eq!(store.incr("k").await.unwrap(), 1);
        // A fresh counter carries no expiry until one is set.
        assert_eq!(store.ttl("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_huge_ttl_is_clamped_not_wrapped() {
        let (store, _clock) = store_with_clock();

        store.incr("k").await.unwrap();
        store.expire("k", Duration::MAX).await.unwrap();
        assert_eq!(store.ttl("k").await.unwrap(), Some(MAX_TTL));
        assert_eq!(store.incr("k").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_expire_on_missing_key_is_noop() {
        let store = MemoryStore::new();
        store.expire("missing", Duration::from_secs(5)).await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_swap_bucket_compare_and_swap() {
        let store = MemoryStore::new();
        let first = BucketState::new(4.0, 1_000);
        let second = BucketState::new(3.0, 2_000);
        let ttl = Duration::from_secs(10);

        assert!(store.swap_bucket("b", None, &first, ttl).await.unwrap());
        // Key now exists, so an "absent" expectation loses.
        assert!(!store.swap_bucket("b", None, &second, ttl).await.unwrap());
        // Stale expectation loses.
        assert!(!store.swap_bucket("b", Some(&second), &second, ttl).await.unwrap());

        assert!(store.swap_bucket("b", Some(&first), &second, ttl).await.unwrap());
        assert_eq!(store.load_bucket("b").await.unwrap(), Some(second));
    }

    #[tokio::test]
    async fn test_expired_bucket_is_absent() {
        let (store, clock) = store_with_clock();
        let state = BucketState::new(1.0, 0);

        store.swap_bucket("b", None, &state, Duration::from_secs(5)).await.unwrap();
        clock.advance(Duration::from_secs(5));

        assert_eq!(store.load_bucket("b").await.unwrap(), None);
        assert!(store.swap_bucket("b", None, &state, Duration::from_secs(5)).await.unwrap());
    }

    #[tokio::test]
    async fn test_wrong_type_is_backend_error() {
        let store = MemoryStore::new();
        store.incr("k").await.unwrap();

        let err = store.load_bucket("k").await.unwrap_err();
        assert!(matches!(err, StoreError::Backend(_)));
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let (store, clock) = store_with_clock();

        store.incr("short").await.unwrap();
        store.expire("short", Duration::from_secs(1)).await.unwrap();
        store.incr("long").await.unwrap();
        store.expire("long", Duration::from_secs(60)).await.unwrap();
        store.incr("forever").await.unwrap();

        clock.advance(Duration::from_secs(2));
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_incr_loses_no_updates() {
        let store = Arc::new(MemoryStore::new());

        let tasks: Vec<_> = (0..64)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.incr("shared").await.unwrap() })
            })
            .collect();

        let mut seen: Vec<u64> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        seen.sort_unstable();

        assert_eq!(seen, (1..=64).collect::<Vec<u64>>());
    }
}
