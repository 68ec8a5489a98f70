//! Process-wide quote cache with TTL, LRU eviction and single-flight loads.
//!
//! During a strategy execution many workers request the same reference
//! roster or the same ticker's fundamentals at overlapping times. The cache
//! collapses concurrent misses for one key into a single upstream call whose
//! result is shared with every waiter. A failed load is never cached; the
//! next caller retries.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, trace};

use super::provider::ProviderError;

// ============================================================================
// Cache Key
// ============================================================================

/// Cache key: (operation, arguments tuple) rendered as a stable string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Build a key from an operation name and its argument tuple.
    pub fn new(op: &str, args: impl AsRef<str>) -> Self {
        Self(format!("{}:{}", op, args.as_ref()))
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Slots
// ============================================================================

type CacheValue = Arc<dyn Any + Send + Sync>;

enum Slot {
    /// A published value
    Ready {
        value: CacheValue,
        inserted_at: Instant,
        last_used: u64,
    },
    /// A load in progress; waiters subscribe to the channel
    Pending { done: watch::Receiver<bool> },
}

// ============================================================================
// Quote Cache
// ============================================================================

/// Keyed TTL cache with size-bounded LRU eviction and single-flight loads.
pub struct QuoteCache {
    entries: Mutex<HashMap<CacheKey, Slot>>,
    capacity: usize,
    use_counter: AtomicU64,
    hits: AtomicU64,
    loads: AtomicU64,
    coalesced: AtomicU64,
    evictions: AtomicU64,
}

impl QuoteCache {
    /// Create a cache bounded to `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            use_counter: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            loads: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Fetch a value, loading it through `loader` on a miss.
    ///
    /// - A fresh entry is returned directly.
    /// - A concurrent load for the same key is awaited and its result shared.
    /// - Otherwise `loader` runs; success is published to waiters and stored,
    ///   failure is returned to this caller only and the slot is cleared so
    ///   the next caller retries.
    pub async fn get_with<T, F, Fut>(
        &self,
        key: CacheKey,
        ttl: Duration,
        loader: F,
    ) -> Result<T, ProviderError>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, ProviderError>>,
    {
        loop {
            enum Action {
                Hit(CacheValue),
                Wait(watch::Receiver<bool>),
                Load(watch::Sender<bool>),
            }

            let action = {
                let mut map = self.entries.lock().expect("cache lock poisoned");
                let usable = match map.get_mut(&key) {
                    Some(Slot::Ready {
                        value,
                        inserted_at,
                        last_used,
                    }) if inserted_at.elapsed() < ttl => {
                        *last_used = self.use_counter.fetch_add(1, Ordering::Relaxed);
                        Some(Action::Hit(Arc::clone(value)))
                    }
                    Some(Slot::Pending { done }) if done.has_changed().is_ok() => {
                        Some(Action::Wait(done.clone()))
                    }
                    // Absent, expired, or an abandoned in-flight slot
                    _ => None,
                };
                match usable {
                    Some(action) => action,
                    None => {
                        // This caller becomes the loader
                        let (tx, rx) = watch::channel(false);
                        map.insert(key.clone(), Slot::Pending { done: rx });
                        Action::Load(tx)
                    }
                }
            };

            match action {
                Action::Hit(value) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    trace!(key = %key, "Cache hit");
                    return downcast::<T>(&key, value);
                }
                Action::Wait(mut rx) => {
                    self.coalesced.fetch_add(1, Ordering::Relaxed);
                    trace!(key = %key, "Waiting on in-flight load");
                    // Err means the loader vanished; either way re-check
                    let _ = rx.changed().await;
                }
                Action::Load(tx) => {
                    self.loads.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %key, "Cache miss, invoking loader");

                    let result = loader().await;

                    {
                        let mut map = self.entries.lock().expect("cache lock poisoned");
                        match &result {
                            Ok(value) => {
                                map.insert(
                                    key.clone(),
                                    Slot::Ready {
                                        value: Arc::new(value.clone()),
                                        inserted_at: Instant::now(),
                                        last_used: self
                                            .use_counter
                                            .fetch_add(1, Ordering::Relaxed),
                                    },
                                );
                                self.evict_over_capacity(&mut map);
                            }
                            Err(_) => {
                                map.remove(&key);
                            }
                        }
                    }

                    let _ = tx.send(true);
                    return result;
                }
            }
        }
    }

    /// Drop a specific key.
    pub fn invalidate(&self, key: &CacheKey) {
        let mut map = self.entries.lock().expect("cache lock poisoned");
        map.remove(key);
    }

    /// Drop everything.
    pub fn clear(&self) {
        let mut map = self.entries.lock().expect("cache lock poisoned");
        map.clear();
    }

    /// Cache statistics snapshot.
    pub fn stats(&self) -> CacheStats {
        let entries = self.entries.lock().expect("cache lock poisoned").len();
        CacheStats {
            entries,
            capacity: self.capacity,
            hits: self.hits.load(Ordering::Relaxed),
            loads: self.loads.load(Ordering::Relaxed),
            coalesced_waits: self.coalesced.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    /// Evict least-recently-used ready entries until within capacity.
    ///
    /// In-flight slots are never evicted.
    fn evict_over_capacity(&self, map: &mut HashMap<CacheKey, Slot>) {
        while map.len() > self.capacity {
            let victim = map
                .iter()
                .filter_map(|(k, slot)| match slot {
                    Slot::Ready { last_used, .. } => Some((k.clone(), *last_used)),
                    Slot::Pending { .. } => None,
                })
                .min_by_key(|(_, used)| *used)
                .map(|(k, _)| k);

            match victim {
                Some(k) => {
                    map.remove(&k);
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                }
                None => break,
            }
        }
    }
}

fn downcast<T: Clone + Send + Sync + 'static>(
    key: &CacheKey,
    value: CacheValue,
) -> Result<T, ProviderError> {
    value
        .downcast_ref::<T>()
        .cloned()
        .ok_or_else(|| ProviderError::Malformed(format!("cache type mismatch for key {}", key)))
}

/// Cache statistics.
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub loads: u64,
    pub coalesced_waits: u64,
    pub evictions: u64,
}

// ============================================================================
// Tests
// ============================================================================
