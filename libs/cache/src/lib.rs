//! Bounded async LRU cache with a weak-reference secondary index.
//!
//! [`AsyncLruCache`] maps opaque keys to shared immutable values. Lookups
//! resolve in order:
//!
//! 1. Hit in the bounded cache.
//! 2. Hit in the weak table: a value evicted from the bounded cache is still
//!    served cheaply as long as something else in the process holds it.
//! 3. A fetch for the key is already in flight: attach to it instead of
//!    fetching a second time.
//! 4. Run the caller's miss function and fan its result out to every waiter.
//!
//! Eviction is an approximate LRU: a recency queue that may contain duplicate
//! keys, per-key reference counts, and lazy compaction once the queue grows
//! far beyond the cache bound.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use thiserror::Error;
use tokio::sync::oneshot;
use tracing::trace;

/// Queue compaction threshold, as a multiple of `max_size`.
const QUEUE_SIZE_FACTOR: usize = 10;

/// Failure of a cache miss function, shared by every waiter on the fetch.
#[derive(Debug, Clone, Error)]
#[error("cache fetch failed: {0}")]
pub struct FetchError(Arc<anyhow::Error>);

impl FetchError {
    /// The underlying miss-function error.
    pub fn source_error(&self) -> &anyhow::Error {
        &self.0
    }
}

/// Monotonic hit/miss counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Exact hits in the bounded cache.
    pub hits: u64,
    /// Hits served by upgrading a weak reference.
    pub refhits: u64,
    /// Miss-function invocations.
    pub misses: u64,
}

type Waiter<V> = oneshot::Sender<Result<Arc<V>, FetchError>>;

struct Inner<K, V> {
    max_size: usize,
    /// Recency queue; may contain duplicate keys, deduplicated lazily.
    queue: VecDeque<K>,
    /// Bounded strong-reference cache.
    cache: HashMap<K, Arc<V>>,
    /// Unbounded secondary index; entries die with their last strong holder.
    weakrefs: HashMap<K, Weak<V>>,
    /// Number of queue entries per key.
    refcount: HashMap<K, usize>,
    /// Waiters attached to in-flight fetches.
    concurrent: HashMap<K, Vec<Waiter<V>>>,
}

/// Bounded cache coalescing concurrent misses on the same key.
pub struct AsyncLruCache<K, V> {
    inner: Arc<Mutex<Inner<K, V>>>,
    hits: AtomicU64,
    refhits: AtomicU64,
    misses: AtomicU64,
}

impl<K, V> AsyncLruCache<K, V>
where
    K: Clone + Eq + Hash + Send + 'static,
    V: Send + Sync + 'static,
{
    /// Create a cache bounded to `max_size` entries. `max_size` must be >= 1.
    pub fn new(max_size: usize) -> Self {
        assert!(max_size >= 1, "cache must hold at least one entry");
        Self {
            inner: Arc::new(Mutex::new(Inner {
                max_size,
                queue: VecDeque::new(),
                cache: HashMap::new(),
                weakrefs: HashMap::new(),
                refcount: HashMap::new(),
                concurrent: HashMap::new(),
            })),
            hits: AtomicU64::new(0),
            refhits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Fetch `key`, running `miss` only if no value and no in-flight fetch
    /// exists for it. All concurrent callers for the same key receive the
    /// same value (or the same error; errors are never cached).
    ///
    /// The fetch runs as a detached task and the initiating caller waits on
    /// it like everyone else, so dropping a caller mid-`get` neither cancels
    /// the fetch nor strands the other waiters.
    pub async fn get<F, Fut>(&self, key: K, miss: F) -> Result<Arc<V>, FetchError>
    where
        F: FnOnce(K) -> Fut,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        let (rx, leading) = {
            let mut inner = self.inner.lock().unwrap();

            if let Some(value) = inner.cache.get(&key).cloned() {
                self.hits.fetch_add(1, Ordering::Relaxed);
                inner.bump(&key);
                return Ok(value);
            }

            if let Some(value) = inner.weakrefs.get(&key).and_then(Weak::upgrade) {
                self.refhits.fetch_add(1, Ordering::Relaxed);
                inner.cache.insert(key.clone(), Arc::clone(&value));
                inner.bump(&key);
                inner.purge();
                return Ok(value);
            }

            let (tx, rx) = oneshot::channel();
            match inner.concurrent.get_mut(&key) {
                Some(waiters) => {
                    waiters.push(tx);
                    (rx, false)
                }
                None => {
                    inner.concurrent.insert(key.clone(), vec![tx]);
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    (rx, true)
                }
            }
        };

        if leading {
            let fetch = miss(key.clone());
            let in_flight = InFlight {
                inner: Arc::clone(&self.inner),
                key: Some(key),
            };
            tokio::spawn(async move {
                let outcome = fetch.await;
                in_flight.complete(outcome);
            });
        }

        rx.await
            .unwrap_or_else(|_| Err(FetchError(Arc::new(anyhow::anyhow!("fetch abandoned")))))
    }

    /// Seed an entry directly, bypassing the miss path.
    pub fn put(&self, key: K, value: Arc<V>) {
        let mut inner = self.inner.lock().unwrap();
        inner.store(key, value);
    }

    /// Change the cache bound, evicting immediately if it shrank.
    pub fn set_max_size(&self, max_size: usize) {
        assert!(max_size >= 1, "cache must hold at least one entry");
        let mut inner = self.inner.lock().unwrap();
        inner.max_size = max_size;
        inner.purge();
    }

    /// Number of entries currently held strongly.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().cache.len()
    }

    /// True if the bounded cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `key` is present in the bounded cache (not the weak table).
    pub fn contains(&self, key: &K) -> bool {
        self.inner.lock().unwrap().cache.contains_key(key)
    }

    /// Hit/refhit/miss counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            refhits: self.refhits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

impl<K, V> Inner<K, V>
where
    K: Clone + Eq + Hash,
{
    /// Insert into both indexes and enforce the bound.
    fn store(&mut self, key: K, value: Arc<V>) {
        self.weakrefs.insert(key.clone(), Arc::downgrade(&value));
        self.cache.insert(key.clone(), value);
        self.bump(&key);
        self.purge();
    }

    /// Record a use of `key` in the recency queue.
    fn bump(&mut self, key: &K) {
        self.queue.push_back(key.clone());
        *self.refcount.entry(key.clone()).or_insert(0) += 1;
        if self.queue.len() > self.max_size.saturating_mul(QUEUE_SIZE_FACTOR) {
            self.compact();
        }
    }

    /// Evict oldest entries until the bound holds. Duplicate queue entries
    /// only decrement the refcount; the key survives until it reaches zero.
    fn purge(&mut self) {
        while self.cache.len() > self.max_size {
            let Some(key) = self.queue.pop_front() else {
                break;
            };
            let Some(count) = self.refcount.get_mut(&key) else {
                continue;
            };
            *count -= 1;
            if *count == 0 {
                self.refcount.remove(&key);
                if self.cache.remove(&key).is_some() {
                    trace!("evicted cache entry");
                }
            }
        }
    }

    /// Drop duplicate queue entries, preserving most-recent order, and prune
    /// dead weak references while we are at it.
    fn compact(&mut self) {
        let mut seen: HashSet<K> = HashSet::with_capacity(self.cache.len());
        let mut deduped: VecDeque<K> = VecDeque::with_capacity(self.refcount.len());
        while let Some(key) = self.queue.pop_back() {
            if seen.insert(key.clone()) {
                deduped.push_front(key);
            }
        }
        for count in self.refcount.values_mut() {
            *count = 1;
        }
        self.queue = deduped;
        self.weakrefs.retain(|_, weak| weak.strong_count() > 0);
    }
}

/// Bookkeeping handle for one in-flight fetch. `complete` publishes the
/// outcome to every waiter; if the fetch task dies first (panic, runtime
/// teardown), the drop clears the entry and fails the waiters so the key
/// cannot stay wedged.
struct InFlight<K: Eq + Hash, V> {
    inner: Arc<Mutex<Inner<K, V>>>,
    key: Option<K>,
}

impl<K: Clone + Eq + Hash, V> InFlight<K, V> {
    fn complete(mut self, outcome: anyhow::Result<V>) {
        let Some(key) = self.key.take() else { return };
        let (waiters, result) = {
            let mut inner = self.inner.lock().unwrap();
            let waiters = inner.concurrent.remove(&key).unwrap_or_default();
            match outcome {
                Ok(value) => {
                    let value = Arc::new(value);
                    inner.store(key, Arc::clone(&value));
                    (waiters, Ok(value))
                }
                Err(e) => (waiters, Err(FetchError(Arc::new(e)))),
            }
        };
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }
}

impl<K: Eq + Hash, V> Drop for InFlight<K, V> {
    fn drop(&mut self) {
        let Some(key) = self.key.take() else { return };
        let waiters = {
            let mut inner = self.inner.lock().unwrap();
            inner.concurrent.remove(&key).unwrap_or_default()
        };
        let err = FetchError(Arc::new(anyhow::anyhow!("fetch abandoned")));
        for waiter in waiters {
            let _ = waiter.send(Err(err.clone()));
        }
    }
}
