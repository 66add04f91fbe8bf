//! Named cache registry.
//!
//! Subsystems look caches up by name; operators size them from
//! configuration without knowing the key/value types involved. The first
//! `get_cache` call for a name fixes its types; later calls must match.

use std::any::Any;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use tracing::debug;

use forge_cache::AsyncLruCache;

pub const DEFAULT_CACHE_SIZE: usize = 1;

struct Entry {
    cache: Box<dyn Any + Send + Sync>,
    set_max_size: Box<dyn Fn(usize) + Send + Sync>,
}

/// Registry of named [`AsyncLruCache`] instances with configured sizes.
pub struct CacheManager {
    sizes: Mutex<HashMap<String, usize>>,
    caches: Mutex<HashMap<String, Entry>>,
}

impl Default for CacheManager {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheManager {
    pub fn new() -> Self {
        Self {
            sizes: Mutex::new(HashMap::new()),
            caches: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch the cache registered under `name`, creating it on first use
    /// with the configured size (or [`DEFAULT_CACHE_SIZE`]).
    ///
    /// # Panics
    ///
    /// Panics if `name` was previously fetched with different key or value
    /// types; cache names are global and their types are part of the
    /// contract.
    pub fn get_cache<K, V>(&self, name: &str) -> Arc<AsyncLruCache<K, V>>
    where
        K: Eq + Hash + Clone + Send + Sync + 'static,
        V: Send + Sync + 'static,
    {
        let mut caches = self.caches.lock().unwrap();
        if let Some(entry) = caches.get(name) {
            return entry
                .cache
                .downcast_ref::<Arc<AsyncLruCache<K, V>>>()
                .unwrap_or_else(|| panic!("cache {name:?} already registered with other types"))
                .clone();
        }

        let size = self
            .sizes
            .lock()
            .unwrap()
            .get(name)
            .copied()
            .unwrap_or(DEFAULT_CACHE_SIZE);
        debug!(cache = %name, size, "creating cache");
        let cache = Arc::new(AsyncLruCache::<K, V>::new(size));
        let sizer = {
            let cache = Arc::clone(&cache);
            Box::new(move |size| cache.set_max_size(size))
        };
        caches.insert(
            name.to_string(),
            Entry {
                cache: Box::new(Arc::clone(&cache)),
                set_max_size: sizer,
            },
        );
        cache
    }

    /// Configure the size for `name`. Applies immediately if the cache
    /// already exists, otherwise on first `get_cache`.
    pub fn set_cache_size(&self, name: &str, size: usize) {
        self.sizes.lock().unwrap().insert(name.to_string(), size);
        if let Some(entry) = self.caches.lock().unwrap().get(name) {
            (entry.set_max_size)(size);
        }
    }

    /// Names of the caches created so far.
    pub fn cache_names(&self) -> Vec<String> {
        self.caches.lock().unwrap().keys().cloned().collect()
    }
}
