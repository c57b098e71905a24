//! TTL memoization for async producers.

use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;

use crate::error::AppError;

/// Caches successful results of an async producer per key.
///
/// Concurrent lookups of the same missing key share one producer call.
/// Errors are returned to every waiter and are not cached.
#[derive(Clone)]
pub struct Memoized<K, V> {
    cache: Cache<K, V>,
}

impl<K, V> Memoized<K, V>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(max_capacity: u64, ttl: Duration) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(max_capacity)
                .time_to_live(ttl)
                .build(),
        }
    }

    /// Return the cached value for `key`, or run `producer` and cache its
    /// result on success.
    pub async fn get_or_try_insert<F, Fut>(&self, key: K, producer: F) -> Result<V, AppError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, AppError>>,
    {
        self.cache
            .try_get_with(key, producer())
            .await
            .map_err(|e: Arc<AppError>| AppError::clone(&e))
    }

    pub async fn get(&self, key: &K) -> Option<V> {
        self.cache.get(key).await
    }

    pub async fn invalidate(&self, key: &K) {
        self.cache.invalidate(key).await;
    }

    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }
}
