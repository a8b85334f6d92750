//! In-memory object cache tier.

use std::sync::RwLock;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use lru::LruCache;
use metrics::counter;

use crate::cache::config::CacheConfig;
use crate::cache::driver::{CacheDriver, DriverError, DriverKind};
use crate::cache::keys::CacheKey;
use crate::cache::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::drivers::object";
const METRIC_OBJECT_HIT: &str = "tierguard_object_cache_hit_total";
const METRIC_OBJECT_MISS: &str = "tierguard_object_cache_miss_total";
const METRIC_OBJECT_EVICT: &str = "tierguard_object_cache_evict_total";

#[derive(Debug, Clone)]
struct Entry {
    body: Bytes,
    stored_at: SystemTime,
}

/// Bounded LRU of rendered bodies keyed by [`CacheKey::digest`].
///
/// The page cache gateway reads it ahead of the disk snapshots.
pub struct ObjectCacheDriver {
    entries: RwLock<LruCache<String, Entry>>,
}

impl ObjectCacheDriver {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: RwLock::new(LruCache::new(config.object_cache_limit_non_zero())),
        }
    }

    pub fn len(&self) -> usize {
        rw_read(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Body and insertion time for `key`, counted as a hit or a miss.
    pub fn lookup(&self, key: &CacheKey) -> Option<(Bytes, SystemTime)> {
        // LRU lookups promote the entry, hence the write lock.
        let hit = rw_write(&self.entries, SOURCE, "lookup")
            .get(&key.digest())
            .map(|entry| (entry.body.clone(), entry.stored_at));
        match hit {
            Some(_) => counter!(METRIC_OBJECT_HIT).increment(1),
            None => counter!(METRIC_OBJECT_MISS).increment(1),
        }
        hit
    }
}

#[async_trait]
impl CacheDriver for ObjectCacheDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::ObjectCache
    }

    async fn initialize(&self) -> Result<(), DriverError> {
        Ok(())
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<Bytes>, DriverError> {
        Ok(self.lookup(key).map(|(body, _)| body))
    }

    async fn set(&self, key: &CacheKey, value: Bytes) -> Result<(), DriverError> {
        let digest = key.digest();
        let entry = Entry {
            body: value,
            stored_at: SystemTime::now(),
        };
        let evicted = rw_write(&self.entries, SOURCE, "set").push(digest.clone(), entry);
        if evicted.is_some_and(|(evicted_key, _)| evicted_key != digest) {
            counter!(METRIC_OBJECT_EVICT).increment(1);
        }
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<(), DriverError> {
        rw_write(&self.entries, SOURCE, "delete").pop(&key.digest());
        Ok(())
    }

    async fn clear(&self) -> Result<(), DriverError> {
        rw_write(&self.entries, SOURCE, "clear").clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use super::*;
    use crate::cache::device::DeviceClass;

    fn key(path: &str) -> CacheKey {
        CacheKey::new("example.com", path, DeviceClass::Desktop).unwrap()
    }

    #[tokio::test]
    async fn set_get_delete_clear() {
        let driver = ObjectCacheDriver::new(&CacheConfig::default());
        driver.set(&key("/a"), Bytes::from_static(b"a")).await.unwrap();
        driver.set(&key("/b"), Bytes::from_static(b"b")).await.unwrap();

        assert_eq!(driver.get(&key("/a")).await.unwrap(), Some(Bytes::from_static(b"a")));

        driver.delete(&key("/a")).await.unwrap();
        assert!(driver.get(&key("/a")).await.unwrap().is_none());
        assert_eq!(driver.len(), 1);

        driver.clear().await.unwrap();
        assert!(driver.is_empty());
    }

    #[tokio::test]
    async fn lru_eviction() {
        let config = CacheConfig {
            object_cache_limit: 2,
            ..Default::default()
        };
        let driver = ObjectCacheDriver::new(&config);

        driver.set(&key("/1"), Bytes::from_static(b"1")).await.unwrap();
        driver.set(&key("/2"), Bytes::from_static(b"2")).await.unwrap();
        driver.set(&key("/3"), Bytes::from_static(b"3")).await.unwrap();

        assert!(driver.get(&key("/1")).await.unwrap().is_none());
        assert!(driver.get(&key("/2")).await.unwrap().is_some());
        assert!(driver.get(&key("/3")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn lookup_reports_insertion_time() {
        let driver = ObjectCacheDriver::new(&CacheConfig::default());
        let before = SystemTime::now();
        driver.set(&key("/a"), Bytes::from_static(b"a")).await.unwrap();

        let (body, stored_at) = driver.lookup(&key("/a")).expect("entry");
        assert_eq!(body, Bytes::from_static(b"a"));
        assert!(stored_at >= before);
        assert!(driver.lookup(&key("/b")).is_none());
    }

    #[tokio::test]
    async fn recovers_from_poisoned_lock() {
        let driver = ObjectCacheDriver::new(&CacheConfig::default());
        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = driver.entries.write().expect("lock should be acquired");
            panic!("poison object cache");
        }));

        driver.set(&key("/a"), Bytes::from_static(b"a")).await.unwrap();
        assert!(driver.get(&key("/a")).await.unwrap().is_some());
    }
}
