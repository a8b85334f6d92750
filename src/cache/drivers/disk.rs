//! Disk snapshot tier.

use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;
use tracing::debug;

use crate::cache::device::DeviceClass;
use crate::cache::driver::{CacheDriver, DriverError, DriverKind};
use crate::cache::keys::CacheKey;
use crate::cache::snapshot::SnapshotStore;

/// Page snapshots under `<root>/html`.
///
/// `delete` removes both device variants of the page: a content change
/// invalidates every rendering of it.
pub struct DiskSnapshotDriver {
    store: SnapshotStore,
    lifetime: Duration,
}

impl DiskSnapshotDriver {
    pub fn new(store: SnapshotStore, lifetime: Duration) -> Self {
        Self { store, lifetime }
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }
}

#[async_trait]
impl CacheDriver for DiskSnapshotDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::DiskSnapshot
    }

    async fn initialize(&self) -> Result<(), DriverError> {
        let root = self.store.pages_root();
        fs::create_dir_all(&root).await.map_err(|err| {
            DriverError::init(format!(
                "cannot create snapshot directory `{}`: {err}",
                root.display()
            ))
        })
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<Bytes>, DriverError> {
        let snapshot = self.store.read_page(key).await?;
        Ok(snapshot
            .filter(|snapshot| snapshot.is_fresh(self.lifetime, SystemTime::now()))
            .map(|snapshot| snapshot.body))
    }

    async fn set(&self, key: &CacheKey, value: Bytes) -> Result<(), DriverError> {
        self.store.write_page(key, value).await?;
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<(), DriverError> {
        for device in [DeviceClass::Desktop, DeviceClass::Mobile] {
            self.store.delete_page(&key.with_device(device)).await?;
        }
        debug!(key = %key, "page snapshots deleted");
        Ok(())
    }

    async fn clear(&self) -> Result<(), DriverError> {
        self.store.wipe_pages().await?;
        Ok(())
    }
}
