//! Static asset snapshot tier.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;

use crate::cache::driver::{CacheDriver, DriverError, DriverKind};
use crate::cache::keys::CacheKey;
use crate::cache::snapshot::{ASSET_EXTENSIONS, SnapshotStore};

/// Minified CSS/JS snapshots under `<root>/css` and `<root>/js`.
///
/// Assets are addressed by content hash rather than by page key, so the keyed
/// operations are no-ops. Producing the files belongs to the minifier.
pub struct AssetSnapshotDriver {
    store: SnapshotStore,
}

impl AssetSnapshotDriver {
    pub fn new(store: SnapshotStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl CacheDriver for AssetSnapshotDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::AssetSnapshot
    }

    async fn initialize(&self) -> Result<(), DriverError> {
        for extension in ASSET_EXTENSIONS {
            let dir = self.store.root().join(extension);
            fs::create_dir_all(&dir).await.map_err(|err| {
                DriverError::init(format!("cannot create `{}`: {err}", dir.display()))
            })?;
        }
        Ok(())
    }

    async fn get(&self, _key: &CacheKey) -> Result<Option<Bytes>, DriverError> {
        Ok(None)
    }

    async fn set(&self, _key: &CacheKey, _value: Bytes) -> Result<(), DriverError> {
        Ok(())
    }

    async fn delete(&self, _key: &CacheKey) -> Result<(), DriverError> {
        Ok(())
    }

    async fn clear(&self) -> Result<(), DriverError> {
        self.store.wipe_assets().await?;
        Ok(())
    }
}
