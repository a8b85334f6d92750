//! Wiring of the cache engine from resolved settings.

use std::sync::Arc;

use tracing::info;

use crate::{
    cache::{
        CacheConfig, CacheManager, CacheTrigger, EdgeConfig, MirrorStore, NullCodeCache,
        NullMirrorStore, PageCacheGateway, RewriteRuleGenerator, RulesConfig, SignalBus,
        SnapshotStore,
        drivers::{
            AssetSnapshotDriver, DiskSnapshotDriver, EdgeAcceleratorDriver, HttpPurgeTransport,
            ObjectCacheDriver, PurgeTransport,
        },
    },
    config::Settings,
    infra::mirror::PostgresMirrorStore,
};

use super::error::AppError;

/// Every long-lived cache component, built once per process.
#[derive(Clone)]
pub struct CacheRuntime {
    pub manager: Arc<CacheManager>,
    pub trigger: CacheTrigger,
    pub gateway: Arc<PageCacheGateway>,
    pub edge: Option<Arc<EdgeAcceleratorDriver>>,
    pub rules: Arc<RewriteRuleGenerator>,
}

impl CacheRuntime {
    /// Register the tiers enabled in `settings`. Drivers are not initialized here.
    pub fn from_settings(
        settings: &Settings,
        mirror: Option<PostgresMirrorStore>,
    ) -> Result<Self, AppError> {
        let transport: Option<Arc<dyn PurgeTransport>> = if settings.cache.drivers.edge {
            let edge_config = EdgeConfig::from(&settings.edge);
            let transport: Arc<dyn PurgeTransport> = Arc::new(
                HttpPurgeTransport::new(&edge_config)
                    .map_err(|err| AppError::unexpected(err.to_string()))?,
            );
            Some(transport)
        } else {
            None
        };
        Ok(Self::assemble(settings, mirror, transport))
    }

    /// Same as [`CacheRuntime::from_settings`] with an explicit purge transport.
    pub fn assemble(
        settings: &Settings,
        mirror: Option<PostgresMirrorStore>,
        transport: Option<Arc<dyn PurgeTransport>>,
    ) -> Self {
        let config = CacheConfig::from(&settings.cache);
        let mirror: Arc<dyn MirrorStore> = match mirror {
            Some(store) => Arc::new(store),
            None => Arc::new(NullMirrorStore),
        };
        let manager = Arc::new(CacheManager::new(
            config.clone(),
            mirror,
            Arc::new(NullCodeCache),
            Arc::new(SignalBus::new()),
        ));

        let store = SnapshotStore::new(config.cache_root.clone());
        let toggles = &config.drivers;
        if toggles.disk {
            manager.add_driver(Arc::new(DiskSnapshotDriver::new(
                store.clone(),
                config.page_lifetime,
            )));
        }
        let object = if toggles.object {
            let object = Arc::new(ObjectCacheDriver::new(&config));
            manager.add_driver(object.clone());
            Some(object)
        } else {
            None
        };
        let edge = match (toggles.edge, transport) {
            (true, Some(transport)) => {
                let edge = Arc::new(EdgeAcceleratorDriver::new(
                    EdgeConfig::from(&settings.edge),
                    transport,
                ));
                manager.add_driver(edge.clone());
                Some(edge)
            }
            _ => None,
        };
        if toggles.assets {
            manager.add_driver(Arc::new(AssetSnapshotDriver::new(store)));
        }

        info!(
            disk = toggles.disk,
            object = object.is_some(),
            edge = edge.is_some(),
            assets = toggles.assets,
            root = %config.cache_root.display(),
            "cache drivers registered"
        );

        let gateway = match object {
            Some(object) => PageCacheGateway::new(config).with_object_cache(object),
            None => PageCacheGateway::new(config),
        };

        Self {
            trigger: CacheTrigger::new(manager.clone()),
            gateway: Arc::new(gateway),
            rules: Arc::new(RewriteRuleGenerator::new(RulesConfig::from(&settings.rules))),
            manager,
            edge,
        }
    }
}
