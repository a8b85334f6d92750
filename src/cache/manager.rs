//! Cache manager: driver registry and invalidation orchestration.
//!
//! A clear runs every active driver to completion, records each failure in the
//! invocation error log, then performs the persistent-store bulk purge and the
//! snapshot wipe regardless of what the drivers did.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use metrics::{counter, histogram};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use super::config::CacheConfig;
use super::driver::{CacheDriver, DriverError, DriverKind};
use super::events::{CacheSignal, ClearScope, MutationKind, MutationSignal, SignalBus};
use super::keys::CacheKey;
use super::lock::{mutex_lock, rw_read, rw_write};
use super::snapshot::SnapshotStore;

const SOURCE: &str = "cache::manager";
const METRIC_CLEAR_TOTAL: &str = "tierguard_clear_total";
const METRIC_CLEAR_MS: &str = "tierguard_clear_ms";

/// One driver failure recorded during a clear.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClearFailure {
    pub driver: DriverKind,
    pub message: String,
}

/// Outcome of a clear invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClearReport {
    pub success: bool,
    pub errors: Vec<ClearFailure>,
}

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("cache mirror purge failed: {0}")]
    Purge(String),
}

#[derive(Debug, Error)]
#[error("compiled code cache reset failed: {0}")]
pub struct CodeCacheError(pub String);

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("driver `{0}` is not registered")]
    NotRegistered(DriverKind),
    #[error("driver `{0}` is inert after a failed initialization")]
    Inert(DriverKind),
    #[error(transparent)]
    Driver(#[from] DriverError),
}

/// Persistent store holding mirrored cache rows.
#[async_trait]
pub trait MirrorStore: Send + Sync {
    /// Delete every row whose key matches `pattern` in a single statement.
    /// Returns the number of rows removed.
    async fn purge(&self, pattern: &str) -> Result<u64, MirrorError>;
}

/// Used when no database is configured.
pub struct NullMirrorStore;

#[async_trait]
impl MirrorStore for NullMirrorStore {
    async fn purge(&self, _pattern: &str) -> Result<u64, MirrorError> {
        Ok(0)
    }
}

/// Process-level cache of compiled code (templates, bytecode, ...).
pub trait CompiledCodeCache: Send + Sync {
    fn reset(&self) -> Result<(), CodeCacheError>;
}

pub struct NullCodeCache;

impl CompiledCodeCache for NullCodeCache {
    fn reset(&self) -> Result<(), CodeCacheError> {
        Ok(())
    }
}

struct RegisteredDriver {
    driver: Arc<dyn CacheDriver>,
    inert: AtomicBool,
}

/// Registered driver as shown on status views.
#[derive(Debug, Clone, Serialize)]
pub struct DriverStatus {
    pub kind: DriverKind,
    pub inert: bool,
}

/// Owns the driver registry and both invalidation severities.
pub struct CacheManager {
    config: CacheConfig,
    store: SnapshotStore,
    mirror: Arc<dyn MirrorStore>,
    code_cache: Arc<dyn CompiledCodeCache>,
    signals: Arc<SignalBus>,
    drivers: RwLock<Vec<Arc<RegisteredDriver>>>,
    bindings: RwLock<HashMap<MutationKind, ClearScope>>,
    error_log: Mutex<Vec<ClearFailure>>,
    initialized: AtomicBool,
    // Serializes clears so the error log always describes exactly one call.
    clear_gate: tokio::sync::Mutex<()>,
}

impl CacheManager {
    pub fn new(
        config: CacheConfig,
        mirror: Arc<dyn MirrorStore>,
        code_cache: Arc<dyn CompiledCodeCache>,
        signals: Arc<SignalBus>,
    ) -> Self {
        let store = SnapshotStore::new(config.cache_root.clone());
        Self {
            config,
            store,
            mirror,
            code_cache,
            signals,
            drivers: RwLock::new(Vec::new()),
            bindings: RwLock::new(HashMap::new()),
            error_log: Mutex::new(Vec::new()),
            initialized: AtomicBool::new(false),
            clear_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Append a driver to the registry. No initialization happens here.
    pub fn add_driver(&self, driver: Arc<dyn CacheDriver>) {
        rw_write(&self.drivers, SOURCE, "add_driver").push(Arc::new(RegisteredDriver {
            driver,
            inert: AtomicBool::new(false),
        }));
    }

    /// Initialize every registered driver once, then bind mutation signals.
    ///
    /// A driver whose `initialize()` fails is logged and left inert for the
    /// rest of the process; the remaining drivers are still initialized.
    #[instrument(skip_all)]
    pub async fn initialize_cache(&self) {
        if self.initialized.swap(true, Ordering::SeqCst) {
            debug!("cache already initialized");
            return;
        }

        for registered in self.registered() {
            let kind = registered.driver.kind();
            match registered.driver.initialize().await {
                Ok(()) => debug!(driver = %kind, "driver initialized"),
                Err(err) => {
                    registered.inert.store(true, Ordering::SeqCst);
                    error!(
                        driver = %kind,
                        error = %err,
                        result = "inert",
                        "driver initialization failed"
                    );
                }
            }
        }

        self.bind_mutation_signals();
        info!(drivers = self.registered().len(), "cache initialized");
    }

    fn bind_mutation_signals(&self) {
        let mut bindings = rw_write(&self.bindings, SOURCE, "bind_mutation_signals");
        for kind in MutationKind::ALL {
            bindings.insert(kind, kind.default_scope());
        }
    }

    /// Content-level clear. Returns true iff no driver failed.
    #[instrument(skip_all)]
    pub async fn clear_content_caches(&self) -> bool {
        self.clear(ClearScope::Content).await.success
    }

    /// System-level clear: content-level clear plus the compiled-code reset.
    #[instrument(skip_all)]
    pub async fn clear_all_caches(&self) -> bool {
        self.clear(ClearScope::All).await.success
    }

    /// Run a clear of the given severity and return the full report.
    pub async fn clear(&self, scope: ClearScope) -> ClearReport {
        let _gate = self.clear_gate.lock().await;
        let started = Instant::now();
        mutex_lock(&self.error_log, SOURCE, "clear.reset").clear();

        let mut failed_drivers = 0_usize;
        for registered in self.registered() {
            let kind = registered.driver.kind();
            if registered.inert.load(Ordering::SeqCst) {
                debug!(driver = %kind, "skipping inert driver");
                continue;
            }
            match registered.driver.clear().await {
                Ok(()) => debug!(driver = %kind, scope = %scope, "driver cleared"),
                Err(err) => {
                    failed_drivers += 1;
                    warn!(driver = %kind, scope = %scope, error = %err, "driver clear failed");
                    mutex_lock(&self.error_log, SOURCE, "clear.record").push(ClearFailure {
                        driver: kind,
                        message: err.to_string(),
                    });
                }
            }
        }

        match self.mirror.purge(&self.config.mirror_key_pattern).await {
            Ok(rows) => debug!(rows, "cache mirror rows purged"),
            Err(err) => warn!(error = %err, "cache mirror purge failed"),
        }

        if let Err(err) = self.store.wipe_pages().await {
            warn!(
                root = %self.store.pages_root().display(),
                error = %err,
                "snapshot directory wipe failed"
            );
        }

        if scope == ClearScope::All {
            if let Err(err) = self.code_cache.reset() {
                debug!(error = %err, "compiled code cache reset failed; ignored");
            }
        }

        let errors = self.last_errors();
        let report = ClearReport {
            success: failed_drivers == 0 && errors.is_empty(),
            errors,
        };

        let result = if report.success { "ok" } else { "partial" };
        counter!(METRIC_CLEAR_TOTAL, "scope" => scope.to_string(), "result" => result)
            .increment(1);
        histogram!(METRIC_CLEAR_MS, "scope" => scope.to_string())
            .record(started.elapsed().as_secs_f64() * 1000.0);
        info!(
            scope = %scope,
            success = report.success,
            failed_drivers,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "cache clear finished"
        );

        let signal = match scope {
            ClearScope::Content => CacheSignal::ContentCacheCleared(report.clone()),
            ClearScope::All => CacheSignal::AllCachesCleared(report.clone()),
        };
        self.signals.emit(signal);

        report
    }

    /// Route a mutation signal to its bound severity. Returns `None` when the
    /// cache has not been initialized and no binding exists yet.
    pub async fn handle_mutation(&self, signal: &MutationSignal) -> Option<ClearReport> {
        let scope = rw_read(&self.bindings, SOURCE, "handle_mutation")
            .get(&signal.kind())
            .copied();
        match scope {
            Some(scope) => {
                info!(signal = ?signal, scope = %scope, "mutation signal received");
                Some(self.clear(scope).await)
            }
            None => {
                debug!(signal = ?signal, "mutation signal ignored; cache not initialized");
                None
            }
        }
    }

    /// Store a freshly rendered page in every active tier. Tiers without keyed
    /// storage accept and drop it. Returns the failures.
    pub async fn populate_key(&self, key: &CacheKey, body: Bytes) -> Vec<ClearFailure> {
        let mut failures = Vec::new();
        for registered in self.registered() {
            if registered.inert.load(Ordering::SeqCst) {
                continue;
            }
            let kind = registered.driver.kind();
            if let Err(err) = registered.driver.set(key, body.clone()).await {
                warn!(driver = %kind, key = %key, error = %err, "driver set failed");
                failures.push(ClearFailure {
                    driver: kind,
                    message: err.to_string(),
                });
            }
        }
        failures
    }

    /// Delete one page from every active tier. Returns the failures.
    pub async fn invalidate_key(&self, key: &CacheKey) -> Vec<ClearFailure> {
        let mut failures = Vec::new();
        for registered in self.registered() {
            if registered.inert.load(Ordering::SeqCst) {
                continue;
            }
            let kind = registered.driver.kind();
            if let Err(err) = registered.driver.delete(key).await {
                warn!(driver = %kind, key = %key, error = %err, "driver delete failed");
                failures.push(ClearFailure {
                    driver: kind,
                    message: err.to_string(),
                });
            }
        }
        failures
    }

    /// Clear a single tier, for manual actions.
    pub async fn clear_driver(&self, kind: DriverKind) -> Result<(), ManagerError> {
        let registered = self
            .registered()
            .into_iter()
            .find(|registered| registered.driver.kind() == kind)
            .ok_or(ManagerError::NotRegistered(kind))?;
        if registered.inert.load(Ordering::SeqCst) {
            return Err(ManagerError::Inert(kind));
        }
        registered.driver.clear().await?;
        info!(driver = %kind, "driver cleared manually");
        Ok(())
    }

    /// Linear lookup by identity.
    pub fn get_driver(&self, kind: DriverKind) -> Option<Arc<dyn CacheDriver>> {
        rw_read(&self.drivers, SOURCE, "get_driver")
            .iter()
            .find(|registered| registered.driver.kind() == kind)
            .map(|registered| Arc::clone(&registered.driver))
    }

    /// Error log of the most recent clear.
    pub fn last_errors(&self) -> Vec<ClearFailure> {
        mutex_lock(&self.error_log, SOURCE, "last_errors").clone()
    }

    pub fn driver_statuses(&self) -> Vec<DriverStatus> {
        self.registered()
            .iter()
            .map(|registered| DriverStatus {
                kind: registered.driver.kind(),
                inert: registered.inert.load(Ordering::SeqCst),
            })
            .collect()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn signals(&self) -> &Arc<SignalBus> {
        &self.signals
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    // Cloned so no lock is held across driver awaits.
    fn registered(&self) -> Vec<Arc<RegisteredDriver>> {
        rw_read(&self.drivers, SOURCE, "registered").clone()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::cache::device::DeviceClass;

    struct FakeDriver {
        kind: DriverKind,
        fail_clear: bool,
        fail_init: bool,
        clears: AtomicUsize,
        inits: AtomicUsize,
        deletes: AtomicUsize,
        sets: AtomicUsize,
    }

    impl FakeDriver {
        fn new(kind: DriverKind) -> Arc<Self> {
            Self::build(kind, false, false)
        }

        fn failing_clear(kind: DriverKind) -> Arc<Self> {
            Self::build(kind, true, false)
        }

        fn failing_init(kind: DriverKind) -> Arc<Self> {
            Self::build(kind, false, true)
        }

        fn build(kind: DriverKind, fail_clear: bool, fail_init: bool) -> Arc<Self> {
            Arc::new(Self {
                kind,
                fail_clear,
                fail_init,
                clears: AtomicUsize::new(0),
                inits: AtomicUsize::new(0),
                deletes: AtomicUsize::new(0),
                sets: AtomicUsize::new(0),
            })
        }

        fn clears(&self) -> usize {
            self.clears.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CacheDriver for FakeDriver {
        fn kind(&self) -> DriverKind {
            self.kind
        }

        async fn initialize(&self) -> Result<(), DriverError> {
            self.inits.fetch_add(1, Ordering::SeqCst);
            if self.fail_init {
                return Err(DriverError::init("unreachable backend"));
            }
            Ok(())
        }

        async fn get(&self, _key: &CacheKey) -> Result<Option<Bytes>, DriverError> {
            Ok(None)
        }

        async fn set(&self, _key: &CacheKey, _value: Bytes) -> Result<(), DriverError> {
            self.sets.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn delete(&self, _key: &CacheKey) -> Result<(), DriverError> {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn clear(&self) -> Result<(), DriverError> {
            self.clears.fetch_add(1, Ordering::SeqCst);
            if self.fail_clear {
                return Err(DriverError::other("flush refused"));
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingMirror {
        purges: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl MirrorStore for CountingMirror {
        async fn purge(&self, pattern: &str) -> Result<u64, MirrorError> {
            assert_eq!(pattern, "tierguard:%");
            self.purges.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(MirrorError::Purge("connection reset".to_string()));
            }
            Ok(3)
        }
    }

    #[derive(Default)]
    struct CountingCodeCache {
        resets: AtomicUsize,
        fail: bool,
    }

    impl CompiledCodeCache for CountingCodeCache {
        fn reset(&self) -> Result<(), CodeCacheError> {
            self.resets.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(CodeCacheError("not available".to_string()));
            }
            Ok(())
        }
    }

    struct Harness {
        manager: CacheManager,
        mirror: Arc<CountingMirror>,
        code_cache: Arc<CountingCodeCache>,
        _dir: tempfile::TempDir,
    }

    fn harness_with(mirror: CountingMirror, code_cache: CountingCodeCache) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig {
            cache_root: dir.path().to_path_buf(),
            ..Default::default()
        };
        let mirror = Arc::new(mirror);
        let code_cache = Arc::new(code_cache);
        let manager = CacheManager::new(
            config,
            mirror.clone(),
            code_cache.clone(),
            Arc::new(SignalBus::new()),
        );
        Harness {
            manager,
            mirror,
            code_cache,
            _dir: dir,
        }
    }

    fn harness() -> Harness {
        harness_with(CountingMirror::default(), CountingCodeCache::default())
    }

    async fn seed_snapshot(manager: &CacheManager) -> CacheKey {
        let key = CacheKey::new("example.com", "/blog/post-1", DeviceClass::Desktop).unwrap();
        manager
            .store
            .write_page(&key, Bytes::from_static(b"<html></html>"))
            .await
            .unwrap();
        key
    }

    #[tokio::test]
    async fn add_driver_has_no_side_effects() {
        let h = harness();
        let driver = FakeDriver::new(DriverKind::ObjectCache);
        h.manager.add_driver(driver.clone());

        assert_eq!(driver.inits.load(Ordering::SeqCst), 0);
        assert_eq!(driver.clears(), 0);
        assert!(!h.manager.is_initialized());
    }

    #[tokio::test]
    async fn one_failing_driver_of_three() {
        let h = harness();
        let disk = FakeDriver::new(DriverKind::DiskSnapshot);
        let object = FakeDriver::failing_clear(DriverKind::ObjectCache);
        let edge = FakeDriver::new(DriverKind::EdgeAccelerator);
        h.manager.add_driver(disk.clone());
        h.manager.add_driver(object.clone());
        h.manager.add_driver(edge.clone());

        let ok = h.manager.clear_content_caches().await;

        assert!(!ok);
        assert_eq!(disk.clears(), 1);
        assert_eq!(object.clears(), 1);
        assert_eq!(edge.clears(), 1);
        let errors = h.manager.last_errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].driver, DriverKind::ObjectCache);
        assert!(errors[0].message.contains("flush refused"));
    }

    #[tokio::test]
    async fn error_log_is_reset_per_call() {
        let h = harness();
        h.manager
            .add_driver(FakeDriver::failing_clear(DriverKind::ObjectCache));
        h.manager
            .add_driver(FakeDriver::failing_clear(DriverKind::AssetSnapshot));

        assert!(!h.manager.clear_content_caches().await);
        assert_eq!(h.manager.last_errors().len(), 2);
        assert!(!h.manager.clear_all_caches().await);
        assert_eq!(h.manager.last_errors().len(), 2);
    }

    #[tokio::test]
    async fn successful_clear_returns_true_and_empty_log() {
        let h = harness();
        h.manager.add_driver(FakeDriver::new(DriverKind::ObjectCache));

        assert!(h.manager.clear_content_caches().await);
        assert!(h.manager.last_errors().is_empty());
    }

    #[tokio::test]
    async fn clear_all_runs_side_effects_exactly_once_despite_failures() {
        let h = harness();
        h.manager
            .add_driver(FakeDriver::failing_clear(DriverKind::ObjectCache));
        h.manager
            .add_driver(FakeDriver::failing_clear(DriverKind::EdgeAccelerator));
        let key = seed_snapshot(&h.manager).await;

        assert!(!h.manager.clear_all_caches().await);

        assert_eq!(h.mirror.purges.load(Ordering::SeqCst), 1);
        assert_eq!(h.code_cache.resets.load(Ordering::SeqCst), 1);
        assert!(h.manager.store.read_page(&key).await.unwrap().is_none());
        assert!(h.manager.store.pages_root().is_dir());
    }

    #[tokio::test]
    async fn content_clear_keeps_code_cache_but_wipes_snapshots() {
        let h = harness();
        let key = seed_snapshot(&h.manager).await;

        assert!(h.manager.clear_content_caches().await);

        assert_eq!(h.mirror.purges.load(Ordering::SeqCst), 1);
        assert_eq!(h.code_cache.resets.load(Ordering::SeqCst), 0);
        assert!(h.manager.store.read_page(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn collaborator_failures_do_not_change_result() {
        let h = harness_with(
            CountingMirror {
                fail: true,
                ..Default::default()
            },
            CountingCodeCache {
                fail: true,
                ..Default::default()
            },
        );
        h.manager.add_driver(FakeDriver::new(DriverKind::ObjectCache));

        assert!(h.manager.clear_all_caches().await);
        assert!(h.manager.last_errors().is_empty());
    }

    #[tokio::test]
    async fn initialize_is_idempotent_and_isolates_failures() {
        let h = harness();
        let broken = FakeDriver::failing_init(DriverKind::EdgeAccelerator);
        let healthy = FakeDriver::new(DriverKind::ObjectCache);
        h.manager.add_driver(broken.clone());
        h.manager.add_driver(healthy.clone());

        h.manager.initialize_cache().await;
        h.manager.initialize_cache().await;

        assert_eq!(broken.inits.load(Ordering::SeqCst), 1);
        assert_eq!(healthy.inits.load(Ordering::SeqCst), 1);

        let statuses = h.manager.driver_statuses();
        assert!(statuses[0].inert);
        assert!(!statuses[1].inert);

        assert!(h.manager.clear_content_caches().await);
        assert_eq!(broken.clears(), 0);
        assert_eq!(healthy.clears(), 1);

        assert!(matches!(
            h.manager.clear_driver(DriverKind::EdgeAccelerator).await,
            Err(ManagerError::Inert(DriverKind::EdgeAccelerator))
        ));
    }

    #[tokio::test]
    async fn get_driver_is_optional() {
        let h = harness();
        h.manager.add_driver(FakeDriver::new(DriverKind::ObjectCache));

        assert!(h.manager.get_driver(DriverKind::ObjectCache).is_some());
        assert!(h.manager.get_driver(DriverKind::EdgeAccelerator).is_none());
        assert!(matches!(
            h.manager.clear_driver(DriverKind::DiskSnapshot).await,
            Err(ManagerError::NotRegistered(DriverKind::DiskSnapshot))
        ));
    }

    #[tokio::test]
    async fn clear_driver_touches_only_that_tier() {
        let h = harness();
        let object = FakeDriver::new(DriverKind::ObjectCache);
        let edge = FakeDriver::new(DriverKind::EdgeAccelerator);
        h.manager.add_driver(object.clone());
        h.manager.add_driver(edge.clone());

        h.manager.clear_driver(DriverKind::ObjectCache).await.unwrap();

        assert_eq!(object.clears(), 1);
        assert_eq!(edge.clears(), 0);
        assert_eq!(h.mirror.purges.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn mutation_signals_route_to_bound_severity() {
        let h = harness();
        h.manager.add_driver(FakeDriver::new(DriverKind::ObjectCache));

        let before_init = h.manager.handle_mutation(&MutationSignal::ThemeSwitched).await;
        assert!(before_init.is_none());

        h.manager.initialize_cache().await;

        h.manager
            .handle_mutation(&MutationSignal::ContentSaved)
            .await
            .expect("bound");
        assert_eq!(h.code_cache.resets.load(Ordering::SeqCst), 0);

        h.manager
            .handle_mutation(&MutationSignal::PluginActivated {
                name: "seo".to_string(),
            })
            .await
            .expect("bound");
        assert_eq!(h.code_cache.resets.load(Ordering::SeqCst), 1);

        let recent = h.manager.signals().recent();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].signal.scope(), ClearScope::Content);
        assert_eq!(recent[1].signal.scope(), ClearScope::All);
    }

    #[tokio::test]
    async fn clear_emits_signal_with_report() {
        let h = harness();
        h.manager
            .add_driver(FakeDriver::failing_clear(DriverKind::AssetSnapshot));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        h.manager.signals().subscribe(move |envelope| {
            sink.lock().unwrap().push(envelope.signal.report().clone());
        });

        h.manager.clear_all_caches().await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(!seen[0].success);
        assert_eq!(seen[0].errors[0].driver, DriverKind::AssetSnapshot);
    }

    #[tokio::test]
    async fn invalidate_key_deletes_from_every_active_tier() {
        let h = harness();
        let a = FakeDriver::new(DriverKind::ObjectCache);
        let b = FakeDriver::new(DriverKind::DiskSnapshot);
        h.manager.add_driver(a.clone());
        h.manager.add_driver(b.clone());

        let key = CacheKey::new("example.com", "/x", DeviceClass::Desktop).unwrap();
        assert!(h.manager.invalidate_key(&key).await.is_empty());
        assert_eq!(a.deletes.load(Ordering::SeqCst), 1);
        assert_eq!(b.deletes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn populate_key_skips_inert_tiers() {
        let h = harness();
        let healthy = FakeDriver::new(DriverKind::ObjectCache);
        let broken = FakeDriver::failing_init(DriverKind::EdgeAccelerator);
        h.manager.add_driver(healthy.clone());
        h.manager.add_driver(broken.clone());
        h.manager.initialize_cache().await;

        let key = CacheKey::new("example.com", "/x", DeviceClass::Mobile).unwrap();
        let failures = h
            .manager
            .populate_key(&key, Bytes::from_static(b"<html></html>"))
            .await;

        assert!(failures.is_empty());
        assert_eq!(healthy.sets.load(Ordering::SeqCst), 1);
        assert_eq!(broken.sets.load(Ordering::SeqCst), 0);
    }
}
