//! Tierguard cache system.
//!
//! Coordinates three tiers guarding the render pipeline:
//!
//! - **Disk snapshots**: rendered pages under `<root>/html`, served by the
//!   web server's rewrite rules or by the [`PageCacheGateway`]
//! - **Object cache**: bounded in-memory LRU keyed by [`CacheKey::digest`]
//! - **Edge accelerator**: tagged responses and PURGE requests
//!
//! ## Configuration
//!
//! Cache behavior is controlled via `tierguard.toml`:
//!
//! ```toml
//! [cache]
//! root = "var/cache"
//! page_lifetime_seconds = 3600
//!
//! [cache.drivers]
//! edge = true
//! ```

mod config;
mod device;
mod driver;
pub mod drivers;
mod events;
mod gateway;
mod keys;
mod lock;
mod manager;
mod rewrite;
mod snapshot;
mod trigger;

pub use config::{CacheConfig, DriverToggles, EdgeConfig, RulesConfig};
pub use device::{DeviceClass, MOBILE_USER_AGENT_PATTERN};
pub use driver::{CacheDriver, DriverError, DriverKind, UnknownDriver};
pub use events::{
    CacheSignal, ClearScope, Epoch, MutationKind, MutationSignal, SignalBus, SignalEnvelope,
};
pub use gateway::{
    AUTH_COOKIE_PATTERN, BypassReason, CACHE_STATUS_HEADER, CacheStatus, Decision,
    ExecutionContext, GatewayError, GatewayRequest, PageCacheGateway, SnapshotTarget,
    has_auth_cookie, page_cache_layer, serve_snapshot,
};
pub use keys::{CacheKey, KeyError};
pub use manager::{
    CacheManager, ClearFailure, ClearReport, CodeCacheError, CompiledCodeCache, DriverStatus,
    ManagerError, MirrorError, MirrorStore, NullCodeCache, NullMirrorStore,
};
pub use rewrite::{BEGIN_MARKER, END_MARKER, RewriteRuleGenerator, RuleFileError};
pub use snapshot::{Snapshot, SnapshotError, SnapshotStore, compute_validator};
pub use trigger::CacheTrigger;
