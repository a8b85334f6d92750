//! Cache configuration.
//!
//! Engine-facing view of the `[cache]`, `[edge]`, and `[rules]` sections of
//! `tierguard.toml`. Built once from [`crate::config::Settings`] and never
//! mutated afterwards.

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

const DEFAULT_CACHE_ROOT: &str = "cache";
const DEFAULT_PAGE_LIFETIME_SECS: u64 = 3600;
const DEFAULT_ASSET_LIFETIME_SECS: u64 = 86_400;
const DEFAULT_OBJECT_CACHE_LIMIT: usize = 1000;
const DEFAULT_MIRROR_KEY_PATTERN: &str = "tierguard:%";
const DEFAULT_EDGE_HOST: &str = "127.0.0.1";
const DEFAULT_EDGE_PORT: u16 = 6081;
const DEFAULT_EDGE_TTL_SECS: u64 = 86_400;
const DEFAULT_PURGE_TIMEOUT_MS: u64 = 1000;
const DEFAULT_RULES_FILE: &str = ".htaccess";
const DEFAULT_RULES_CACHE_PREFIX: &str = "/cache";

/// Which tiers the manager registers at bootstrap.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DriverToggles {
    pub disk: bool,
    pub object: bool,
    pub edge: bool,
    pub assets: bool,
}

impl Default for DriverToggles {
    fn default() -> Self {
        Self {
            disk: true,
            object: true,
            edge: false,
            assets: true,
        }
    }
}

/// Cache configuration consumed by the manager, drivers, and gateway.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Root directory holding `html/`, `css/`, and `js/` snapshots.
    pub cache_root: PathBuf,
    /// Freshness window for page snapshots.
    pub page_lifetime: Duration,
    /// Freshness window for static asset snapshots.
    pub asset_lifetime: Duration,
    /// Maximum entries in the in-memory object cache.
    pub object_cache_limit: usize,
    /// `LIKE` pattern selecting cache-mirror rows for the bulk purge.
    pub mirror_key_pattern: String,
    /// Path prefixes treated as administrative context.
    pub admin_prefixes: Vec<String>,
    /// Path prefixes treated as REST/RPC endpoints.
    pub api_prefixes: Vec<String>,
    /// Emit gateway failures to the log.
    pub diagnostics: bool,
    pub drivers: DriverToggles,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_root: PathBuf::from(DEFAULT_CACHE_ROOT),
            page_lifetime: Duration::from_secs(DEFAULT_PAGE_LIFETIME_SECS),
            asset_lifetime: Duration::from_secs(DEFAULT_ASSET_LIFETIME_SECS),
            object_cache_limit: DEFAULT_OBJECT_CACHE_LIMIT,
            mirror_key_pattern: DEFAULT_MIRROR_KEY_PATTERN.to_string(),
            admin_prefixes: vec!["/admin".to_string()],
            api_prefixes: vec!["/api".to_string(), "/xmlrpc".to_string()],
            diagnostics: false,
            drivers: DriverToggles::default(),
        }
    }
}

impl CacheConfig {
    /// Returns the object cache limit as NonZeroUsize, clamping to 1 if zero.
    pub fn object_cache_limit_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.object_cache_limit).unwrap_or(NonZeroUsize::MIN)
    }

    /// Directory holding page snapshots.
    pub fn html_root(&self) -> PathBuf {
        self.cache_root.join("html")
    }
}

/// Connection parameters for the HTTP edge accelerator.
#[derive(Debug, Clone)]
pub struct EdgeConfig {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    /// `max-age` advertised on cacheable responses.
    pub default_ttl: Duration,
    /// Upper bound for a single purge request.
    pub purge_timeout: Duration,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_EDGE_HOST.to_string(),
            port: DEFAULT_EDGE_PORT,
            use_tls: false,
            default_ttl: Duration::from_secs(DEFAULT_EDGE_TTL_SECS),
            purge_timeout: Duration::from_millis(DEFAULT_PURGE_TIMEOUT_MS),
        }
    }
}

impl EdgeConfig {
    pub fn base_url(&self) -> String {
        let scheme = if self.use_tls { "https" } else { "http" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }
}

/// Location of the web-server rule file and the snapshot prefix it serves from.
#[derive(Debug, Clone)]
pub struct RulesConfig {
    pub rules_file: PathBuf,
    /// Snapshot root as seen from the web server's document root.
    pub cache_prefix: String,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            rules_file: PathBuf::from(DEFAULT_RULES_FILE),
            cache_prefix: DEFAULT_RULES_CACHE_PREFIX.to_string(),
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            cache_root: settings.root.clone(),
            page_lifetime: settings.page_lifetime,
            asset_lifetime: settings.asset_lifetime,
            object_cache_limit: settings.object_cache_limit.get(),
            mirror_key_pattern: settings.mirror_key_pattern.clone(),
            admin_prefixes: settings.admin_prefixes.clone(),
            api_prefixes: settings.api_prefixes.clone(),
            diagnostics: settings.diagnostics,
            drivers: settings.drivers.clone(),
        }
    }
}

impl From<&crate::config::EdgeSettings> for EdgeConfig {
    fn from(settings: &crate::config::EdgeSettings) -> Self {
        Self {
            host: settings.host.clone(),
            port: settings.port,
            use_tls: settings.use_tls,
            default_ttl: settings.default_ttl,
            purge_timeout: settings.purge_timeout,
        }
    }
}

impl From<&crate::config::RulesSettings> for RulesConfig {
    fn from(settings: &crate::config::RulesSettings) -> Self {
        Self {
            rules_file: settings.file.clone(),
            cache_prefix: settings.cache_prefix.clone(),
        }
    }
}
