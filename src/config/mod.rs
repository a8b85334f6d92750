//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    net::SocketAddr,
    num::{NonZeroU32, NonZeroUsize},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::{Args, Parser, Subcommand, ValueEnum, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::cache::{ClearScope, DriverToggles};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "tierguard";
const ENV_PREFIX: &str = "TIERGUARD";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_ADMIN_HOST: &str = "127.0.0.1";
const DEFAULT_PUBLIC_PORT: u16 = 8000;
const DEFAULT_ADMIN_PORT: u16 = 8001;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 4;
const DEFAULT_CACHE_ROOT: &str = "cache";
const DEFAULT_PAGE_LIFETIME_SECS: u64 = 3600;
const DEFAULT_ASSET_LIFETIME_SECS: u64 = 86_400;
const DEFAULT_OBJECT_CACHE_LIMIT: u64 = 1000;
const DEFAULT_MIRROR_KEY_PATTERN: &str = "tierguard:%";
const DEFAULT_EDGE_HOST: &str = "127.0.0.1";
const DEFAULT_EDGE_PORT: u16 = 6081;
const DEFAULT_EDGE_TTL_SECS: u64 = 86_400;
const DEFAULT_PURGE_TIMEOUT_MS: u64 = 1000;
const DEFAULT_RULES_FILE: &str = ".htaccess";
const DEFAULT_RULES_CACHE_PREFIX: &str = "/cache";
const DEFAULT_ORIGIN_URL: &str = "http://127.0.0.1:8080";
const DEFAULT_ORIGIN_TIMEOUT_SECS: u64 = 30;
const DEFAULT_ORIGIN_MAX_BODY_BYTES: u64 = 8 * 1024 * 1024;

/// Command-line arguments for the Tierguard binary.
#[derive(Debug, Parser)]
#[command(name = "tierguard", version, about = "Tierguard cache coordinator")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "TIERGUARD_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the gateway and the administrative listener.
    Serve(Box<ServeArgs>),
    /// Manage the web-server rewrite rules.
    Rules(RulesArgs),
    /// Clear caches once and exit.
    Clear(ClearArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct DatabaseOverride {
    /// Override the database connection URL.
    #[arg(long = "database-url", value_name = "URL")]
    pub database_url: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct CacheRootOverride {
    /// Override the snapshot root directory.
    #[arg(long = "cache-root", value_name = "PATH")]
    pub cache_root: Option<PathBuf>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub database: DatabaseOverride,

    #[command(flatten)]
    pub cache: CacheRootOverride,

    /// Override the public listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the administrative listener host.
    #[arg(long = "server-admin-host", value_name = "HOST")]
    pub server_admin_host: Option<String>,

    /// Override the public listener port.
    #[arg(long = "server-public-port", value_name = "PORT")]
    pub public_port: Option<u16>,

    /// Override the administrative listener port.
    #[arg(long = "server-admin-port", value_name = "PORT")]
    pub admin_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Toggle the edge accelerator tier.
    #[arg(
        long = "edge-enabled",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub edge_enabled: Option<bool>,

    /// Override the edge accelerator host.
    #[arg(long = "edge-host", value_name = "HOST")]
    pub edge_host: Option<String>,

    /// Override the edge accelerator port.
    #[arg(long = "edge-port", value_name = "PORT")]
    pub edge_port: Option<u16>,

    /// Override the upstream renderer URL.
    #[arg(long = "origin-url", value_name = "URL")]
    pub origin_url: Option<String>,

    /// Toggle diagnostic logging of gateway failures.
    #[arg(
        long = "diagnostics",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub diagnostics: Option<bool>,
}

#[derive(Debug, Args, Clone)]
pub struct RulesArgs {
    #[command(subcommand)]
    pub command: RulesCommand,
}

#[derive(Debug, Subcommand, Clone)]
pub enum RulesCommand {
    /// Insert or refresh the rule block in the rules file.
    Install(RulesFileOverride),
    /// Remove the rule block from the rules file.
    Remove(RulesFileOverride),
    /// Print the rule block to stdout.
    Print(RulesFileOverride),
}

#[derive(Debug, Args, Default, Clone)]
pub struct RulesFileOverride {
    /// Override the rules file location.
    #[arg(long = "rules-file", value_name = "PATH")]
    pub rules_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum ScopeArg {
    /// Rendering caches only.
    #[default]
    Content,
    /// Everything, including compiled code.
    All,
}

impl From<ScopeArg> for ClearScope {
    fn from(scope: ScopeArg) -> Self {
        match scope {
            ScopeArg::Content => ClearScope::Content,
            ScopeArg::All => ClearScope::All,
        }
    }
}

#[derive(Debug, Args, Clone)]
pub struct ClearArgs {
    /// Invalidation severity.
    #[arg(long, value_enum, default_value_t = ScopeArg::Content)]
    pub scope: ScopeArg,

    #[command(flatten)]
    pub database: DatabaseOverride,

    #[command(flatten)]
    pub cache: CacheRootOverride,
}

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub database: DatabaseSettings,
    pub cache: CacheSettings,
    pub edge: EdgeSettings,
    pub rules: RulesSettings,
    pub origin: OriginSettings,
    pub diagnostics: DiagnosticsSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub public_addr: SocketAddr,
    pub admin_addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    /// `None` leaves the cache-mirror purge as a no-op.
    pub url: Option<String>,
    pub max_connections: NonZeroU32,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub root: PathBuf,
    pub page_lifetime: Duration,
    pub asset_lifetime: Duration,
    pub object_cache_limit: NonZeroUsize,
    pub mirror_key_pattern: String,
    pub admin_prefixes: Vec<String>,
    pub api_prefixes: Vec<String>,
    pub diagnostics: bool,
    pub drivers: DriverToggles,
}

#[derive(Debug, Clone)]
pub struct EdgeSettings {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    pub default_ttl: Duration,
    pub purge_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct RulesSettings {
    pub file: PathBuf,
    pub cache_prefix: String,
    pub install_on_start: bool,
}

#[derive(Debug, Clone)]
pub struct OriginSettings {
    pub url: Url,
    pub timeout: Duration,
    pub max_body_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct DiagnosticsSettings {
    pub enabled: bool,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Rules(args)) => match &args.command {
            RulesCommand::Install(file) | RulesCommand::Remove(file) | RulesCommand::Print(file) => {
                raw.apply_rules_override(file)
            }
        },
        Some(Command::Clear(args)) => {
            raw.apply_database_override(&args.database);
            raw.apply_cache_root_override(&args.cache);
        }
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    database: RawDatabaseSettings,
    cache: RawCacheSettings,
    edge: RawEdgeSettings,
    rules: RawRulesSettings,
    origin: RawOriginSettings,
    diagnostics: RawDiagnosticsSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        self.apply_database_override(&overrides.database);
        self.apply_cache_root_override(&overrides.cache);

        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(host) = overrides.server_admin_host.as_ref() {
            self.server.admin_host = Some(host.clone());
        }
        if let Some(port) = overrides.public_port {
            self.server.public_port = Some(port);
        }
        if let Some(port) = overrides.admin_port {
            self.server.admin_port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(enabled) = overrides.edge_enabled {
            self.cache.drivers.edge = enabled;
        }
        if let Some(host) = overrides.edge_host.as_ref() {
            self.edge.host = Some(host.clone());
        }
        if let Some(port) = overrides.edge_port {
            self.edge.port = Some(port);
        }
        if let Some(url) = overrides.origin_url.as_ref() {
            self.origin.url = Some(url.clone());
        }
        if let Some(enabled) = overrides.diagnostics {
            self.diagnostics.enabled = Some(enabled);
        }
    }

    fn apply_database_override(&mut self, overrides: &DatabaseOverride) {
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
    }

    fn apply_cache_root_override(&mut self, overrides: &CacheRootOverride) {
        if let Some(root) = overrides.cache_root.as_ref() {
            self.cache.root = Some(root.clone());
        }
    }

    fn apply_rules_override(&mut self, overrides: &RulesFileOverride) {
        if let Some(file) = overrides.rules_file.as_ref() {
            self.rules.file = Some(file.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            database,
            cache,
            edge,
            rules,
            origin,
            diagnostics,
        } = raw;

        let server = build_server_settings(server)?;
        let logging = build_logging_settings(logging)?;
        let database = build_database_settings(database)?;
        let diagnostics = DiagnosticsSettings {
            enabled: diagnostics.enabled.unwrap_or(false),
        };
        let cache = build_cache_settings(cache, &diagnostics)?;
        let edge = build_edge_settings(edge)?;
        let rules = build_rules_settings(rules)?;
        let origin = build_origin_settings(origin)?;

        Ok(Self {
            server,
            logging,
            database,
            cache,
            edge,
            rules,
            origin,
            diagnostics,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());
    let admin_host = server
        .admin_host
        .unwrap_or_else(|| DEFAULT_ADMIN_HOST.to_string());

    let public_port = server.public_port.unwrap_or(DEFAULT_PUBLIC_PORT);
    if public_port == 0 {
        return Err(LoadError::invalid(
            "server.public_port",
            "port must be greater than zero",
        ));
    }

    let admin_port = server.admin_port.unwrap_or(DEFAULT_ADMIN_PORT);
    if admin_port == 0 {
        return Err(LoadError::invalid(
            "server.admin_port",
            "port must be greater than zero",
        ));
    }

    let public_addr = parse_socket_addr(&host, public_port)
        .map_err(|reason| LoadError::invalid("server.public_addr", reason))?;
    let admin_addr = parse_socket_addr(&admin_host, admin_port)
        .map_err(|reason| LoadError::invalid("server.admin_addr", reason))?;
    if public_addr == admin_addr {
        return Err(LoadError::invalid(
            "server.admin_port",
            "administrative listener must not share the public address",
        ));
    }

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        public_addr,
        admin_addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_database_settings(database: RawDatabaseSettings) -> Result<DatabaseSettings, LoadError> {
    let url = database.url.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });

    let max_connections = non_zero_u32(
        database
            .max_connections
            .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS)
            .into(),
        "database.max_connections",
    )?;

    Ok(DatabaseSettings {
        url,
        max_connections,
    })
}

fn build_cache_settings(
    cache: RawCacheSettings,
    diagnostics: &DiagnosticsSettings,
) -> Result<CacheSettings, LoadError> {
    let root = cache
        .root
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_ROOT));
    if root.as_os_str().is_empty() {
        return Err(LoadError::invalid("cache.root", "path must not be empty"));
    }

    let page_lifetime = positive_seconds(
        cache
            .page_lifetime_seconds
            .unwrap_or(DEFAULT_PAGE_LIFETIME_SECS),
        "cache.page_lifetime_seconds",
    )?;
    let asset_lifetime = positive_seconds(
        cache
            .asset_lifetime_seconds
            .unwrap_or(DEFAULT_ASSET_LIFETIME_SECS),
        "cache.asset_lifetime_seconds",
    )?;

    let limit = cache
        .object_cache_limit
        .unwrap_or(DEFAULT_OBJECT_CACHE_LIMIT);
    let object_cache_limit = usize::try_from(limit)
        .ok()
        .and_then(NonZeroUsize::new)
        .ok_or_else(|| {
            LoadError::invalid(
                "cache.object_cache_limit",
                "must be greater than zero and fit in usize",
            )
        })?;

    let mirror_key_pattern = cache
        .mirror_key_pattern
        .unwrap_or_else(|| DEFAULT_MIRROR_KEY_PATTERN.to_string());
    if mirror_key_pattern.trim().is_empty() {
        return Err(LoadError::invalid(
            "cache.mirror_key_pattern",
            "pattern must not be empty",
        ));
    }
    if mirror_key_pattern.trim() == "%" {
        return Err(LoadError::invalid(
            "cache.mirror_key_pattern",
            "pattern must not match every row",
        ));
    }

    let admin_prefixes = cache
        .admin_prefixes
        .unwrap_or_else(|| vec!["/admin".to_string()]);
    let api_prefixes = cache
        .api_prefixes
        .unwrap_or_else(|| vec!["/api".to_string(), "/xmlrpc".to_string()]);
    for prefix in admin_prefixes.iter().chain(api_prefixes.iter()) {
        if !prefix.starts_with('/') {
            return Err(LoadError::invalid(
                "cache.prefixes",
                format!("prefix `{prefix}` must start with `/`"),
            ));
        }
    }

    Ok(CacheSettings {
        root,
        page_lifetime,
        asset_lifetime,
        object_cache_limit,
        mirror_key_pattern,
        admin_prefixes,
        api_prefixes,
        diagnostics: diagnostics.enabled,
        drivers: cache.drivers,
    })
}

fn build_edge_settings(edge: RawEdgeSettings) -> Result<EdgeSettings, LoadError> {
    let host = edge.host.unwrap_or_else(|| DEFAULT_EDGE_HOST.to_string());
    if host.trim().is_empty() {
        return Err(LoadError::invalid("edge.host", "host must not be empty"));
    }

    let port = edge.port.unwrap_or(DEFAULT_EDGE_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "edge.port",
            "port must be greater than zero",
        ));
    }

    let default_ttl = positive_seconds(
        edge.default_ttl_seconds.unwrap_or(DEFAULT_EDGE_TTL_SECS),
        "edge.default_ttl_seconds",
    )?;

    let purge_timeout_ms = edge.purge_timeout_ms.unwrap_or(DEFAULT_PURGE_TIMEOUT_MS);
    if purge_timeout_ms == 0 {
        return Err(LoadError::invalid(
            "edge.purge_timeout_ms",
            "must be greater than zero",
        ));
    }

    Ok(EdgeSettings {
        host,
        port,
        use_tls: edge.use_tls.unwrap_or(false),
        default_ttl,
        purge_timeout: Duration::from_millis(purge_timeout_ms),
    })
}

fn build_rules_settings(rules: RawRulesSettings) -> Result<RulesSettings, LoadError> {
    let file = rules
        .file
        .unwrap_or_else(|| PathBuf::from(DEFAULT_RULES_FILE));
    if file.as_os_str().is_empty() {
        return Err(LoadError::invalid("rules.file", "path must not be empty"));
    }

    let cache_prefix = rules
        .cache_prefix
        .unwrap_or_else(|| DEFAULT_RULES_CACHE_PREFIX.to_string());
    if !cache_prefix.starts_with('/') {
        return Err(LoadError::invalid(
            "rules.cache_prefix",
            "prefix must start with `/`",
        ));
    }

    Ok(RulesSettings {
        file,
        cache_prefix,
        install_on_start: rules.install_on_start.unwrap_or(false),
    })
}

fn build_origin_settings(origin: RawOriginSettings) -> Result<OriginSettings, LoadError> {
    let raw_url = origin
        .url
        .unwrap_or_else(|| DEFAULT_ORIGIN_URL.to_string());
    let url = Url::parse(raw_url.trim())
        .map_err(|err| LoadError::invalid("origin.url", format!("failed to parse: {err}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(LoadError::invalid(
            "origin.url",
            "scheme must be http or https",
        ));
    }

    let timeout = positive_seconds(
        origin.timeout_seconds.unwrap_or(DEFAULT_ORIGIN_TIMEOUT_SECS),
        "origin.timeout_seconds",
    )?;

    let max_body_value = origin
        .max_body_bytes
        .unwrap_or(DEFAULT_ORIGIN_MAX_BODY_BYTES);
    if max_body_value == 0 {
        return Err(LoadError::invalid(
            "origin.max_body_bytes",
            "must be greater than zero",
        ));
    }
    let max_body_bytes = usize::try_from(max_body_value).map_err(|_| {
        LoadError::invalid(
            "origin.max_body_bytes",
            "value exceeds supported range for usize",
        )
    })?;

    Ok(OriginSettings {
        url,
        timeout,
        max_body_bytes,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    admin_host: Option<String>,
    public_port: Option<u16>,
    admin_port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawDatabaseSettings {
    url: Option<String>,
    max_connections: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    root: Option<PathBuf>,
    page_lifetime_seconds: Option<u64>,
    asset_lifetime_seconds: Option<u64>,
    object_cache_limit: Option<u64>,
    mirror_key_pattern: Option<String>,
    admin_prefixes: Option<Vec<String>>,
    api_prefixes: Option<Vec<String>>,
    drivers: DriverToggles,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawEdgeSettings {
    host: Option<String>,
    port: Option<u16>,
    use_tls: Option<bool>,
    default_ttl_seconds: Option<u64>,
    purge_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRulesSettings {
    file: Option<PathBuf>,
    cache_prefix: Option<String>,
    install_on_start: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawOriginSettings {
    url: Option<String>,
    timeout_seconds: Option<u64>,
    max_body_bytes: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawDiagnosticsSettings {
    enabled: Option<bool>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn positive_seconds(value: u64, key: &'static str) -> Result<Duration, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(Duration::from_secs(value))
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");

        assert_eq!(settings.server.public_addr.port(), DEFAULT_PUBLIC_PORT);
        assert_eq!(settings.server.admin_addr.port(), DEFAULT_ADMIN_PORT);
        assert!(settings.database.url.is_none());
        assert_eq!(settings.cache.page_lifetime, Duration::from_secs(3600));
        assert_eq!(settings.cache.mirror_key_pattern, "tierguard:%");
        assert!(!settings.cache.drivers.edge);
        assert_eq!(settings.edge.purge_timeout, Duration::from_secs(1));
        assert_eq!(settings.rules.file, PathBuf::from(".htaccess"));
        assert_eq!(settings.origin.url.as_str(), "http://127.0.0.1:8080/");
        assert!(!settings.diagnostics.enabled);
    }

    #[test]
    fn cli_overrides_take_highest_precedence() {
        let mut raw = RawSettings::default();
        raw.server.public_port = Some(4000);
        raw.logging.level = Some("info".to_string());
        raw.edge.port = Some(6082);

        let overrides = ServeOverrides {
            public_port: Some(4321),
            log_level: Some("debug".to_string()),
            edge_enabled: Some(true),
            edge_port: Some(6090),
            diagnostics: Some(true),
            ..Default::default()
        };

        raw.apply_serve_overrides(&overrides);
        let settings = Settings::from_raw(raw).expect("valid settings");

        assert_eq!(settings.server.public_addr.port(), 4321);
        assert_eq!(settings.logging.level, LevelFilter::DEBUG);
        assert!(settings.cache.drivers.edge);
        assert_eq!(settings.edge.port, 6090);
        assert!(settings.cache.diagnostics);
    }

    #[test]
    fn cli_json_logging_enforces_format() {
        let mut raw = RawSettings::default();
        let overrides = ServeOverrides {
            log_json: Some(true),
            ..Default::default()
        };

        raw.apply_serve_overrides(&overrides);
        let settings = Settings::from_raw(raw).expect("valid settings");

        assert!(matches!(settings.logging.format, LogFormat::Json));
    }

    #[test]
    fn blank_database_url_means_no_mirror() {
        let mut raw = RawSettings::default();
        raw.database.url = Some("   ".to_string());
        let settings = Settings::from_raw(raw).expect("valid settings");
        assert!(settings.database.url.is_none());
    }

    #[test]
    fn rejects_invalid_values() {
        let cases: Vec<(RawSettings, &str)> = vec![
            (
                RawSettings {
                    cache: RawCacheSettings {
                        page_lifetime_seconds: Some(0),
                        ..Default::default()
                    },
                    ..Default::default()
                },
                "cache.page_lifetime_seconds",
            ),
            (
                RawSettings {
                    cache: RawCacheSettings {
                        object_cache_limit: Some(0),
                        ..Default::default()
                    },
                    ..Default::default()
                },
                "cache.object_cache_limit",
            ),
            (
                RawSettings {
                    cache: RawCacheSettings {
                        mirror_key_pattern: Some("%".to_string()),
                        ..Default::default()
                    },
                    ..Default::default()
                },
                "cache.mirror_key_pattern",
            ),
            (
                RawSettings {
                    edge: RawEdgeSettings {
                        port: Some(0),
                        ..Default::default()
                    },
                    ..Default::default()
                },
                "edge.port",
            ),
            (
                RawSettings {
                    rules: RawRulesSettings {
                        cache_prefix: Some("cache".to_string()),
                        ..Default::default()
                    },
                    ..Default::default()
                },
                "rules.cache_prefix",
            ),
            (
                RawSettings {
                    origin: RawOriginSettings {
                        url: Some("ftp://renderer".to_string()),
                        ..Default::default()
                    },
                    ..Default::default()
                },
                "origin.url",
            ),
            (
                RawSettings {
                    server: RawServerSettings {
                        public_port: Some(9000),
                        admin_port: Some(9000),
                        ..Default::default()
                    },
                    ..Default::default()
                },
                "server.admin_port",
            ),
        ];

        for (raw, expected_key) in cases {
            match Settings::from_raw(raw) {
                Err(LoadError::Invalid { key, .. }) => assert_eq!(key, expected_key),
                other => panic!("expected invalid `{expected_key}`, got {other:?}"),
            }
        }
    }

    #[test]
    fn default_to_serve_command() {
        let args = CliArgs::parse_from(["tierguard"]);
        let command = args
            .command
            .unwrap_or(Command::Serve(Box::<ServeArgs>::default()));
        assert!(matches!(command, Command::Serve(_)));
    }

    #[test]
    fn parse_serve_overrides() {
        let args = CliArgs::parse_from([
            "tierguard",
            "serve",
            "--server-host",
            "0.0.0.0",
            "--database-url",
            "postgres://override",
            "--edge-enabled",
            "yes",
        ]);

        match args.command.expect("serve command") {
            Command::Serve(serve) => {
                assert_eq!(serve.overrides.server_host.as_deref(), Some("0.0.0.0"));
                assert_eq!(
                    serve.overrides.database.database_url.as_deref(),
                    Some("postgres://override")
                );
                assert_eq!(serve.overrides.edge_enabled, Some(true));
            }
            _ => panic!("wrong command parsed"),
        }
    }

    #[test]
    fn parse_rules_arguments() {
        let args = CliArgs::parse_from([
            "tierguard",
            "rules",
            "install",
            "--rules-file",
            "/srv/www/.htaccess",
        ]);

        match args.command.expect("rules command") {
            Command::Rules(rules) => match rules.command {
                RulesCommand::Install(file) => assert_eq!(
                    file.rules_file.as_deref(),
                    Some(std::path::Path::new("/srv/www/.htaccess"))
                ),
                other => panic!("wrong rules command parsed: {other:?}"),
            },
            _ => panic!("wrong command parsed"),
        }
    }

    #[test]
    fn parse_clear_arguments() {
        let args = CliArgs::parse_from(["tierguard", "clear", "--scope", "all"]);
        match args.command.expect("clear command") {
            Command::Clear(clear) => {
                assert_eq!(clear.scope, ScopeArg::All);
                assert_eq!(ClearScope::from(clear.scope), ClearScope::All);
            }
            _ => panic!("wrong command parsed"),
        }

        let args = CliArgs::parse_from(["tierguard", "clear"]);
        match args.command.expect("clear command") {
            Command::Clear(clear) => assert_eq!(clear.scope, ScopeArg::Content),
            _ => panic!("wrong command parsed"),
        }
    }
}
