//! Page cache gateway.
//!
//! Runs once per request when the web server's rewrite rules did not serve a
//! snapshot, and decides BYPASS, HIT, or MISS. A HIT ends the request; every
//! other outcome continues to the full render with an `X-Cache-Status` header
//! on the way out.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::SystemTime;

use axum::{
    body::{Body, HttpBody},
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use futures::FutureExt;
use metrics::counter;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use thiserror::Error;
use time::{OffsetDateTime, format_description::FormatItem, macros::format_description};
use tracing::{debug, instrument, warn};

use super::config::CacheConfig;
use super::device::DeviceClass;
use super::drivers::ObjectCacheDriver;
use super::drivers::edge::{GLOBAL_TAG, TAG_HEADER};
use super::keys::{CacheKey, KeyError};
use super::snapshot::{Snapshot, SnapshotError, SnapshotStore};

pub const CACHE_STATUS_HEADER: HeaderName = HeaderName::from_static("x-cache-status");

/// Cookie names that mark a session, a login, or an unlocked protected page.
/// Matched as substrings of the `Cookie` header, case-insensitively.
pub const AUTH_COOKIE_PATTERN: &str = "(tierguard_session|tierguard_logged_in|tierguard_postpass)";

/// One year, sent on every served snapshot.
pub const SNAPSHOT_CACHE_CONTROL: &str = "public, max-age=31536000";

const HTML_CONTENT_TYPE: &str = "text/html; charset=UTF-8";
const METRIC_GATEWAY_TOTAL: &str = "tierguard_gateway_total";

static AUTH_COOKIE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(&format!("(?i){AUTH_COOKIE_PATTERN}")).ok());

static HASHED_ASSET: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"^/(?:[^/]+/)*[^/]+?\.([0-9a-fA-F]{8,64})\.(css|js)$").ok()
});

const HTTP_DATE: &[FormatItem<'static>] = format_description!(
    "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
);

/// Value of the `X-Cache-Status` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CacheStatus {
    Bypass,
    Hit,
    Miss,
    Error,
}

impl CacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bypass => "BYPASS",
            Self::Hit => "HIT",
            Self::Miss => "MISS",
            Self::Error => "ERROR",
        }
    }

    fn header_value(self) -> HeaderValue {
        HeaderValue::from_static(self.as_str())
    }
}

impl fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a request skipped the snapshot store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BypassReason {
    Cli,
    Background,
    Ajax,
    Api,
    Admin,
    Method,
    Query,
    Body,
    AuthCookie,
}

/// How the request entered the process. Internal callers insert this as a
/// request extension; plain HTTP traffic gets the default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionContext {
    pub cli: bool,
    pub background: bool,
}

/// Set on MISS so the renderer knows which snapshot variant to persist.
#[derive(Debug, Clone)]
pub struct SnapshotTarget(pub CacheKey);

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("request carries no host")]
    MissingHost,
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

/// Request facts the decision depends on, copied out of the request.
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    pub method: Method,
    pub host: Option<String>,
    pub path: String,
    pub query: Option<String>,
    pub user_agent: Option<String>,
    pub cookies: Option<String>,
    pub if_none_match: Option<String>,
    pub ajax: bool,
    pub has_body: bool,
    pub context: ExecutionContext,
}

impl GatewayRequest {
    pub fn from_request(request: &Request<Body>) -> Self {
        let headers = request.headers();
        let host = header_str(headers, &header::HOST)
            .or_else(|| request.uri().authority().map(|authority| authority.as_str()))
            .map(str::to_string);
        let ajax = header_str(headers, &HeaderName::from_static("x-requested-with"))
            .is_some_and(|value| value.eq_ignore_ascii_case("XMLHttpRequest"));
        let declared_length = header_str(headers, &header::CONTENT_LENGTH)
            .and_then(|value| value.trim().parse::<u64>().ok())
            .unwrap_or(0);
        let has_body = declared_length > 0
            || headers.contains_key(header::TRANSFER_ENCODING)
            || request.body().size_hint().exact() != Some(0);

        Self {
            method: request.method().clone(),
            host,
            path: request.uri().path().to_string(),
            query: request.uri().query().map(str::to_string),
            user_agent: header_str(headers, &header::USER_AGENT).map(str::to_string),
            cookies: header_str(headers, &header::COOKIE).map(str::to_string),
            if_none_match: header_str(headers, &header::IF_NONE_MATCH).map(str::to_string),
            ajax,
            has_body,
            context: request
                .extensions()
                .get::<ExecutionContext>()
                .copied()
                .unwrap_or_default(),
        }
    }

    pub fn device(&self) -> DeviceClass {
        DeviceClass::from_user_agent(self.user_agent.as_deref())
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Outcome of the decision procedure.
#[derive(Debug, Clone)]
pub enum Decision {
    Bypass(BypassReason),
    Hit {
        snapshot: Snapshot,
        content_type: HeaderValue,
    },
    Miss {
        key: CacheKey,
    },
}

/// Application-level fallback for the rewrite rules.
pub struct PageCacheGateway {
    config: CacheConfig,
    store: SnapshotStore,
    object: Option<Arc<ObjectCacheDriver>>,
}

impl PageCacheGateway {
    pub fn new(config: CacheConfig) -> Self {
        let store = SnapshotStore::new(config.cache_root.clone());
        Self {
            config,
            store,
            object: None,
        }
    }

    /// Consult the in-memory tier before the disk snapshots.
    pub fn with_object_cache(mut self, object: Arc<ObjectCacheDriver>) -> Self {
        self.object = Some(object);
        self
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    /// First matching bypass condition, if any.
    pub fn bypass_reason(&self, request: &GatewayRequest) -> Option<BypassReason> {
        if request.context.cli {
            return Some(BypassReason::Cli);
        }
        if request.context.background {
            return Some(BypassReason::Background);
        }
        if request.ajax {
            return Some(BypassReason::Ajax);
        }
        if matches_prefix(&request.path, &self.config.api_prefixes) {
            return Some(BypassReason::Api);
        }
        if matches_prefix(&request.path, &self.config.admin_prefixes) {
            return Some(BypassReason::Admin);
        }
        if request.method != Method::GET {
            return Some(BypassReason::Method);
        }
        if request.query.as_deref().is_some_and(|query| !query.is_empty()) {
            return Some(BypassReason::Query);
        }
        if request.has_body {
            return Some(BypassReason::Body);
        }
        if request.cookies.as_deref().is_some_and(has_auth_cookie) {
            return Some(BypassReason::AuthCookie);
        }
        None
    }

    /// Decide how to handle `request`. Storage is never touched on BYPASS.
    pub async fn decide(&self, request: &GatewayRequest) -> Result<Decision, GatewayError> {
        if let Some(reason) = self.bypass_reason(request) {
            return Ok(Decision::Bypass(reason));
        }

        let now = SystemTime::now();

        if let Some((hash, extension)) = hashed_asset(&request.path) {
            if let Some(snapshot) = self.store.read_asset(extension, hash).await? {
                if snapshot.is_fresh(self.config.asset_lifetime, now) {
                    let content_type = mime_guess::from_ext(extension).first_or_octet_stream();
                    let content_type = HeaderValue::from_str(content_type.as_ref())
                        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
                    return Ok(Decision::Hit {
                        snapshot,
                        content_type,
                    });
                }
                debug!(path = %request.path, "asset snapshot expired");
            }
        }

        let host = request.host.as_deref().ok_or(GatewayError::MissingHost)?;
        let key = CacheKey::new(host, &request.path, request.device())?;

        let cached = self.object.as_ref().and_then(|object| object.lookup(&key));
        if let Some((body, stored_at)) = cached {
            let snapshot = Snapshot::from_body(body, stored_at);
            if snapshot.is_fresh(self.config.page_lifetime, now) {
                debug!(key = %key, tier = "object", "serving from memory");
                return Ok(Decision::Hit {
                    snapshot,
                    content_type: HeaderValue::from_static(HTML_CONTENT_TYPE),
                });
            }
        }

        match self.store.read_page(&key).await? {
            Some(snapshot) if snapshot.is_fresh(self.config.page_lifetime, now) => {
                Ok(Decision::Hit {
                    snapshot,
                    content_type: HeaderValue::from_static(HTML_CONTENT_TYPE),
                })
            }
            Some(_) => {
                // Expired snapshots stay on disk until the renderer replaces them.
                debug!(key = %key, "page snapshot expired");
                Ok(Decision::Miss { key })
            }
            None => Ok(Decision::Miss { key }),
        }
    }

    fn report_failure(&self, message: &str) {
        if self.config.diagnostics {
            warn!(error = %message, status = "ERROR", "page cache gateway failed");
        } else {
            debug!(error = %message, status = "ERROR", "page cache gateway failed");
        }
    }
}

fn matches_prefix(path: &str, prefixes: &[String]) -> bool {
    prefixes.iter().any(|prefix| {
        let prefix = prefix.trim_end_matches('/');
        !prefix.is_empty()
            && path
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
    })
}

pub fn has_auth_cookie(cookies: &str) -> bool {
    AUTH_COOKIE
        .as_ref()
        .is_some_and(|pattern| pattern.is_match(cookies))
}

/// `(hash, extension)` when `path` names a content-hashed asset.
fn hashed_asset(path: &str) -> Option<(&str, &str)> {
    let captures = HASHED_ASSET.as_ref()?.captures(path)?;
    let hash = captures.get(1)?.as_str();
    let extension = captures.get(2)?.as_str();
    Some((hash, extension))
}

fn validator_matches(if_none_match: &str, validator: &str) -> bool {
    if_none_match.split(',').map(str::trim).any(|candidate| {
        candidate == "*" || candidate.strip_prefix("W/").unwrap_or(candidate) == validator
    })
}

fn http_date(modified: SystemTime) -> Option<HeaderValue> {
    let formatted = OffsetDateTime::from(modified).format(HTTP_DATE).ok()?;
    HeaderValue::from_str(&formatted).ok()
}

/// Build the response for a served snapshot: 304 when the client's validator
/// matches, otherwise the full body.
pub fn serve_snapshot(
    snapshot: Snapshot,
    content_type: HeaderValue,
    if_none_match: Option<&str>,
) -> Response {
    let etag = HeaderValue::from_str(&snapshot.validator).ok();
    let not_modified = if_none_match.is_some_and(|value| validator_matches(value, &snapshot.validator));

    let mut response = if not_modified {
        StatusCode::NOT_MODIFIED.into_response()
    } else {
        let mut response = Response::new(Body::from(snapshot.body));
        response
            .headers_mut()
            .insert(header::CONTENT_TYPE, content_type);
        if let Some(last_modified) = http_date(snapshot.modified) {
            response
                .headers_mut()
                .insert(header::LAST_MODIFIED, last_modified);
        }
        response
    };

    let headers = response.headers_mut();
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static(SNAPSHOT_CACHE_CONTROL),
    );
    if let Some(etag) = etag {
        headers.insert(header::ETAG, etag);
    }
    headers.insert(CACHE_STATUS_HEADER, CacheStatus::Hit.header_value());
    // The page's own tags are not known here; the global tag still lets a
    // full purge reach what the accelerator stores from this response.
    headers.insert(TAG_HEADER, HeaderValue::from_static(GLOBAL_TAG));
    response
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|message| (*message).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "panic with non-string payload".to_string())
}

/// Runs a decision, turning both errors and panics into a failure message.
async fn guarded<F>(decision: F) -> Result<Decision, String>
where
    F: Future<Output = Result<Decision, GatewayError>>,
{
    match AssertUnwindSafe(decision).catch_unwind().await {
        Ok(Ok(decision)) => Ok(decision),
        Ok(Err(err)) => Err(err.to_string()),
        Err(payload) => Err(panic_message(payload.as_ref())),
    }
}

/// Middleware running the gateway in front of the full render.
#[instrument(skip_all, fields(path = %request.uri().path()))]
pub async fn page_cache_layer(
    State(gateway): State<Arc<PageCacheGateway>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let facts = GatewayRequest::from_request(&request);
    let status = match guarded(gateway.decide(&facts)).await {
        Ok(Decision::Hit {
            snapshot,
            content_type,
        }) => {
            debug!(cache = "page", outcome = "hit", "serving snapshot");
            counter!(METRIC_GATEWAY_TOTAL, "status" => CacheStatus::Hit.as_str()).increment(1);
            return serve_snapshot(snapshot, content_type, facts.if_none_match.as_deref());
        }
        Ok(Decision::Bypass(reason)) => {
            debug!(cache = "page", outcome = "bypass", reason = ?reason, "bypassing snapshots");
            CacheStatus::Bypass
        }
        Ok(Decision::Miss { key }) => {
            debug!(cache = "page", outcome = "miss", key = %key, "snapshot miss");
            request.extensions_mut().insert(SnapshotTarget(key));
            CacheStatus::Miss
        }
        Err(message) => {
            gateway.report_failure(&message);
            CacheStatus::Error
        }
    };

    counter!(METRIC_GATEWAY_TOTAL, "status" => status.as_str()).increment(1);
    let mut response = next.run(request).await;
    response
        .headers_mut()
        .insert(CACHE_STATUS_HEADER, status.header_value());
    response
}
