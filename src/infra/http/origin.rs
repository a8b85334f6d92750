//! Reverse proxy to the upstream renderer.
//!
//! Every request the gateway does not answer from a snapshot ends up here. The
//! renderer describes each response through two private headers, which are
//! consumed and never forwarded to the client:
//!
//! - `X-Origin-View`: `single post=12 terms=3,4`, `listing`, or `listing term=7`
//! - `X-Origin-Flags`: any of `authenticated`, `feed`, `trackback`
//!
//! A MISS that comes back as a cacheable HTML page is written back into the
//! cache tiers before the response is returned.

use axum::{
    body::{Body, to_bytes},
    extract::State,
    http::{HeaderMap, HeaderName, Request, StatusCode, header},
    response::{IntoResponse, Response},
};
use metrics::counter;
use tracing::{debug, warn};
use url::Url;

use crate::{
    application::error::HttpError,
    cache::{
        SnapshotTarget,
        drivers::{ResponseContext, ViewContext},
    },
    config::OriginSettings,
    infra::error::InfraError,
};

use super::public::HttpState;

const SOURCE: &str = "infra::http::origin";
const METRIC_POPULATE_TOTAL: &str = "tierguard_origin_populate_total";

pub const ORIGIN_VIEW_HEADER: HeaderName = HeaderName::from_static("x-origin-view");
pub const ORIGIN_FLAGS_HEADER: HeaderName = HeaderName::from_static("x-origin-flags");
const FORWARDED_HOST_HEADER: HeaderName = HeaderName::from_static("x-forwarded-host");

const HOP_BY_HOP: [HeaderName; 9] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    header::CONTENT_LENGTH,
];

/// HTTP client bound to the renderer's base URL.
pub struct OriginClient {
    client: reqwest::Client,
    base: Url,
    max_body_bytes: usize,
}

impl OriginClient {
    pub fn new(settings: &OriginSettings) -> Result<Self, InfraError> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|err| InfraError::upstream(format!("failed to build origin client: {err}")))?;

        Ok(Self {
            client,
            base: settings.url.clone(),
            max_body_bytes: settings.max_body_bytes,
        })
    }

    /// Renderer URL for a request target. Only the path and query are taken
    /// from the client; scheme and authority always come from the base URL.
    pub fn upstream_url(&self, path: &str, query: Option<&str>) -> Url {
        let mut url = self.base.clone();
        url.set_path(path);
        url.set_query(query);
        url
    }
}

/// Copy of `headers` without hop-by-hop fields or `Host`.
fn forwardable(headers: &HeaderMap) -> HeaderMap {
    let mut forwarded = headers.clone();
    for name in HOP_BY_HOP.iter().chain(std::iter::once(&header::HOST)) {
        forwarded.remove(name);
    }
    forwarded
}

/// Parse an `X-Origin-View` value. Anything unrecognised is [`ViewContext::Other`].
pub fn parse_view(value: &str) -> ViewContext {
    let mut parts = value.split_whitespace();
    match parts.next() {
        Some("single") => {
            let mut post_id = None;
            let mut term_ids = Vec::new();
            for part in parts {
                if let Some(id) = part.strip_prefix("post=") {
                    post_id = id.parse().ok();
                } else if let Some(ids) = part.strip_prefix("terms=") {
                    term_ids = ids
                        .split(',')
                        .filter_map(|id| id.trim().parse().ok())
                        .collect();
                }
            }
            match post_id {
                Some(post_id) => ViewContext::Single { post_id, term_ids },
                None => ViewContext::Other,
            }
        }
        Some("listing") => ViewContext::Listing {
            term_id: parts
                .find_map(|part| part.strip_prefix("term="))
                .and_then(|id| id.parse().ok()),
        },
        _ => ViewContext::Other,
    }
}

/// Remove the renderer's private headers and turn them into a [`ResponseContext`].
pub fn take_response_context(headers: &mut HeaderMap) -> ResponseContext {
    let view = headers
        .remove(ORIGIN_VIEW_HEADER)
        .and_then(|value| value.to_str().ok().map(parse_view))
        .unwrap_or_default();

    let mut context = ResponseContext {
        view,
        ..Default::default()
    };
    let flags = headers.remove(ORIGIN_FLAGS_HEADER);
    let flags = flags.as_ref().and_then(|value| value.to_str().ok()).unwrap_or("");
    for flag in flags.split([',', ' ']).map(str::trim) {
        match flag {
            "authenticated" => context.authenticated = true,
            "feed" => context.feed = true,
            "trackback" => context.trackback = true,
            _ => {}
        }
    }
    context
}

/// Whether a rendered response may be persisted as a page snapshot.
fn is_snapshot_worthy(status: StatusCode, headers: &HeaderMap, context: &ResponseContext) -> bool {
    if status != StatusCode::OK || context.authenticated || context.feed || context.trackback {
        return false;
    }
    if headers.contains_key(header::SET_COOKIE) {
        return false;
    }
    let html = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.trim_start().to_ascii_lowercase().starts_with("text/html"));
    let private = headers
        .get(header::CACHE_CONTROL)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| {
            let value = value.to_ascii_lowercase();
            value.contains("no-store") || value.contains("private")
        });
    html && !private
}

pub(super) async fn proxy(State(state): State<HttpState>, request: Request<Body>) -> Response {
    let target = request.extensions().get::<SnapshotTarget>().cloned();
    let (parts, body) = request.into_parts();

    let url = state
        .origin
        .upstream_url(parts.uri.path(), parts.uri.query());

    let body = match to_bytes(body, state.origin.max_body_bytes).await {
        Ok(body) => body,
        Err(err) => {
            return HttpError::new(
                SOURCE,
                StatusCode::PAYLOAD_TOO_LARGE,
                "Request body too large",
                err.to_string(),
            )
            .into_response();
        }
    };

    let mut headers = forwardable(&parts.headers);
    if let Some(host) = parts.headers.get(header::HOST) {
        headers.insert(FORWARDED_HOST_HEADER, host.clone());
    }

    let upstream = match state
        .origin
        .client
        .request(parts.method.clone(), url)
        .headers(headers)
        .body(body)
        .send()
        .await
    {
        Ok(response) => response,
        Err(err) => {
            return HttpError::from_error(
                SOURCE,
                StatusCode::BAD_GATEWAY,
                "Upstream renderer unavailable",
                &err,
            )
            .into_response();
        }
    };

    let status = upstream.status();
    let mut response_headers = forwardable(upstream.headers());
    let context = take_response_context(&mut response_headers);

    let body = match upstream.bytes().await {
        Ok(body) if body.len() <= state.origin.max_body_bytes => body,
        Ok(body) => {
            return HttpError::new(
                SOURCE,
                StatusCode::BAD_GATEWAY,
                "Upstream response too large",
                format!("{} bytes exceeds the configured limit", body.len()),
            )
            .into_response();
        }
        Err(err) => {
            return HttpError::from_error(
                SOURCE,
                StatusCode::BAD_GATEWAY,
                "Upstream renderer unavailable",
                &err,
            )
            .into_response();
        }
    };

    if let Some(SnapshotTarget(key)) = target {
        if is_snapshot_worthy(status, &response_headers, &context) {
            let failures = state.manager.populate_key(&key, body.clone()).await;
            let result = if failures.is_empty() { "ok" } else { "partial" };
            counter!(METRIC_POPULATE_TOTAL, "result" => result).increment(1);
            debug!(key = %key, failures = failures.len(), "rendered page cached");
        } else {
            debug!(key = %key, status = status.as_u16(), "rendered page not cacheable");
        }
    }

    if let Some(edge) = state.edge.as_ref() {
        edge.apply_headers(&context, &mut response_headers);
    }

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    if status.is_server_error() {
        warn!(status = status.as_u16(), path = %parts.uri.path(), "upstream renderer error");
    }
    response
}
