use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};

use crate::{
    application::error::HttpError,
    cache::{CacheKey, ClearFailure, ClearScope, DeviceClass, DriverKind, DriverStatus, SignalEnvelope},
};

use super::AdminState;

const SOURCE: &str = "infra::http::admin::cache";

#[derive(Debug, Deserialize)]
pub(super) struct ClearQuery {
    #[serde(default = "default_scope")]
    scope: ClearScope,
}

fn default_scope() -> ClearScope {
    ClearScope::Content
}

/// Run a clear. Driver failures still return the report, with a 500 status.
pub(super) async fn clear_caches(
    State(state): State<AdminState>,
    Query(query): Query<ClearQuery>,
) -> Response {
    let report = state.manager.clear(query.scope).await;
    let status = if report.success {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, Json(report)).into_response()
}

pub(super) async fn clear_driver(
    State(state): State<AdminState>,
    Path(kind): Path<String>,
) -> Result<StatusCode, HttpError> {
    let kind: DriverKind = kind.parse()?;
    state.manager.clear_driver(kind).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub(super) struct InvalidateRequest {
    host: String,
    path: String,
    /// Both variants when absent.
    device: Option<DeviceClass>,
}

#[derive(Debug, Serialize)]
pub(super) struct InvalidateResponse {
    keys: Vec<String>,
    errors: Vec<ClearFailure>,
}

pub(super) async fn invalidate_key(
    State(state): State<AdminState>,
    Json(request): Json<InvalidateRequest>,
) -> Result<Json<InvalidateResponse>, HttpError> {
    let devices = match request.device {
        Some(device) => vec![device],
        None => vec![DeviceClass::Desktop, DeviceClass::Mobile],
    };

    let mut keys = Vec::with_capacity(devices.len());
    let mut errors = Vec::new();
    for device in devices {
        let key = CacheKey::new(&request.host, &request.path, device).map_err(|err| {
            HttpError::from_error(SOURCE, StatusCode::BAD_REQUEST, "Invalid cache key", &err)
        })?;
        errors.extend(state.manager.invalidate_key(&key).await);
        keys.push(key.to_string());
    }

    Ok(Json(InvalidateResponse { keys, errors }))
}

#[derive(Debug, Serialize)]
pub(super) struct CacheStatusView {
    initialized: bool,
    drivers: Vec<DriverStatus>,
    last_errors: Vec<ClearFailure>,
    recent_signals: Vec<SignalEnvelope>,
    rules_installed: Option<bool>,
}

pub(super) async fn cache_status(State(state): State<AdminState>) -> Json<CacheStatusView> {
    Json(CacheStatusView {
        initialized: state.manager.is_initialized(),
        drivers: state.manager.driver_statuses(),
        last_errors: state.manager.last_errors(),
        recent_signals: state.manager.signals().recent(),
        rules_installed: state.rules.is_installed().ok(),
    })
}
