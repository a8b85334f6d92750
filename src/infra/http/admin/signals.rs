use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};

use crate::{application::error::HttpError, cache::MutationSignal};

use super::AdminState;

const SOURCE: &str = "infra::http::admin::signals";

/// Route a mutation signal from the content layer to its bound clear.
pub(super) async fn dispatch_signal(
    State(state): State<AdminState>,
    Json(signal): Json<MutationSignal>,
) -> Result<Response, HttpError> {
    let report = state.trigger.trigger(signal).await.ok_or_else(|| {
        HttpError::new(
            SOURCE,
            StatusCode::CONFLICT,
            "Cache not initialized",
            "mutation signal received before cache initialization",
        )
    })?;
    let status = if report.success {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    Ok((status, Json(report)).into_response())
}

#[derive(Debug, Deserialize)]
pub(super) struct PurgePostRequest {
    post_id: u64,
    #[serde(default)]
    term_ids: Vec<u64>,
}

#[derive(Debug, Serialize)]
pub(super) struct PurgeAccepted {
    dispatched: usize,
}

/// Targeted edge purge for one post. Dispatch is asynchronous, hence 202.
pub(super) async fn purge_post(
    State(state): State<AdminState>,
    Json(request): Json<PurgePostRequest>,
) -> Result<(StatusCode, Json<PurgeAccepted>), HttpError> {
    let edge = state.edge.as_ref().ok_or_else(|| {
        HttpError::new(
            SOURCE,
            StatusCode::NOT_FOUND,
            "Edge accelerator disabled",
            "edge accelerator driver is not enabled",
        )
    })?;
    let dispatched = edge.purge_post(request.post_id, &request.term_ids);
    Ok((StatusCode::ACCEPTED, Json(PurgeAccepted { dispatched })))
}
