use axum::{
    Json,
    extract::State,
    http::{StatusCode, header::CONTENT_TYPE},
    response::IntoResponse,
};
use serde::Serialize;

use crate::application::error::HttpError;

use super::AdminState;

const SOURCE: &str = "infra::http::admin::rules";

#[derive(Debug, Serialize)]
pub(super) struct RulesOutcome {
    installed: bool,
}

pub(super) async fn install_rules(
    State(state): State<AdminState>,
) -> Result<Json<RulesOutcome>, HttpError> {
    state.rules.try_install().map_err(|err| {
        HttpError::from_error(
            SOURCE,
            StatusCode::INTERNAL_SERVER_ERROR,
            "Rewrite rules could not be installed",
            &err,
        )
    })?;
    Ok(Json(RulesOutcome { installed: true }))
}

pub(super) async fn remove_rules(
    State(state): State<AdminState>,
) -> Result<Json<RulesOutcome>, HttpError> {
    state.rules.try_remove().map_err(|err| {
        HttpError::from_error(
            SOURCE,
            StatusCode::INTERNAL_SERVER_ERROR,
            "Rewrite rules could not be removed",
            &err,
        )
    })?;
    Ok(Json(RulesOutcome { installed: false }))
}

pub(super) async fn show_rules(State(state): State<AdminState>) -> impl IntoResponse {
    (
        [(CONTENT_TYPE, "text/plain; charset=utf-8")],
        state.rules.render_block(),
    )
}
