mod admin;
mod middleware;
pub mod origin;
mod public;

pub use admin::{AdminState, build_admin_router};
pub use origin::OriginClient;
pub use public::{HttpState, build_router};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::application::error::ErrorReport;
use crate::infra::mirror::PostgresMirrorStore;

/// Without a configured database there is nothing to check.
async fn db_health_response(mirror: Option<&PostgresMirrorStore>) -> Response {
    let Some(mirror) = mirror else {
        return StatusCode::NO_CONTENT.into_response();
    };
    match mirror.health_check().await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => {
            let mut response = StatusCode::SERVICE_UNAVAILABLE.into_response();
            ErrorReport::from_error(
                "infra::http::db_health",
                StatusCode::SERVICE_UNAVAILABLE,
                &err,
            )
            .attach(&mut response);
            response
        }
    }
}
