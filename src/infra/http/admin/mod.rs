mod cache;
mod health;
mod rules;
mod signals;
mod state;

pub use state::AdminState;

use axum::{
    Router, middleware,
    routing::{get, post},
};

use super::middleware::{log_responses, set_request_context};

/// Operator surface. Bind it to a private address only.
pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/cache/clear", post(cache::clear_caches))
        .route("/cache/drivers/{kind}/clear", post(cache::clear_driver))
        .route("/cache/keys/invalidate", post(cache::invalidate_key))
        .route("/cache/status", get(cache::cache_status))
        .route("/signals", post(signals::dispatch_signal))
        .route("/edge/purge-post", post(signals::purge_post))
        .route(
            "/rules",
            get(rules::show_rules)
                .put(rules::install_rules)
                .delete(rules::remove_rules),
        )
        .route("/_health/db", get(health::admin_health))
        .with_state(state)
        .layer(middleware::from_fn(log_responses))
        .layer(middleware::from_fn(set_request_context))
}
