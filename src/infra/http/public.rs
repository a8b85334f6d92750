use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    middleware,
    response::Response,
    routing::get,
};

use crate::{
    cache::{CacheManager, PageCacheGateway, drivers::EdgeAcceleratorDriver, page_cache_layer},
    infra::mirror::PostgresMirrorStore,
};

use super::{
    db_health_response,
    middleware::{log_responses, set_request_context},
    origin::{OriginClient, proxy},
};

#[derive(Clone)]
pub struct HttpState {
    pub gateway: Arc<PageCacheGateway>,
    pub manager: Arc<CacheManager>,
    pub edge: Option<Arc<EdgeAcceleratorDriver>>,
    pub origin: Arc<OriginClient>,
    pub mirror: Option<PostgresMirrorStore>,
}

pub fn build_router(state: HttpState) -> Router {
    // Everything unknown goes to the renderer, behind the page cache.
    let cached_routes = Router::new()
        .fallback(proxy)
        .layer(middleware::from_fn_with_state(
            state.gateway.clone(),
            page_cache_layer,
        ));

    let static_routes = Router::new().route("/_health/db", get(public_health));

    static_routes
        .merge(cached_routes)
        .with_state(state)
        .layer(middleware::from_fn(log_responses))
        .layer(middleware::from_fn(set_request_context))
}

async fn public_health(State(state): State<HttpState>) -> Response {
    db_health_response(state.mirror.as_ref()).await
}
