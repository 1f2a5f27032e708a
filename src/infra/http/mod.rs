mod middleware;
mod serve;

use std::sync::Arc;

use axum::{Router, middleware as axum_middleware, routing::get};
use tower_http::compression::CompressionLayer;

use crate::{
    cache::{BlobStore, CacheStore},
    domain::endpoint::Endpoint,
};

pub use middleware::{RequestContext, log_responses, set_request_context};
pub use serve::{METRIC_HTTP_RESPONSES, not_found, serve_endpoint};

/// Read-side handles shared by every request.
#[derive(Clone)]
pub struct HttpState {
    pub store: Arc<CacheStore>,
    pub blobs: Arc<BlobStore>,
}

/// One `GET` route per endpoint; the matched route template is the cache key.
pub fn build_router(state: HttpState, endpoints: &[Arc<Endpoint>]) -> Router {
    let mut router = Router::new();
    for endpoint in endpoints {
        router = router.route(endpoint.path(), get(serve_endpoint));
    }

    router
        .fallback(not_found)
        .with_state(state)
        .layer(CompressionLayer::new())
        .layer(axum_middleware::from_fn(log_responses))
        .layer(axum_middleware::from_fn(set_request_context))
}
