//! API routes.

use std::sync::Arc;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

use crate::handlers::coupons::{
    apply_batch, apply_coupon, create_coupon, get_coupon, list_affiliate_usage, validate_coupon,
};
use crate::handlers::counters::increment_counter;
use crate::handlers::{health, ready};
use crate::metrics::metrics_middleware;
use crate::middleware::{
    cors_layer, rate_limit_middleware, request_id, request_logging, require_service_token,
    security_headers, RateLimiterCache,
};
use crate::state::AppState;

/// Create the API router.
pub fn create_router(state: AppState, metrics_handle: Option<PrometheusHandle>) -> Router {
    let coupon_routes = Router::new()
        .route("/coupons", post(create_coupon))
        .route("/coupons/apply", post(apply_coupon))
        .route("/coupons/apply-batch", post(apply_batch))
        .route("/coupons/:code", get(get_coupon))
        .route("/coupons/:code/validate", get(validate_coupon))
        .route("/affiliates/:code/usage", get(list_affiliate_usage));

    let counter_routes = Router::new().route("/counters/increment", post(increment_counter));

    let rate_limiter = Arc::new(RateLimiterCache::new(state.config.rate_limit_rps));

    let api_routes = Router::new()
        .merge(coupon_routes)
        .merge(counter_routes)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_service_token,
        ))
        .layer(middleware::from_fn_with_state(
            rate_limiter,
            rate_limit_middleware,
        ));

    let health_routes = Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready));

    let metrics_routes = if let Some(handle) = metrics_handle {
        Router::new().route("/metrics", get(move || async move { handle.render() }))
    } else {
        Router::new()
    };

    Router::new()
        .nest("/api", api_routes)
        .merge(health_routes)
        .merge(metrics_routes)
        .layer(RequestBodyLimitLayer::new(state.config.max_body_size))
        .layer(TimeoutLayer::new(state.config.request_timeout))
        .layer(middleware::from_fn(metrics_middleware))
        .layer(middleware::from_fn(security_headers))
        .layer(middleware::from_fn(request_logging))
        // Wraps request_logging so the id is set first
        .layer(middleware::from_fn(request_id))
        .layer(cors_layer(&state.config.cors_origins))
        .with_state(state)
}
