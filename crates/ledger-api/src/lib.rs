//! Axum HTTP API for the coupon usage ledger.
//!
//! This crate provides:
//! - Coupon create/lookup/validate and idempotent apply endpoints
//! - Guarded counter increments on arbitrary documents
//! - Service token auth, rate limiting and security headers
//! - Prometheus metrics

pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod routes;
pub mod state;

pub use config::ApiConfig;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
