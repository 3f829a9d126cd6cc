//! Request handlers.

pub mod counters;
pub mod coupons;
pub mod health;

pub use health::*;
