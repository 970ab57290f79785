#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Glimpse API server
//!
//! HTTP surface over the billing crate: signup, the authenticated user
//! endpoint with its billing section, self-serve plan enrollment, the Stripe
//! webhook receiver, and the public plan catalog.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use state::AppState;
