//! HTTP API for Beacon.
//!
//! Exposes task creation, inspection and control over JSON, plus a health
//! check, Prometheus metrics, per-client rate limiting and optional static
//! dashboard files.

mod error;
mod metrics;
mod rate_limit;
mod routes;

pub use error::ApiError;
pub use metrics::ApiMetrics;
pub use rate_limit::{ClientRateLimiter, DEFAULT_RATE_LIMIT, DEFAULT_RATE_WINDOW, RateLimitConfig};
pub use routes::{ApiConfig, AppState, MAX_BODY_BYTES, TaskRef, TaskSummary, create_router};
