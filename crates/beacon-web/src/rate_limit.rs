//! Per-client request rate limiting.
//!
//! Each client address gets a token bucket holding `max_requests` tokens that
//! refills evenly over `window`. Requests without a known peer address share
//! one bucket.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use governor::clock::{Clock, DefaultClock};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use tracing::debug;

use crate::error::ApiError;

/// Requests allowed per client and window by default.
pub const DEFAULT_RATE_LIMIT: u32 = 120;

/// Default rate limit window.
pub const DEFAULT_RATE_WINDOW: Duration = Duration::from_secs(60);

/// Tracked clients before idle buckets are dropped.
const MAX_TRACKED_CLIENTS: usize = 10_000;

/// How many requests a client may make per window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: DEFAULT_RATE_LIMIT,
            window: DEFAULT_RATE_WINDOW,
        }
    }
}

impl RateLimitConfig {
    /// `None` when the limit is zero or the window is too short to divide.
    fn quota(&self) -> Option<Quota> {
        let burst = NonZeroU32::new(self.max_requests)?;
        let period = self.window / self.max_requests;
        Some(Quota::with_period(period)?.allow_burst(burst))
    }
}

/// Keyed limiter over client IP addresses.
pub struct ClientRateLimiter {
    limiter: DefaultKeyedRateLimiter<IpAddr>,
    clock: DefaultClock,
}

impl ClientRateLimiter {
    /// Build a limiter, or `None` if `config` cannot limit anything.
    pub fn new(config: RateLimitConfig) -> Option<Self> {
        let quota = config.quota()?;
        Some(Self {
            limiter: RateLimiter::keyed(quota),
            clock: DefaultClock::default(),
        })
    }

    /// Take one token for `client`, or return how long until one is free.
    pub fn check(&self, client: IpAddr) -> Result<(), Duration> {
        if self.limiter.len() > MAX_TRACKED_CLIENTS {
            self.limiter.retain_recent();
        }
        self.limiter
            .check_key(&client)
            .map_err(|not_until| not_until.wait_time_from(self.clock.now()))
    }
}

/// Middleware rejecting clients that ran out of tokens with 429.
pub async fn limit_requests(
    State(limiter): State<Arc<ClientRateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    let client = client_ip(&request);
    match limiter.check(client) {
        Ok(()) => next.run(request).await,
        Err(wait) => {
            debug!(client = %client, wait_ms = wait.as_millis() as u64, "rate limited");
            ApiError::TooManyRequests {
                retry_after: wait.as_secs().max(1),
            }
            .into_response()
        }
    }
}

fn client_ip(request: &Request) -> IpAddr {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}
