//! # Per-IP rate limiting (spec §6)
//!
//! A fixed-window counter keyed by client IP, the same "one DashMap as the
//! process's shared mutable state" idiom the registry uses. This is the
//! ambient stack reached for in place of a dedicated crate: the
//! reference's dependency set has no rate-limiting library, so the
//! simplest honest implementation is a counter behind the structure
//! already used elsewhere in this codebase for concurrent shared state.

use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use dashmap::DashMap;

use crate::AppState;

const WINDOW: Duration = Duration::from_secs(60);

pub struct RateLimiter {
    limit: u32,
    windows: DashMap<IpAddr, (Instant, u32)>,
}

impl RateLimiter {
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            windows: DashMap::new(),
        }
    }

    /// Returns `true` if the request is allowed, `false` if `ip` has
    /// exceeded `limit` requests within the current 60s window.
    pub fn check(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let mut entry = self.windows.entry(ip).or_insert((now, 0));
        if now.duration_since(entry.0) >= WINDOW {
            *entry = (now, 1);
            true
        } else if entry.1 < self.limit {
            entry.1 += 1;
            true
        } else {
            false
        }
    }
}

/// `axum` middleware enforcing the per-IP limit on every request, ahead of
/// subdomain routing (spec §6 "Rate limiting").
pub async fn enforce(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: axum::extract::Request,
    next: Next,
) -> Response {
    if state.rate_limiter.check(addr.ip()) {
        next.run(req).await
    } else {
        (StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded").into_response()
    }
}
