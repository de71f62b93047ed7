//! # Tunnel Server
//!
//! The public-facing half of the tunnel: a `tokio`/`axum` server that
//! accepts control connections from `tunnel-client` processes over
//! `GET /connect`, and routes ordinary HTTP traffic arriving on a
//! registered subdomain through to whichever control connection owns it.
//!
//! ## Modules
//!
//! - [`config`]    — environment-driven configuration (spec §6)
//! - [`registry`]  — `subdomain -> Tunnel` registry (spec §4.4)
//! - [`tunnel`]    — per-tunnel and per-stream state (spec §3)
//! - [`control`]   — the `/connect` control WebSocket handler (spec §4.1, §5)
//! - [`public`]    — the public HTTP fallback handler (spec §4.3)
//! - [`subdomain`] — subdomain validation/extraction (spec §4.3, §4.4)
//! - [`ratelimit`] — per-IP fixed-window rate limiting (spec §6)
//! - [`health`]    — `GET /health`
//! - [`error`]     — internal server errors (bind failures, registration races)

mod config;
mod control;
mod error;
mod health;
mod public;
mod ratelimit;
mod registry;
mod subdomain;
mod tunnel;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::middleware;
use axum::routing::{any, get};
use axum::Router;
use tower_http::cors::CorsLayer;
use tracing::info;

use config::Config;
use error::ServerError;
use ratelimit::RateLimiter;
use registry::Registry;

/// Shared application state, handed to every route (spec §4.4, §6).
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub rate_limiter: Arc<RateLimiter>,
    pub config: Arc<Config>,
}

#[tokio::main]
async fn main() -> Result<(), ServerError> {
    let config = Config::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.default_log_directive().into()),
        )
        .init();

    let state = AppState {
        registry: Arc::new(Registry::new()),
        rate_limiter: Arc::new(RateLimiter::new(config.rate_limit_per_minute)),
        config: Arc::new(config),
    };

    // The rate limiter guards only the public traffic path (spec §6); the
    // control and health endpoints stay unthrottled.
    let public_router = Router::new()
        .fallback(any(public::handle_public_request))
        .route_layer(middleware::from_fn_with_state(state.clone(), ratelimit::enforce));

    let app = Router::new()
        .route("/health", get(health::health))
        .route("/connect", get(control::connect_handler))
        .merge(public_router)
        .layer(CorsLayer::permissive())
        .with_state(state.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.port));
    info!(%addr, domain_base = %state.config.domain_base, "tunnel-server listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .expect("server exited unexpectedly");
    Ok(())
}
