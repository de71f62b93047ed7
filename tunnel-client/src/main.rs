//! # Tunnel Client
//!
//! A CLI process that registers a tunnel with a `tunnel-server` and proxies
//! every inbound request it receives over the control channel to a local
//! HTTP origin (spec §4.2).
//!
//! ## Modules
//!
//! - [`config`]  — CLI/env configuration (spec §6)
//! - [`control`] — the control connection: handshake + frame dispatch loop
//! - [`stream`]  — per-stream request/response bridge to the local origin
//! - [`error`]   — typed errors for per-stream origin dispatch

mod config;
mod control;
mod error;
mod stream;

use clap::Parser;

use config::{Cli, ClientConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| default_log_directive().into()),
        )
        .init();

    let cli = Cli::parse();
    let Some(config) = ClientConfig::resolve(cli) else {
        eprintln!("error: --port is required (or pass it positionally: tunnel-client <port>)");
        std::process::exit(1);
    };

    if let Err(e) = control::run(config).await {
        eprintln!("tunnel-client: {e:#}");
        std::process::exit(1);
    }

    Ok(())
}

/// The `tracing-subscriber` default directive used when `RUST_LOG` is
/// unset: `SIMPLE_TUNNEL_LOG` (spec §6), a client-specific level name
/// distinct from `RUST_LOG`'s filter-string syntax, falls back to `info`.
fn default_log_directive() -> String {
    let level = std::env::var("SIMPLE_TUNNEL_LOG").unwrap_or_else(|_| "info".to_string());
    format!("tunnel_client={level}")
}
