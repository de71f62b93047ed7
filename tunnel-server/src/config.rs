//! # Server configuration
//!
//! Resolved once at startup from environment variables (spec §6). There is
//! no config file and no CLI surface on the server side — everything is an
//! env var, matching the reference server's `main.rs`, which reads nothing
//! but a hardcoded port.

/// Resolved server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// `PORT`, default 3000.
    pub port: u16,
    /// `DOMAIN_BASE`, default `localhost`.
    pub domain_base: String,
    /// `LOG_LEVEL`, used only to pick a default `tracing` directive when
    /// `RUST_LOG` is unset.
    pub log_level: Option<String>,
    /// `LOG_ALL_REQUESTS` — log every public request, not just failures.
    pub log_all_requests: bool,
    /// Per-IP requests/minute on the public traffic path (spec §6).
    pub rate_limit_per_minute: u32,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: std::env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3000),
            domain_base: std::env::var("DOMAIN_BASE").unwrap_or_else(|_| "localhost".to_string()),
            log_level: std::env::var("LOG_LEVEL").ok(),
            log_all_requests: env_flag("LOG_ALL_REQUESTS"),
            rate_limit_per_minute: std::env::var("RATE_LIMIT_PER_MINUTE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(200),
        }
    }

    /// The `tracing-subscriber` default directive to fall back to when
    /// `RUST_LOG` is not set.
    pub fn default_log_directive(&self) -> String {
        match self.log_level.as_deref() {
            Some(level) => format!("tunnel_server={level}"),
            None => "tunnel_server=info".to_string(),
        }
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}
