//! # Client configuration (spec §6)
//!
//! Resolved from `clap`-parsed CLI flags layered over environment
//! variables. The positional fallback `<port> [connect] [subdomain]` is
//! applied when the equivalent flags were not given, mirroring the
//! reference's tolerance for informal invocation.

use clap::Parser;

const DEFAULT_CONNECT: &str = "ws://localhost:3000/connect";
const DEFAULT_HOST: &str = "127.0.0.1";

/// `tunnel-client --port 8080 --subdomain myapp`, or positionally
/// `tunnel-client 8080 ws://relay.example.com/connect myapp`.
#[derive(Parser, Debug)]
#[command(name = "tunnel-client", version, about = "Expose a local HTTP origin through a tunnel-server subdomain")]
pub struct Cli {
    /// Local origin port to forward requests to.
    #[arg(long)]
    pub port: Option<u16>,

    /// Local origin host.
    #[arg(long, default_value = DEFAULT_HOST)]
    pub host: String,

    /// Requested subdomain; the server picks a random one if absent or taken.
    #[arg(long)]
    pub subdomain: Option<String>,

    /// Control channel URL (the server's `/connect` WebSocket endpoint).
    #[arg(long, env = "SIMPLE_TUNNEL_CONNECT")]
    pub connect: Option<String>,

    /// Overrides the base domain used to print the public URL; defaults to
    /// the host component of `--connect`.
    #[arg(long, env = "SIMPLE_TUNNEL_DOMAIN_BASE")]
    pub domain_base: Option<String>,

    /// Opaque token echoed at handshake (spec §3 "opaque token").
    #[arg(long)]
    pub token: Option<String>,

    /// Positional fallback: `<port> [connect] [subdomain]`.
    #[arg(hide = true)]
    pub positional: Vec<String>,
}

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub origin_host: String,
    pub origin_port: u16,
    pub connect_url: String,
    pub subdomain: Option<String>,
    pub domain_base_override: Option<String>,
    pub token: Option<String>,
    /// `SIMPLE_TUNNEL_STREAM` — force streaming mode for all methods.
    pub force_stream: bool,
    /// `SIMPLE_TUNNEL_FORCE_IDENTITY` — replace `accept-encoding` with
    /// `identity` instead of removing it.
    pub force_identity: bool,
}

impl ClientConfig {
    /// Resolves CLI flags + env vars + the positional fallback into a
    /// [`ClientConfig`]. Returns `None` (exit code 1 per spec §6) when no
    /// port was given by any means.
    pub fn resolve(cli: Cli) -> Option<Self> {
        let mut port = cli.port;
        let mut connect = cli.connect.clone();
        let mut subdomain = cli.subdomain.clone();

        // Positional fallback: `<port> [connect] [subdomain]`, applied only
        // where the corresponding flag was not already given.
        let mut positional = cli.positional.into_iter();
        if port.is_none() {
            if let Some(p) = positional.next().and_then(|s| s.parse().ok()) {
                port = Some(p);
            }
        } else {
            positional.next();
        }
        if connect.is_none() {
            if let Some(c) = positional.next() {
                connect = Some(c);
            }
        } else {
            positional.next();
        }
        if subdomain.is_none() {
            subdomain = positional.next();
        }

        let port = port?;
        let connect_url = connect.unwrap_or_else(|| DEFAULT_CONNECT.to_string());

        // clap's `env` attribute only binds one name per field
        // (`SIMPLE_TUNNEL_DOMAIN_BASE`); spec §6 also accepts the bare
        // `DOMAIN_BASE` name, so fall back to it manually.
        let domain_base_override = cli
            .domain_base
            .or_else(|| std::env::var("DOMAIN_BASE").ok());

        Some(Self {
            origin_host: cli.host,
            origin_port: port,
            connect_url,
            subdomain,
            domain_base_override,
            token: cli.token,
            force_stream: env_flag("SIMPLE_TUNNEL_STREAM"),
            force_identity: env_flag("SIMPLE_TUNNEL_FORCE_IDENTITY"),
        })
    }

    /// The origin base URL, e.g. `http://127.0.0.1:8080`.
    pub fn origin_base_url(&self) -> String {
        format!("http://{}:{}", self.origin_host, self.origin_port)
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(port: Option<u16>, connect: Option<&str>, subdomain: Option<&str>, positional: Vec<&str>) -> Cli {
        Cli {
            port,
            host: DEFAULT_HOST.to_string(),
            subdomain: subdomain.map(String::from),
            connect: connect.map(String::from),
            domain_base: None,
            token: None,
            positional: positional.into_iter().map(String::from).collect(),
        }
    }

    #[test]
    fn flags_take_precedence_over_positional() {
        let cfg = ClientConfig::resolve(cli(Some(9000), Some("ws://a/connect"), None, vec!["1234"])).unwrap();
        assert_eq!(cfg.origin_port, 9000);
        assert_eq!(cfg.connect_url, "ws://a/connect");
    }

    #[test]
    fn positional_fallback_fills_in_missing_flags() {
        let cfg = ClientConfig::resolve(cli(None, None, None, vec!["8080", "ws://b/connect", "myapp"])).unwrap();
        assert_eq!(cfg.origin_port, 8080);
        assert_eq!(cfg.connect_url, "ws://b/connect");
        assert_eq!(cfg.subdomain.as_deref(), Some("myapp"));
    }

    #[test]
    fn missing_port_resolves_to_none() {
        assert!(ClientConfig::resolve(cli(None, None, None, vec![])).is_none());
    }

    #[test]
    fn default_connect_url_is_localhost() {
        let cfg = ClientConfig::resolve(cli(Some(3000), None, None, vec![])).unwrap();
        assert_eq!(cfg.connect_url, DEFAULT_CONNECT);
    }

    #[test]
    fn bare_domain_base_env_var_is_a_fallback_for_the_prefixed_one() {
        // std::env is process-global; this crate's test binary doesn't run
        // other tests that touch DOMAIN_BASE, so this is safe in practice.
        std::env::set_var("DOMAIN_BASE", "fallback.example.com");
        let cfg = ClientConfig::resolve(cli(Some(3000), None, None, vec![])).unwrap();
        std::env::remove_var("DOMAIN_BASE");
        assert_eq!(cfg.domain_base_override.as_deref(), Some("fallback.example.com"));
    }
}
