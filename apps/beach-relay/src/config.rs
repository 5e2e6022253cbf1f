use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::Context;
use axum::http::{HeaderName, HeaderValue, Method};
use clap::Args;

use crate::{connection::DEFAULT_OUTBOUND_DEPTH, policy::AllowListConfig};

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:21480";
pub const DEFAULT_CALL_TIMEOUT_SECS: u64 = 10;
/// Upper bound for one inbound peer frame.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 32 * 1024;
pub const DEFAULT_REJECT_REDIRECT: &str = "https://www.google.com";

/// Flags for `beach-relay serve`; each one can also come from the environment.
#[derive(Debug, Clone, Args)]
pub struct ServeArgs {
    /// Address to bind the HTTP/WebSocket listener to.
    #[arg(long, env = "BEACH_RELAY_LISTEN_ADDR", default_value = DEFAULT_LISTEN_ADDR)]
    pub listen_addr: String,

    /// Seconds a forwarded call waits for the target peer's reply.
    #[arg(long, env = "BEACH_RELAY_CALL_TIMEOUT_SECS", default_value_t = DEFAULT_CALL_TIMEOUT_SECS)]
    pub call_timeout_secs: u64,

    /// Largest inbound WebSocket frame accepted from a peer, in bytes.
    #[arg(long, env = "BEACH_RELAY_MAX_FRAME_BYTES", default_value_t = DEFAULT_MAX_FRAME_BYTES)]
    pub max_frame_bytes: usize,

    /// Frames buffered per connection before forwarding callers wait.
    #[arg(long, env = "BEACH_RELAY_OUTBOUND_DEPTH", default_value_t = DEFAULT_OUTBOUND_DEPTH)]
    pub outbound_depth: usize,

    /// Only admit peers whose client address is allow-listed.
    #[arg(long, env = "BEACH_RELAY_ALLOWLIST_ENABLED", default_value_t = false)]
    pub allowlist_enabled: bool,

    /// Comma-separated allow-listed addresses.
    #[arg(long, env = "BEACH_RELAY_ALLOWLIST", value_delimiter = ',')]
    pub allowlist: Vec<String>,

    /// File with one allow-listed address per line; reloaded on change.
    #[arg(long, env = "BEACH_RELAY_ALLOWLIST_FILE")]
    pub allowlist_file: Option<PathBuf>,

    /// How often the allow-list file is checked for changes.
    #[arg(long, env = "BEACH_RELAY_ALLOWLIST_RELOAD_SECS", default_value_t = 5)]
    pub allowlist_reload_secs: u64,

    /// Where rejected upgrade requests are redirected.
    #[arg(long, env = "BEACH_RELAY_REJECT_REDIRECT", default_value = DEFAULT_REJECT_REDIRECT)]
    pub reject_redirect: String,

    /// Add CORS headers to HTTP responses and answer preflights.
    #[arg(long, env = "BEACH_RELAY_CORS", default_value_t = false)]
    pub cors: bool,

    /// Comma-separated allowed origins; empty or `*` allows any.
    #[arg(long, env = "BEACH_RELAY_CORS_ALLOW_ORIGIN", value_delimiter = ',')]
    pub cors_allow_origin: Vec<String>,

    /// Comma-separated allowed request headers; empty or `*` allows any.
    #[arg(long, env = "BEACH_RELAY_CORS_ALLOW_HEADER", value_delimiter = ',')]
    pub cors_allow_header: Vec<String>,

    /// Comma-separated allowed methods; empty or `*` allows any.
    #[arg(long, env = "BEACH_RELAY_CORS_ALLOW_METHOD", value_delimiter = ',')]
    pub cors_allow_method: Vec<String>,

    /// Comma-separated response headers exposed to the browser.
    #[arg(long, env = "BEACH_RELAY_CORS_EXPOSE_HEADER", value_delimiter = ',')]
    pub cors_expose_header: Vec<String>,

    /// Allow credentialed cross-origin requests.
    #[arg(long, env = "BEACH_RELAY_CORS_ALLOW_CREDENTIALS", default_value_t = false)]
    pub cors_allow_credentials: bool,

    /// Grace period applied during shutdown.
    #[arg(long, env = "BEACH_RELAY_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    pub call_timeout: Duration,
    pub max_frame_bytes: usize,
    pub outbound_depth: usize,
    pub allowlist: AllowListConfig,
    pub allowlist_reload: Duration,
    pub reject_redirect: String,
    pub cors: CorsConfig,
    pub shutdown_grace: Duration,
}

/// Cross-origin policy for the HTTP routes. An empty list, or one containing
/// `*`, means "any".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CorsConfig {
    pub enabled: bool,
    pub allow_origins: Vec<String>,
    pub allow_headers: Vec<String>,
    pub allow_methods: Vec<String>,
    pub expose_headers: Vec<String>,
    pub allow_credentials: bool,
}

impl CorsConfig {
    /// Origins must be header values, header lists header names and methods
    /// HTTP methods.
    fn validate(&self) -> anyhow::Result<()> {
        for origin in self.allow_origins.iter().filter(|entry| *entry != "*") {
            HeaderValue::from_str(origin).with_context(|| format!("invalid CORS origin: {origin}"))?;
        }
        for name in self
            .allow_headers
            .iter()
            .chain(&self.expose_headers)
            .filter(|entry| *entry != "*")
        {
            HeaderName::from_bytes(name.as_bytes())
                .with_context(|| format!("invalid CORS header name: {name}"))?;
        }
        for method in self.allow_methods.iter().filter(|entry| *entry != "*") {
            Method::from_bytes(method.as_bytes())
                .with_context(|| format!("invalid CORS method: {method}"))?;
        }
        anyhow::ensure!(
            !(self.allow_credentials && self.expose_headers.iter().any(|entry| entry == "*")),
            "CORS expose headers cannot be `*` when credentials are allowed"
        );
        Ok(())
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 21480)),
            call_timeout: Duration::from_secs(DEFAULT_CALL_TIMEOUT_SECS),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            outbound_depth: DEFAULT_OUTBOUND_DEPTH,
            allowlist: AllowListConfig::default(),
            allowlist_reload: Duration::from_secs(5),
            reject_redirect: DEFAULT_REJECT_REDIRECT.to_string(),
            cors: CorsConfig::default(),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl TryFrom<ServeArgs> for RelayConfig {
    type Error = anyhow::Error;

    fn try_from(args: ServeArgs) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = args
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", args.listen_addr))?;
        anyhow::ensure!(args.call_timeout_secs > 0, "call timeout must be at least one second");
        anyhow::ensure!(args.max_frame_bytes > 0, "max frame size must be positive");

        let cors = CorsConfig {
            enabled: args.cors,
            allow_origins: trimmed(args.cors_allow_origin),
            allow_headers: trimmed(args.cors_allow_header),
            allow_methods: trimmed(args.cors_allow_method),
            expose_headers: trimmed(args.cors_expose_header),
            allow_credentials: args.cors_allow_credentials,
        };
        cors.validate()?;

        Ok(Self {
            listen_addr,
            call_timeout: Duration::from_secs(args.call_timeout_secs),
            max_frame_bytes: args.max_frame_bytes,
            outbound_depth: args.outbound_depth.max(1),
            allowlist: AllowListConfig {
                enabled: args.allowlist_enabled,
                entries: trimmed(args.allowlist),
                file: args.allowlist_file,
            },
            allowlist_reload: Duration::from_secs(args.allowlist_reload_secs.max(1)),
            reject_redirect: args.reject_redirect,
            cors,
            shutdown_grace: Duration::from_secs(args.shutdown_grace_secs),
        })
    }
}

fn trimmed(entries: Vec<String>) -> Vec<String> {
    entries
        .into_iter()
        .map(|entry| entry.trim().to_string())
        .filter(|entry| !entry.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        serve: ServeArgs,
    }

    fn parse(args: &[&str]) -> anyhow::Result<RelayConfig> {
        let harness = Harness::try_parse_from(std::iter::once("beach-relay").chain(args.iter().copied()))?;
        RelayConfig::try_from(harness.serve)
    }

    #[test_timeout::timeout]
    fn defaults_match_the_documented_values() {
        let config = parse(&[]).unwrap();
        let defaults = RelayConfig::default();
        assert_eq!(config.listen_addr, defaults.listen_addr);
        assert_eq!(config.call_timeout, Duration::from_secs(10));
        assert_eq!(config.max_frame_bytes, 32768);
        assert!(!config.allowlist.enabled);
    }

    #[test_timeout::timeout]
    fn allowlist_flags_are_collected() {
        let config = parse(&[
            "--allowlist-enabled",
            "--allowlist",
            "10.0.0.1, 10.0.0.2,",
            "--call-timeout-secs",
            "3",
        ])
        .unwrap();
        assert!(config.allowlist.enabled);
        assert_eq!(config.allowlist.entries, vec!["10.0.0.1", "10.0.0.2"]);
        assert_eq!(config.call_timeout, Duration::from_secs(3));
    }

    #[test_timeout::timeout]
    fn rejects_bad_listen_address_and_zero_timeout() {
        assert!(parse(&["--listen-addr", "nowhere"]).is_err());
        assert!(parse(&["--call-timeout-secs", "0"]).is_err());
    }

    #[test_timeout::timeout]
    fn cors_flags_are_collected_and_checked() {
        let config = parse(&[
            "--cors",
            "--cors-allow-origin",
            "https://app.example.com, https://admin.example.com",
            "--cors-allow-method",
            "GET,POST",
            "--cors-expose-header",
            "x-request-id",
            "--cors-allow-credentials",
        ])
        .unwrap();
        assert!(config.cors.enabled);
        assert_eq!(
            config.cors.allow_origins,
            vec!["https://app.example.com", "https://admin.example.com"]
        );
        assert_eq!(config.cors.allow_methods, vec!["GET", "POST"]);
        assert!(config.cors.allow_headers.is_empty());
        assert!(config.cors.allow_credentials);

        assert!(parse(&["--cors-allow-header", "bad header"]).is_err());
        assert!(parse(&["--cors-allow-credentials", "--cors-expose-header", "*"]).is_err());
    }
}
