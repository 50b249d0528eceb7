//! Server configuration.
//!
//! Loads configuration from environment variables with defaults for every
//! tunable. All settings can be overridden via `STASH_*` environment
//! variables; the database connection string follows the usual
//! `DATABASE_URL` convention.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the HTTP listener to.
    pub bind_addr: SocketAddr,
    /// Database URL: `memory`, `sqlite:<path>`, or `postgres://...`.
    pub database_url: String,
    /// Path to the auth config file. Without one, no principal exists and
    /// every request is rejected.
    pub auth_config: Option<PathBuf>,
    /// Whether to hot-reload the auth config on changes.
    pub watch_config: bool,
    /// Session lifetime.
    pub session_ttl: Duration,
    /// Interval between expired-session sweeps.
    pub session_sweep_interval: Duration,
    /// Use the `__Host-` cookie name (HTTPS deployments).
    pub secure_cookies: bool,
    /// Enable the in-process value cache.
    pub cache_enabled: bool,
    /// Cache entry cap.
    pub cache_size: u64,
    /// Secrets master key; absent disables secrets encryption.
    pub master_key: Option<String>,
    /// Enable audit capture and the query endpoint.
    pub audit_enabled: bool,
    /// Audit retention window in days; 0 keeps entries forever.
    pub audit_retention_days: i64,
    /// Upper bound on audit query page sizes.
    pub audit_max_query_limit: u64,
    /// Maximum request body size in bytes.
    pub max_body_bytes: usize,
    /// Per-request timeout on non-streaming routes.
    pub request_timeout: Duration,
    /// Path to the history repository; absent disables history.
    pub history_repo: Option<PathBuf>,
    /// Name of the git remote to mirror history to.
    pub history_remote: Option<String>,
    /// Per-subscriber event buffer capacity.
    pub event_buffer: usize,
    /// Log level filter (e.g. `info`, `debug`).
    pub log_level: String,
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `STASH_BIND_ADDR` — bind address (overrides `PORT`, default `127.0.0.1:8080`)
    /// - `PORT` — port on `0.0.0.0` (container convention)
    /// - `DATABASE_URL` — `memory`, `sqlite:<path>`, or `postgres://...` (default `memory`)
    /// - `STASH_AUTH_CONFIG` — path to the YAML auth config (optional)
    /// - `STASH_WATCH_CONFIG` — hot-reload the auth config (default `true`)
    /// - `STASH_SESSION_TTL_SECS` — session lifetime (default 30 days)
    /// - `STASH_SESSION_SWEEP_SECS` — expired-session sweep interval (default 1 hour)
    /// - `STASH_SECURE_COOKIES` — use the `__Host-` cookie name (default `false`)
    /// - `STASH_CACHE_ENABLED` — in-process value cache (default `true`)
    /// - `STASH_CACHE_SIZE` — cache entry cap (default 1024)
    /// - `STASH_MASTER_KEY` — secrets master key (optional)
    /// - `STASH_AUDIT_ENABLED` — audit capture (default `true`)
    /// - `STASH_AUDIT_RETENTION_DAYS` — retention window, 0 = unlimited (default 90)
    /// - `STASH_AUDIT_MAX_QUERY_LIMIT` — query page-size ceiling (default 10000)
    /// - `STASH_MAX_BODY_BYTES` — request body cap (default 1 MiB)
    /// - `STASH_REQUEST_TIMEOUT_SECS` — non-streaming request timeout (default 30)
    /// - `STASH_HISTORY_REPO` — history repository path (optional)
    /// - `STASH_HISTORY_REMOTE` — git remote name for history mirroring (optional)
    /// - `STASH_EVENT_BUFFER` — per-subscriber event buffer (default 64)
    /// - `STASH_LOG_LEVEL` — log filter (default `info`)
    #[must_use]
    pub fn from_env() -> Self {
        let bind_addr = if let Ok(addr) = std::env::var("STASH_BIND_ADDR") {
            addr.parse()
                .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], 8080)))
        } else if let Ok(port) = std::env::var("PORT") {
            let port: u16 = port.parse().unwrap_or(8080);
            SocketAddr::from(([0, 0, 0, 0], port))
        } else {
            SocketAddr::from(([127, 0, 0, 1], 8080))
        };

        Self {
            bind_addr,
            database_url: std::env::var("DATABASE_URL").unwrap_or_else(|_| "memory".to_owned()),
            auth_config: std::env::var("STASH_AUTH_CONFIG").ok().map(PathBuf::from),
            watch_config: env_bool("STASH_WATCH_CONFIG", true),
            session_ttl: Duration::from_secs(env_u64(
                "STASH_SESSION_TTL_SECS",
                60 * 60 * 24 * 30,
            )),
            session_sweep_interval: Duration::from_secs(env_u64(
                "STASH_SESSION_SWEEP_SECS",
                60 * 60,
            )),
            secure_cookies: env_bool("STASH_SECURE_COOKIES", false),
            cache_enabled: env_bool("STASH_CACHE_ENABLED", true),
            cache_size: env_u64("STASH_CACHE_SIZE", 1024),
            master_key: std::env::var("STASH_MASTER_KEY").ok().filter(|k| !k.is_empty()),
            audit_enabled: env_bool("STASH_AUDIT_ENABLED", true),
            audit_retention_days: env_u64("STASH_AUDIT_RETENTION_DAYS", 90)
                .try_into()
                .unwrap_or(90),
            audit_max_query_limit: env_u64("STASH_AUDIT_MAX_QUERY_LIMIT", 10_000),
            max_body_bytes: usize::try_from(env_u64("STASH_MAX_BODY_BYTES", 1024 * 1024))
                .unwrap_or(1024 * 1024),
            request_timeout: Duration::from_secs(env_u64("STASH_REQUEST_TIMEOUT_SECS", 30)),
            history_repo: std::env::var("STASH_HISTORY_REPO").ok().map(PathBuf::from),
            history_remote: std::env::var("STASH_HISTORY_REMOTE").ok(),
            event_buffer: usize::try_from(env_u64("STASH_EVENT_BUFFER", 64)).unwrap_or(64),
            log_level: std::env::var("STASH_LOG_LEVEL").unwrap_or_else(|_| "info".to_owned()),
        }
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    std::env::var(name).map_or(default, |v| match v.as_str() {
        "true" | "1" | "yes" => true,
        "false" | "0" | "no" => false,
        _ => default,
    })
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
