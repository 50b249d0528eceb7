//! Stash server entry point.
//!
//! Bootstraps the store, auth service, audit log, revision store, and event
//! bus (in that order), then serves the Axum router with graceful shutdown.
//! Background workers — session sweep, audit retention, config watcher —
//! run alongside the server and stop on the shared shutdown signal; the
//! event bus closes its subscribers first so long-lived streams drain
//! before the listener stops.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::TimeDelta;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use stash_core::audit::AuditLog;
use stash_core::auth::{AuthService, AuthSnapshot, spawn_config_watcher};
use stash_core::cache::ValueCache;
use stash_core::crypto::MasterKey;
use stash_core::events::EventBus;
use stash_core::kv::KvStore;
use stash_core::revision::RevisionStore;
use stash_storage::{MemoryStore, PostgresStore, SqliteStore, Store};

use stash_server::config::ServerConfig;
use stash_server::routes::build_router;
use stash_server::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .json()
        .init();

    info!(db = %redacted_url(&config.database_url), "stash starting");

    let state = build_app_state(&config).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = spawn_workers(&config, &state, &shutdown_rx);

    let app = build_router(
        Arc::clone(&state),
        config.max_body_bytes,
        config.request_timeout,
    );

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "stash listening");

    let events = state.events.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(shutdown_tx, events))
    .await
    .context("server error")?;

    // Stop order is the reverse of start: events closed first (above),
    // HTTP drained, then the background workers within a bounded window.
    info!("waiting for background workers to stop");
    for worker in workers {
        let _ = tokio::time::timeout(Duration::from_secs(10), worker).await;
    }

    info!("stash stopped");
    Ok(())
}

/// Wire the components in start order: store → auth → audit → revision →
/// events.
async fn build_app_state(config: &ServerConfig) -> anyhow::Result<Arc<AppState>> {
    let store: Arc<dyn Store> = if config.database_url == "memory" {
        info!("using in-memory store (data will not persist)");
        Arc::new(MemoryStore::new())
    } else if config.database_url.starts_with("sqlite") {
        Arc::new(
            SqliteStore::connect(&config.database_url)
                .await
                .context("failed to open sqlite store")?,
        )
    } else if config.database_url.starts_with("postgres") {
        Arc::new(
            PostgresStore::connect(&config.database_url)
                .await
                .context("failed to connect to postgres store")?,
        )
    } else {
        anyhow::bail!(
            "unsupported DATABASE_URL '{}': expected memory, sqlite:..., or postgres://...",
            redacted_url(&config.database_url)
        );
    };

    let snapshot = match &config.auth_config {
        Some(path) => {
            AuthSnapshot::load(path).with_context(|| format!("auth config {}", path.display()))?
        }
        None => {
            warn!("no auth config: every request will be rejected");
            AuthSnapshot::empty()
        }
    };
    let session_ttl = TimeDelta::from_std(config.session_ttl)
        .unwrap_or_else(|_| TimeDelta::days(30));
    let auth = Arc::new(AuthService::new(snapshot, Arc::clone(&store), session_ttl));

    let audit = config
        .audit_enabled
        .then(|| Arc::new(AuditLog::new(Arc::clone(&store), config.audit_max_query_limit)));

    let revisions = match &config.history_repo {
        Some(path) => Some(Arc::new(
            RevisionStore::open(path, config.history_remote.clone())
                .context("failed to open history repository")?,
        )),
        None => None,
    };

    let events = Arc::new(EventBus::new(config.event_buffer));

    let cache = config.cache_enabled.then(|| ValueCache::new(config.cache_size));
    let master_key = config
        .master_key
        .as_ref()
        .map(|key| MasterKey::new(key.clone().into_bytes()));
    if master_key.is_none() {
        warn!("no master key: writes to secrets paths are disabled");
    }
    let kv = Arc::new(KvStore::new(Arc::clone(&store), cache, master_key));

    Ok(Arc::new(AppState {
        kv,
        auth,
        audit,
        events: Some(events),
        revisions,
        secure_cookies: config.secure_cookies,
    }))
}

/// Spawn the background workers; each stops when the shutdown signal fires.
fn spawn_workers(
    config: &ServerConfig,
    state: &Arc<AppState>,
    shutdown: &watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let mut workers = Vec::new();

    workers.push(tokio::spawn(session_sweep_worker(
        Arc::clone(&state.auth),
        shutdown.clone(),
        config.session_sweep_interval,
    )));

    if let Some(audit) = &state.audit {
        if config.audit_retention_days > 0 {
            workers.push(tokio::spawn(audit_retention_worker(
                Arc::clone(audit),
                shutdown.clone(),
                config.audit_retention_days,
            )));
        }
    }

    if config.watch_config {
        if let Some(path) = &config.auth_config {
            workers.push(spawn_config_watcher(
                Arc::clone(&state.auth),
                path.clone(),
                shutdown.clone(),
            ));
        }
    }

    workers
}

/// Periodically delete expired sessions.
async fn session_sweep_worker(
    auth: Arc<AuthService>,
    mut shutdown: watch::Receiver<bool>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    info!(interval_secs = interval.as_secs(), "session sweep worker started");
    loop {
        tokio::select! {
            _ = ticker.tick() => auth.sweep_expired_sessions().await,
            _ = shutdown.changed() => {
                info!("session sweep worker shutting down");
                return;
            }
        }
    }
}

/// Hourly audit retention sweep.
async fn audit_retention_worker(
    audit: Arc<AuditLog>,
    mut shutdown: watch::Receiver<bool>,
    retention_days: i64,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(60 * 60));
    info!(retention_days, "audit retention worker started");
    loop {
        tokio::select! {
            _ = ticker.tick() => audit.sweep(TimeDelta::days(retention_days)).await,
            _ = shutdown.changed() => {
                info!("audit retention worker shutting down");
                return;
            }
        }
    }
}

/// Wait for SIGINT or SIGTERM, broadcast shutdown, and close the event bus
/// so long-lived subscriber streams end before the listener drains.
async fn shutdown_signal(
    shutdown_tx: watch::Sender<bool>,
    events: Option<Arc<EventBus>>,
) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut sig) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            sig.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutdown signal received, stopping server");
    let _ = shutdown_tx.send(true);
    if let Some(events) = events {
        events.shutdown();
    }
}

/// Strip credentials from a connection URL for logging.
fn redacted_url(url: &str) -> String {
    match url.split_once('@') {
        Some((head, rest)) => match head.split_once("//") {
            Some((scheme, _)) => format!("{scheme}//[redacted]@{rest}"),
            None => format!("[redacted]@{rest}"),
        },
        None => url.to_owned(),
    }
}
