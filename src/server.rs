// synckairos: top-level server wiring and graceful shutdown (§5).

use std::sync::Arc;
use std::time::Duration;

use redis::aio::ConnectionManager;
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tracing::{info, warn};

use crate::api::{AllowAllAuthenticator, AppState};
use crate::audit::{AuditQueue, LoggingAlertSink, PostgresAuditWriter};
use crate::config::Config;
use crate::engine::SessionEngine;
use crate::error::SyncKairosError;
use crate::health::HealthChecker;
use crate::hub::Hub;
use crate::metrics::MetricsCollector;
use crate::recovery::AuditRecoveryLoader;
use crate::retry::RetryConfig;
use crate::store::{RedisStore, StateStore};

/// Owns the constructed dependency graph (store, engine, hub, audit
/// queue) and the axum router built from it. Assembly happens once in
/// `build`, following the dependency-injection wiring §9 asks for in
/// place of singletons.
pub struct SyncKairosServer {
    config: Config,
    state: AppState,
}

impl SyncKairosServer {
    pub async fn build(config: Config) -> Result<Self, SyncKairosError> {
        let redis_client = redis::Client::open(config.store.redis_url.clone())?;
        let conn = ConnectionManager::new(redis_client.clone()).await?;

        let pg_pool = PgPoolOptions::new()
            .max_connections(config.audit.worker_pool_size as u32 + 2)
            .connect(&config.audit.database_url)
            .await?;

        // Store and recovery loader are mutually referential (store calls
        // recovery on miss; recovery writes back through the store), so
        // the store is constructed twice: once without recovery to hand
        // to the loader, once wrapping the loader. Each also spawns its
        // own pub/sub listener task; the bootstrap store's is short-lived
        // and stops mattering once it's dropped after `recovery` is built.
        let bootstrap_store: Arc<dyn StateStore> =
            Arc::new(RedisStore::new(redis_client.clone(), conn.clone(), None));
        let recovery = Arc::new(AuditRecoveryLoader::new(pg_pool.clone(), bootstrap_store));
        let store: Arc<dyn StateStore> = Arc::new(RedisStore::new(redis_client, conn, Some(recovery)));

        let retry = RetryConfig {
            max_attempts: config.audit.max_attempts,
            initial_delay_ms: config.audit.initial_backoff_ms,
            max_delay_ms: config.audit.max_backoff_ms,
            multiplier: 2.0,
        };
        let audit_writer = Arc::new(PostgresAuditWriter::new(pg_pool));
        let alert_sink = Arc::new(LoggingAlertSink);
        let audit = Arc::new(AuditQueue::new(
            audit_writer,
            alert_sink,
            retry,
            config.audit.worker_pool_size,
        ));

        let engine = Arc::new(SessionEngine::new(store.clone(), audit.clone()));
        let hub = Arc::new(Hub::new(engine.clone(), config.hub.max_connects_per_ip_per_min));
        let health = Arc::new(HealthChecker::new());
        let metrics = Arc::new(MetricsCollector::new(1_000));

        spawn_ws_fanout_listener(store.clone(), hub.clone());
        spawn_update_observer(store.clone());

        let state = AppState {
            engine,
            store,
            audit,
            hub,
            health,
            metrics,
            authenticator: Arc::new(AllowAllAuthenticator),
        };

        Ok(Self { config, state })
    }

    pub async fn start(self) -> Result<(), SyncKairosError> {
        let router = crate::api::build_router(self.state.clone());
        let listener = tokio::net::TcpListener::bind(&self.config.server.bind_address)
            .await
            .map_err(|e| SyncKairosError::Internal(format!("bind failed: {e}")))?;

        info!(addr = %self.config.server.bind_address, "synckairos listening");

        let drain_secs = self.config.hub.shutdown_drain_secs;
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<std::net::SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal(drain_secs))
        .await
        .map_err(|e| SyncKairosError::Internal(format!("server error: {e}")))
    }
}

/// Drives the cross-instance WebSocket fan-out: every `ws:{id}` message
/// published by any engine instance reaches this instance's Hub, which
/// then forwards to its local sockets (§4.1, §4.4).
fn spawn_ws_fanout_listener(store: Arc<dyn StateStore>, hub: Arc<Hub>) {
    tokio::spawn(async move {
        loop {
            let mut rx = match store.subscribe_ws().await {
                Ok(rx) => rx,
                Err(e) => {
                    warn!(error = %e, "failed to subscribe to ws fan-out channel, retrying");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };
            loop {
                match rx.recv().await {
                    Ok((session_id, msg)) => hub.dispatch(session_id, msg).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "ws fan-out listener lagged, dropped messages");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    });
}

/// Lightweight observability tap on `session-updates`; the engine already
/// applies updates locally, so this exists only to make cross-instance
/// traffic visible in logs.
fn spawn_update_observer(store: Arc<dyn StateStore>) {
    tokio::spawn(async move {
        let Ok(mut rx) = store.subscribe_updates().await else {
            return;
        };
        loop {
            match rx.recv().await {
                Ok(msg) => {
                    tracing::debug!(?msg, "observed session-updates broadcast");
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "update observer lagged, dropped messages");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

/// Waits for SIGTERM/Ctrl-C, then gives in-flight WebSocket sessions a
/// drain window before axum stops the listener (§5 Graceful shutdown).
async fn shutdown_signal(drain_secs: u64) {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    warn!(drain_secs, "shutdown signal received, stopping new connections and draining");
    tokio::time::sleep(Duration::from_secs(drain_secs)).await;
}
