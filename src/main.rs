use axum::Router;
use axum::middleware;
use axum::routing::{get, post, put};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use foghorn_logs::archive::ArchiveStore;
use foghorn_logs::config::AppConfig;
use foghorn_logs::hub::Hub;
use foghorn_logs::store::Store;
use foghorn_logs::{AppState, alerts, auth, handlers, health, metrics_recorder, retention};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("foghorn_logs=debug,tower_http=info")
        }))
        .init();

    let config = match AppConfig::from_env() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            tracing::error!("startup aborted: {e}");
            anyhow::bail!("{e}");
        }
    };

    let store = Arc::new(Store::open(&config.database_path)?);
    tracing::info!("store opened at {}", config.database_path);
    store.seed_default_policies(&config.health.service_names())?;

    let hub = Arc::new(Hub::new());
    let http = reqwest::Client::new();
    let sessions = auth::build_session_service(config.session_service_url.as_deref(), http.clone());

    let archive_store = if config.retention.archive.enabled {
        Some(Arc::new(ArchiveStore::from_settings(&config.retention.archive)?))
    } else {
        None
    };

    // Service-wide shutdown signal; background tasks finish their current
    // iteration before exiting.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let metrics = metrics_recorder::spawn(store.clone());
    retention::spawn_retention_task(
        store.clone(),
        hub.clone(),
        archive_store,
        config.retention.clone(),
        shutdown_rx.clone(),
    );
    health::spawn_health_scheduler(
        store.clone(),
        hub.clone(),
        config.clone(),
        shutdown_rx.clone(),
    );
    alerts::spawn_alert_engine(store.clone(), config.smtp.clone(), shutdown_rx);

    let state = AppState {
        store,
        hub,
        sessions,
        metrics,
        config: config.clone(),
        http,
    };

    let app = Router::new()
        // Log surface
        .route(
            "/api/logs",
            post(handlers::logs::ingest_log)
                .get(handlers::logs::query_logs)
                .delete(handlers::logs::delete_logs),
        )
        .route("/api/logs/stats", get(handlers::logs::get_stats))
        .route("/api/logs/export", get(handlers::logs::export_logs))
        .route("/api/logs/healthcheck", get(handlers::health::healthcheck))
        .route("/api/logs/{id}", get(handlers::logs::get_log))
        .route("/api/logs/{id}/analysis", put(handlers::logs::set_analysis))
        .route(
            "/api/logs/correlation/{cid}",
            get(handlers::logs::get_correlated),
        )
        .route(
            "/api/logs/correlation/{cid}/metadata",
            get(handlers::logs::get_correlation_metadata),
        )
        .route(
            "/api/logs/correlation/{cid}/timeline",
            get(handlers::logs::get_correlation_timeline),
        )
        // Health surface
        .route("/api/health/history", get(handlers::health::history))
        .route("/api/health/trends/{service}", get(handlers::health::trends))
        .route("/api/health/policies", get(handlers::health::list_policies))
        .route(
            "/api/health/policies/{service}",
            get(handlers::health::get_policy).put(handlers::health::put_policy),
        )
        .route("/api/health/repairs", get(handlers::health::list_repairs))
        .route(
            "/api/health/repair/{service}",
            post(handlers::health::manual_repair),
        )
        // Saved searches
        .route(
            "/api/searches",
            get(handlers::searches::list_searches).post(handlers::searches::create_search),
        )
        .route(
            "/api/searches/history",
            get(handlers::searches::search_history),
        )
        .route(
            "/api/searches/{id}",
            get(handlers::searches::get_search)
                .put(handlers::searches::update_search)
                .delete(handlers::searches::delete_search),
        )
        .route(
            "/api/searches/{id}/share",
            post(handlers::searches::share_search),
        )
        // Alerting
        .route(
            "/api/alerts/config",
            get(handlers::searches::list_alert_configs),
        )
        .route(
            "/api/alerts/config/{service}",
            get(handlers::searches::get_alert_config).put(handlers::searches::put_alert_config),
        )
        .route("/api/alerts", get(handlers::searches::list_alerts))
        // Live stream
        .route("/ws/logs", get(handlers::stream::ws_logs))
        .route("/ws/logs/stats", get(handlers::stream::hub_stats))
        .route("/ws/logs/config", post(handlers::stream::hub_config))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            metrics_recorder::track_requests,
        ))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("foghorn-logs listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    Ok(())
}
