use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::{routing::get, Extension, Router};
use axum_prometheus::PrometheusMetricLayer;
use datadog_keys::config;
use datadog_keys::routes::api_routes;
use datadog_keys::storage::{MemoryStorage, PgStorage, Storage};
use datadog_keys::{EngineSettings, KeyEngine};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{fmt, EnvFilter};

async fn root() -> &'static str {
    "Datadog key engine"
}

async fn open_storage() -> anyhow::Result<Arc<dyn Storage>> {
    let Some(db_url) = config::DATABASE_URL.as_deref() else {
        tracing::warn!("DATABASE_URL not set; roles and configuration are kept in memory");
        return Ok(Arc::new(MemoryStorage::new()));
    };
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(db_url)
        .await
        .context("failed to connect to Postgres")?;
    sqlx::migrate!()
        .run(&pool)
        .await
        .context("failed to run database migrations")?;
    Ok(Arc::new(PgStorage::new(pool)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    let storage = open_storage().await?;
    let settings = EngineSettings::from_env();
    tracing::info!(
        api_url = %settings.api_url,
        timeout_secs = settings.request_timeout.as_secs(),
        cleanup_partial_issuance = settings.cleanup_partial_issuance,
        "starting datadog key engine"
    );
    let engine = Arc::new(KeyEngine::from_settings(storage, &settings));

    let (prometheus_layer, metrics_handle) = PrometheusMetricLayer::pair();
    let app = Router::new()
        .route("/", get(root))
        .route(
            "/metrics",
            get(move || async move { metrics_handle.render() }),
        )
        .merge(api_routes())
        .layer(prometheus_layer)
        .layer(Extension(engine));

    let addr: SocketAddr = format!("{}:{}", config::BIND_ADDRESS.as_str(), *config::BIND_PORT)
        .parse()
        .context("invalid bind address")?;
    tracing::info!(%addr, "Listening for incoming connections");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}
