//! `mentor-service`: serves the mentor aggregate methods over HTTP.

use anyhow::Context;
use mentor_rating_postgres::PostgresAggregateStore;
use mentor_rating_service::{
    AggregateService, ServiceConfig, init_tracing, install_exporter, router, wait_for_signal,
};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServiceConfig::from_env().context("Invalid configuration")?;
    init_tracing(&config.log_level);
    if let Some(addr) = config.metrics_addr {
        install_exporter(addr)?;
    }

    let pool = mentor_rating_postgres::connect(&config.database_url, config.db_max_connections)
        .await
        .context("Failed to connect to database")?;
    mentor_rating_postgres::migrate(&pool)
        .await
        .context("Failed to run migrations")?;

    let service = Arc::new(AggregateService::new(Arc::new(PostgresAggregateStore::new(pool))));
    let app = router(service);

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;
    tracing::info!(listen_addr = %config.listen_addr, "Mentor service listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_signal())
        .await
        .context("Server error")?;

    tracing::info!("Mentor service stopped");
    Ok(())
}
