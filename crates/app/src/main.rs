mod analytics;
mod assignments;
mod auth;
mod leaves;
mod maintenance;
mod notifications;
mod problem;
mod push;
mod quotas;
mod router;
mod rules;
mod sectors;
mod telemetry;
#[cfg(test)]
mod testutil;
mod trames;
mod users;

use std::net::SocketAddr;
use std::time::Duration;

use tracing::info;

use anesth_roster_storage::Database;
use anesth_roster_util::{load_env_file, AppConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_env_file();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;

    let database = Database::connect(&config.database_url).await?;
    database.run_migrations().await?;
    info!(stage = "storage", url = %config.database_url, "database ready");

    maintenance::MaintenanceWorker::new(database.clone()).spawn();

    let state = router::AppState::new(
        metrics,
        database,
        &config.auth_token_secret,
        config.team_absence_threshold,
        config.sse_ring_max,
        Duration::from_secs(config.sse_ring_ttl_secs),
        config.sse_heartbeat_secs,
    );

    let addr: SocketAddr = config.bind_addr;
    info!(stage = "app", %addr, env = %config.environment.as_str(), "starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router::app_router(state))
        .await
        .map_err(|err| err.into())
}
