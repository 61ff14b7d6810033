use bluegreen_buddy::{
    bot::{self, BotData},
    config::{database, deployment::DeploymentConfig},
    core::{
        events::EventBus, postgres::PostgresDeploymentRepository,
        repository::DeploymentRepository, service::DeploymentService,
    },
    errors::{Error, Result},
};
use dotenvy::dotenv;
use std::{env, sync::Arc, time::Duration};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// How often the notification connection is checked after start.
const LISTENER_CHECK_INTERVAL: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Initialize tracing (as early as possible)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // 2. Load .env file; env vars can also be set externally
    dotenv().ok();

    // 3. Resolve every required setting before touching the database
    let deployment_config = DeploymentConfig::from_env()
        .inspect_err(|e| error!("Critical error loading deployment configuration: {e}"))?;
    let database_url = database::get_database_url()
        .inspect_err(|e| error!("Critical error loading database configuration: {e}"))?;
    let token = env::var("DISCORD_BOT_TOKEN")
        .inspect_err(|e| error!("DISCORD_BOT_TOKEN not found: {e}"))
        .map_err(Error::EnvVar)?;
    let process = deployment_config.process_name;
    info!(process = %process, "Configuration loaded");

    // 4. Connect and make sure the deployment table exists
    let db = database::create_connection(&database_url)
        .await
        .inspect(|_| info!("Database connection established."))
        .inspect_err(|e| error!("Failed to connect to database: {e}"))?;
    database::ensure_schema(&db)
        .await
        .inspect_err(|e| error!("Failed to prepare deployment schema: {e}"))?;

    // 5. Wire the coordinator and seed it from storage
    let event_bus = Arc::new(EventBus::new());
    let repository: Arc<dyn DeploymentRepository> = Arc::new(PostgresDeploymentRepository::new(
        db,
        database_url,
        Arc::clone(&event_bus),
        process,
    ));
    let deployment = DeploymentService::new(repository, event_bus, deployment_config);
    deployment.start().await?;

    // 6. Run the bot until it stops, the listener drops, or we are asked to shut down
    let result = tokio::select! {
        result = bot::run_bot(token, BotData::new(Arc::clone(&deployment))) => result,
        result = watch_listener(&deployment) => result,
        signal = tokio::signal::ctrl_c() => {
            info!(process = %process, "Shutdown signal received");
            signal.map_err(Error::from)
        }
    };

    if let Err(e) = deployment.stop().await {
        warn!(process = %process, "Failed to stop deployment service cleanly: {e}");
    }
    result
}

/// Resolves with an error once the notification connection is gone. The listener does not
/// reconnect, so the process exits and its supervisor starts a fresh one.
async fn watch_listener(deployment: &DeploymentService) -> Result<()> {
    let mut interval = tokio::time::interval(LISTENER_CHECK_INTERVAL);
    loop {
        interval.tick().await;
        let status = deployment.snapshot();
        if !status.repository_connected {
            error!(
                process = %status.process_name,
                active = ?status.current.map(|d| d.name()),
                "Deployment notifications lost; exiting so the supervisor can restart this instance"
            );
            return Err(Error::ListenerDisconnected);
        }
    }
}
