use fleetmend_control_plane::seed::{FleetSeed, InMemoryFleet};
use fleetmend_control_plane::server::router;
use fleetmend_control_plane::shared::config::ControlPlaneConfig;
use fleetmend_control_plane::ControlPlane;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting Fleetmend Control Plane");

    let config = ControlPlaneConfig::from_env()?;
    let listen_addr = config.listen_addr;

    let fleet = match &config.seed_file {
        Some(path) => {
            info!(path = %path.display(), "Loading fleet seed");
            InMemoryFleet::from_seed(FleetSeed::load(path)?).await?
        }
        None => {
            warn!("FLEETMEND_SEED_FILE is not configured, starting with an empty fleet");
            InMemoryFleet::new()
        }
    };

    let control_plane = Arc::new(ControlPlane::new(config, fleet.backends())?);
    let app = router(control_plane);

    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    info!(%listen_addr, "Control Plane initialized successfully");

    axum::serve(listener, app).await?;

    Ok(())
}
