//! cloudpool agent
//!
//! Hosts one cloud environment: a pool of machines from the simulated
//! provisioner, leased to workloads and published as `cloud:` locations.
//!
//! ## Architecture
//!
//! - **Environment**: pool lifecycle and its pool/machine locations
//! - **Resolver**: turns `cloud:` specs into managed locations
//! - **Usage Sampler**: refreshes machine usage for placement

use std::sync::Arc;

use anyhow::{Context, Result};
use cloudpool_environment::{CloudEnvironment, Directory, SpecResolver};
use cloudpool_location::{LocationRegistry, OwnedLocation};
use cloudpool_pool::{SimulatedProvisioner, UsageSampler};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting cloudpool agent");
    info!(
        pool_id = %config.pool_id,
        initial_size = config.pool.initial_size,
        max_size = ?config.pool.max_size,
        release_policy = ?config.pool.release_policy,
        register_machines = config.pool.register_machine_locations,
        "Configuration loaded"
    );

    let locations = Arc::new(LocationRegistry::new());
    let directory = Arc::new(Directory::new());
    let provisioner = Arc::new(SimulatedProvisioner::new());

    let mut environment = CloudEnvironment::new(
        config.pool_id.clone(),
        config.pool.clone(),
        Some(provisioner),
        Arc::clone(&locations),
    );
    if let Some(name) = &config.location_name {
        environment = environment.with_location_name(name);
    }
    let environment = Arc::new(environment);

    environment
        .start()
        .await
        .context("failed to start cloud environment")?;
    directory.insert(Arc::clone(&environment)).await;

    let resolver = SpecResolver::new(Arc::clone(&directory), Arc::clone(&locations));
    let spec = environment.spec();
    let location = resolver
        .resolve(&spec)
        .await
        .with_context(|| format!("failed to resolve {spec}"))?;
    info!(
        spec = %spec,
        location = %location.name(),
        display_name = %location.display_name(),
        "Cloud environment available"
    );

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sampler = UsageSampler::new(Arc::clone(environment.pool()), config.sample_interval);
    let sampler_handle = tokio::spawn(async move {
        sampler.run(shutdown_rx).await;
    });

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal"),
        Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
    }

    // Signal shutdown to the sampler
    let _ = shutdown_tx.send(true);
    if let Err(e) = sampler_handle.await {
        error!(error = %e, "Usage sampler task panicked");
    }

    let report = environment.stop().await;
    directory.remove(environment.id()).await;
    info!(
        released = report.released,
        already_gone = report.already_gone,
        failed = report.failed,
        evicted = report.evicted,
        "Cloudpool agent shutdown complete"
    );
    Ok(())
}
