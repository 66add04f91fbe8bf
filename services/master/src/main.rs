//! forge master
//!
//! The master is the central coordination service for the build cluster.
//! It listens for worker connections, arbitrates duplicate sessions, and
//! keeps worker registrations in sync with the definitions file.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use forge_debounce::Debouncer;
use forge_master::{
    config::{self, Config},
    registration::PortManager,
    worker_manager::WorkerManager,
};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to FORGE_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting forge master");
    info!(master_port = %config.master_port, "Configuration loaded");

    let port_manager = PortManager::new();
    let manager = WorkerManager::new(port_manager, config.ping_timeout);

    // Apply the initial worker definitions
    if let Err(e) = apply_worker_definitions(&manager, &config).await {
        error!(error = %e, "Failed to apply worker definitions");
        return Err(e);
    }

    // Definition-file reloads are debounced so a burst of SIGHUPs (or an
    // editor writing the file in several chunks) produces one reload.
    let reload = {
        let manager = Arc::clone(&manager);
        let config = config.clone();
        Arc::new(Debouncer::new(
            Duration::from_secs(1),
            true,
            Arc::new(move || {
                let manager = Arc::clone(&manager);
                let config = config.clone();
                Box::pin(async move { apply_worker_definitions(&manager, &config).await })
            }),
        ))
    };

    let reload_task = {
        let reload = Arc::clone(&reload);
        tokio::spawn(async move {
            let mut hup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
            {
                Ok(hup) => hup,
                Err(e) => {
                    warn!(error = %e, "SIGHUP handler unavailable, reload disabled");
                    return;
                }
            };
            while hup.recv().await.is_some() {
                info!("SIGHUP received, scheduling worker definition reload");
                reload.trigger();
            }
        })
    };

    // Wait for shutdown signal (Ctrl+C)
    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    reload_task.abort();
    // Flush any pending reload before tearing listeners down.
    reload.stop().await;

    for name in manager.registered_workers().await {
        if let Err(e) = manager.remove_registration(&name).await {
            error!(worker = %name, error = %e, "Failed to unregister worker");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// Load the definitions file and reconcile registrations against it:
/// register new workers, update changed ones, drop the rest.
async fn apply_worker_definitions(manager: &Arc<WorkerManager>, config: &Config) -> Result<()> {
    let Some(path) = &config.workers_file else {
        warn!("FORGE_WORKERS_FILE is not set, no workers registered");
        return Ok(());
    };

    let definitions = config::load_worker_definitions(path)?;
    info!(count = definitions.len(), "Applying worker definitions");

    for def in &definitions {
        let port = def.port.as_deref().unwrap_or(&config.master_port);
        // A bad registration is fatal to that worker only, not to the reload.
        if let Err(e) = manager
            .update_registration(&def.name, &def.password, port)
            .await
        {
            error!(worker = %def.name, error = %e, "Failed to register worker");
        }
    }

    let keep: Vec<&str> = definitions.iter().map(|d| d.name.as_str()).collect();
    for name in manager.registered_workers().await {
        if !keep.contains(&name.as_str()) {
            info!(worker = %name, "Removing stale registration");
            if let Err(e) = manager.remove_registration(&name).await {
                error!(worker = %name, error = %e, "Failed to unregister worker");
            }
        }
    }
    Ok(())
}
