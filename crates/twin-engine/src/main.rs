//! Twin engine binary.
//!
//! Hosts one snapshot-aware worker per digital twin and serves snapshot and
//! modify commands arriving over NATS until interrupted.
//!
//! # Startup Sequence
//!
//! 1. Load configuration from `twin-config.yaml`
//! 2. Initialize structured logging (tracing)
//! 3. Open the snapshot store and event journal (`PostgreSQL` or in-memory)
//! 4. Create the worker registry
//! 5. Connect to NATS and serve commands until Ctrl-C
//! 6. Stop every entity worker

mod config;
mod error;
mod nats_bridge;
mod registry;

use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use twin_db::{PgStore, PostgresConfig, PostgresPool};
use twin_snapshot::{EventJournal, MemoryStore, SnapshotStore};

use crate::config::{LogFormat, LoggingConfig, PlatformConfig};
use crate::error::EngineError;
use crate::nats_bridge::NatsBridge;
use crate::registry::WorkerRegistry;

/// Application entry point for the twin engine.
///
/// # Errors
///
/// Returns an error if configuration, the store, or the broker connection
/// cannot be set up.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Load configuration.
    let (config, from_file) = load_config()?;

    // 2. Initialize structured logging.
    init_tracing(&config.logging);
    info!("twin-engine starting");
    if !from_file {
        info!("Config file not found, using defaults");
    }
    info!(
        snapshot_interval_ms = config.snapshot.snapshot_interval_ms,
        save_snapshot_timeout_ms = config.snapshot.save_snapshot_timeout_ms,
        load_snapshot_timeout_ms = config.snapshot.load_snapshot_timeout_ms,
        delete_old_snapshots = config.snapshot.delete_old_snapshots,
        delete_old_events = config.snapshot.delete_old_events,
        "Configuration loaded"
    );

    // 3. Open the store and hand over to the generic serve loop.
    if config.infrastructure.uses_postgres() {
        let pool = PostgresPool::connect(
            &PostgresConfig::new(&config.infrastructure.postgres_url)
                .with_max_connections(config.infrastructure.max_connections),
        )
        .await
        .map_err(EngineError::from)?;
        pool.run_migrations().await.map_err(EngineError::from)?;
        info!("PostgreSQL store ready");
        serve(&config, Arc::new(PgStore::new(pool))).await?;
    } else {
        warn!("No postgres_url configured, snapshots and events are kept in memory only");
        serve(&config, Arc::new(MemoryStore::new())).await?;
    }

    info!("twin-engine stopped");
    Ok(())
}

async fn serve<S>(config: &PlatformConfig, store: Arc<S>) -> Result<(), EngineError>
where
    S: SnapshotStore + EventJournal,
{
    // 4. Create the worker registry.
    let registry = Arc::new(WorkerRegistry::new(store, config.snapshot.clone()));

    // 5. Connect to NATS and serve until interrupted.
    let bridge = NatsBridge::connect(
        &config.infrastructure.nats_url,
        &config.infrastructure.subject_prefix,
        Arc::clone(&registry),
    )
    .await?;

    let outcome = tokio::select! {
        result = bridge.run() => result,
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Shutdown signal received");
            Ok(())
        }
    };

    // 6. Stop every entity worker, even when the bridge failed.
    info!(workers = registry.len().await, "Stopping entity workers");
    registry.shutdown_all().await;
    outcome
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    match logging.format {
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init(),
    }
}

/// Load `twin-config.yaml`, falling back to defaults when it is absent.
///
/// The flag reports whether the file was found so the caller can log it
/// once tracing is up.
fn load_config() -> Result<(PlatformConfig, bool), EngineError> {
    let config_path = Path::new("twin-config.yaml");
    if config_path.exists() {
        Ok((PlatformConfig::from_file(config_path)?, true))
    } else {
        Ok((PlatformConfig::parse("")?, false))
    }
}
