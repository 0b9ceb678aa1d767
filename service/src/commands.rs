//! `consume` and `publish` subcommands.

use crate::config::{SyncConfig, validate_subsystems};
use anyhow::Context;
use std::future::pending;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use user_sync_amqp::{AmqpBroker, AmqpConnector};
use user_sync_core::codec::XmlCodec;
use user_sync_core::error::SyncError;
use user_sync_core::event::Action;
use user_sync_core::routing::Destinations;
use user_sync_postgres::PostgresUserStore;
use user_sync_runtime::{ConnectionManager, Consumer, ConsumerSpec, Publisher};

/// Apply `action` events from every subsystem queue until SIGINT or SIGTERM.
///
/// # Errors
///
/// Returns an error if the database or broker is unreachable, or if the broker
/// session breaks while consuming.
pub async fn consume(config: &SyncConfig, action: Action) -> anyhow::Result<ExitCode> {
    let database = config.require_database()?;
    let store = PostgresUserStore::connect(database)
        .await
        .context("Failed to connect to user database")?;

    let broker = connect_broker(config).await?;
    let spec = ConsumerSpec::for_action(action, config.exchange.clone(), &config.subsystems);
    info!(action = %action, queues = ?spec.destinations.queues(), "Starting consumer");

    let consumer = Consumer::new(Arc::new(broker.clone()), Arc::new(store), spec);
    let result = consumer.run_until(shutdown_signal()).await;
    close_broker(&broker).await;

    let stats = result?;
    info!(
        action = %action,
        applied = stats.applied,
        skipped = stats.skipped,
        rejected = stats.rejected,
        "Consumer stopped"
    );
    Ok(ExitCode::SUCCESS)
}

/// Publish the event document at `file` to its action's subsystem queues.
///
/// `subsystems` narrows the fan-out; empty means every configured subsystem. Exits
/// with failure if any destination was not confirmed.
///
/// # Errors
///
/// Returns an error if the file cannot be read, does not hold a valid event, or the
/// broker is unreachable.
pub async fn publish(
    config: &SyncConfig,
    file: &Path,
    subsystems: &[String],
) -> anyhow::Result<ExitCode> {
    let payload = tokio::fs::read(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let event = XmlCodec::new()
        .decode_bytes(&payload)
        .map_err(SyncError::from)?;
    event.validate().map_err(SyncError::from)?;

    let targets = if subsystems.is_empty() {
        config.subsystems.as_slice()
    } else {
        validate_subsystems(subsystems)?;
        subsystems
    };
    let destinations = Destinations::for_action(event.action, targets);

    let broker = connect_broker(config).await?;
    let publisher = Publisher::new(Arc::new(broker.clone()), config.exchange.clone());
    let report = publisher.publish(&event, &destinations).await;
    close_broker(&broker).await;

    match report.into_result() {
        Ok(delivered) => {
            info!(
                action = %event.action,
                user_id = %event.user_id,
                delivered = delivered.len(),
                "Event published"
            );
            Ok(ExitCode::SUCCESS)
        },
        Err(e) => {
            error!(action = %event.action, user_id = %event.user_id, error = %e, "Publish incomplete");
            Ok(ExitCode::FAILURE)
        },
    }
}

async fn connect_broker(config: &SyncConfig) -> Result<AmqpBroker, SyncError> {
    ConnectionManager::new(AmqpConnector::new(), config.broker.clone())
        .with_policy(config.retry_policy())
        .connect()
        .await
}

async fn close_broker(broker: &AmqpBroker) {
    if let Err(e) = broker.close().await {
        warn!(error = %e, "Broker session did not close cleanly");
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            },
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        () = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
