//! Analysis orchestrator service.
//!
//! Runs the three workflow workers against RabbitMQ and serves health and
//! metrics endpoints until SIGTERM or Ctrl+C.

use analysis_orchestrator::{Config, HealthState, Orchestrator, router, wait_for_signal};
use analysis_orchestrator_core::shutdown;
use analysis_orchestrator_rabbitmq::{ConnectionManager, RabbitMqConsumer, RabbitMqPublisher};
use analysis_orchestrator_runtime::ReadinessProbe;
use analysis_orchestrator_runtime::metrics::install_recorder;
use anyhow::Context;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "analysis_orchestrator=info,analysis_orchestrator_runtime=info,\
                 analysis_orchestrator_rabbitmq=info"
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting analysis orchestrator");

    let config = Config::from_env().context("Failed to load configuration")?;
    info!(
        rabbitmq = %config.rabbitmq.endpoint(),
        request_routing_key = %config.topology.request_routing_key,
        retry_interval_ms = u64::try_from(config.retry.initial_delay.as_millis()).unwrap_or(u64::MAX),
        health_addr = %config.server.health_addr,
        "Configuration loaded"
    );

    let metrics = install_recorder().context("Failed to install metrics recorder")?;

    // One connection, opened lazily by the first worker
    let connections = Arc::new(ConnectionManager::amqp(config.rabbitmq.clone()));
    let publisher = Arc::new(RabbitMqPublisher::new(Arc::clone(&connections)));
    let consumer = Arc::new(RabbitMqConsumer::new(Arc::clone(&connections)));

    let (shutdown, signal) = shutdown::channel();
    let orchestrator = Orchestrator::new(&config, consumer, publisher);
    let worker_health = orchestrator.health();
    let workers = orchestrator.spawn(&signal);
    let started = workers.len();
    info!(workers = started, "Workers started");

    let probes: Vec<Arc<dyn ReadinessProbe>> = vec![connections.clone(), worker_health];
    let app = router(HealthState::new(probes).with_metrics(metrics));
    let listener = tokio::net::TcpListener::bind(config.server.health_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.health_addr))?;
    info!(address = %config.server.health_addr, "Health server listening");

    let server_signal = signal.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_signal.cancelled().await })
            .await
    });

    wait_for_signal().await;
    shutdown.trigger();

    let exits = workers.join(config.server.shutdown_timeout).await;
    if exits.len() < started {
        warn!(stopped = exits.len(), started, "Some workers were aborted");
    }

    server
        .await
        .context("Health server task panicked")?
        .context("Health server failed")?;
    connections.close().await;

    info!("Analysis orchestrator stopped");
    Ok(())
}
