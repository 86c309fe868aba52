use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use relay_durable::{
    BrokerConfig, BrokerConsumer, BrokerProducer, EventLogStore, InMemoryBroker,
    InMemoryEventLogStore, PostgresEventLogStore, ResultConsumer, RuntimeConfig,
};
use relay_worker::telemetry::{init_telemetry, TelemetryConfig};
use relay_worker::{greeting_runtime, HelloCities};
use tokio::sync::watch;

const COMPLETION_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Configure via RUST_LOG or LOG_LEVEL
    init_telemetry(TelemetryConfig::from_env());

    tracing::info!("relay-worker starting...");

    let broker_config = BrokerConfig::from_env().context("Invalid broker configuration")?;
    let runtime_config = RuntimeConfig::from_env().context("Invalid runtime configuration")?;

    let store = open_store().await?;
    let (producer, consumer) = open_broker(&broker_config)?;

    tracing::info!(
        broker_addresses = %broker_config.broker_addresses,
        topic = %broker_config.topic,
        group_id = %broker_config.group_id,
        offset_reset = %broker_config.offset_reset,
        "Starting runtime"
    );

    let runtime = greeting_runtime(store, producer, &broker_config.topic, runtime_config);
    runtime
        .recover()
        .await
        .context("Failed to recover instances")?;

    let client = runtime.client();
    let instance_id = client
        .create::<HelloCities>(HelloCities::default_input())
        .await
        .context("Failed to create greeting instance")?;
    tracing::info!(%instance_id, "Started greeting orchestration");

    match client
        .wait_for_completion(instance_id, COMPLETION_TIMEOUT)
        .await
    {
        Ok(state) => tracing::info!(
            %instance_id,
            status = %state.status,
            output = ?state.output,
            error = ?state.error,
            "Greeting orchestration finished"
        ),
        Err(e) => tracing::warn!(%instance_id, error = %e, "Greeting orchestration still running"),
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received shutdown signal");
            let _ = shutdown_tx.send(true);
        }
    });

    let consumer = ResultConsumer::new(consumer);
    let result = consumer
        .run(
            |message| async move {
                println!("Message received: {}", message.payload_lossy());
            },
            shutdown_rx,
        )
        .await;

    runtime.shutdown().await;

    if let Err(e) = result {
        println!("Error: {e}");
        tracing::error!(error = %e, "Consumer stopped");
        std::process::exit(1);
    }

    tracing::info!("Worker shutdown complete");
    Ok(())
}

/// Postgres when `DATABASE_URL` is set, otherwise an in-memory store
async fn open_store() -> Result<Arc<dyn EventLogStore>> {
    match std::env::var("DATABASE_URL") {
        Ok(url) => {
            let store = PostgresEventLogStore::connect(&url)
                .await
                .context("Failed to connect to database")?;
            store.migrate().await.context("Failed to run migrations")?;
            tracing::info!("Using PostgreSQL event log");
            Ok(Arc::new(store))
        }
        Err(_) => {
            tracing::info!("DATABASE_URL not set, using in-memory event log");
            Ok(Arc::new(InMemoryEventLogStore::new()))
        }
    }
}

/// Kafka when `BROKER_ADDRESSES` is set, otherwise an in-process broker
fn open_broker(config: &BrokerConfig) -> Result<(Arc<dyn BrokerProducer>, Box<dyn BrokerConsumer>)> {
    if std::env::var_os("BROKER_ADDRESSES").is_some() {
        return open_kafka(config);
    }

    tracing::info!("BROKER_ADDRESSES not set, using in-process broker");
    let broker = InMemoryBroker::new();
    let consumer = broker.consumer(config);
    Ok((Arc::new(broker), Box::new(consumer)))
}

#[cfg(feature = "kafka")]
fn open_kafka(config: &BrokerConfig) -> Result<(Arc<dyn BrokerProducer>, Box<dyn BrokerConsumer>)> {
    use relay_durable::{KafkaConsumer, KafkaProducer};

    let producer = KafkaProducer::new(config).context("Failed to create Kafka producer")?;
    let consumer = KafkaConsumer::new(config).context("Failed to create Kafka consumer")?;
    tracing::info!(brokers = %config.broker_addresses, "Using Kafka broker");
    Ok((Arc::new(producer), Box::new(consumer)))
}

#[cfg(not(feature = "kafka"))]
fn open_kafka(_config: &BrokerConfig) -> Result<(Arc<dyn BrokerProducer>, Box<dyn BrokerConsumer>)> {
    anyhow::bail!("BROKER_ADDRESSES is set but relay-worker was built without the `kafka` feature")
}
