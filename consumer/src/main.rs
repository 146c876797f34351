//! `rating-consumer`: applies review events to mentor aggregates.

use anyhow::Context;
use mentor_rating_consumer::shutdown::wait_for_signal;
use mentor_rating_consumer::{ConsumerConfig, LoggingDeadLetterSink, ReviewEventConsumer};
use mentor_rating_core::dead_letter::DeadLetterSink;
use mentor_rating_postgres::DeadLetterQueue;
use mentor_rating_redpanda::RedpandaEventBus;
use mentor_rating_service::{MentorServiceClient, init_tracing, install_exporter};
use std::sync::Arc;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ConsumerConfig::from_env().context("Invalid configuration")?;
    init_tracing(&config.log_level);
    if let Some(addr) = config.metrics_addr {
        install_exporter(addr)?;
    }

    let client = MentorServiceClient::new(&config.mentor_service_address, config.rpc_timeout)
        .context("Failed to create mentor service client")?;
    let bus = RedpandaEventBus::new(&config.kafka_brokers).context("Failed to create broker client")?;

    let dead_letters: Arc<dyn DeadLetterSink> = match &config.database_url {
        Some(url) => {
            let pool = mentor_rating_postgres::connect(url, 2)
                .await
                .context("Failed to connect to database")?;
            mentor_rating_postgres::migrate(&pool)
                .await
                .context("Failed to run migrations")?;
            Arc::new(DeadLetterQueue::new(pool))
        },
        None => {
            tracing::warn!("DATABASE_URL not set, dead letters will only be logged");
            Arc::new(LoggingDeadLetterSink)
        },
    };

    let consumer = ReviewEventConsumer::builder()
        .bus(Arc::new(bus))
        .applier(Arc::new(client))
        .dead_letters(dead_letters)
        .topic(config.kafka_topic.clone())
        .group(config.kafka_group_id.clone())
        .poison_policy(config.poison_policy())
        .build()?;

    let mut state = consumer.state();
    tokio::spawn(async move {
        while state.changed().await.is_ok() {
            let current = state.borrow_and_update().clone();
            tracing::info!(state = %current, "Consumer state changed");
        }
    });

    tracing::info!(
        topic = %config.kafka_topic,
        group = %config.kafka_group_id,
        mentor_service = %config.mentor_service_address,
        poison_policy = ?config.poison_policy(),
        "Starting rating consumer"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run = consumer.run(shutdown_rx);
    tokio::pin!(run);

    tokio::select! {
        result = &mut run => result.context("Consumer failed")?,
        () = wait_for_signal() => {
            shutdown_tx.send_replace(true);
            run.await.context("Consumer failed during shutdown")?;
        },
    }

    tracing::info!("consumer service stopped");
    Ok(())
}
