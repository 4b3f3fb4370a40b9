//! Balanced Consumers Example
//!
//! Two event processors share a four-partition in-memory stream through a
//! SQLite checkpoint store and converge on two partitions each.
//!
//! Run with: cargo run --example balanced_consumers

use std::sync::Arc;
use std::time::Duration;
use streamlease_processor::{
    Event, EventHandler, EventProcessor, HandlerResult, InMemoryStreamClient, PartitionContext,
    StartPosition, StreamClient,
};
use streamlease_store::{CheckpointStore, SqliteCheckpointStore};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

struct Printer {
    name: &'static str,
}

#[async_trait::async_trait]
impl EventHandler for Printer {
    async fn on_event(&self, context: &PartitionContext, event: Event) -> HandlerResult {
        info!(
            "[{}] partition {} seq {} body {:?}",
            self.name,
            context.partition_id(),
            event.sequence_number,
            std::str::from_utf8(&event.body).unwrap_or("<binary>"),
        );
        context.update_checkpoint(&event).await?;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Setup logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting balanced consumers example");

    // Shared checkpoint store (SQLite for demo) and in-memory stream
    let store = SqliteCheckpointStore::new("/tmp/streamlease_example.db").await?;
    let store = Arc::new(store) as Arc<dyn CheckpointStore>;
    let client = Arc::new(InMemoryStreamClient::new(4));

    let build = |name: &'static str| {
        EventProcessor::builder()
            .namespace("demo")
            .stream("orders")
            .consumer_group("$default")
            .store(store.clone())
            .client(client.clone() as Arc<dyn StreamClient>)
            .handler(Arc::new(Printer { name }))
            .processor_id(name)
            .polling_interval(Duration::from_millis(500))
            .initial_position(StartPosition::Earliest)
            .build()
    };

    let alpha = Arc::new(build("alpha")?);
    let beta = Arc::new(build("beta")?);

    let run_alpha = {
        let alpha = alpha.clone();
        tokio::spawn(async move { alpha.start().await })
    };
    let run_beta = {
        let beta = beta.clone();
        tokio::spawn(async move { beta.start().await })
    };

    // Produce a little traffic while the processors settle
    for round in 0..10 {
        for partition in ["0", "1", "2", "3"] {
            client
                .push(partition, format!("order-{partition}-{round}"))
                .await?;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    info!(
        "alpha owns {:?}, beta owns {:?}",
        alpha.owned_partitions().await,
        beta.owned_partitions().await
    );

    // Graceful shutdown
    info!("Shutting down processors...");
    alpha.stop().await;
    beta.stop().await;
    run_alpha.await??;
    run_beta.await??;

    info!("Processors stopped successfully");

    Ok(())
}
