//! Capture service entry point: feed client + ingestion pipeline + writer.

use anyhow::Result;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use bookvault_backend::config::Config;
use bookvault_backend::feed::client::FeedClient;
use bookvault_backend::feed::rest::RestClient;
use bookvault_backend::ingest::pipeline::IngestPipeline;
use bookvault_backend::store::partitions::PartitionManager;
use bookvault_backend::store::storage::BookStorage;
use bookvault_backend::store::writer::{PersistenceWriter, WriterConfig};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();
    info!(
        db = %config.db_path,
        markets = config.market_tickers.len(),
        "Starting capture service"
    );

    let partitions =
        PartitionManager::new(config.partition_lead_days, config.partition_lead_months);
    let storage = Arc::new(BookStorage::open(&config.db_path, partitions)?);
    let maintenance = storage.spawn_partition_maintenance(config.partition_check_interval_secs);

    let (writer, writer_handle) = PersistenceWriter::spawn(
        Arc::clone(&storage),
        WriterConfig {
            flush_interval_ms: config.flush_interval_ms,
            flush_threshold: config.flush_threshold,
            retry_max: config.flush_retry_max,
            retry_base_ms: config.flush_retry_base_ms,
        },
    );

    let rest = RestClient::new(&config.rest_base_url, config.api_token.as_deref())?;
    let (feed_client, feed_handle, events) = FeedClient::new(&config);
    let feed_task = tokio::spawn(feed_client.run());

    let pipeline = IngestPipeline::new(
        &config,
        Arc::clone(&storage),
        writer.clone(),
        rest,
        feed_handle,
    );
    let pipeline_task = tokio::spawn(pipeline.run(events));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received; draining write buffers");

    // Stop producers first, then drop the writer handle so the flush task
    // sees channel closure and performs its final flush.
    feed_task.abort();
    pipeline_task.abort();
    maintenance.abort();
    drop(writer);
    let _ = writer_handle.await;

    info!("Shutdown complete");
    Ok(())
}
