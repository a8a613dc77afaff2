mod bootstrap;

use std::sync::Arc;

use bootstrap::{init_tracing, shutdown_on_ctrl_c, Services};
use common::utils::config::get_config;
use ingestion_consumer::{RedisStreamConfig, RedisStreamSource};
use tracing::{error, info};

/// Consumer and pending-document worker in one process.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = get_config()?;
    let services = Services::connect(config).await?;
    let shutdown = shutdown_on_ctrl_c();

    let source = RedisStreamSource::connect(RedisStreamConfig::from_config(&services.config)).await?;
    let (consumer, handlers) = services.consumer(Arc::new(source));
    consumer
        .start(handlers, services.config.consumer_concurrency)
        .await?;

    let scanner = services.scanner()?;
    let worker = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { scanner.run(shutdown).await }
    });
    info!("consumer and worker running");

    shutdown.cancelled().await;
    consumer.stop().await;
    match worker.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!(error = %err, "worker stopped with an error"),
        Err(err) => error!(error = %err, "worker task panicked"),
    }
    Ok(())
}
