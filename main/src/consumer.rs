mod bootstrap;

use std::sync::Arc;

use bootstrap::{init_tracing, shutdown_on_ctrl_c, Services};
use common::utils::config::get_config;
use ingestion_consumer::{RedisStreamConfig, RedisStreamSource};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = get_config()?;
    let services = Services::connect(config).await?;

    let source = RedisStreamSource::connect(RedisStreamConfig::from_config(&services.config)).await?;
    let (consumer, handlers) = services.consumer(Arc::new(source));
    consumer
        .start(handlers, services.config.consumer_concurrency)
        .await?;

    shutdown_on_ctrl_c().cancelled().await;
    consumer.stop().await;
    Ok(())
}
