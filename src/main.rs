use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use tracing::info;
use tracing_subscriber::EnvFilter;

use portfolio_engine::config::Config;
use portfolio_engine::consumer::{ensure_group, StreamConsumer};
use portfolio_engine::database;

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
        group = %config.consumer.group,
        consumer = %config.consumer.consumer_name,
        "starting portfolio engine"
    );

    let pool = database::create_pool(&config.database.url, config.database.max_connections).await?;
    database::ensure_schema(&pool).await?;

    let client =
        redis::Client::open(config.redis.url.as_str()).context("parsing Redis URL")?;
    let mut redis = ConnectionManager::new(client)
        .await
        .context("connecting to Redis")?;

    for stream in config.streams() {
        ensure_group(&mut redis, stream, &config.consumer.group).await?;
    }

    let consumers: Vec<StreamConsumer> = config
        .streams()
        .into_iter()
        .map(|stream| {
            StreamConsumer::new(config.consumer_settings(stream), redis.clone(), pool.clone())
        })
        .collect();
    let handles: Vec<_> = consumers.iter().filter_map(|c| c.start()).collect();

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown signal received, draining consumers");

    for consumer in &consumers {
        consumer.stop();
    }
    for handle in handles {
        let _ = handle.await;
    }
    for consumer in &consumers {
        info!(stream = consumer.stream(), stats = %consumer.metrics(), "final consumer stats");
    }

    pool.close().await;
    Ok(())
}
