use anyhow::Result;
use pg_statements_collector::{Config, Instance, PostgresCollector, QueryContext, encode_text};
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))).init();

    let config = Config::from_env()?;
    let collector: PostgresCollector<deadpool_postgres::Object> = PostgresCollector::from_config(&config)?;
    tracing::info!(collectors = ?collector.collector_names(), reset = config.stat_statements_reset, "starting scrape");

    let pool = config.pool()?;
    let instance = Instance::connect(&pool).await?;
    let ctx = match config.scrape_timeout {
        Some(timeout) => QueryContext::background().with_timeout(timeout),
        None => QueryContext::background(),
    };
    let metrics = collector.scrape(&ctx, &instance).await;
    print!("{}", encode_text(&metrics)?);
    Ok(())
}
