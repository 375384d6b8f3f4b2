//! Environment-driven configuration.

use ahash::AHashMap;
use anyhow::Context;
use std::str::FromStr;
use std::time::Duration;

use crate::collector::stat_statements::StatementLabel;

pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost:5432/postgres";
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

const COLLECTOR_PREFIX: &str = "PG_EXPORTER_COLLECTOR_";

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// Per-collector enable overrides, keyed by collector name.
    pub collectors: AHashMap<String, bool>,
    pub stat_statements_reset: bool,
    pub stat_statements_label: StatementLabel,
    pub scrape_timeout: Option<Duration>,
    pub channel_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            collectors: AHashMap::new(),
            stat_statements_reset: false,
            stat_statements_label: StatementLabel::default(),
            scrape_timeout: None,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl Config {
    /// Reads the process environment, loading `.env` first when one exists.
    pub fn from_env() -> anyhow::Result<Self> {
        if std::path::Path::new(".env").exists() {
            dotenvy::dotenv().context("failed to load .env")?;
        }
        Self::from_vars(std::env::vars())
    }

    /// Parses configuration from `(name, value)` pairs. Unrelated variables are ignored.
    pub fn from_vars(vars: impl IntoIterator<Item = (String, String)>) -> anyhow::Result<Self> {
        let mut config = Self::default();
        for (name, value) in vars {
            match name.as_str() {
                "DATABASE_URL" => config.database_url = value,
                "PG_EXPORTER_STAT_STATEMENTS_RESET" => config.stat_statements_reset = parse_bool(&name, &value)?,
                "PG_EXPORTER_STAT_STATEMENTS_LABEL" => config.stat_statements_label = StatementLabel::from_str(&value)?,
                "PG_EXPORTER_SCRAPE_TIMEOUT_SECS" => {
                    let secs: f64 = value.parse().with_context(|| format!("{name}: invalid number {value:?}"))?;
                    config.scrape_timeout = Some(Duration::try_from_secs_f64(secs).with_context(|| format!("{name}: invalid timeout {value:?}"))?);
                }
                "PG_EXPORTER_CHANNEL_CAPACITY" => {
                    config.channel_capacity = value.parse().with_context(|| format!("{name}: invalid capacity {value:?}"))?;
                }
                _ => {
                    if let Some(collector) = name.strip_prefix(COLLECTOR_PREFIX) {
                        config.collectors.insert(collector.to_lowercase(), parse_bool(&name, &value)?);
                    }
                }
            }
        }
        Ok(config)
    }

    pub fn pool(&self) -> anyhow::Result<deadpool_postgres::Pool> {
        let pg_config = tokio_postgres::Config::from_str(&self.database_url).context("invalid DATABASE_URL")?;
        let mgr_config = deadpool_postgres::ManagerConfig { recycling_method: deadpool_postgres::RecyclingMethod::Fast };
        let mgr = deadpool_postgres::Manager::from_config(pg_config, tokio_postgres::NoTls, mgr_config);
        Ok(deadpool_postgres::Pool::builder(mgr).build()?)
    }
}

fn parse_bool(name: &str, value: &str) -> anyhow::Result<bool> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => anyhow::bail!("{name}: expected a boolean, got {value:?}"),
    }
}
