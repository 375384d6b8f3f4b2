//! Snapshot collector for `pg_stat_statements`.
//!
//! Each scrape reads the statement-statistics aggregates, converts every row into six counters and,
//! when configured to, resets the aggregates afterwards so the next scrape starts from a clean slate.
//!
//! ```rust,ignore
//! let config = Config::from_env()?;
//! let pool = config.pool()?;
//! let collector = PostgresCollector::from_config(&config)?;
//! let instance = Instance::connect(&pool).await?;
//! let metrics = collector.scrape(&QueryContext::background(), &instance).await;
//! print!("{}", encode_text(&metrics)?);
//! ```

pub mod collector;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod exposition;
pub mod metric;

pub use collector::stat_statements::{StatStatementsCollector, StatStatementsConfig, StatementLabel, StatementStatRow};
pub use collector::{Collector, CollectorConfig, PostgresCollector, Registration, registrations};
pub use config::Config;
pub use context::{CancelHandle, ContextError, QueryContext};
pub use db::{Database, Instance, SqlRow};
pub use error::CollectError;
pub use exposition::{encode_text, gather};
pub use metric::{ConstMetric, Desc, MetricSender, ValueType};
