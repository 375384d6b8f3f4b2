//! Collector registration and the scrape loop that drives enabled collectors.

pub mod stat_statements;

use ahash::AHashMap;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::config::Config;
use crate::context::QueryContext;
use crate::db::{Database, Instance};
use crate::error::CollectError;
use crate::metric::{ConstMetric, Desc, MetricError, MetricSender, ValueType, new_desc};
use stat_statements::StatStatementsConfig;

/// A source of observations refreshed once per scrape.
pub trait Collector<D: Database>: Send + Sync {
    fn name(&self) -> &'static str;

    /// Every descriptor this collector can emit, independent of any particular scrape.
    fn describe(&self) -> Vec<Arc<Desc>>;

    /// Reads the current state and pushes observations onto `ch`.
    ///
    /// Callers must not run two updates of the same collector concurrently.
    fn update<'a>(&'a self, ctx: &'a QueryContext, instance: &'a Instance<D>, ch: &'a MetricSender) -> BoxFuture<'a, Result<(), CollectError>>;
}

/// Settings handed to collector factories.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub stat_statements: StatStatementsConfig,
}

impl CollectorConfig {
    pub fn new(config: &Config) -> Result<Self, MetricError> {
        Ok(Self { stat_statements: StatStatementsConfig::new(config.stat_statements_reset, config.stat_statements_label)? })
    }
}

pub type Factory<D> = fn(&CollectorConfig) -> anyhow::Result<Box<dyn Collector<D>>>;

pub struct Registration<D> {
    pub name: &'static str,
    pub default_enabled: bool,
    pub factory: Factory<D>,
}

/// Every collector this crate knows about, in scrape order.
pub fn registrations<D: Database + 'static>() -> Vec<Registration<D>> {
    vec![stat_statements::registration()]
}

const SCRAPE_SUBSYSTEM: &str = "scrape";

/// Runs the enabled collectors for each scrape and reports how each one did.
pub struct PostgresCollector<D> {
    collectors: Vec<Box<dyn Collector<D>>>,
    scrape_duration: Arc<Desc>,
    scrape_success: Arc<Desc>,
    channel_capacity: usize,
}

impl<D: Database + 'static> PostgresCollector<D> {
    /// Instantiates every collector that is enabled by default or by an override in `enabled`.
    ///
    /// Overrides naming a collector that does not exist are an error.
    pub fn new(registrations: Vec<Registration<D>>, enabled: &AHashMap<String, bool>, config: &CollectorConfig, channel_capacity: usize) -> anyhow::Result<Self> {
        for name in enabled.keys() {
            if !registrations.iter().any(|r| r.name == name) {
                anyhow::bail!("unknown collector {name:?}");
            }
        }
        let mut collectors = Vec::new();
        for registration in registrations {
            if enabled.get(registration.name).copied().unwrap_or(registration.default_enabled) {
                debug!(collector = registration.name, "enabled collector");
                collectors.push((registration.factory)(config)?);
            }
        }
        let labels = ["collector"];
        Ok(Self {
            collectors,
            scrape_duration: new_desc(SCRAPE_SUBSYSTEM, "collector_duration_seconds", "postgres_exporter: Duration of a collector scrape.", &labels)?,
            scrape_success: new_desc(SCRAPE_SUBSYSTEM, "collector_success", "postgres_exporter: Whether a collector succeeded.", &labels)?,
            channel_capacity: channel_capacity.max(1),
        })
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Self::new(registrations(), &config.collectors, &CollectorConfig::new(config)?, config.channel_capacity)
    }

    pub fn collector_names(&self) -> Vec<&'static str> {
        self.collectors.iter().map(|c| c.name()).collect()
    }

    pub fn describe(&self) -> Vec<Arc<Desc>> {
        let mut descs = vec![self.scrape_duration.clone(), self.scrape_success.clone()];
        for collector in &self.collectors {
            descs.extend(collector.describe());
        }
        descs
    }

    /// Runs every enabled collector once and returns everything they emitted.
    ///
    /// A failing collector contributes only its scrape gauges (`success` 0) and does not stop the others.
    #[tracing::instrument(name = "scrape", skip_all, fields(collectors = self.collectors.len()))]
    pub async fn scrape(&self, ctx: &QueryContext, instance: &Instance<D>) -> Vec<ConstMetric> {
        let mut metrics = Vec::new();
        for collector in &self.collectors {
            let start = Instant::now();
            let result = self.run_collector(collector.as_ref(), ctx, instance, &mut metrics).await;
            let elapsed = start.elapsed();
            let success = match &result {
                Ok(()) => {
                    debug!(collector = collector.name(), duration_seconds = elapsed.as_secs_f64(), "collector succeeded");
                    1.0
                }
                Err(err) => {
                    error!(collector = collector.name(), duration_seconds = elapsed.as_secs_f64(), error = %err, "collector failed");
                    0.0
                }
            };
            metrics.extend(self.scrape_metrics(collector.name(), elapsed, success));
        }
        metrics
    }

    async fn run_collector(&self, collector: &dyn Collector<D>, ctx: &QueryContext, instance: &Instance<D>, out: &mut Vec<ConstMetric>) -> Result<(), CollectError> {
        let (tx, mut rx) = mpsc::channel(self.channel_capacity);
        let update = async move {
            let result = collector.update(ctx, instance, &tx).await;
            drop(tx);
            result
        };
        let mut emitted = Vec::new();
        let drain = async {
            while let Some(metric) = rx.recv().await {
                emitted.push(metric);
            }
        };
        let (result, ()) = futures::join!(update, drain);
        // Observations from a failed cycle are not reported.
        if result.is_ok() {
            out.append(&mut emitted);
        }
        result
    }

    fn scrape_metrics(&self, name: &str, elapsed: Duration, success: f64) -> Vec<ConstMetric> {
        [(&self.scrape_duration, elapsed.as_secs_f64()), (&self.scrape_success, success)]
            .into_iter()
            .filter_map(|(desc, value)| ConstMetric::new(desc, ValueType::Gauge, value, vec![name.to_string()]).ok())
            .collect()
    }
}
