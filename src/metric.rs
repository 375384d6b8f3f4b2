//! Metric descriptors and constant observations.
//!
//! Descriptors are `prometheus` descriptors, so metric and label names are validated when they are
//! built. The crate has no constant-metric type, hence [`ConstMetric`].

use prometheus::Opts;
use prometheus::core::Describer;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

pub use prometheus::core::Desc;

/// Prefix shared by every metric this crate exposes.
pub const NAMESPACE: &str = "pg";

/// Output channel a collector pushes its observations onto.
pub type MetricSender = mpsc::Sender<ConstMetric>;

#[derive(Debug, Error)]
pub enum MetricError {
    #[error("{name}: expected {expected} label values, got {actual}")]
    LabelCardinality { name: String, expected: usize, actual: usize },

    #[error("invalid descriptor: {0}")]
    Descriptor(#[from] prometheus::Error),
}

/// Builds `pg_<subsystem>_<name>` with the given variable labels.
pub fn new_desc(subsystem: &str, name: &str, help: &str, variable_labels: &[&str]) -> Result<Arc<Desc>, MetricError> {
    let opts = Opts::new(name, help)
        .namespace(NAMESPACE)
        .subsystem(subsystem)
        .variable_labels(variable_labels.iter().map(|l| l.to_string()).collect());
    describe(&opts)
}

pub fn describe(opts: &Opts) -> Result<Arc<Desc>, MetricError> {
    Ok(Arc::new(opts.describe()?))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Counter,
    Gauge,
}

/// A single observation whose value is fixed at construction.
#[derive(Debug, Clone)]
pub struct ConstMetric {
    desc: Arc<Desc>,
    value_type: ValueType,
    value: f64,
    label_values: Vec<String>,
}

impl ConstMetric {
    pub fn new(desc: &Arc<Desc>, value_type: ValueType, value: f64, label_values: Vec<String>) -> Result<Self, MetricError> {
        if label_values.len() != desc.variable_labels.len() {
            return Err(MetricError::LabelCardinality {
                name: desc.fq_name.clone(),
                expected: desc.variable_labels.len(),
                actual: label_values.len(),
            });
        }
        Ok(Self { desc: desc.clone(), value_type, value, label_values })
    }

    pub fn desc(&self) -> &Arc<Desc> {
        &self.desc
    }

    pub fn value_type(&self) -> ValueType {
        self.value_type
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn label_values(&self) -> &[String] {
        &self.label_values
    }

    /// Returns the value of the label called `name`, variable or constant.
    pub fn label(&self, name: &str) -> Option<&str> {
        if let Some(index) = self.desc.variable_labels.iter().position(|l| l == name) {
            return Some(&self.label_values[index]);
        }
        self.desc.const_label_pairs.iter().find(|pair| pair.get_name() == name).map(|pair| pair.get_value())
    }
}
