//! Rendering collected observations in the Prometheus text format.

use ahash::AHashMap;
use prometheus::proto::{self, MetricFamily, MetricType};
use prometheus::{Encoder, TextEncoder};

use crate::metric::{ConstMetric, ValueType};

/// Groups observations into metric families, keeping the order in which names were first seen.
pub fn gather(metrics: &[ConstMetric]) -> Vec<MetricFamily> {
    let mut families: Vec<MetricFamily> = Vec::new();
    let mut index: AHashMap<&str, usize> = AHashMap::new();
    for metric in metrics {
        let desc = metric.desc();
        let i = *index.entry(desc.fq_name.as_str()).or_insert_with(|| {
            let mut family = MetricFamily::default();
            family.set_name(desc.fq_name.clone());
            family.set_help(desc.help.clone());
            family.set_field_type(match metric.value_type() {
                ValueType::Counter => MetricType::COUNTER,
                ValueType::Gauge => MetricType::GAUGE,
            });
            families.push(family);
            families.len() - 1
        });
        families[i].mut_metric().push(to_proto(metric));
    }
    families
}

fn to_proto(metric: &ConstMetric) -> proto::Metric {
    let desc = metric.desc();
    let mut m = proto::Metric::default();
    let mut labels: Vec<proto::LabelPair> = desc
        .variable_labels
        .iter()
        .zip(metric.label_values())
        .map(|(name, value)| {
            let mut pair = proto::LabelPair::default();
            pair.set_name(name.clone());
            pair.set_value(value.clone());
            pair
        })
        .collect();
    labels.extend(desc.const_label_pairs.iter().cloned());
    labels.sort_by(|a, b| a.get_name().cmp(b.get_name()));
    for pair in labels {
        m.mut_label().push(pair);
    }
    match metric.value_type() {
        ValueType::Counter => {
            let mut counter = proto::Counter::default();
            counter.set_value(metric.value());
            m.set_counter(counter);
        }
        ValueType::Gauge => {
            let mut gauge = proto::Gauge::default();
            gauge.set_value(metric.value());
            m.set_gauge(gauge);
        }
    }
    m
}

/// Renders `metrics` in the text exposition format.
pub fn encode_text(metrics: &[ConstMetric]) -> anyhow::Result<String> {
    let mut buf = Vec::new();
    TextEncoder::new().encode(&gather(metrics), &mut buf)?;
    Ok(String::from_utf8(buf)?)
}
