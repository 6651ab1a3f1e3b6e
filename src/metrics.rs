//! Metrics collection and reporting for a conversion run.
//!
//! The pipeline counts what it reads and writes per split and records each
//! split's throughput as a gauge. At the end of a run
//! the collector can be logged or saved as JSON:
//!
//! ```no_run
//! use tfrecord_convert::metrics::MetricsCollector;
//!
//! # fn main() -> tfrecord_convert::Result<()> {
//! let mut metrics = MetricsCollector::new();
//! metrics.record_start();
//! metrics.increment_counter("records.train", 10_000);
//! metrics.record_end();
//!
//! metrics.log_summary();
//! metrics.save_to_file("metrics.json")?;
//! # Ok(())
//! # }
//! ```

use crate::error::{ConvertError, Result};
use log::info;
use serde_json::{Value, json};
use std::any::Any;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::time::{Duration, Instant};

/// A named value reported at the end of a run.
pub trait Metric: Any {
    /// The name of this metric (e.g., `records.train`).
    fn name(&self) -> &str;

    /// The current value of this metric as a JSON value.
    fn value(&self) -> Value;

    /// Optional description of what this metric measures.
    fn description(&self) -> Option<&str> {
        None
    }

    /// Cast to Any for downcasting.
    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Collects metrics for one run. Names are kept sorted for stable output.
#[derive(Default)]
pub struct MetricsCollector {
    metrics: BTreeMap<String, Box<dyn Metric>>,
    start_time: Option<Instant>,
    end_time: Option<Instant>,
}

impl MetricsCollector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a metric, replacing any metric with the same name.
    pub fn register(&mut self, metric: Box<dyn Metric>) {
        self.metrics.insert(metric.name().to_string(), metric);
    }

    pub fn record_start(&mut self) {
        self.start_time = Some(Instant::now());
    }

    pub fn record_end(&mut self) {
        self.end_time = Some(Instant::now());
    }

    /// Time between [`record_start`](Self::record_start) and [`record_end`](Self::record_end).
    #[must_use]
    pub fn elapsed(&self) -> Option<Duration> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => Some(end.duration_since(start)),
            _ => None,
        }
    }

    /// Add `value` to a counter, creating it at zero first if needed.
    ///
    /// A non-counter metric registered under `name` is replaced.
    pub fn increment_counter(&mut self, name: &str, value: u64) {
        if let Some(counter) = self
            .metrics
            .get_mut(name)
            .and_then(|m| m.as_any_mut().downcast_mut::<CounterMetric>())
        {
            counter.count += value;
            return;
        }
        self.set_counter(name, value);
    }

    /// Set a counter metric to a specific value.
    pub fn set_counter(&mut self, name: &str, value: u64) {
        self.register(Box::new(CounterMetric::with_value(name, value)));
    }

    /// Set a gauge metric, replacing any metric with the same name.
    pub fn set_gauge(&mut self, name: &str, value: f64, description: &str) {
        self.register(Box::new(
            GaugeMetric::new(name, value).with_description(description),
        ));
    }

    /// Current reading of a gauge, if one exists under `name`.
    #[must_use]
    pub fn gauge(&self, name: &str) -> Option<f64> {
        self.metrics
            .get(name)
            .and_then(|m| m.as_any().downcast_ref::<GaugeMetric>())
            .map(|g| g.value)
    }

    /// Current value of a counter, if one exists under `name`.
    #[must_use]
    pub fn counter(&self, name: &str) -> Option<u64> {
        self.metrics
            .get(name)
            .and_then(|m| m.as_any().downcast_ref::<CounterMetric>())
            .map(|c| c.count)
    }

    /// All metrics as a JSON object, plus `execution_time_ms` when timed.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let mut metrics_json = serde_json::Map::new();

        for (name, metric) in &self.metrics {
            let mut metric_obj = serde_json::Map::new();
            metric_obj.insert("value".to_string(), metric.value());
            if let Some(desc) = metric.description() {
                metric_obj.insert("description".to_string(), json!(desc));
            }
            metrics_json.insert(name.clone(), Value::Object(metric_obj));
        }

        if let Some(elapsed) = self.elapsed() {
            metrics_json.insert(
                "execution_time_ms".to_string(),
                json!({
                    "value": elapsed.as_millis(),
                    "description": "Total conversion time in milliseconds",
                }),
            );
        }
        Value::Object(metrics_json)
    }

    /// Log every metric at info level, execution time first.
    pub fn log_summary(&self) {
        if let Some(elapsed) = self.elapsed() {
            info!(
                "Execution time: {:.3}s ({} ms)",
                elapsed.as_secs_f64(),
                elapsed.as_millis()
            );
        }
        for (name, metric) in &self.metrics {
            match metric.description() {
                Some(desc) => info!("{}: {} ({})", name, metric.value(), desc),
                None => info!("{}: {}", name, metric.value()),
            }
        }
    }

    /// Save all metrics to a pretty-printed JSON file.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the file cannot be created or written to.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let formatted = serde_json::to_string_pretty(&self.to_json())
            .map_err(|e| ConvertError::io(path, e.into()))?;
        let mut file = File::create(path).map_err(|e| ConvertError::io(path, e))?;
        file.write_all(formatted.as_bytes())
            .map_err(|e| ConvertError::io(path, e))?;
        Ok(())
    }
}

// ========== Built-in Metrics ==========

/// A monotonically increasing count.
pub struct CounterMetric {
    name: String,
    count: u64,
}

impl CounterMetric {
    pub fn with_value(name: impl Into<String>, count: u64) -> Self {
        Self {
            name: name.into(),
            count,
        }
    }
}

impl Metric for CounterMetric {
    fn name(&self) -> &str {
        &self.name
    }

    fn value(&self) -> Value {
        json!(self.count)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A single numeric reading with an optional description.
pub struct GaugeMetric {
    name: String,
    value: f64,
    description: Option<String>,
}

impl GaugeMetric {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
            description: None,
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

impl Metric for GaugeMetric {
    fn name(&self) -> &str {
        &self.name
    }

    fn value(&self) -> Value {
        json!(self.value)
    }

    fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
