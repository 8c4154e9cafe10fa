use once_cell::sync::Lazy;
use prometheus::{self, Gauge, IntCounter, IntGauge, Opts, Registry};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock},
};
use sysinfo::System;
use tracing::{debug, instrument};

/// Global singleton for the `Metrics` instance.
pub static METRICS: Lazy<Arc<Mutex<Option<Metrics>>>> = Lazy::new(|| Arc::new(Mutex::new(None)));

/// Metrics struct managing process gauges and named domain instruments.
#[derive(Debug, Clone)]
pub struct Metrics {
    registry: Registry,
    common_labels: Arc<RwLock<Vec<(String, String)>>>,
    cpu_usage: Gauge,
    memory_usage: Gauge,
    custom_gauges: Arc<Mutex<HashMap<String, IntGauge>>>,
    custom_counters: Arc<Mutex<HashMap<String, IntCounter>>>,
    system: Arc<Mutex<System>>,
}

pub struct MetricsBuilder {
    common_labels: Vec<(String, String)>,
}

impl Default for MetricsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsBuilder {
    /// Create a new `MetricsBuilder`.
    #[instrument(skip_all)]
    pub fn new() -> Self {
        Self {
            common_labels: Vec::new(),
        }
    }

    /// Add a common label to be applied to all metrics.
    #[instrument(skip_all)]
    pub fn add_label(mut self, key: &str, value: &str) -> Self {
        self.common_labels.push((key.to_string(), value.to_string()));
        self
    }

    /// Build the Metrics struct and register it as the global instance.
    #[instrument(skip_all)]
    pub fn build(self) -> Metrics {
        let metrics = self.construct();

        let mut metrics_guard = METRICS.lock().unwrap();
        if metrics_guard.is_some() {
            panic!("Metrics instance already initialized.");
        }
        *metrics_guard = Some(metrics);

        (*metrics_guard.as_ref().unwrap()).clone()
    }

    fn construct(self) -> Metrics {
        let registry = Registry::new();

        let cpu_usage = Gauge::with_opts(Self::opts_with_labels(
            "cpu_usage",
            "CPU usage percentage",
            &self.common_labels,
        ))
        .expect("Failed to create CPU usage gauge");
        let memory_usage = Gauge::with_opts(Self::opts_with_labels(
            "memory_usage",
            "Memory usage in bytes",
            &self.common_labels,
        ))
        .expect("Failed to create memory usage gauge");

        registry
            .register(Box::new(cpu_usage.clone()))
            .expect("Failed to register CPU usage gauge");
        registry
            .register(Box::new(memory_usage.clone()))
            .expect("Failed to register memory usage gauge");

        debug!("Metrics successfully built");

        Metrics {
            registry,
            common_labels: Arc::new(RwLock::new(self.common_labels)),
            cpu_usage,
            memory_usage,
            custom_gauges: Arc::new(Mutex::new(HashMap::new())),
            custom_counters: Arc::new(Mutex::new(HashMap::new())),
            system: Arc::new(Mutex::new(System::new())),
        }
    }

    /// Helper to create metric options with labels.
    fn opts_with_labels(name: &str, help: &str, labels: &[(String, String)]) -> Opts {
        let mut opts = Opts::new(name, help);
        for (key, value) in labels {
            opts = opts.const_label(key.clone(), value.clone());
        }
        opts
    }
}

/// Retrieve the global Metrics instance, creating an unlabeled one on first
/// use when no builder ran (components can always record their instruments).
#[instrument(skip_all)]
pub fn get_metrics() -> Metrics {
    let mut metrics_guard = METRICS.lock().unwrap();
    if let Some(ref metrics) = *metrics_guard {
        return metrics.clone();
    }

    let metrics = MetricsBuilder::new().construct();
    *metrics_guard = Some(metrics.clone());
    metrics
}

impl Metrics {
    /// Update process metrics.
    #[instrument(skip_all)]
    pub fn update(&self) {
        let mut sys = self.system.lock().expect("Failed to lock system data");
        sys.refresh_all();

        self.cpu_usage.set(sys.global_cpu_usage() as f64);
        self.memory_usage.set(sys.used_memory() as f64);
    }

    /// Add or get a custom gauge by name.
    #[instrument(skip_all)]
    pub fn get_or_create_gauge(&self, name: &str, description: &str) -> Result<IntGauge, String> {
        let mut gauges = self
            .custom_gauges
            .lock()
            .map_err(|_| "Failed to lock custom gauges".to_string())?;
        if let Some(gauge) = gauges.get(name) {
            return Ok(gauge.clone());
        }

        let labels = self
            .common_labels
            .read()
            .map_err(|_| "Failed to lock common labels".to_string())?;
        let opts = MetricsBuilder::opts_with_labels(name, description, &labels);
        let gauge = IntGauge::with_opts(opts).map_err(|e| format!("Failed to create gauge: {}", e))?;
        self.registry
            .register(Box::new(gauge.clone()))
            .map_err(|e| format!("Failed to register gauge: {}", e))?;
        gauges.insert(name.to_string(), gauge.clone());
        Ok(gauge)
    }

    /// Add or get a custom monotonic counter by name.
    #[instrument(skip_all)]
    pub fn get_or_create_counter(&self, name: &str, description: &str) -> Result<IntCounter, String> {
        let mut counters = self
            .custom_counters
            .lock()
            .map_err(|_| "Failed to lock custom counters".to_string())?;
        if let Some(counter) = counters.get(name) {
            return Ok(counter.clone());
        }

        let labels = self
            .common_labels
            .read()
            .map_err(|_| "Failed to lock common labels".to_string())?;
        let opts = MetricsBuilder::opts_with_labels(name, description, &labels);
        let counter =
            IntCounter::with_opts(opts).map_err(|e| format!("Failed to create counter: {}", e))?;
        self.registry
            .register(Box::new(counter.clone()))
            .map_err(|e| format!("Failed to register counter: {}", e))?;
        counters.insert(name.to_string(), counter.clone());
        Ok(counter)
    }

    /// Get the Prometheus registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_created_once_and_shared() {
        let metrics = get_metrics();
        let a = metrics.get_or_create_counter("test_events_total", "Test events").unwrap();
        let b = metrics.get_or_create_counter("test_events_total", "Test events").unwrap();
        a.inc();
        b.inc();
        assert_eq!(a.get(), 2);
    }
}
