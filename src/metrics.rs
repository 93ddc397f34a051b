//! Metrics collection and export for connection pools

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Metrics data for a pool
///
/// # Examples
///
/// ```
/// use broker_pool::memory::MemoryBroker;
/// use broker_pool::{ConnectionPool, PoolConfiguration};
///
/// let broker = MemoryBroker::new();
/// let pool = ConnectionPool::new(broker.factory(), PoolConfiguration::default()).unwrap();
///
/// let handle = pool.acquire().unwrap();
/// let metrics = pool.get_metrics();
/// assert_eq!(metrics.connections_created, 1);
/// assert_eq!(metrics.lent_connections, 1);
/// handle.release().unwrap();
/// ```
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct PoolMetrics {
    /// Connections dialled by the factory
    pub connections_created: usize,

    /// Acquisitions served from the idle set
    pub connections_reused: usize,

    /// Connections put back into the idle set
    pub connections_returned: usize,

    /// Connections physically closed on release, shutdown or overflow
    pub connections_discarded: usize,

    /// Idle connections closed by the eviction policy
    pub connections_evicted: usize,

    /// Dial attempts that failed
    pub factory_failures: usize,

    /// Times a caller had to wait for a free slot
    pub wait_events: usize,

    /// Current lent connections
    pub lent_connections: usize,

    /// Current idle connections
    pub idle_connections: usize,

    /// Share of the capacity lent out (0.0 to 1.0)
    pub utilization: f64,

    /// Maximum number of open connections
    pub max_capacity: usize,
}

impl PoolMetrics {
    /// Export metrics as a HashMap
    pub fn export(&self) -> HashMap<String, String> {
        let mut metrics = HashMap::new();
        metrics.insert("connections_created".to_string(), self.connections_created.to_string());
        metrics.insert("connections_reused".to_string(), self.connections_reused.to_string());
        metrics.insert("connections_returned".to_string(), self.connections_returned.to_string());
        metrics.insert("connections_discarded".to_string(), self.connections_discarded.to_string());
        metrics.insert("connections_evicted".to_string(), self.connections_evicted.to_string());
        metrics.insert("factory_failures".to_string(), self.factory_failures.to_string());
        metrics.insert("wait_events".to_string(), self.wait_events.to_string());
        metrics.insert("lent_connections".to_string(), self.lent_connections.to_string());
        metrics.insert("idle_connections".to_string(), self.idle_connections.to_string());
        metrics.insert("utilization".to_string(), format!("{:.2}", self.utilization));
        metrics.insert("max_capacity".to_string(), self.max_capacity.to_string());
        metrics
    }
}

/// Metrics exporter for Prometheus format
#[cfg(feature = "prometheus")]
pub struct MetricsExporter;

#[cfg(feature = "prometheus")]
impl MetricsExporter {
    /// Export metrics in Prometheus exposition format
    ///
    /// # Examples
    ///
    /// ```
    /// use broker_pool::memory::MemoryBroker;
    /// use broker_pool::{ConnectionPool, PoolConfiguration};
    /// use std::collections::HashMap;
    ///
    /// let pool = ConnectionPool::new(MemoryBroker::new().factory(), PoolConfiguration::default()).unwrap();
    ///
    /// let mut tags = HashMap::new();
    /// tags.insert("service".to_string(), "mailer".to_string());
    ///
    /// let output = pool.export_metrics_prometheus("jobs", Some(&tags)).unwrap();
    /// assert!(output.contains("brokerpool_connections_lent"));
    /// assert!(output.contains("service=\"mailer\""));
    /// ```
    pub fn export_prometheus(
        metrics: &PoolMetrics,
        pool_name: &str,
        tags: Option<&HashMap<String, String>>,
    ) -> prometheus::Result<String> {
        use prometheus::{Encoder, TextEncoder};

        let registry = prometheus::Registry::new();
        let labels = Self::const_labels(pool_name, tags);

        // Gauge metrics
        Self::gauge(&registry, &labels, "brokerpool_connections_lent", "Current lent connections", metrics.lent_connections as f64)?;
        Self::gauge(&registry, &labels, "brokerpool_connections_idle", "Current idle connections", metrics.idle_connections as f64)?;
        Self::gauge(&registry, &labels, "brokerpool_utilization", "Pool utilization ratio", metrics.utilization)?;

        // Counter metrics
        Self::counter(&registry, &labels, "brokerpool_connections_created_total", "Connections dialled", metrics.connections_created)?;
        Self::counter(&registry, &labels, "brokerpool_connections_reused_total", "Acquisitions served from idle connections", metrics.connections_reused)?;
        Self::counter(&registry, &labels, "brokerpool_connections_returned_total", "Connections returned to the pool", metrics.connections_returned)?;
        Self::counter(&registry, &labels, "brokerpool_connections_discarded_total", "Connections closed instead of pooled", metrics.connections_discarded)?;
        Self::counter(&registry, &labels, "brokerpool_connections_evicted_total", "Idle connections evicted", metrics.connections_evicted)?;
        Self::counter(&registry, &labels, "brokerpool_factory_failures_total", "Failed dial attempts", metrics.factory_failures)?;
        Self::counter(&registry, &labels, "brokerpool_wait_events_total", "Acquisitions that had to wait", metrics.wait_events)?;

        let mut buffer = Vec::new();
        TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    fn const_labels(
        pool_name: &str,
        tags: Option<&HashMap<String, String>>,
    ) -> HashMap<String, String> {
        let mut labels = HashMap::new();
        if let Some(tags) = tags {
            labels.extend(tags.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        labels.insert("pool".to_string(), pool_name.to_string());
        labels
    }

    fn gauge(
        registry: &prometheus::Registry,
        labels: &HashMap<String, String>,
        name: &str,
        help: &str,
        value: f64,
    ) -> prometheus::Result<()> {
        let opts = prometheus::Opts::new(name, help).const_labels(labels.clone());
        let gauge = prometheus::Gauge::with_opts(opts)?;
        gauge.set(value);
        registry.register(Box::new(gauge))
    }

    fn counter(
        registry: &prometheus::Registry,
        labels: &HashMap<String, String>,
        name: &str,
        help: &str,
        value: usize,
    ) -> prometheus::Result<()> {
        let opts = prometheus::Opts::new(name, help).const_labels(labels.clone());
        let counter = prometheus::IntCounter::with_opts(opts)?;
        counter.inc_by(value as u64);
        registry.register(Box::new(counter))
    }
}

/// Share of `capacity` held by callers. Idle connections are free to lend,
/// so they do not count.
pub(crate) fn utilization(lent: usize, capacity: usize) -> f64 {
    if capacity > 0 {
        lent as f64 / capacity as f64
    } else {
        0.0
    }
}

/// Internal metrics tracker
#[derive(Default)]
pub(crate) struct MetricsTracker {
    pub connections_created: AtomicUsize,
    pub connections_reused: AtomicUsize,
    pub connections_returned: AtomicUsize,
    pub connections_discarded: AtomicUsize,
    pub connections_evicted: AtomicUsize,
    pub factory_failures: AtomicUsize,
    pub wait_events: AtomicUsize,
}

impl MetricsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_metrics(&self, lent: usize, idle: usize, capacity: usize) -> PoolMetrics {
        PoolMetrics {
            connections_created: self.connections_created.load(Ordering::Relaxed),
            connections_reused: self.connections_reused.load(Ordering::Relaxed),
            connections_returned: self.connections_returned.load(Ordering::Relaxed),
            connections_discarded: self.connections_discarded.load(Ordering::Relaxed),
            connections_evicted: self.connections_evicted.load(Ordering::Relaxed),
            factory_failures: self.factory_failures.load(Ordering::Relaxed),
            wait_events: self.wait_events.load(Ordering::Relaxed),
            lent_connections: lent,
            idle_connections: idle,
            utilization: utilization(lent, capacity),
            max_capacity: capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_contains_every_counter() {
        let tracker = MetricsTracker::new();
        MetricsTracker::record(&tracker.connections_created);
        MetricsTracker::record(&tracker.connections_created);
        MetricsTracker::record(&tracker.wait_events);

        let exported = tracker.get_metrics(1, 1, 4).export();
        assert_eq!(exported["connections_created"], "2");
        assert_eq!(exported["wait_events"], "1");
        assert_eq!(exported["utilization"], "0.25");
        assert_eq!(exported.len(), 11);
    }

    #[cfg(feature = "prometheus")]
    #[test]
    fn test_prometheus_output_is_labelled() {
        let metrics = MetricsTracker::new().get_metrics(2, 0, 2);
        let output = MetricsExporter::export_prometheus(&metrics, "jobs", None).unwrap();

        assert!(output.contains("# TYPE brokerpool_connections_created_total counter"));
        assert!(output.contains("# TYPE brokerpool_connections_lent gauge"));
        assert!(output.contains("brokerpool_connections_lent{pool=\"jobs\"} 2"));
    }
}
