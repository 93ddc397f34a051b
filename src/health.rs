//! Health monitoring for connection pools

use crate::metrics::utilization;

/// Health status of a connection pool
///
/// # Examples
///
/// ```
/// use broker_pool::HealthStatus;
///
/// let health = HealthStatus::new(2, 1, 3, 10, false);
/// assert!(health.is_healthy());
/// assert_eq!(health.utilization, 0.1);
/// ```
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct HealthStatus {
    /// Whether the pool is healthy
    pub is_healthy: bool,

    /// Number of warnings detected
    pub warning_count: usize,

    /// Share of the capacity lent out (0.0 to 1.0)
    pub utilization: f64,

    /// Idle connections count
    pub idle_connections: usize,

    /// Lent connections count
    pub lent_connections: usize,

    /// Idle, lent and dialling
    pub open_connections: usize,

    /// Maximum number of open connections
    pub total_capacity: usize,

    /// Whether the pool has been shut down
    pub is_closed: bool,

    /// Warning messages
    pub warnings: Vec<String>,
}

impl HealthStatus {
    /// Create a new health status
    pub fn new(idle: usize, lent: usize, open: usize, capacity: usize, closed: bool) -> Self {
        let utilization = utilization(lent, capacity);

        let mut warnings = Vec::new();
        let mut is_healthy = true;

        if closed {
            warnings.push("Pool is closed".to_string());
            is_healthy = false;
        }

        // Callers start queueing once every slot is lent out.
        if lent >= capacity && capacity > 0 {
            warnings.push("All connections are lent out".to_string());
        }

        if utilization > 0.9 {
            warnings.push(format!("High utilization: {:.1}%", utilization * 100.0));
            is_healthy = false;
        }

        Self {
            is_healthy,
            warning_count: warnings.len(),
            utilization,
            idle_connections: idle,
            lent_connections: lent,
            open_connections: open,
            total_capacity: capacity,
            is_closed: closed,
            warnings,
        }
    }

    /// Check if the pool is healthy
    pub fn is_healthy(&self) -> bool {
        self.is_healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_connections_do_not_count_as_utilization() {
        let health = HealthStatus::new(10, 0, 10, 10, false);
        assert!(health.is_healthy());
        assert_eq!(health.utilization, 0.0);
        assert_eq!(health.open_connections, 10);
    }

    #[test]
    fn test_saturated_pool_is_unhealthy() {
        let health = HealthStatus::new(0, 4, 4, 4, false);
        assert!(!health.is_healthy());
        assert_eq!(health.utilization, 1.0);
        assert_eq!(health.warning_count, 2);
    }

    #[test]
    fn test_utilization_threshold() {
        assert!(HealthStatus::new(1, 9, 10, 10, false).is_healthy());
        assert!(!HealthStatus::new(0, 19, 19, 20, false).is_healthy());
    }

    #[test]
    fn test_closed_pool_is_unhealthy() {
        let health = HealthStatus::new(0, 0, 0, 4, true);
        assert!(!health.is_healthy());
        assert!(health.warnings.iter().any(|w| w.contains("closed")));
    }
}
