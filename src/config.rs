//! Pool configuration options

use crate::errors::{PoolError, PoolResult};
use std::time::Duration;

/// Parameters used by the job operations on a
/// [`PooledHandle`](crate::PooledHandle) when the caller does not pass
/// them explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct JobDefaults {
    /// Priority for `put` and `put_delayed`
    pub priority: u32,

    /// Time-to-run granted to a worker that reserves the job
    pub ttr: Duration,

    /// Delay applied by `put_delayed`
    pub put_delay: Duration,

    /// How long `reserve` waits for a ready job
    pub reserve_timeout: Duration,

    /// Priority used by `release_job`
    pub release_priority: u32,

    /// Delay used by `release_job`
    pub release_delay: Duration,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            priority: 1,
            ttr: Duration::from_secs(30),
            put_delay: Duration::from_secs(30),
            reserve_timeout: Duration::from_secs(3),
            release_priority: 1,
            release_delay: Duration::from_secs(30),
        }
    }
}

/// Configuration for connection pool behavior
///
/// # Examples
///
/// ```
/// use broker_pool::PoolConfiguration;
/// use std::time::Duration;
///
/// let config = PoolConfiguration::new()
///     .with_max_open(20)
///     .with_max_idle(5)
///     .with_acquire_timeout(Duration::from_secs(2))
///     .with_idle_timeout(Duration::from_secs(300));
///
/// assert_eq!(config.max_open, 20);
/// assert_eq!(config.effective_max_idle(), 5);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PoolConfiguration {
    /// Maximum number of live connections, idle and lent together
    pub max_open: usize,

    /// Maximum number of idle connections kept for reuse. Defaults to `max_open`.
    pub max_idle: Option<usize>,

    /// Number of connections dialled when the pool is created
    pub initial_size: usize,

    /// How long a blocking `acquire` waits for a free slot. `None` waits forever.
    pub acquire_timeout: Option<Duration>,

    /// Idle connections older than this since their last return are closed
    pub idle_timeout: Option<Duration>,

    /// Connections older than this since they were dialled are closed when idle
    pub max_lifetime: Option<Duration>,

    /// Defaults for the forwarded job operations
    pub job_defaults: JobDefaults,
}

impl Default for PoolConfiguration {
    fn default() -> Self {
        Self {
            max_open: 10,
            max_idle: None,
            initial_size: 0,
            acquire_timeout: None,
            idle_timeout: None,
            max_lifetime: None,
            job_defaults: JobDefaults::default(),
        }
    }
}

impl PoolConfiguration {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the pool capacity
    ///
    /// # Examples
    ///
    /// ```
    /// use broker_pool::PoolConfiguration;
    ///
    /// let config = PoolConfiguration::new().with_max_open(2);
    ///
    /// assert_eq!(config.max_open, 2);
    /// assert_eq!(config.effective_max_idle(), 2);
    /// ```
    pub fn with_max_open(mut self, max: usize) -> Self {
        self.max_open = max;
        self
    }

    /// Set the idle connection limit
    pub fn with_max_idle(mut self, max: usize) -> Self {
        self.max_idle = Some(max);
        self
    }

    /// Set how many connections are dialled up front
    pub fn with_initial_size(mut self, size: usize) -> Self {
        self.initial_size = size;
        self
    }

    /// Bound how long `acquire` may wait
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = Some(timeout);
        self
    }

    /// Set idle timeout for pooled connections
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Set maximum lifetime for pooled connections
    pub fn with_max_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_lifetime = Some(lifetime);
        self
    }

    /// Replace the job operation defaults
    pub fn with_job_defaults(mut self, defaults: JobDefaults) -> Self {
        self.job_defaults = defaults;
        self
    }

    pub fn effective_max_idle(&self) -> usize {
        self.max_idle.unwrap_or(self.max_open)
    }

    /// Check the limits are consistent with each other
    pub fn validate(&self) -> PoolResult<()> {
        if self.max_open == 0 {
            return Err(PoolError::InvalidConfiguration("max_open must be at least 1"));
        }
        if self.effective_max_idle() > self.max_open {
            return Err(PoolError::InvalidConfiguration(
                "max_idle must not exceed max_open",
            ));
        }
        if self.initial_size > self.effective_max_idle() {
            return Err(PoolError::InvalidConfiguration(
                "initial_size must not exceed max_idle",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_defaults_match_broker_conventions() {
        let defaults = JobDefaults::default();
        assert_eq!(defaults.reserve_timeout, Duration::from_secs(3));
        assert_eq!(defaults.release_delay, Duration::from_secs(30));
        assert_eq!(defaults.release_priority, 1);
        assert_eq!(defaults.put_delay, Duration::from_secs(30));
    }

    #[test]
    fn test_rejects_zero_capacity() {
        let config = PoolConfiguration::new().with_max_open(0);
        assert!(matches!(
            config.validate(),
            Err(PoolError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_rejects_idle_above_capacity() {
        let config = PoolConfiguration::new().with_max_open(2).with_max_idle(3);
        assert!(config.validate().is_err());

        let config = PoolConfiguration::new()
            .with_max_open(4)
            .with_max_idle(2)
            .with_initial_size(3);
        assert!(config.validate().is_err());
    }
}
