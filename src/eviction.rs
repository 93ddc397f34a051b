//! Eviction policies for idle connections

use crate::config::PoolConfiguration;
use std::time::{Duration, Instant};

/// Eviction policy applied to idle connections
///
/// Checked whenever a caller acquires a connection: every idle connection
/// that has expired is closed at that point, not only the one about to be
/// lent out.
///
/// # Examples
///
/// ```
/// use broker_pool::{EvictionPolicy, PoolConfiguration};
/// use std::time::Duration;
///
/// let config = PoolConfiguration::new()
///     .with_idle_timeout(Duration::from_secs(60));
///
/// assert!(matches!(
///     EvictionPolicy::from_config(&config),
///     EvictionPolicy::IdleTimeout(_)
/// ));
/// ```
#[derive(Debug, Clone, Default)]
pub enum EvictionPolicy {
    /// No eviction
    #[default]
    None,

    /// Connections expire a fixed duration after they were dialled
    MaxLifetime(Duration),

    /// Connections expire after sitting idle
    IdleTimeout(Duration),

    /// Combined: lifetime or idle timeout
    Combined {
        max_lifetime: Duration,
        idle_timeout: Duration,
    },
}

impl EvictionPolicy {
    pub fn from_config(config: &PoolConfiguration) -> Self {
        match (config.max_lifetime, config.idle_timeout) {
            (Some(max_lifetime), Some(idle_timeout)) => EvictionPolicy::Combined {
                max_lifetime,
                idle_timeout,
            },
            (Some(lifetime), None) => EvictionPolicy::MaxLifetime(lifetime),
            (None, Some(idle)) => EvictionPolicy::IdleTimeout(idle),
            (None, None) => EvictionPolicy::None,
        }
    }
}

/// An idle connection together with its lifecycle timestamps
pub(crate) struct IdleEntry<C> {
    pub conn: C,
    pub id: usize,
    pub created_at: Instant,
    pub returned_at: Instant,
}

impl<C> IdleEntry<C> {
    pub fn new(conn: C, id: usize, created_at: Instant) -> Self {
        Self {
            conn,
            id,
            created_at,
            returned_at: Instant::now(),
        }
    }

    pub fn is_expired(&self, policy: &EvictionPolicy) -> bool {
        match policy {
            EvictionPolicy::None => false,
            EvictionPolicy::MaxLifetime(lifetime) => self.created_at.elapsed() > *lifetime,
            EvictionPolicy::IdleTimeout(timeout) => self.returned_at.elapsed() > *timeout,
            EvictionPolicy::Combined {
                max_lifetime,
                idle_timeout,
            } => {
                self.created_at.elapsed() > *max_lifetime
                    || self.returned_at.elapsed() > *idle_timeout
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_entry_is_not_expired() {
        let entry = IdleEntry::new((), 0, Instant::now());
        assert!(!entry.is_expired(&EvictionPolicy::None));
        assert!(!entry.is_expired(&EvictionPolicy::IdleTimeout(Duration::from_secs(60))));
    }

    #[test]
    fn test_lifetime_counts_from_creation() {
        let created = Instant::now() - Duration::from_secs(10);
        let entry = IdleEntry::new((), 0, created);

        assert!(entry.is_expired(&EvictionPolicy::MaxLifetime(Duration::from_secs(5))));
        // Just returned, so the idle clock has not run out.
        assert!(!entry.is_expired(&EvictionPolicy::IdleTimeout(Duration::from_secs(5))));
        assert!(entry.is_expired(&EvictionPolicy::Combined {
            max_lifetime: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(60),
        }));
    }

    #[test]
    fn test_policy_follows_configuration() {
        let config = PoolConfiguration::new()
            .with_idle_timeout(Duration::from_secs(1))
            .with_max_lifetime(Duration::from_secs(2));
        assert!(matches!(
            EvictionPolicy::from_config(&config),
            EvictionPolicy::Combined { .. }
        ));
        assert!(matches!(
            EvictionPolicy::from_config(&PoolConfiguration::new()),
            EvictionPolicy::None
        ));
    }
}
