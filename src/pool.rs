//! Core connection pool implementation

use crate::config::PoolConfiguration;
use crate::connection::{BrokerConnection, BrokerError, ConnectionFactory};
use crate::errors::{PoolError, PoolResult};
use crate::eviction::{EvictionPolicy, IdleEntry};
use crate::handle::PooledHandle;
use crate::health::HealthStatus;
use crate::metrics::{MetricsTracker, PoolMetrics};

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Timeout used by [`ConnectionPool::acquire_async`] when none is configured
const DEFAULT_ASYNC_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything guarded by the pool lock
struct PoolState<C> {
    /// Idle connections, most recently returned last
    idle: Vec<IdleEntry<C>>,
    /// Idle, lent and currently dialling connections
    open: usize,
    closed: bool,
}

enum Checkout<C> {
    Idle(IdleEntry<C>),
    Dial,
}

/// State shared between a pool and the handles it lends out
pub(crate) struct PoolInner<C> {
    state: Mutex<PoolState<C>>,
    slot_freed: Condvar,
    factory: Box<ConnectionFactory<C>>,
    pub(crate) config: PoolConfiguration,
    eviction: EvictionPolicy,
    /// Lent connection ids and when they were lent
    lent: DashMap<usize, Instant>,
    metrics: MetricsTracker,
    next_id: AtomicUsize,
}

impl<C: BrokerConnection> PoolInner<C> {
    /// Put a cleanly released connection back, or close it if the pool is
    /// closed or already holds `max_idle` idle connections.
    pub(crate) fn return_connection(
        &self,
        conn: C,
        id: usize,
        created_at: Instant,
    ) -> PoolResult<()> {
        self.lent.remove(&id);

        let mut state = self.state.lock();
        if state.closed || state.idle.len() >= self.config.effective_max_idle() {
            state.open -= 1;
            let closed = state.closed;
            drop(state);
            self.slot_freed.notify_one();

            MetricsTracker::record(&self.metrics.connections_discarded);
            debug!(connection_id = id, pool_closed = closed, "closing returned connection");
            return conn.close().map_err(PoolError::Broker);
        }

        state.idle.push(IdleEntry::new(conn, id, created_at));
        drop(state);
        self.slot_freed.notify_one();

        MetricsTracker::record(&self.metrics.connections_returned);
        debug!(connection_id = id, "connection returned to pool");
        Ok(())
    }

    /// Close a connection whose handle was marked unusable.
    pub(crate) fn discard(&self, conn: C, id: usize) -> PoolResult<()> {
        self.forget(id);
        MetricsTracker::record(&self.metrics.connections_discarded);
        debug!(connection_id = id, "closing unusable connection");
        conn.close().map_err(PoolError::Broker)
    }

    /// Stop accounting for a lent connection without touching it.
    pub(crate) fn forget(&self, id: usize) {
        self.lent.remove(&id);
        self.state.lock().open -= 1;
        self.slot_freed.notify_one();
    }

    fn close_all(&self, entries: Vec<IdleEntry<C>>, reason: &str) -> PoolResult<()> {
        let mut first_error = None;
        for entry in entries {
            if let Err(err) = entry.conn.close() {
                warn!(connection_id = entry.id, reason, error = %err, "failed to close connection");
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(PoolError::Broker(err)),
            None => Ok(()),
        }
    }

    fn dial(&self) -> Result<(C, usize), BrokerError> {
        let conn = (self.factory)()?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        MetricsTracker::record(&self.metrics.connections_created);
        Ok((conn, id))
    }

    /// Give back a slot reserved for a dial that did not produce a connection.
    fn release_slot(&self) {
        self.state.lock().open -= 1;
        self.slot_freed.notify_one();
    }
}

/// Thread-safe pool of broker connections
///
/// Connections are created on demand by the factory, up to
/// [`max_open`](PoolConfiguration::max_open) at a time. Cloning the pool is
/// cheap and every clone shares the same connections.
///
/// # Examples
///
/// ```
/// use broker_pool::memory::MemoryBroker;
/// use broker_pool::{ConnectionPool, PoolConfiguration};
///
/// let broker = MemoryBroker::new();
/// let pool = ConnectionPool::new(broker.factory(), PoolConfiguration::new().with_max_open(4)).unwrap();
///
/// let mut handle = pool.acquire().unwrap();
/// let id = handle.put("emails", "welcome").unwrap();
/// handle.release().unwrap();
///
/// assert_eq!(pool.idle_count(), 1);
/// assert!(id > 0);
/// ```
pub struct ConnectionPool<C: BrokerConnection> {
    inner: Arc<PoolInner<C>>,
}

impl<C: BrokerConnection> Clone for ConnectionPool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: BrokerConnection> ConnectionPool<C> {
    /// Create a pool around a connection factory.
    ///
    /// Dials `initial_size` connections up front; if one of them fails, the
    /// ones already dialled are closed and the factory error is returned.
    pub fn new<F>(factory: F, config: PoolConfiguration) -> PoolResult<Self>
    where
        F: Fn() -> Result<C, BrokerError> + Send + Sync + 'static,
    {
        config.validate()?;

        let initial_size = config.initial_size;
        let eviction = EvictionPolicy::from_config(&config);
        let pool = Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    idle: Vec::with_capacity(config.effective_max_idle()),
                    open: 0,
                    closed: false,
                }),
                slot_freed: Condvar::new(),
                factory: Box::new(factory),
                config,
                eviction,
                lent: DashMap::new(),
                metrics: MetricsTracker::new(),
                next_id: AtomicUsize::new(0),
            }),
        };

        if initial_size > 0 {
            if let Err(err) = pool.warmup(initial_size) {
                let _ = pool.shutdown();
                return Err(err);
            }
        }

        debug!(
            max_open = pool.inner.config.max_open,
            max_idle = pool.inner.config.effective_max_idle(),
            initial_size,
            "connection pool created"
        );
        Ok(pool)
    }

    /// Get a connection, waiting for one to be returned if the pool is at
    /// capacity.
    ///
    /// Waits at most [`acquire_timeout`](PoolConfiguration::acquire_timeout)
    /// when one is configured, forever otherwise.
    pub fn acquire(&self) -> PoolResult<PooledHandle<C>> {
        self.checkout(true, self.inner.config.acquire_timeout)
    }

    /// Get a connection without waiting; fails with
    /// [`PoolError::Exhausted`] if the pool is at capacity.
    pub fn try_acquire(&self) -> PoolResult<PooledHandle<C>> {
        self.checkout(false, None)
    }

    /// Get a connection from async code.
    ///
    /// Runs on tokio's blocking pool since dialling is blocking I/O. Waits
    /// at most `acquire_timeout`, or 30 seconds if none is configured.
    pub async fn acquire_async(&self) -> PoolResult<PooledHandle<C>> {
        let timeout = self
            .inner
            .config
            .acquire_timeout
            .unwrap_or(DEFAULT_ASYNC_TIMEOUT);
        let pool = self.clone();

        tokio::task::spawn_blocking(move || pool.checkout(true, Some(timeout)))
            .await
            .map_err(|_| PoolError::Cancelled)?
    }

    fn checkout(&self, block: bool, timeout: Option<Duration>) -> PoolResult<PooledHandle<C>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let max_open = self.inner.config.max_open;
        let mut expired = Vec::new();
        let mut waited = false;

        let mut state = self.inner.state.lock();
        let outcome = loop {
            if state.closed {
                break Err(PoolError::Closed);
            }

            if let Some(entry) = self.pop_idle(&mut state, &mut expired) {
                break Ok(Checkout::Idle(entry));
            }

            if state.open < max_open {
                state.open += 1;
                break Ok(Checkout::Dial);
            }

            if !block {
                break Err(PoolError::Exhausted);
            }

            if !waited {
                waited = true;
                MetricsTracker::record(&self.inner.metrics.wait_events);
                trace!(open = state.open, "pool at capacity, waiting for a connection");
            }

            match (deadline, timeout) {
                (Some(deadline), Some(timeout)) => {
                    if Instant::now() >= deadline {
                        break Err(PoolError::Timeout(timeout));
                    }
                    self.inner.slot_freed.wait_until(&mut state, deadline);
                }
                _ => self.inner.slot_freed.wait(&mut state),
            }
        };
        drop(state);

        if !expired.is_empty() {
            // Each eviction freed a slot somebody else may be waiting for.
            self.inner.slot_freed.notify_all();
            let _ = self.inner.close_all(expired, "evicted");
        }

        match outcome? {
            Checkout::Idle(entry) => {
                MetricsTracker::record(&self.inner.metrics.connections_reused);
                Ok(self.lend(entry.conn, entry.id, entry.created_at))
            }
            Checkout::Dial => self.dial_for_checkout(),
        }
    }

    /// Pop the most recently returned connection after moving every expired
    /// idle connection into `expired`, to be closed outside the lock.
    fn pop_idle(
        &self,
        state: &mut PoolState<C>,
        expired: &mut Vec<IdleEntry<C>>,
    ) -> Option<IdleEntry<C>> {
        if !matches!(self.inner.eviction, EvictionPolicy::None) {
            let (stale, live): (Vec<_>, Vec<_>) = std::mem::take(&mut state.idle)
                .into_iter()
                .partition(|entry| entry.is_expired(&self.inner.eviction));
            state.idle = live;
            state.open -= stale.len();

            for entry in stale {
                trace!(connection_id = entry.id, "evicting idle connection");
                MetricsTracker::record(&self.inner.metrics.connections_evicted);
                expired.push(entry);
            }
        }
        state.idle.pop()
    }

    fn dial_for_checkout(&self) -> PoolResult<PooledHandle<C>> {
        let (conn, id) = match self.inner.dial() {
            Ok(dialled) => dialled,
            Err(err) => {
                self.inner.release_slot();
                MetricsTracker::record(&self.inner.metrics.factory_failures);
                warn!(error = %err, "failed to dial broker");
                return Err(PoolError::Factory(err));
            }
        };

        // Shutdown may have happened while dialling.
        if self.inner.state.lock().closed {
            self.inner.release_slot();
            if let Err(err) = conn.close() {
                warn!(connection_id = id, error = %err, "failed to close connection dialled during shutdown");
            }
            return Err(PoolError::Closed);
        }

        debug!(connection_id = id, "dialled new broker connection");
        Ok(self.lend(conn, id, Instant::now()))
    }

    fn lend(&self, conn: C, id: usize, created_at: Instant) -> PooledHandle<C> {
        self.inner.lent.insert(id, Instant::now());
        debug!(connection_id = id, "lending connection");
        PooledHandle::new(conn, id, created_at, Arc::clone(&self.inner))
    }

    /// Close the pool.
    ///
    /// Idle connections are closed now; lent ones are closed when their
    /// handles are released. Waiting `acquire` calls fail with
    /// [`PoolError::Closed`]. Returns the first close error, after trying
    /// to close every idle connection.
    pub fn shutdown(&self) -> PoolResult<()> {
        let mut state = self.inner.state.lock();
        let already_closed = state.closed;
        state.closed = true;
        let drained = std::mem::take(&mut state.idle);
        state.open -= drained.len();
        let lent = state.open;
        drop(state);
        self.inner.slot_freed.notify_all();

        if !already_closed {
            info!(idle = drained.len(), lent, "shutting down connection pool");
        }
        for _ in &drained {
            MetricsTracker::record(&self.inner.metrics.connections_discarded);
        }
        self.inner.close_all(drained, "shutdown")
    }

    /// Dial up to `count` idle connections ahead of demand.
    ///
    /// Stops early once the idle set or the pool is full.
    pub fn warmup(&self, count: usize) -> PoolResult<()> {
        let max_idle = self.inner.config.effective_max_idle();
        let mut added = 0;

        for _ in 0..count.min(max_idle) {
            {
                let mut state = self.inner.state.lock();
                if state.closed {
                    return Err(PoolError::Closed);
                }
                if state.idle.len() >= max_idle || state.open >= self.inner.config.max_open {
                    break;
                }
                state.open += 1;
            }

            let (conn, id) = match self.inner.dial() {
                Ok(dialled) => dialled,
                Err(err) => {
                    self.inner.release_slot();
                    MetricsTracker::record(&self.inner.metrics.factory_failures);
                    warn!(error = %err, "failed to dial broker during warm-up");
                    return Err(PoolError::Factory(err));
                }
            };

            let mut state = self.inner.state.lock();
            if state.closed {
                state.open -= 1;
                drop(state);
                if let Err(err) = conn.close() {
                    warn!(connection_id = id, error = %err, "failed to close connection dialled during shutdown");
                }
                return Err(PoolError::Closed);
            }
            state.idle.push(IdleEntry::new(conn, id, Instant::now()));
            drop(state);
            self.inner.slot_freed.notify_one();
            added += 1;
        }

        info!(added, "warmed up connection pool");
        Ok(())
    }

    /// Warm up from async code
    pub async fn warmup_async(&self, count: usize) -> PoolResult<()> {
        let pool = self.clone();
        tokio::task::spawn_blocking(move || pool.warmup(count))
            .await
            .map_err(|_| PoolError::Cancelled)?
    }

    /// Get idle connection count
    pub fn idle_count(&self) -> usize {
        self.inner.state.lock().idle.len()
    }

    /// Get lent connection count
    pub fn lent_count(&self) -> usize {
        self.inner.lent.len()
    }

    /// Idle, lent and dialling connections
    pub fn open_count(&self) -> usize {
        self.inner.state.lock().open
    }

    pub fn capacity(&self) -> usize {
        self.inner.config.max_open
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// How long the longest outstanding loan has been held
    pub fn oldest_loan(&self) -> Option<Duration> {
        self.inner
            .lent
            .iter()
            .map(|entry| entry.value().elapsed())
            .max()
    }

    pub fn config(&self) -> &PoolConfiguration {
        &self.inner.config
    }

    /// Get health status
    pub fn get_health_status(&self) -> HealthStatus {
        let (idle, open, closed) = {
            let state = self.inner.state.lock();
            (state.idle.len(), state.open, state.closed)
        };
        HealthStatus::new(idle, self.lent_count(), open, self.capacity(), closed)
    }

    /// Get pool metrics
    pub fn get_metrics(&self) -> PoolMetrics {
        self.inner
            .metrics
            .get_metrics(self.lent_count(), self.idle_count(), self.capacity())
    }

    /// Export metrics
    pub fn export_metrics(&self) -> HashMap<String, String> {
        self.get_metrics().export()
    }

    /// Export metrics in Prometheus format
    #[cfg(feature = "prometheus")]
    pub fn export_metrics_prometheus(
        &self,
        pool_name: &str,
        tags: Option<&HashMap<String, String>>,
    ) -> prometheus::Result<String> {
        crate::metrics::MetricsExporter::export_prometheus(&self.get_metrics(), pool_name, tags)
    }
}
