//! Connection handles lent out by the pool

use crate::connection::BrokerConnection;
use crate::errors::{PoolError, PoolResult};
use crate::pool::PoolInner;

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// A broker connection borrowed from a [`ConnectionPool`](crate::ConnectionPool)
///
/// Give it back with [`release`](PooledHandle::release). If the connection
/// hit a connection-level error, call
/// [`mark_unusable`](PooledHandle::mark_unusable) first so it is closed
/// rather than reused. A handle dropped without `release` is released
/// implicitly; any close error is then only logged.
///
/// # Examples
///
/// ```
/// use broker_pool::memory::MemoryBroker;
/// use broker_pool::{ConnectionPool, PoolConfiguration};
///
/// let pool = ConnectionPool::new(MemoryBroker::new().factory(), PoolConfiguration::default()).unwrap();
/// let mut handle = pool.acquire().unwrap();
///
/// match handle.stats() {
///     Ok(stats) => assert!(stats.contains_key("current-jobs-ready")),
///     Err(err) if handle.is_connection_error(&err) => handle.mark_unusable(),
///     Err(err) => panic!("{err}"),
/// }
/// handle.release().unwrap();
/// ```
pub struct PooledHandle<C: BrokerConnection> {
    conn: Option<C>,
    id: usize,
    created_at: Instant,
    unusable: RwLock<bool>,
    pool: Arc<PoolInner<C>>,
}

impl<C: BrokerConnection> PooledHandle<C> {
    pub(crate) fn new(conn: C, id: usize, created_at: Instant, pool: Arc<PoolInner<C>>) -> Self {
        Self {
            conn: Some(conn),
            id,
            created_at,
            unusable: RwLock::new(false),
            pool,
        }
    }

    /// Pool-assigned id of the wrapped connection
    pub fn id(&self) -> usize {
        self.id
    }

    /// Flag the connection as broken. It will be closed on release instead
    /// of going back to the pool. There is no way to undo this.
    pub fn mark_unusable(&self) {
        let mut unusable = self.unusable.write();
        if !*unusable {
            debug!(connection_id = self.id, "connection marked unusable");
        }
        *unusable = true;
    }

    pub fn is_unusable(&self) -> bool {
        *self.unusable.read()
    }

    /// Whether `err` means this handle's connection is broken, as judged by
    /// the client library.
    pub fn is_connection_error(&self, err: &PoolError) -> bool {
        err.is_connection_error::<C>()
    }

    /// Hand the connection back.
    ///
    /// A usable connection goes back to the pool; an unusable one is closed
    /// and its close error returned. Releasing a handle whose connection was
    /// [detached](PooledHandle::detach) fails with
    /// [`PoolError::NoConnection`] unless the handle is marked unusable.
    pub fn release(mut self) -> PoolResult<()> {
        let conn = self.conn.take();
        self.finish(conn)
    }

    fn finish(&self, conn: Option<C>) -> PoolResult<()> {
        let unusable = self.unusable.read();
        match (*unusable, conn) {
            (true, Some(conn)) => self.pool.discard(conn, self.id),
            (true, None) => Ok(()),
            (false, Some(conn)) => self.pool.return_connection(conn, self.id, self.created_at),
            (false, None) => Err(PoolError::NoConnection),
        }
    }

    /// Take the connection out of the pool's care.
    ///
    /// The pool frees its slot and never sees the connection again; the
    /// caller becomes responsible for closing it.
    pub fn detach(&mut self) -> Option<C> {
        let conn = self.conn.take()?;
        self.pool.forget(self.id);
        debug!(connection_id = self.id, "connection detached from pool");
        Some(conn)
    }

    pub fn connection(&self) -> Option<&C> {
        self.conn.as_ref()
    }

    /// Direct access for broker operations the handle does not forward.
    pub fn connection_mut(&mut self) -> PoolResult<&mut C> {
        self.conn.as_mut().ok_or(PoolError::NoConnection)
    }

    /// Put a job with the default priority and time-to-run, ready at once.
    pub fn put(&mut self, tube: &str, body: impl AsRef<[u8]>) -> PoolResult<u64> {
        let defaults = self.pool.config.job_defaults;
        self.put_with(tube, body, defaults.priority, Duration::ZERO, defaults.ttr)
    }

    /// Put a job that becomes ready after the configured put delay.
    pub fn put_delayed(&mut self, tube: &str, body: impl AsRef<[u8]>) -> PoolResult<u64> {
        let defaults = self.pool.config.job_defaults;
        self.put_with(tube, body, defaults.priority, defaults.put_delay, defaults.ttr)
    }

    pub fn put_with(
        &mut self,
        tube: &str,
        body: impl AsRef<[u8]>,
        priority: u32,
        delay: Duration,
        ttr: Duration,
    ) -> PoolResult<u64> {
        self.connection_mut()?
            .put(tube, body.as_ref(), priority, delay, ttr)
            .map_err(PoolError::Broker)
    }

    /// Reserve a job from `tube`, waiting up to the configured reserve timeout.
    pub fn reserve(&mut self, tube: &str) -> PoolResult<(u64, Vec<u8>)> {
        let timeout = self.pool.config.job_defaults.reserve_timeout;
        self.reserve_with_timeout(tube, timeout)
    }

    pub fn reserve_with_timeout(
        &mut self,
        tube: &str,
        timeout: Duration,
    ) -> PoolResult<(u64, Vec<u8>)> {
        self.connection_mut()?
            .reserve(tube, timeout)
            .map_err(PoolError::Broker)
    }

    /// Return a reserved job to the broker with the configured release
    /// priority and delay.
    pub fn release_job(&mut self, id: u64) -> PoolResult<()> {
        let defaults = self.pool.config.job_defaults;
        self.release_job_with(id, defaults.release_priority, defaults.release_delay)
    }

    pub fn release_job_with(&mut self, id: u64, priority: u32, delay: Duration) -> PoolResult<()> {
        self.connection_mut()?
            .release(id, priority, delay)
            .map_err(PoolError::Broker)
    }

    /// Delete a job. Reserved jobs can only be deleted through the handle
    /// that reserved them.
    pub fn delete(&mut self, id: u64) -> PoolResult<()> {
        self.connection_mut()?.delete(id).map_err(PoolError::Broker)
    }

    pub fn stats(&mut self) -> PoolResult<HashMap<String, String>> {
        self.connection_mut()?.stats().map_err(PoolError::Broker)
    }
}

impl<C: BrokerConnection> Drop for PooledHandle<C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Err(err) = self.finish(Some(conn)) {
                warn!(connection_id = self.id, error = %err, "failed to release dropped handle");
            }
        }
    }
}

impl<C: BrokerConnection> std::fmt::Debug for PooledHandle<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledHandle")
            .field("id", &self.id)
            .field("attached", &self.conn.is_some())
            .field("unusable", &self.is_unusable())
            .finish()
    }
}
