//! In-process broker implementing [`BrokerConnection`]
//!
//! Useful for tests, benchmarks and demos. Jobs are ordered by priority
//! (lower first) and then by id, delays and reservations follow the usual
//! work-queue rules, and every dial and close is counted so pool behavior
//! can be observed from the outside.

use crate::connection::{BrokerConnection, BrokerError};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryBrokerError {
    #[error("broker unavailable")]
    Unavailable,

    #[error("connection lost")]
    ConnectionLost,

    #[error("job not found")]
    NotFound,

    #[error("timed out waiting for a job")]
    TimedOut,

    #[error("failed to close connection")]
    CloseFailed,
}

impl MemoryBrokerError {
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            MemoryBrokerError::Unavailable
                | MemoryBrokerError::ConnectionLost
                | MemoryBrokerError::CloseFailed
        )
    }
}

struct Job {
    tube: String,
    body: Vec<u8>,
    priority: u32,
    ready_at: Instant,
    reserved_by: Option<usize>,
}

#[derive(Default)]
struct BrokerState {
    jobs: HashMap<u64, Job>,
    next_job_id: u64,
    next_connection_id: usize,
    open: HashSet<usize>,
    severed: HashSet<usize>,
    closes: HashMap<usize, usize>,
    dials: usize,
    puts: usize,
    unavailable: bool,
    fail_closes: bool,
    dial_delay: Option<Duration>,
}

impl BrokerState {
    fn check(&self, connection: usize) -> Result<(), MemoryBrokerError> {
        if self.unavailable || self.severed.contains(&connection) {
            return Err(MemoryBrokerError::ConnectionLost);
        }
        Ok(())
    }

    fn next_ready(&self, tube: &str, now: Instant) -> Option<u64> {
        self.jobs
            .iter()
            .filter(|(_, job)| job.tube == tube && job.reserved_by.is_none() && job.ready_at <= now)
            .min_by_key(|(id, job)| (job.priority, **id))
            .map(|(id, _)| *id)
    }

    fn earliest_delayed(&self, tube: &str, now: Instant) -> Option<Instant> {
        self.jobs
            .values()
            .filter(|job| job.tube == tube && job.reserved_by.is_none() && job.ready_at > now)
            .map(|job| job.ready_at)
            .min()
    }
}

struct Shared {
    state: Mutex<BrokerState>,
    job_ready: Condvar,
}

/// An in-memory job-queue broker
///
/// # Examples
///
/// ```
/// use broker_pool::memory::MemoryBroker;
/// use broker_pool::BrokerConnection;
/// use std::time::Duration;
///
/// let broker = MemoryBroker::new();
/// let mut conn = broker.dial().unwrap();
///
/// let id = conn.put("emails", b"hello", 1, Duration::ZERO, Duration::from_secs(30)).unwrap();
/// let (reserved, body) = conn.reserve("emails", Duration::from_millis(10)).unwrap();
/// assert_eq!(reserved, id);
/// assert_eq!(body, b"hello");
/// ```
#[derive(Clone)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState {
                    next_job_id: 1,
                    ..Default::default()
                }),
                job_ready: Condvar::new(),
            }),
        }
    }

    /// Open a new connection.
    pub fn dial(&self) -> Result<MemoryConnection, MemoryBrokerError> {
        let delay = self.shared.state.lock().dial_delay;
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }

        let mut state = self.shared.state.lock();
        if state.unavailable {
            return Err(MemoryBrokerError::Unavailable);
        }
        let id = state.next_connection_id;
        state.next_connection_id += 1;
        state.dials += 1;
        state.open.insert(id);

        Ok(MemoryConnection {
            id,
            shared: Arc::clone(&self.shared),
        })
    }

    /// A factory suitable for [`ConnectionPool::new`](crate::ConnectionPool::new).
    pub fn factory(&self) -> impl Fn() -> Result<MemoryConnection, BrokerError> + Send + Sync + 'static + use<> {
        let broker = self.clone();
        move || broker.dial().map_err(BrokerError::from)
    }

    /// Make dials and operations on every connection fail.
    pub fn set_available(&self, available: bool) {
        self.shared.state.lock().unavailable = !available;
    }

    /// Make `close` report an error (the connection is still torn down).
    pub fn set_fail_closes(&self, fail: bool) {
        self.shared.state.lock().fail_closes = fail;
    }

    /// Slow down every dial, to widen races in tests.
    pub fn set_dial_delay(&self, delay: Duration) {
        self.shared.state.lock().dial_delay = Some(delay);
    }

    /// Break a single connection: its operations fail from now on.
    pub fn sever(&self, connection: usize) {
        self.shared.state.lock().severed.insert(connection);
    }

    pub fn dial_count(&self) -> usize {
        self.shared.state.lock().dials
    }

    pub fn close_count(&self) -> usize {
        self.shared.state.lock().closes.values().sum()
    }

    pub fn close_count_for(&self, connection: usize) -> usize {
        self.shared
            .state
            .lock()
            .closes
            .get(&connection)
            .copied()
            .unwrap_or(0)
    }

    pub fn open_connections(&self) -> usize {
        self.shared.state.lock().open.len()
    }

    pub fn is_open(&self, connection: usize) -> bool {
        self.shared.state.lock().open.contains(&connection)
    }

    pub fn ready_jobs(&self, tube: &str) -> usize {
        let state = self.shared.state.lock();
        let now = Instant::now();
        state
            .jobs
            .values()
            .filter(|job| job.tube == tube && job.reserved_by.is_none() && job.ready_at <= now)
            .count()
    }
}

/// A session with a [`MemoryBroker`]
pub struct MemoryConnection {
    id: usize,
    shared: Arc<Shared>,
}

impl MemoryConnection {
    /// Broker-assigned connection number, unique per broker.
    pub fn id(&self) -> usize {
        self.id
    }
}

impl std::fmt::Debug for MemoryConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConnection").field("id", &self.id).finish()
    }
}

impl BrokerConnection for MemoryConnection {
    fn put(
        &mut self,
        tube: &str,
        body: &[u8],
        priority: u32,
        delay: Duration,
        _ttr: Duration,
    ) -> Result<u64, BrokerError> {
        let mut state = self.shared.state.lock();
        state.check(self.id)?;

        let id = state.next_job_id;
        state.next_job_id += 1;
        state.puts += 1;
        state.jobs.insert(
            id,
            Job {
                tube: tube.to_string(),
                body: body.to_vec(),
                priority,
                ready_at: Instant::now() + delay,
                reserved_by: None,
            },
        );
        self.shared.job_ready.notify_all();
        Ok(id)
    }

    fn reserve(&mut self, tube: &str, timeout: Duration) -> Result<(u64, Vec<u8>), BrokerError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();

        loop {
            state.check(self.id)?;

            let now = Instant::now();
            if let Some(id) = state.next_ready(tube, now) {
                let job = state
                    .jobs
                    .get_mut(&id)
                    .ok_or(MemoryBrokerError::NotFound)?;
                job.reserved_by = Some(self.id);
                return Ok((id, job.body.clone()));
            }

            if now >= deadline {
                return Err(MemoryBrokerError::TimedOut.into());
            }

            let wake_at = state
                .earliest_delayed(tube, now)
                .map_or(deadline, |ready| ready.min(deadline));
            self.shared.job_ready.wait_until(&mut state, wake_at);
        }
    }

    fn release(&mut self, id: u64, priority: u32, delay: Duration) -> Result<(), BrokerError> {
        let mut state = self.shared.state.lock();
        state.check(self.id)?;

        match state.jobs.get_mut(&id) {
            Some(job) if job.reserved_by == Some(self.id) => {
                job.reserved_by = None;
                job.priority = priority;
                job.ready_at = Instant::now() + delay;
                self.shared.job_ready.notify_all();
                Ok(())
            }
            _ => Err(MemoryBrokerError::NotFound.into()),
        }
    }

    fn delete(&mut self, id: u64) -> Result<(), BrokerError> {
        let mut state = self.shared.state.lock();
        state.check(self.id)?;

        let deletable = state
            .jobs
            .get(&id)
            .is_some_and(|job| job.reserved_by.is_none_or(|holder| holder == self.id));
        if !deletable {
            return Err(MemoryBrokerError::NotFound.into());
        }
        state.jobs.remove(&id);
        Ok(())
    }

    fn stats(&mut self) -> Result<HashMap<String, String>, BrokerError> {
        let state = self.shared.state.lock();
        state.check(self.id)?;

        let now = Instant::now();
        let reserved = state.jobs.values().filter(|j| j.reserved_by.is_some()).count();
        let delayed = state
            .jobs
            .values()
            .filter(|j| j.reserved_by.is_none() && j.ready_at > now)
            .count();
        let ready = state.jobs.len() - reserved - delayed;

        let mut stats = HashMap::new();
        stats.insert("current-jobs-ready".to_string(), ready.to_string());
        stats.insert("current-jobs-reserved".to_string(), reserved.to_string());
        stats.insert("current-jobs-delayed".to_string(), delayed.to_string());
        stats.insert("current-connections".to_string(), state.open.len().to_string());
        stats.insert("total-connections".to_string(), state.dials.to_string());
        stats.insert("cmd-put".to_string(), state.puts.to_string());
        Ok(stats)
    }

    fn is_connection_error(err: &BrokerError) -> bool {
        err.downcast_ref::<MemoryBrokerError>()
            .is_some_and(MemoryBrokerError::is_connection_error)
            || err.downcast_ref::<std::io::Error>().is_some()
    }

    fn close(self) -> Result<(), BrokerError> {
        let mut state = self.shared.state.lock();
        state.open.remove(&self.id);
        *state.closes.entry(self.id).or_insert(0) += 1;

        // Reservations die with the connection.
        for job in state.jobs.values_mut() {
            if job.reserved_by == Some(self.id) {
                job.reserved_by = None;
            }
        }
        self.shared.job_ready.notify_all();

        if state.fail_closes {
            return Err(MemoryBrokerError::CloseFailed.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_prefers_lower_priority_value() {
        let broker = MemoryBroker::new();
        let mut conn = broker.dial().unwrap();

        conn.put("t", b"low", 10, Duration::ZERO, Duration::from_secs(1)).unwrap();
        let urgent = conn.put("t", b"urgent", 0, Duration::ZERO, Duration::from_secs(1)).unwrap();

        let (id, body) = conn.reserve("t", Duration::ZERO).unwrap();
        assert_eq!(id, urgent);
        assert_eq!(body, b"urgent");
    }

    #[test]
    fn test_reserve_times_out_on_empty_tube() {
        let broker = MemoryBroker::new();
        let mut conn = broker.dial().unwrap();

        let err = conn.reserve("empty", Duration::from_millis(20)).unwrap_err();
        assert_eq!(
            err.downcast_ref::<MemoryBrokerError>(),
            Some(&MemoryBrokerError::TimedOut)
        );
    }

    #[test]
    fn test_delayed_job_becomes_ready() {
        let broker = MemoryBroker::new();
        let mut conn = broker.dial().unwrap();

        let id = conn
            .put("t", b"later", 1, Duration::from_millis(30), Duration::from_secs(1))
            .unwrap();
        assert_eq!(broker.ready_jobs("t"), 0);

        let (reserved, _) = conn.reserve("t", Duration::from_secs(2)).unwrap();
        assert_eq!(reserved, id);
    }

    #[test]
    fn test_only_holder_may_delete_reserved_job() {
        let broker = MemoryBroker::new();
        let mut worker = broker.dial().unwrap();
        let mut other = broker.dial().unwrap();

        let id = worker.put("t", b"x", 1, Duration::ZERO, Duration::from_secs(1)).unwrap();
        worker.reserve("t", Duration::ZERO).unwrap();

        assert!(other.delete(id).is_err());
        assert!(other.release(id, 1, Duration::ZERO).is_err());
        worker.delete(id).unwrap();
    }

    #[test]
    fn test_close_frees_reservations() {
        let broker = MemoryBroker::new();
        let mut worker = broker.dial().unwrap();
        worker.put("t", b"x", 1, Duration::ZERO, Duration::from_secs(1)).unwrap();
        worker.reserve("t", Duration::ZERO).unwrap();
        let worker_id = worker.id();

        worker.close().unwrap();
        assert_eq!(broker.ready_jobs("t"), 1);
        assert_eq!(broker.close_count_for(worker_id), 1);
        assert!(!broker.is_open(worker_id));
    }

    #[test]
    fn test_severed_connection_fails_operations() {
        let broker = MemoryBroker::new();
        let mut conn = broker.dial().unwrap();
        broker.sever(conn.id());

        let err = conn.stats().unwrap_err();
        assert!(MemoryConnection::is_connection_error(&err));
    }
}
