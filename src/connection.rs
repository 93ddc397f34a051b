//! Capabilities the pool needs from a broker client library

use std::collections::HashMap;
use std::time::Duration;

/// Opaque error raised by the broker client. Forwarded unchanged inside
/// [`PoolError::Broker`](crate::PoolError::Broker) and
/// [`PoolError::Factory`](crate::PoolError::Factory).
pub type BrokerError = Box<dyn std::error::Error + Send + Sync>;

/// Factory producing new broker connections.
pub(crate) type ConnectionFactory<C> = dyn Fn() -> Result<C, BrokerError> + Send + Sync;

/// An open session to the job-queue broker.
///
/// Implemented by the host's client library. The pool only ever calls
/// [`close`](BrokerConnection::close); the job operations are forwarded by
/// [`PooledHandle`](crate::PooledHandle).
pub trait BrokerConnection: Send + 'static {
    /// Enqueue a job on `tube` and return its id.
    fn put(
        &mut self,
        tube: &str,
        body: &[u8],
        priority: u32,
        delay: Duration,
        ttr: Duration,
    ) -> Result<u64, BrokerError>;

    /// Reserve the next ready job from `tube`, waiting at most `timeout`.
    fn reserve(&mut self, tube: &str, timeout: Duration) -> Result<(u64, Vec<u8>), BrokerError>;

    /// Put a reserved job back into the ready queue after `delay`.
    fn release(&mut self, id: u64, priority: u32, delay: Duration) -> Result<(), BrokerError>;

    /// Remove a job. Reserved jobs can only be deleted by the connection
    /// holding the reservation.
    fn delete(&mut self, id: u64) -> Result<(), BrokerError>;

    /// Server statistics as reported by the broker.
    fn stats(&mut self) -> Result<HashMap<String, String>, BrokerError>;

    /// Terminate the session.
    fn close(self) -> Result<(), BrokerError>;

    /// Whether `err`, raised by one of this connection's operations, means
    /// the session itself is broken. By default only I/O errors are.
    fn is_connection_error(err: &BrokerError) -> bool
    where
        Self: Sized,
    {
        err.downcast_ref::<std::io::Error>().is_some()
    }
}
