//! Error types for the connection pool

use crate::connection::{BrokerConnection, BrokerError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Pool is closed")]
    Closed,

    #[error("Failed to establish broker connection: {0}")]
    Factory(#[source] BrokerError),

    #[error("Handle holds no broker connection")]
    NoConnection,

    #[error("Broker error: {0}")]
    Broker(#[source] BrokerError),

    #[error("Pool is at maximum capacity")]
    Exhausted,

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Invalid pool configuration: {0}")]
    InvalidConfiguration(&'static str),

    #[error("Operation was cancelled")]
    Cancelled,
}

impl PoolError {
    /// Whether the error says something about the connection itself rather
    /// than about a job, as judged by the client library `C`. Callers use
    /// this to decide on
    /// [`PooledHandle::mark_unusable`](crate::PooledHandle::mark_unusable).
    pub fn is_connection_error<C: BrokerConnection>(&self) -> bool {
        match self {
            PoolError::Broker(err) => C::is_connection_error(err),
            PoolError::NoConnection => true,
            _ => false,
        }
    }
}

pub type PoolResult<T> = Result<T, PoolError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryBrokerError, MemoryConnection};
    use std::collections::HashMap;
    use std::time::Duration;

    /// A client that relies on the default classification
    struct WireConnection;

    impl BrokerConnection for WireConnection {
        fn put(&mut self, _: &str, _: &[u8], _: u32, _: Duration, _: Duration) -> Result<u64, BrokerError> {
            Ok(1)
        }
        fn reserve(&mut self, _: &str, _: Duration) -> Result<(u64, Vec<u8>), BrokerError> {
            Ok((1, Vec::new()))
        }
        fn release(&mut self, _: u64, _: u32, _: Duration) -> Result<(), BrokerError> {
            Ok(())
        }
        fn delete(&mut self, _: u64) -> Result<(), BrokerError> {
            Ok(())
        }
        fn stats(&mut self) -> Result<HashMap<String, String>, BrokerError> {
            Ok(HashMap::new())
        }
        fn close(self) -> Result<(), BrokerError> {
            Ok(())
        }
    }

    fn broken_pipe() -> PoolError {
        PoolError::Broker(Box::new(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "broken pipe",
        )))
    }

    #[test]
    fn test_io_errors_are_connection_errors_by_default() {
        assert!(broken_pipe().is_connection_error::<WireConnection>());
        assert!(broken_pipe().is_connection_error::<MemoryConnection>());

        // The default knows nothing about client-specific error types.
        let lost = PoolError::Broker(Box::new(MemoryBrokerError::ConnectionLost));
        assert!(!lost.is_connection_error::<WireConnection>());
    }

    #[test]
    fn test_client_classifies_its_own_errors() {
        let lost = PoolError::Broker(Box::new(MemoryBrokerError::ConnectionLost));
        assert!(lost.is_connection_error::<MemoryConnection>());

        let missing = PoolError::Broker(Box::new(MemoryBrokerError::NotFound));
        assert!(!missing.is_connection_error::<MemoryConnection>());
        assert!(!PoolError::Closed.is_connection_error::<MemoryConnection>());
        assert!(PoolError::NoConnection.is_connection_error::<WireConnection>());
    }

    #[test]
    fn test_factory_error_keeps_source() {
        use std::error::Error as _;

        let err = PoolError::Factory(Box::new(MemoryBrokerError::Unavailable));
        assert!(err.source().is_some());
        assert!(err.to_string().contains("broker unavailable"));
    }
}
