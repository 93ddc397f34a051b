//! # broker_pool
//!
//! Bounded, thread-safe pool of job-queue broker connections.
//!
//! ## Features
//!
//! - Connections dialled on demand, bounded by a configurable capacity
//! - Callers wait (optionally with a timeout) when every connection is lent out
//! - Explicit `release` returns a connection, or closes it if the handle was
//!   marked unusable
//! - Forwarded job operations with configurable defaults
//! - Async acquire and warm-up on tokio
//! - Idle timeout / max lifetime eviction
//! - Health status, metrics and Prometheus export
//! - An in-memory broker for tests and demos
//!
//! ## Quick Start
//!
//! ```rust
//! use broker_pool::memory::MemoryBroker;
//! use broker_pool::{ConnectionPool, PoolConfiguration};
//!
//! let broker = MemoryBroker::new();
//! let pool = ConnectionPool::new(broker.factory(), PoolConfiguration::default()).unwrap();
//!
//! let mut handle = pool.acquire().unwrap();
//! match handle.put("emails", "welcome") {
//!     Ok(id) => println!("queued job {id}"),
//!     Err(err) if handle.is_connection_error(&err) => handle.mark_unusable(),
//!     Err(err) => eprintln!("put failed: {err}"),
//! }
//! handle.release().unwrap();
//! ```

mod pool;
mod handle;
mod config;
mod connection;
mod metrics;
mod health;
mod eviction;
mod errors;
pub mod memory;

pub use pool::ConnectionPool;
pub use handle::PooledHandle;
pub use config::{JobDefaults, PoolConfiguration};
pub use connection::{BrokerConnection, BrokerError};
pub use metrics::PoolMetrics;
#[cfg(feature = "prometheus")]
pub use metrics::MetricsExporter;
pub use health::HealthStatus;
pub use eviction::EvictionPolicy;
pub use errors::{PoolError, PoolResult};
