//! Basic usage examples for ConnectionPool

use broker_pool::memory::MemoryBroker;
use broker_pool::{ConnectionPool, PoolConfiguration, PoolError};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("=== broker_pool - Basic Examples ===\n");

    let broker = MemoryBroker::new();

    // Example 1: Put and reserve through a pooled connection
    simple_pool(&broker);

    // Example 2: Discarding a broken connection
    unusable_connection(&broker);

    // Example 3: Capacity limits
    capacity_limits(&broker);

    // Example 4: Metrics and health
    metrics_and_health(&broker);
}

fn simple_pool(broker: &MemoryBroker) {
    println!("1. Simple Pool:");
    let pool = ConnectionPool::new(broker.factory(), PoolConfiguration::default()).unwrap();

    let mut handle = pool.acquire().unwrap();
    let id = handle.put("emails", "welcome mail").unwrap();
    println!("   Put job {id}");

    let (reserved, body) = handle.reserve("emails").unwrap();
    println!("   Reserved job {reserved}: {}", String::from_utf8_lossy(&body));
    handle.delete(reserved).unwrap();
    handle.release().unwrap();

    println!("   Idle after release: {}\n", pool.idle_count());
}

fn unusable_connection(broker: &MemoryBroker) {
    println!("2. Unusable Connection:");
    let pool = ConnectionPool::new(broker.factory(), PoolConfiguration::default()).unwrap();

    let mut handle = pool.acquire().unwrap();
    broker.sever(handle.connection().unwrap().id());

    if let Err(err) = handle.put("emails", "lost") {
        println!("   Put failed: {err}");
        if handle.is_connection_error(&err) {
            handle.mark_unusable();
        }
    }
    handle.release().unwrap();

    println!("   Idle after release: {} (connection was closed)\n", pool.idle_count());
}

fn capacity_limits(broker: &MemoryBroker) {
    println!("3. Capacity Limits:");
    let config = PoolConfiguration::new()
        .with_max_open(1)
        .with_acquire_timeout(Duration::from_millis(100));
    let pool = ConnectionPool::new(broker.factory(), config).unwrap();

    let first = pool.acquire().unwrap();
    println!("   First acquire: Success");

    match pool.try_acquire() {
        Err(PoolError::Exhausted) => println!("   Try acquire: pool exhausted"),
        other => println!("   Try acquire: {other:?}"),
    }

    match pool.acquire() {
        Err(err) => println!("   Blocking acquire: {err}"),
        Ok(_) => println!("   Blocking acquire: Success"),
    }

    first.release().unwrap();
    let second = pool.acquire().unwrap();
    println!("   After release: Success (connection {})\n", second.id());
}

fn metrics_and_health(broker: &MemoryBroker) {
    println!("4. Metrics and Health:");
    let pool = ConnectionPool::new(broker.factory(), PoolConfiguration::new().with_max_open(5)).unwrap();

    {
        let _a = pool.acquire().unwrap();
        let _b = pool.acquire().unwrap();

        let health = pool.get_health_status();
        println!("   Health: {}", if health.is_healthy { "Healthy" } else { "Unhealthy" });
        println!("   Utilization: {:.1}%", health.utilization * 100.0);
        println!("   Lent: {}, Idle: {}", health.lent_connections, health.idle_connections);
    }

    let metrics = pool.export_metrics();
    println!("\n   Metrics:");
    for (key, value) in metrics {
        println!("     {}: {}", key, value);
    }

    pool.shutdown().unwrap();
}
