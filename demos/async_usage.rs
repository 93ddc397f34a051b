//! Async usage examples

use broker_pool::memory::MemoryBroker;
use broker_pool::{ConnectionPool, PoolConfiguration};
use std::time::Duration;
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("=== broker_pool - Async Examples ===\n");

    let broker = MemoryBroker::new();

    // Example 1: Async acquire with timeout
    async_with_timeout(&broker).await;

    // Example 2: Warm-up
    warmup(&broker).await;

    // Example 3: Producers and consumers sharing one pool
    concurrent_access(&broker).await;
}

async fn async_with_timeout(broker: &MemoryBroker) {
    println!("1. Async with Timeout:");

    let config = PoolConfiguration::new()
        .with_max_open(1)
        .with_acquire_timeout(Duration::from_millis(100));
    let pool = ConnectionPool::new(broker.factory(), config).unwrap();

    let _held = pool.acquire_async().await.unwrap();

    match pool.acquire_async().await {
        Ok(_) => println!("   Got connection"),
        Err(e) => println!("   Error: {}", e),
    }

    println!();
}

async fn warmup(broker: &MemoryBroker) {
    println!("2. Pool Warm-up:");

    let pool = ConnectionPool::new(broker.factory(), PoolConfiguration::new().with_max_open(8)).unwrap();
    pool.warmup_async(4).await.unwrap();

    println!("   Idle after warm-up: {}\n", pool.idle_count());
}

async fn concurrent_access(broker: &MemoryBroker) {
    println!("3. Concurrent Access:");

    let pool = ConnectionPool::new(broker.factory(), PoolConfiguration::new().with_max_open(3)).unwrap();
    let mut tasks = Vec::new();

    for i in 0..5 {
        let pool = pool.clone();
        tasks.push(tokio::spawn(async move {
            let mut handle = pool.acquire_async().await.unwrap();
            let id = handle.put("reports", format!("report-{i}")).unwrap();
            sleep(Duration::from_millis(10)).await;
            handle.release().unwrap();
            id
        }));
    }

    for task in tasks {
        let id = task.await.unwrap();
        println!("   Queued job {id}");
    }

    let consumer = pool.clone();
    let drained = tokio::task::spawn_blocking(move || {
        let mut handle = consumer.acquire().unwrap();
        let mut count = 0;
        while let Ok((id, _)) = handle.reserve_with_timeout("reports", Duration::from_millis(10)) {
            handle.delete(id).unwrap();
            count += 1;
        }
        handle.release().unwrap();
        count
    })
    .await
    .unwrap();

    println!("   Consumed {drained} jobs");
    println!("   Metrics: {:?}", pool.get_metrics());
}
