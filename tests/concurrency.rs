use broker_pool::memory::{MemoryBroker, MemoryConnection};
use broker_pool::{ConnectionPool, PoolConfiguration, PoolError};
use crossbeam::channel;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::time::Duration;

fn pool(broker: &MemoryBroker, config: PoolConfiguration) -> ConnectionPool<MemoryConnection> {
    ConnectionPool::new(broker.factory(), config).unwrap()
}

#[test]
fn test_connections_never_exceed_capacity_or_double_lend() {
    let broker = MemoryBroker::new();
    let pool = pool(&broker, PoolConfiguration::new().with_max_open(4));
    let lent = Mutex::new(HashSet::new());

    crossbeam::scope(|s| {
        for worker in 0..16 {
            let pool = &pool;
            let lent = &lent;
            s.spawn(move |_| {
                for i in 0..50 {
                    let mut handle = pool.acquire().unwrap();
                    let id = handle.connection().unwrap().id();
                    assert!(lent.lock().insert(id), "connection {id} lent twice");

                    handle.put("work", format!("{worker}-{i}")).unwrap();

                    assert!(lent.lock().remove(&id));
                    handle.release().unwrap();
                }
            });
        }
    })
    .unwrap();

    assert!(broker.dial_count() <= 4);
    assert_eq!(pool.lent_count(), 0);
    assert_eq!(broker.ready_jobs("work"), 16 * 50);
}

#[test]
fn test_third_caller_waits_for_a_returned_connection() {
    let broker = MemoryBroker::new();
    broker.set_dial_delay(Duration::from_millis(20));
    let pool = pool(&broker, PoolConfiguration::new().with_max_open(2));

    let (acquired_tx, acquired_rx) = channel::unbounded();
    let (release_tx, release_rx) = channel::unbounded::<()>();

    crossbeam::scope(|s| {
        for _ in 0..3 {
            let pool = &pool;
            let acquired_tx = acquired_tx.clone();
            let release_rx = release_rx.clone();
            s.spawn(move |_| {
                let handle = pool.acquire().unwrap();
                acquired_tx.send(handle.connection().unwrap().id()).unwrap();
                release_rx.recv().unwrap();
                handle.release().unwrap();
            });
        }

        let timeout = Duration::from_secs(5);
        let first = acquired_rx.recv_timeout(timeout).unwrap();
        let second = acquired_rx.recv_timeout(timeout).unwrap();
        assert_ne!(first, second);

        // The third caller is stuck until somebody gives a connection back.
        assert!(acquired_rx.recv_timeout(Duration::from_millis(150)).is_err());
        assert_eq!(broker.dial_count(), 2);

        release_tx.send(()).unwrap();
        let third = acquired_rx.recv_timeout(timeout).unwrap();
        assert!(third == first || third == second);
        assert_eq!(broker.dial_count(), 2);

        release_tx.send(()).unwrap();
        release_tx.send(()).unwrap();
    })
    .unwrap();

    assert_eq!(pool.idle_count(), 2);
    assert!(pool.get_metrics().wait_events >= 1);
}

#[test]
fn test_concurrent_mark_unusable_closes_once() {
    let broker = MemoryBroker::new();
    let pool = pool(&broker, PoolConfiguration::default());
    let handle = pool.acquire().unwrap();
    let id = handle.connection().unwrap().id();

    crossbeam::scope(|s| {
        s.spawn(|_| handle.mark_unusable());
        s.spawn(|_| handle.mark_unusable());
    })
    .unwrap();

    handle.release().unwrap();
    assert_eq!(broker.close_count_for(id), 1);
    assert_eq!(pool.idle_count(), 0);
    assert_eq!(pool.open_count(), 0);
}

#[test]
fn test_shutdown_wakes_waiting_callers() {
    let broker = MemoryBroker::new();
    let pool = pool(&broker, PoolConfiguration::new().with_max_open(1));
    let held = pool.acquire().unwrap();
    let held_id = held.connection().unwrap().id();

    crossbeam::scope(|s| {
        let waiter = s.spawn(|_| pool.acquire().map(|h| h.id()));

        std::thread::sleep(Duration::from_millis(50));
        pool.shutdown().unwrap();

        assert!(matches!(waiter.join().unwrap(), Err(PoolError::Closed)));
    })
    .unwrap();

    // Returned after shutdown, so closed instead of pooled.
    held.release().unwrap();
    assert!(!broker.is_open(held_id));
    assert_eq!(pool.idle_count(), 0);
}

#[test]
fn test_unusable_connections_free_their_slot() {
    let broker = MemoryBroker::new();
    let pool = pool(&broker, PoolConfiguration::new().with_max_open(1));

    crossbeam::scope(|s| {
        for _ in 0..4 {
            let pool = &pool;
            s.spawn(move |_| {
                for _ in 0..10 {
                    let handle = pool.acquire().unwrap();
                    handle.mark_unusable();
                    handle.release().unwrap();
                }
            });
        }
    })
    .unwrap();

    assert_eq!(broker.dial_count(), 40);
    assert_eq!(broker.open_connections(), 0);
    assert_eq!(pool.open_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_async_callers_share_bounded_connections() {
    let broker = MemoryBroker::new();
    let pool = pool(&broker, PoolConfiguration::new().with_max_open(2));

    let mut tasks = Vec::new();
    for i in 0..8 {
        let pool = pool.clone();
        tasks.push(tokio::spawn(async move {
            let mut handle = pool.acquire_async().await?;
            handle.put("async", format!("job-{i}"))?;
            tokio::time::sleep(Duration::from_millis(5)).await;
            handle.release()
        }));
    }

    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert!(broker.dial_count() <= 2);
    assert_eq!(broker.ready_jobs("async"), 8);
}
