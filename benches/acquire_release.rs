use broker_pool::memory::MemoryBroker;
use broker_pool::{ConnectionPool, PoolConfiguration};
use criterion::{Criterion, black_box, criterion_group, criterion_main};

fn acquire_release(c: &mut Criterion) {
    let broker = MemoryBroker::new();
    let pool = ConnectionPool::new(broker.factory(), PoolConfiguration::new().with_initial_size(4)).unwrap();

    c.bench_function("acquire_release", |b| {
        b.iter(|| {
            let handle = pool.acquire().unwrap();
            black_box(handle.id());
            handle.release().unwrap();
        })
    });

    c.bench_function("acquire_put_release", |b| {
        b.iter(|| {
            let mut handle = pool.acquire().unwrap();
            black_box(handle.put("bench", b"payload").unwrap());
            handle.release().unwrap();
        })
    });
}

criterion_group!(benches, acquire_release);
criterion_main!(benches);
