use std::sync::Arc;
use std::time::Instant;

use criterion::{criterion_group, criterion_main, Criterion, Throughput};

use action_outbox::{
    open_queue, ActionObject, ActionPool, ActionTarget, CancellationToken, CommitClient,
    CommitError, CommitRequest, CommitResponse, InMemoryQueueStore, PersistentConfig, QueueStore,
    StaticTokenProvider,
};

struct AckClient;

impl CommitClient for AckClient {
    fn commit_batch(
        &self,
        request: &CommitRequest,
        _cancel: &CancellationToken,
    ) -> Result<CommitResponse, CommitError> {
        Ok(CommitResponse {
            last_action_time: request.actions().iter().map(|a| a.action_time).max().unwrap_or(0),
        })
    }
}

fn view(i: u64) -> ActionObject {
    ActionObject::view(ActionTarget::new("new_faces", format!("img-{i}"), format!("user-{i}")), 1, 1_500)
        .with_action_time(i as i64)
        .with_strategies(Vec::new())
}

fn pool_over(store: Arc<dyn QueueStore>) -> ActionPool {
    ActionPool::builder()
        .store(store)
        .client(Arc::new(AckClient))
        .token_provider(Arc::new(StaticTokenProvider::new("bench")))
        .build()
        .unwrap()
}

fn bench_put(c: &mut Criterion) {
    let mut group = c.benchmark_group("put");
    group.throughput(Throughput::Elements(1));

    group.bench_function("memory", |b| {
        b.iter_custom(|iters| {
            // Fresh queue per sample so backlog does not leak between samples.
            let pool = pool_over(Arc::new(InMemoryQueueStore::new()));
            let start = Instant::now();
            for i in 0..iters {
                pool.put(view(i)).unwrap();
            }
            start.elapsed()
        });
    });

    group.bench_function("persistent_no_fsync", |b| {
        b.iter_custom(|iters| {
            let dir = tempfile::tempdir().unwrap();
            let store = open_queue(
                dir.path(),
                Some(PersistentConfig {
                    sync_on_write: false,
                    ..PersistentConfig::default()
                }),
            )
            .unwrap();
            let pool = pool_over(Arc::new(store));
            let start = Instant::now();
            for i in 0..iters {
                pool.put(view(i)).unwrap();
            }
            start.elapsed()
        });
    });

    group.finish();
}

fn bench_flush(c: &mut Criterion) {
    let mut group = c.benchmark_group("flush");
    group.throughput(Throughput::Elements(64));

    group.bench_function("memory_batch_64", |b| {
        b.iter_custom(|iters| {
            let pool = pool_over(Arc::new(InMemoryQueueStore::new()));
            let mut elapsed = std::time::Duration::ZERO;
            for round in 0..iters {
                for i in 0..64 {
                    pool.put(view(round * 64 + i)).unwrap();
                }
                let start = Instant::now();
                pool.trigger_source().unwrap();
                elapsed += start.elapsed();
            }
            elapsed
        });
    });

    group.finish();
}

criterion_group!(outbox, bench_put, bench_flush);
criterion_main!(outbox);
