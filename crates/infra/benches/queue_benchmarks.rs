use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use std::time::Duration;

use taskq_core::Payload;
use taskq_infra::{InMemoryStore, TaskQueue};

fn payload() -> Payload {
    [
        ("read-from", "s3://bucket/in/0001.jsonl"),
        ("instructor", "summarize"),
        ("save-into", "s3://bucket/out/0001.jsonl"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

fn queue() -> (InMemoryStore, TaskQueue<InMemoryStore>) {
    let store = InMemoryStore::with_clock(1_700_000_000);
    let queue = TaskQueue::new(store.clone(), "bench".parse().expect("valid topic"));
    (store, queue)
}

/// Full task lifecycle: create → acquire → heartbeat → release.
fn bench_task_lifecycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("task_lifecycle");
    group.sample_size(1000);

    let (_, queue) = queue();
    let data = payload();

    group.bench_function("create_acquire_release", |b| {
        b.iter(|| {
            let id = queue.create(black_box(&data)).unwrap();
            let (acquired, _) = queue.acquire().unwrap().unwrap();
            queue.heartbeat(&acquired).unwrap();
            assert!(queue.release(&id).unwrap());
        });
    });

    group.finish();
}

/// Acquire throughput with a deep backlog.
fn bench_acquire_with_backlog(c: &mut Criterion) {
    let mut group = c.benchmark_group("acquire_with_backlog");
    group.throughput(Throughput::Elements(1));

    for backlog in [10usize, 1_000, 10_000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(backlog), backlog, |b, &backlog| {
            let (_, queue) = queue();
            let data = payload();
            for _ in 0..backlog {
                queue.create(&data).unwrap();
            }

            b.iter(|| {
                let (id, _) = queue.acquire().unwrap().unwrap();
                queue.release(&id).unwrap();
                queue.create(&data).unwrap();
            });
        });
    }

    group.finish();
}

/// Cleanup pass cost over a working set where every task is stale.
fn bench_cleanup(c: &mut Criterion) {
    let mut group = c.benchmark_group("cleanup");

    for working in [10usize, 100, 1_000].iter() {
        group.throughput(Throughput::Elements(*working as u64));
        group.bench_with_input(BenchmarkId::from_parameter(working), working, |b, &working| {
            let (store, queue) = queue();
            let data = payload();
            for _ in 0..working {
                queue.create(&data).unwrap();
            }

            b.iter(|| {
                while queue.acquire().unwrap().is_some() {}
                store.advance(Duration::from_secs(1_000));
                let report = queue.cleanup(Duration::from_secs(900)).unwrap();
                black_box(report.requeued.len());
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_task_lifecycle,
    bench_acquire_with_backlog,
    bench_cleanup
);
criterion_main!(benches);
