//! Benchmarks for the in-memory store's hot path: enqueue and claim.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;

use hostpilot_core::OperationSource;
use hostpilot_infra::store::{InMemoryOperationStore, OperationStore};

fn bench_enqueue(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("runtime");

    let mut group = c.benchmark_group("enqueue");
    for count in [100u64, 1_000] {
        group.throughput(Throughput::Elements(count));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter(|| {
                rt.block_on(async {
                    let store = InMemoryOperationStore::new();
                    for _ in 0..count {
                        store
                            .enqueue(
                                "site.create",
                                json!({"domain_name": "example.com"}),
                                OperationSource::Api,
                            )
                            .await
                            .unwrap();
                    }
                })
            })
        });
    }
    group.finish();
}

fn bench_claim_backlog(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("runtime");

    let mut group = c.benchmark_group("claim_backlog");
    for count in [100u64, 1_000] {
        group.throughput(Throughput::Elements(count));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter_batched(
                || {
                    rt.block_on(async {
                        let store = InMemoryOperationStore::new();
                        let mut ids = Vec::with_capacity(count as usize);
                        for _ in 0..count {
                            let op = store
                                .enqueue("site.create", json!({}), OperationSource::Api)
                                .await
                                .unwrap();
                            ids.push(op.id);
                        }
                        (store, ids)
                    })
                },
                |(store, ids)| {
                    rt.block_on(async {
                        for id in ids {
                            assert!(store.claim(id).await.unwrap());
                        }
                    })
                },
                criterion::BatchSize::SmallInput,
            )
        });
    }
    group.finish();
}

criterion_group!(benches, bench_enqueue, bench_claim_backlog);
criterion_main!(benches);
