use std::hint::black_box;
use std::time::Duration;

use criterion::{BatchSize, Criterion, Throughput, criterion_group, criterion_main};
use rand::Rng;
use serde_json::{Map, Value, json};

use cloudlink::attributes::SharedAttributeSubscriptionService;
use cloudlink::config::Capacity;
use cloudlink::network::Transport;
use cloudlink::network::error::Error;
use cloudlink::ota::{ChecksumAlgorithm, software_hasher};
use cloudlink::request::{RequestIdGenerator, RequestRegistry, ResponseCallbacks};
use cloudlink::time::Instant;

/// Transport that accepts everything and keeps nothing.
struct NullTransport;

impl Transport for NullTransport {
    fn publish(&mut self, _topic: &str, _payload: &[u8]) -> Result<(), Error> {
        Ok(())
    }

    fn subscribe(&mut self, _filter: &str) -> Result<(), Error> {
        Ok(())
    }

    fn unsubscribe(&mut self, _filter: &str) -> Result<(), Error> {
        Ok(())
    }

    fn buffer_size(&self) -> usize {
        4096
    }

    fn set_buffer_size(&mut self, _size: usize) -> Result<(), Error> {
        Ok(())
    }
}

fn bench_registry(c: &mut Criterion) {
    let mut group = c.benchmark_group("request_registry");
    let payload = json!({ "client": { "a": 1 } });

    for pending in [4usize, 64] {
        group.bench_function(format!("register_resolve_{pending}"), |b| {
            b.iter_batched(
                || {
                    let mut registry =
                        RequestRegistry::new(Capacity::Unbounded, RequestIdGenerator::new());
                    let ids: Vec<u32> = (0..pending)
                        .map(|_| {
                            registry
                                .register(
                                    ResponseCallbacks::new(|_| {}),
                                    Some("client"),
                                    Duration::from_secs(5),
                                    Instant::from_millis(0),
                                )
                                .unwrap()
                        })
                        .collect();
                    (registry, ids)
                },
                |(mut registry, ids)| {
                    for id in ids.iter().rev() {
                        black_box(registry.resolve(*id, &payload));
                    }
                },
                BatchSize::SmallInput,
            )
        });
    }
    group.finish();
}

fn bench_shared_dispatch(c: &mut Criterion) {
    let mut rng = rand::thread_rng();
    let mut transport = NullTransport;
    let mut service = SharedAttributeSubscriptionService::new(Capacity::Unbounded);
    let keys: Vec<String> = (0..32).map(|i| format!("key{i}")).collect();
    for chunk in keys.chunks(4) {
        let chunk: Vec<&str> = chunk.iter().map(String::as_str).collect();
        service.subscribe(&mut transport, &chunk, |update| {
            black_box(update);
        })
        .unwrap();
    }

    let update: Map<String, Value> = (0..8)
        .map(|_| {
            let key = format!("key{}", rng.gen_range(0..64));
            (key, json!(rng.r#gen::<u32>()))
        })
        .collect();
    let update = Value::Object(update);

    c.bench_function("shared_dispatch", |b| {
        b.iter(|| black_box(service.dispatch(black_box(&update))))
    });
}

fn bench_chunk_digest(c: &mut Criterion) {
    let mut rng = rand::thread_rng();
    let chunk: Vec<u8> = (0..4096).map(|_| rng.r#gen()).collect();
    let mut group = c.benchmark_group("chunk_digest");
    group.throughput(Throughput::Bytes(chunk.len() as u64));

    for algorithm in [ChecksumAlgorithm::Md5, ChecksumAlgorithm::Sha256] {
        group.bench_function(algorithm.as_str(), |b| {
            b.iter(|| {
                let mut hasher = software_hasher(algorithm);
                hasher.update(black_box(&chunk));
                black_box(hasher.digest_hex())
            })
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_registry,
    bench_shared_dispatch,
    bench_chunk_digest
);
criterion_main!(benches);
