use criterion::{black_box, criterion_group, criterion_main, Criterion};
use apmflow::aggregation::Transform;
use apmflow::analysis::{ServiceCall, ServiceCallTransform};
use apmflow::record::codec::{self, Compression, RemoteBatch, RemoteEnvelope};
use apmflow::record::KeyedRecord;
use apmflow::worker::{stable_hash, SelectionStrategy, Selector};

// 2024-01-01T12:30:15Z
const TS: i64 = 1_704_112_215_000;

fn service_record(service: &str, n: i64) -> KeyedRecord {
    ServiceCallTransform
        .transform(ServiceCall::new(service, TS + n, 25, n % 7 == 0))
        .expect("valid call")
}

fn build_batch(size: usize) -> RemoteBatch {
    RemoteBatch {
        entries: (0..size)
            .map(|i| RemoteEnvelope {
                graph_id: "service_metrics_rec".to_string(),
                record: service_record(&format!("svc-{}", i % 64), i as i64),
            })
            .collect(),
    }
}

fn bench_merge(c: &mut Criterion) {
    let delta = service_record("svcA", 1);

    c.bench_function("record/merge_service_call", |b| {
        let mut acc = service_record("svcA", 0);
        b.iter(|| acc.merge(black_box(&delta)).expect("merge"))
    });

    c.bench_function("record/transform_service_call", |b| {
        b.iter(|| {
            ServiceCallTransform
                .transform(black_box(ServiceCall::new("svcA", TS, 25, false)))
                .expect("transform")
        })
    });
}

fn bench_select(c: &mut Criterion) {
    let selector = Selector::new(SelectionStrategy::Affinity, 8).expect("selector");

    c.bench_function("selector/stable_hash", |b| {
        b.iter(|| stable_hash(black_box("202401011230_svcA")))
    });

    c.bench_function("selector/affinity_select", |b| {
        b.iter(|| selector.select(black_box("202401011230_svcA")))
    });
}

fn bench_codec(c: &mut Criterion) {
    let batch = build_batch(256);

    for compression in [Compression::None, Compression::Gzip, Compression::Zstd, Compression::Snappy] {
        let encoded = codec::encode(&batch, compression).expect("encode");
        let name = compression.content_encoding().unwrap_or("none");

        c.bench_function(&format!("codec/encode_256/{name}"), |b| {
            b.iter(|| codec::encode(black_box(&batch), compression).expect("encode"))
        });

        c.bench_function(&format!("codec/decode_256/{name}"), |b| {
            b.iter(|| codec::decode(black_box(&encoded), compression).expect("decode"))
        });
    }
}

fn bench_suite(c: &mut Criterion) {
    bench_merge(c);
    bench_select(c);
    bench_codec(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
