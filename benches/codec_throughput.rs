//! Queue entry and remote-write encoding throughput

use walqueue::network::wire;
use walqueue::serialization::codec;
use walqueue::series::{Labels, TimeSeriesBinary};

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use prost::Message;
use std::collections::BTreeMap;

fn create_test_series(rows: usize) -> Vec<Box<TimeSeriesBinary>> {
    let now = chrono::Utc::now().timestamp_millis();
    (0..rows)
        .map(|i| {
            let labels = Labels::from_pairs([
                ("__name__", "http_requests_total".to_string()),
                ("host", format!("server-{:02}", i % 10)),
                (
                    "service",
                    match i % 5 {
                        0 => "api-gateway",
                        1 => "auth-service",
                        2 => "user-service",
                        3 => "order-service",
                        _ => "payment-service",
                    }
                    .to_string(),
                ),
                ("instance", i.to_string()),
            ]);
            let mut s = Box::<TimeSeriesBinary>::default();
            s.set_labels(&labels);
            s.ts = now + i as i64;
            s.value = (i as f64 % 100.0) / 100.0;
            s
        })
        .collect()
}

fn benchmark_entry_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("entry_encode");

    for rows in [1_000, 10_000] {
        group.throughput(Throughput::Elements(rows as u64));
        let series = create_test_series(rows);

        group.bench_function(format!("{}_series", rows), |b| {
            b.iter(|| black_box(codec::serialize(&series, &[]).unwrap()));
        });
    }

    group.finish();
}

fn benchmark_entry_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("entry_decode");

    for rows in [1_000, 10_000] {
        group.throughput(Throughput::Elements(rows as u64));
        let series = create_test_series(rows);
        let (meta, data) = codec::serialize(&series, &[]).unwrap();

        group.bench_function(format!("{}_series", rows), |b| {
            b.iter(|| {
                let group = codec::deserialize(&meta, &data).unwrap();
                black_box(group.series.len());
                group.release();
            });
        });
    }

    group.finish();
}

fn benchmark_write_request(c: &mut Criterion) {
    let mut group = c.benchmark_group("write_request");
    let external = BTreeMap::from([("cluster".to_string(), "eu-1".to_string())]);

    for rows in [100, 1_000] {
        group.throughput(Throughput::Elements(rows as u64));
        let series = create_test_series(rows);

        group.bench_function(format!("{}_series", rows), |b| {
            b.iter(|| {
                let request = wire::create_write_request(&series, &external);
                let raw = request.encode_to_vec();
                black_box(snap::raw::Encoder::new().compress_vec(&raw).unwrap())
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    benchmark_entry_encode,
    benchmark_entry_decode,
    benchmark_write_request
);
criterion_main!(benches);
