//! OpenTelemetry instruments and recording helpers.
//!
//! Instruments come from the global meter provider and record into nothing
//! unless the embedding process installs one with a reader.

use super::{EndpointStats, NetworkStats, SerializerStats};
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry::KeyValue;
use std::sync::OnceLock;

struct QueueInstruments {
    network_sent: Counter<u64>,
    network_retried: Counter<u64>,
    network_retried_429: Counter<u64>,
    network_retried_5xx: Counter<u64>,
    network_failed: Counter<u64>,
    network_errors: Counter<u64>,
    network_bytes: Counter<u64>,
    network_duration_seconds: Histogram<f64>,
    serializer_incoming: Counter<u64>,
    serializer_errors: Counter<u64>,
    ttl_dropped: Counter<u64>,
    endpoint_forwarded: Counter<u64>,
    endpoint_entry_errors: Counter<u64>,
}

fn instruments() -> &'static QueueInstruments {
    static INSTRUMENTS: OnceLock<QueueInstruments> = OnceLock::new();
    INSTRUMENTS.get_or_init(|| {
        let meter = global::meter("walqueue");
        QueueInstruments {
            network_sent: meter
                .u64_counter("walqueue.network.sent")
                .with_description("Records delivered to the remote endpoint")
                .init(),
            network_retried: meter
                .u64_counter("walqueue.network.retried")
                .with_description("Records re-sent after a recoverable failure")
                .init(),
            network_retried_429: meter
                .u64_counter("walqueue.network.retried_429")
                .with_description("Records re-sent after HTTP 429")
                .init(),
            network_retried_5xx: meter
                .u64_counter("walqueue.network.retried_5xx")
                .with_description("Records re-sent after HTTP 5xx")
                .init(),
            network_failed: meter
                .u64_counter("walqueue.network.failed")
                .with_description("Records dropped after a non-recoverable failure or exhausted retries")
                .init(),
            network_errors: meter
                .u64_counter("walqueue.network.errors")
                .with_description("Records affected by transport errors")
                .init(),
            network_bytes: meter
                .u64_counter("walqueue.network.bytes")
                .with_description("Compressed request bytes sent")
                .with_unit("By")
                .init(),
            network_duration_seconds: meter
                .f64_histogram("walqueue.network.duration")
                .with_description("Duration of one send attempt")
                .with_unit("s")
                .init(),
            serializer_incoming: meter
                .u64_counter("walqueue.serializer.incoming")
                .with_description("Records accepted by the serializer")
                .init(),
            serializer_errors: meter
                .u64_counter("walqueue.serializer.errors")
                .with_description("Serializer flush failures")
                .init(),
            ttl_dropped: meter
                .u64_counter("walqueue.ttl.dropped")
                .with_description("Records dropped for exceeding the TTL")
                .init(),
            endpoint_forwarded: meter
                .u64_counter("walqueue.endpoint.forwarded")
                .with_description("Records read back from the file queue and handed to the network")
                .init(),
            endpoint_entry_errors: meter
                .u64_counter("walqueue.endpoint.entry_errors")
                .with_description("Queue entries that could not be read or decoded")
                .init(),
        }
    })
}

pub fn record_network(endpoint: &str, stats: &NetworkStats) {
    let i = instruments();
    let attrs = [KeyValue::new("endpoint", endpoint.to_string())];
    for (kind, category) in [
        ("sample", &stats.series),
        ("histogram", &stats.histogram),
        ("metadata", &stats.metadata),
    ] {
        let attrs = [attrs[0].clone(), KeyValue::new("kind", kind)];
        if category.sent > 0 {
            i.network_sent.add(category.sent, &attrs);
        }
        if category.retried > 0 {
            i.network_retried.add(category.retried, &attrs);
        }
        if category.retried_429 > 0 {
            i.network_retried_429.add(category.retried_429, &attrs);
        }
        if category.retried_5xx > 0 {
            i.network_retried_5xx.add(category.retried_5xx, &attrs);
        }
        if category.failed > 0 {
            i.network_failed.add(category.failed, &attrs);
        }
        if category.network_failed > 0 {
            i.network_errors.add(category.network_failed, &attrs);
        }
    }
    let bytes = stats.series_bytes + stats.metadata_bytes;
    if bytes > 0 {
        i.network_bytes.add(bytes, &attrs);
    }
    if !stats.send_duration.is_zero() {
        i.network_duration_seconds
            .record(stats.send_duration.as_secs_f64(), &attrs);
    }
}

pub fn record_serializer(endpoint: &str, stats: &SerializerStats) {
    let i = instruments();
    let attrs = [KeyValue::new("endpoint", endpoint.to_string())];
    let incoming = stats.series_stored + stats.metadata_stored;
    if incoming > 0 {
        i.serializer_incoming.add(incoming, &attrs);
    }
    if stats.errors > 0 {
        i.serializer_errors.add(stats.errors, &attrs);
    }
    if stats.ttl_dropped > 0 {
        i.ttl_dropped.add(
            stats.ttl_dropped,
            &[attrs[0].clone(), KeyValue::new("stage", "serializer")],
        );
    }
}

pub fn record_endpoint(endpoint: &str, stats: &EndpointStats) {
    let i = instruments();
    let attrs = [KeyValue::new("endpoint", endpoint.to_string())];
    let forwarded = stats.series_forwarded + stats.metadata_forwarded;
    if forwarded > 0 {
        i.endpoint_forwarded.add(forwarded, &attrs);
    }
    if stats.ttl_dropped > 0 {
        i.ttl_dropped.add(
            stats.ttl_dropped,
            &[attrs[0].clone(), KeyValue::new("stage", "endpoint")],
        );
    }
    if stats.entry_errors > 0 {
        i.endpoint_entry_errors.add(stats.entry_errors, &attrs);
    }
}
