//! Operational statistics
//!
//! Workers report what happened as per-event deltas through plain callbacks.
//! Each report is also recorded into the OpenTelemetry instruments in
//! [`telemetry`]. [`StatsCounters`] is a ready-made sink that keeps running
//! totals, used by the binary's summary log and by tests.

pub mod telemetry;

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Per-category outcome counts for one delivery attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CategoryStats {
    pub sent: u64,
    pub retried: u64,
    pub retried_429: u64,
    pub retried_5xx: u64,
    pub failed: u64,
    pub network_failed: u64,
}

/// Emitted by a delivery loop after every send attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NetworkStats {
    pub series: CategoryStats,
    pub histogram: CategoryStats,
    pub metadata: CategoryStats,
    pub send_duration: Duration,
    /// Newest sample timestamp in a successful send, 0 if none.
    pub newest_timestamp: i64,
    pub series_bytes: u64,
    pub metadata_bytes: u64,
}

impl NetworkStats {
    fn categories(&self) -> [&CategoryStats; 3] {
        [&self.series, &self.histogram, &self.metadata]
    }

    pub fn total_sent(&self) -> u64 {
        self.categories().iter().map(|c| c.sent).sum()
    }

    pub fn total_retried(&self) -> u64 {
        self.categories().iter().map(|c| c.retried).sum()
    }

    pub fn total_failed(&self) -> u64 {
        self.categories().iter().map(|c| c.failed).sum()
    }

    pub fn total_429(&self) -> u64 {
        self.categories().iter().map(|c| c.retried_429).sum()
    }

    pub fn total_5xx(&self) -> u64 {
        self.categories().iter().map(|c| c.retried_5xx).sum()
    }

    pub fn total_network_failed(&self) -> u64 {
        self.categories().iter().map(|c| c.network_failed).sum()
    }
}

/// Emitted by the serializer for every accepted record and every flush error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SerializerStats {
    pub series_stored: u64,
    pub metadata_stored: u64,
    pub errors: u64,
    pub ttl_dropped: u64,
    pub newest_timestamp: i64,
}

/// Emitted by an endpoint for every queue entry it processes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EndpointStats {
    pub series_forwarded: u64,
    pub metadata_forwarded: u64,
    pub ttl_dropped: u64,
    pub entry_errors: u64,
}

pub type NetworkStatsFn = Arc<dyn Fn(NetworkStats) + Send + Sync>;
pub type SerializerStatsFn = Arc<dyn Fn(SerializerStats) + Send + Sync>;
pub type EndpointStatsFn = Arc<dyn Fn(EndpointStats) + Send + Sync>;

/// Callbacks a pipeline reports into.
#[derive(Clone)]
pub struct StatsSinks {
    pub network: NetworkStatsFn,
    pub serializer: SerializerStatsFn,
    pub endpoint: EndpointStatsFn,
}

impl StatsSinks {
    /// Sinks that only feed the OpenTelemetry instruments.
    pub fn telemetry(endpoint: &str) -> Self {
        let name: Arc<str> = Arc::from(endpoint);
        let (n, s, e) = (name.clone(), name.clone(), name);
        Self {
            network: Arc::new(move |stats| telemetry::record_network(&n, &stats)),
            serializer: Arc::new(move |stats| telemetry::record_serializer(&s, &stats)),
            endpoint: Arc::new(move |stats| telemetry::record_endpoint(&e, &stats)),
        }
    }

    /// Sinks that feed both the instruments and `counters`.
    pub fn with_counters(endpoint: &str, counters: Arc<StatsCounters>) -> Self {
        let base = Self::telemetry(endpoint);
        let (cn, cs, ce) = (counters.clone(), counters.clone(), counters);
        let (bn, bs, be) = (base.network, base.serializer, base.endpoint);
        Self {
            network: Arc::new(move |stats| {
                bn(stats);
                cn.add_network(&stats);
            }),
            serializer: Arc::new(move |stats| {
                bs(stats);
                cs.add_serializer(&stats);
            }),
            endpoint: Arc::new(move |stats| {
                be(stats);
                ce.add_endpoint(&stats);
            }),
        }
    }
}

impl std::fmt::Debug for StatsSinks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatsSinks").finish_non_exhaustive()
    }
}

/// Running totals across every report, safe to share between workers.
#[derive(Debug, Default)]
pub struct StatsCounters {
    sent: AtomicU64,
    retried: AtomicU64,
    retried_429: AtomicU64,
    retried_5xx: AtomicU64,
    failed: AtomicU64,
    network_failed: AtomicU64,
    metadata_sent: AtomicU64,
    histograms_sent: AtomicU64,
    bytes_sent: AtomicU64,
    sends: AtomicU64,
    newest_sent_timestamp: AtomicI64,
    serializer_series: AtomicU64,
    serializer_metadata: AtomicU64,
    serializer_errors: AtomicU64,
    serializer_ttl_dropped: AtomicU64,
    endpoint_forwarded: AtomicU64,
    endpoint_ttl_dropped: AtomicU64,
    endpoint_entry_errors: AtomicU64,
}

/// Point-in-time copy of [`StatsCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub sent: u64,
    pub retried: u64,
    pub retried_429: u64,
    pub retried_5xx: u64,
    pub failed: u64,
    pub network_failed: u64,
    pub metadata_sent: u64,
    pub histograms_sent: u64,
    pub bytes_sent: u64,
    pub sends: u64,
    pub newest_sent_timestamp: i64,
    pub serializer_series: u64,
    pub serializer_metadata: u64,
    pub serializer_errors: u64,
    pub serializer_ttl_dropped: u64,
    pub endpoint_forwarded: u64,
    pub endpoint_ttl_dropped: u64,
    pub endpoint_entry_errors: u64,
}

impl StatsCounters {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_network(&self, stats: &NetworkStats) {
        self.sent.fetch_add(stats.total_sent(), Ordering::Relaxed);
        self.retried.fetch_add(stats.total_retried(), Ordering::Relaxed);
        self.retried_429.fetch_add(stats.total_429(), Ordering::Relaxed);
        self.retried_5xx.fetch_add(stats.total_5xx(), Ordering::Relaxed);
        self.failed.fetch_add(stats.total_failed(), Ordering::Relaxed);
        self.network_failed
            .fetch_add(stats.total_network_failed(), Ordering::Relaxed);
        self.metadata_sent
            .fetch_add(stats.metadata.sent, Ordering::Relaxed);
        self.histograms_sent
            .fetch_add(stats.histogram.sent, Ordering::Relaxed);
        self.bytes_sent.fetch_add(
            stats.series_bytes + stats.metadata_bytes,
            Ordering::Relaxed,
        );
        if !stats.send_duration.is_zero() {
            self.sends.fetch_add(1, Ordering::Relaxed);
        }
        if stats.newest_timestamp != 0 {
            self.newest_sent_timestamp
                .fetch_max(stats.newest_timestamp, Ordering::Relaxed);
        }
    }

    pub fn add_serializer(&self, stats: &SerializerStats) {
        self.serializer_series
            .fetch_add(stats.series_stored, Ordering::Relaxed);
        self.serializer_metadata
            .fetch_add(stats.metadata_stored, Ordering::Relaxed);
        self.serializer_errors
            .fetch_add(stats.errors, Ordering::Relaxed);
        self.serializer_ttl_dropped
            .fetch_add(stats.ttl_dropped, Ordering::Relaxed);
    }

    pub fn add_endpoint(&self, stats: &EndpointStats) {
        self.endpoint_forwarded.fetch_add(
            stats.series_forwarded + stats.metadata_forwarded,
            Ordering::Relaxed,
        );
        self.endpoint_ttl_dropped
            .fetch_add(stats.ttl_dropped, Ordering::Relaxed);
        self.endpoint_entry_errors
            .fetch_add(stats.entry_errors, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            retried_429: self.retried_429.load(Ordering::Relaxed),
            retried_5xx: self.retried_5xx.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            network_failed: self.network_failed.load(Ordering::Relaxed),
            metadata_sent: self.metadata_sent.load(Ordering::Relaxed),
            histograms_sent: self.histograms_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            sends: self.sends.load(Ordering::Relaxed),
            newest_sent_timestamp: self.newest_sent_timestamp.load(Ordering::Relaxed),
            serializer_series: self.serializer_series.load(Ordering::Relaxed),
            serializer_metadata: self.serializer_metadata.load(Ordering::Relaxed),
            serializer_errors: self.serializer_errors.load(Ordering::Relaxed),
            serializer_ttl_dropped: self.serializer_ttl_dropped.load(Ordering::Relaxed),
            endpoint_forwarded: self.endpoint_forwarded.load(Ordering::Relaxed),
            endpoint_ttl_dropped: self.endpoint_ttl_dropped.load(Ordering::Relaxed),
            endpoint_entry_errors: self.endpoint_entry_errors.load(Ordering::Relaxed),
        }
    }

    /// A network callback that only updates these counters.
    pub fn network_fn(self: &Arc<Self>) -> NetworkStatsFn {
        let counters = self.clone();
        Arc::new(move |stats| counters.add_network(&stats))
    }

    /// A serializer callback that only updates these counters.
    pub fn serializer_fn(self: &Arc<Self>) -> SerializerStatsFn {
        let counters = self.clone();
        Arc::new(move |stats| counters.add_serializer(&stats))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_totals_sum_categories() {
        let stats = NetworkStats {
            series: CategoryStats {
                sent: 3,
                retried: 1,
                retried_429: 1,
                ..Default::default()
            },
            histogram: CategoryStats {
                sent: 2,
                failed: 4,
                ..Default::default()
            },
            metadata: CategoryStats {
                sent: 1,
                retried: 2,
                retried_5xx: 2,
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(stats.total_sent(), 6);
        assert_eq!(stats.total_retried(), 3);
        assert_eq!(stats.total_failed(), 4);
        assert_eq!(stats.total_429(), 1);
        assert_eq!(stats.total_5xx(), 2);
    }

    #[test]
    fn test_counters_accumulate() {
        let counters = StatsCounters::new();
        let sink = counters.network_fn();
        for ts in [5, 10, 7] {
            sink(NetworkStats {
                series: CategoryStats {
                    sent: 10,
                    ..Default::default()
                },
                send_duration: Duration::from_millis(3),
                newest_timestamp: ts,
                series_bytes: 100,
                ..Default::default()
            });
        }
        let snap = counters.snapshot();
        assert_eq!(snap.sent, 30);
        assert_eq!(snap.sends, 3);
        assert_eq!(snap.bytes_sent, 300);
        assert_eq!(snap.newest_sent_timestamp, 10);
    }

    #[test]
    fn test_sinks_with_counters() {
        let counters = StatsCounters::new();
        let sinks = StatsSinks::with_counters("test", counters.clone());
        (sinks.serializer)(SerializerStats {
            series_stored: 2,
            ttl_dropped: 1,
            ..Default::default()
        });
        (sinks.endpoint)(EndpointStats {
            series_forwarded: 4,
            ttl_dropped: 3,
            ..Default::default()
        });
        let snap = counters.snapshot();
        assert_eq!(snap.serializer_series, 2);
        assert_eq!(snap.serializer_ttl_dropped, 1);
        assert_eq!(snap.endpoint_forwarded, 4);
        assert_eq!(snap.endpoint_ttl_dropped, 3);
    }
}
