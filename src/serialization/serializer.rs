//! Batching actor in front of the file queue.

use super::codec;
use crate::clock::{is_expired, Clock};
use crate::config::SerializerConfig;
use crate::filequeue::FileQueue;
use crate::series::{pool, TimeSeriesBinary};
use crate::stats::{SerializerStats, SerializerStatsFn};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

const MAILBOX_CAPACITY: usize = 1024;

/// Destination for encoded batches.
#[async_trait]
pub trait EntryStore: Send + Sync {
    async fn store(&self, meta: HashMap<String, String>, data: Vec<u8>) -> Result<()>;
}

#[async_trait]
impl EntryStore for FileQueue {
    async fn store(&self, meta: HashMap<String, String>, data: Vec<u8>) -> Result<()> {
        FileQueue::store(self, meta, data).await
    }
}

struct ConfigUpdate {
    config: SerializerConfig,
    done: oneshot::Sender<()>,
}

/// Accumulates records and writes them to an [`EntryStore`] once the batch is
/// full or the flush interval has elapsed.
pub struct Serializer {
    series_tx: mpsc::Sender<Box<TimeSeriesBinary>>,
    meta_tx: mpsc::Sender<Box<TimeSeriesBinary>>,
    config_tx: mpsc::Sender<ConfigUpdate>,
    worker: Mutex<Option<Worker>>,
    task: Mutex<Option<JoinHandle<()>>>,
    token: CancellationToken,
}

struct Worker {
    config: SerializerConfig,
    store: Arc<dyn EntryStore>,
    clock: Arc<dyn Clock>,
    stats: SerializerStatsFn,
    series_rx: mpsc::Receiver<Box<TimeSeriesBinary>>,
    meta_rx: mpsc::Receiver<Box<TimeSeriesBinary>>,
    config_rx: mpsc::Receiver<ConfigUpdate>,
    series: Vec<Box<TimeSeriesBinary>>,
    metadata: Vec<Box<TimeSeriesBinary>>,
    last_flush: Instant,
}

impl Serializer {
    pub fn new(
        config: SerializerConfig,
        store: Arc<dyn EntryStore>,
        clock: Arc<dyn Clock>,
        stats: SerializerStatsFn,
    ) -> Result<Self> {
        config.validate()?;
        let (series_tx, series_rx) = mpsc::channel(MAILBOX_CAPACITY);
        let (meta_tx, meta_rx) = mpsc::channel(MAILBOX_CAPACITY);
        let (config_tx, config_rx) = mpsc::channel(1);
        Ok(Self {
            series_tx,
            meta_tx,
            config_tx,
            worker: Mutex::new(Some(Worker {
                config,
                store,
                clock,
                stats,
                series_rx,
                meta_rx,
                config_rx,
                series: Vec::new(),
                metadata: Vec::new(),
                last_flush: Instant::now(),
            })),
            task: Mutex::new(None),
            token: CancellationToken::new(),
        })
    }

    pub fn start(&self) {
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        let token = self.token.clone();
        *self.task.lock() = Some(tokio::spawn(worker.run(token)));
    }

    /// Stops the worker. Buffered records get one final flush attempt.
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub async fn join(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    pub async fn send_series(&self, series: Box<TimeSeriesBinary>) -> Result<()> {
        self.enqueue(&self.series_tx, series).await
    }

    pub async fn send_metadata(&self, metadata: Box<TimeSeriesBinary>) -> Result<()> {
        self.enqueue(&self.meta_tx, metadata).await
    }

    async fn enqueue(
        &self,
        tx: &mpsc::Sender<Box<TimeSeriesBinary>>,
        record: Box<TimeSeriesBinary>,
    ) -> Result<()> {
        if self.token.is_cancelled() {
            pool::put_series(record);
            return Err(Error::Stopped);
        }
        tokio::select! {
            sent = tx.send(record) => sent.map_err(|e| {
                pool::put_series(e.0);
                Error::Stopped
            }),
            _ = self.token.cancelled() => Err(Error::Stopped),
        }
    }

    /// Applies new batching parameters. Records buffered under the previous
    /// configuration are flushed before this returns.
    pub async fn update_config(&self, config: SerializerConfig) -> Result<()> {
        config.validate()?;
        // Not started yet: nothing is buffered, so swap the config in place.
        {
            let mut parked = self.worker.lock();
            if let Some(worker) = parked.as_mut() {
                worker.config = config;
                return Ok(());
            }
        }
        let (done, wait) = oneshot::channel();
        tokio::select! {
            sent = self.config_tx.send(ConfigUpdate { config, done }) => sent?,
            _ = self.token.cancelled() => return Err(Error::Stopped),
        }
        wait.await?;
        Ok(())
    }
}

impl Drop for Serializer {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

fn flush_ticker(config: &SerializerConfig) -> Interval {
    let mut ticker = tokio::time::interval_at(
        Instant::now() + config.flush_frequency,
        config.flush_frequency,
    );
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

impl Worker {
    async fn run(mut self, token: CancellationToken) {
        let mut ticker = flush_ticker(&self.config);
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                Some(update) = self.config_rx.recv() => {
                    self.flush().await;
                    info!(
                        max_signals_in_batch = update.config.max_signals_in_batch,
                        flush_frequency = ?update.config.flush_frequency,
                        ttl = ?update.config.ttl,
                        "Serializer configuration updated"
                    );
                    self.config = update.config;
                    ticker = flush_ticker(&self.config);
                    let _ = update.done.send(());
                }
                Some(series) = self.series_rx.recv() => {
                    if self.admit(&series) {
                        self.series.push(series);
                    } else {
                        pool::put_series(series);
                    }
                    self.maybe_flush().await;
                }
                Some(metadata) = self.meta_rx.recv() => {
                    self.metadata.push(metadata);
                    self.maybe_flush().await;
                }
                _ = ticker.tick() => {
                    if self.last_flush.elapsed() >= self.config.flush_frequency {
                        self.flush().await;
                    }
                }
            }
        }
        self.flush().await;
        debug!("Serializer worker stopped");
    }

    fn admit(&self, series: &TimeSeriesBinary) -> bool {
        if is_expired(self.clock.now_millis(), series.ts, self.config.ttl) {
            (self.stats)(SerializerStats {
                ttl_dropped: 1,
                ..Default::default()
            });
            return false;
        }
        true
    }

    async fn maybe_flush(&mut self) {
        if self.series.len() + self.metadata.len() >= self.config.max_signals_in_batch {
            self.flush().await;
        }
    }

    async fn flush(&mut self) {
        self.last_flush = Instant::now();
        if self.series.is_empty() && self.metadata.is_empty() {
            return;
        }
        let series = std::mem::take(&mut self.series);
        let metadata = std::mem::take(&mut self.metadata);
        let newest_timestamp = series.iter().map(|s| s.ts).max().unwrap_or(0);

        let result = match codec::serialize(&series, &metadata) {
            Ok((meta, data)) => self.store.store(meta, data).await,
            Err(e) => Err(e),
        };
        let stats = match result {
            Ok(()) => {
                debug!(
                    series = series.len(),
                    metadata = metadata.len(),
                    "Flushed batch to file queue"
                );
                SerializerStats {
                    series_stored: series.len() as u64,
                    metadata_stored: metadata.len() as u64,
                    newest_timestamp,
                    ..Default::default()
                }
            }
            Err(e) => {
                error!(
                    error = %e,
                    series = series.len(),
                    metadata = metadata.len(),
                    "Failed to store batch"
                );
                SerializerStats {
                    errors: 1,
                    ..Default::default()
                }
            }
        };
        (self.stats)(stats);
        pool::put_series_slice(series);
        pool::put_series_slice(metadata);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::series::{Labels, SeriesGroup};
    use crate::stats::StatsCounters;
    use std::time::Duration;

    #[derive(Default)]
    struct MemoryStore {
        entries: Mutex<Vec<(HashMap<String, String>, Vec<u8>)>>,
    }

    impl MemoryStore {
        fn groups(&self) -> Vec<SeriesGroup> {
            self.entries
                .lock()
                .iter()
                .map(|(m, d)| codec::deserialize(m, d).unwrap())
                .collect()
        }
    }

    #[async_trait]
    impl EntryStore for MemoryStore {
        async fn store(&self, meta: HashMap<String, String>, data: Vec<u8>) -> Result<()> {
            self.entries.lock().push((meta, data));
            Ok(())
        }
    }

    fn record(ts: i64) -> Box<TimeSeriesBinary> {
        let mut s = pool::get_series();
        s.set_labels(&Labels::from_pairs([("__name__", "test"), ("ts", &*ts.to_string())]));
        s.ts = ts;
        s.value = ts as f64;
        s
    }

    fn config(batch: usize) -> SerializerConfig {
        SerializerConfig {
            max_signals_in_batch: batch,
            flush_frequency: Duration::from_secs(60),
            ttl: Duration::from_secs(60),
        }
    }

    async fn wait_for(mut f: impl FnMut() -> bool) {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !f() {
            assert!(std::time::Instant::now() < deadline, "condition not met in time");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_flushes_on_batch_size() {
        let store = Arc::new(MemoryStore::default());
        let clock = Arc::new(ManualClock::new(10_000));
        let counters = StatsCounters::new();
        let s = Serializer::new(config(5), store.clone(), clock, counters.serializer_fn()).unwrap();
        s.start();
        for ts in 0..10 {
            s.send_series(record(10_000 - ts)).await.unwrap();
        }
        wait_for(|| store.entries.lock().len() == 2).await;
        let groups = store.groups();
        assert_eq!(groups[0].series.len(), 5);
        assert_eq!(groups[1].series.len(), 5);
        assert_eq!(counters.snapshot().serializer_series, 10);
        s.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_flushes_on_interval() {
        let store = Arc::new(MemoryStore::default());
        let clock = Arc::new(ManualClock::new(1_000));
        let mut cfg = config(100);
        cfg.flush_frequency = Duration::from_secs(1);
        let s = Serializer::new(cfg, store.clone(), clock, StatsCounters::new().serializer_fn())
            .unwrap();
        s.start();
        s.send_series(record(1_000)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(store.entries.lock().len(), 1);
        s.stop();
    }

    #[tokio::test]
    async fn test_ttl_boundary() {
        let store = Arc::new(MemoryStore::default());
        let now = 100_000;
        let clock = Arc::new(ManualClock::new(now));
        let counters = StatsCounters::new();
        let s = Serializer::new(config(2), store.clone(), clock, counters.serializer_fn()).unwrap();
        s.start();
        let ttl_ms = 60_000;
        // age == ttl is kept, age > ttl is dropped, age < ttl is kept
        s.send_series(record(now - ttl_ms)).await.unwrap();
        s.send_series(record(now - ttl_ms - 1)).await.unwrap();
        s.send_series(record(now - ttl_ms + 1)).await.unwrap();
        wait_for(|| store.entries.lock().len() == 1).await;

        let groups = store.groups();
        let kept: Vec<i64> = groups[0].series.iter().map(|s| s.ts).collect();
        assert_eq!(kept, vec![now - ttl_ms, now - ttl_ms + 1]);
        assert_eq!(counters.snapshot().serializer_ttl_dropped, 1);
        s.stop();
    }

    #[tokio::test]
    async fn test_update_config_flushes_pending_batch() {
        let store = Arc::new(MemoryStore::default());
        let clock = Arc::new(ManualClock::new(5_000));
        let s = Serializer::new(
            config(100),
            store.clone(),
            clock,
            StatsCounters::new().serializer_fn(),
        )
        .unwrap();
        s.start();
        s.send_series(record(5_000)).await.unwrap();
        s.send_series(record(4_999)).await.unwrap();
        // Let the worker drain its mailbox so both records sit in the batch.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(store.entries.lock().is_empty());
        s.update_config(config(1)).await.unwrap();
        assert_eq!(store.entries.lock().len(), 1);
        assert_eq!(store.groups()[0].series.len(), 2);

        s.send_series(record(5_000)).await.unwrap();
        wait_for(|| store.entries.lock().len() == 2).await;
        s.stop();
    }

    #[tokio::test]
    async fn test_update_before_start_applies_to_worker() {
        let store = Arc::new(MemoryStore::default());
        let clock = Arc::new(ManualClock::new(5_000));
        let s = Serializer::new(
            config(100),
            store.clone(),
            clock,
            StatsCounters::new().serializer_fn(),
        )
        .unwrap();
        tokio::time::timeout(Duration::from_secs(1), s.update_config(config(1)))
            .await
            .expect("update before start must not block")
            .unwrap();
        assert!(s.update_config(config(0)).await.is_err());

        s.start();
        s.send_series(record(5_000)).await.unwrap();
        wait_for(|| store.entries.lock().len() == 1).await;
        s.stop();
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let store = Arc::new(MemoryStore::default());
        let clock = Arc::new(ManualClock::new(0));
        let s = Serializer::new(config(10), store, clock, StatsCounters::new().serializer_fn())
            .unwrap();
        s.start();
        assert!(s.update_config(config(0)).await.is_err());
        s.stop();
    }

    #[tokio::test]
    async fn test_send_after_stop() {
        let store = Arc::new(MemoryStore::default());
        let clock = Arc::new(ManualClock::new(0));
        let s = Serializer::new(config(10), store, clock, StatsCounters::new().serializer_fn())
            .unwrap();
        s.start();
        s.stop();
        assert!(matches!(
            s.send_series(record(0)).await.unwrap_err(),
            Error::Stopped
        ));
    }
}
