//! Routes records to the shard loops and owns their lifecycle.

use super::send_loop::SendLoop;
use crate::config::ConnectionConfig;
use crate::series::{pool, TimeSeriesBinary};
use crate::stats::NetworkStatsFn;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const MAILBOX_CAPACITY: usize = 256;

/// Shard that owns records with this label hash.
pub fn shard_index(hash: u64, shards: usize) -> usize {
    (hash % shards.max(1) as u64) as usize
}

struct ConfigUpdate {
    config: ConnectionConfig,
    done: oneshot::Sender<Result<()>>,
}

/// Network client for one endpoint: N series loops plus one metadata loop.
///
/// Records with the same label set always land on the same loop, so samples of
/// one series are delivered in order.
pub struct NetworkManager {
    series_tx: mpsc::Sender<Box<TimeSeriesBinary>>,
    meta_tx: mpsc::Sender<Box<TimeSeriesBinary>>,
    config_tx: mpsc::Sender<ConfigUpdate>,
    worker: Mutex<Option<Worker>>,
    task: Mutex<Option<JoinHandle<()>>>,
    token: CancellationToken,
}

struct Worker {
    config: Arc<ConnectionConfig>,
    client: reqwest::Client,
    stats: NetworkStatsFn,
    loops: Vec<SendLoop>,
    metadata_loop: Option<SendLoop>,
    series_rx: mpsc::Receiver<Box<TimeSeriesBinary>>,
    meta_rx: mpsc::Receiver<Box<TimeSeriesBinary>>,
    config_rx: mpsc::Receiver<ConfigUpdate>,
}

impl NetworkManager {
    pub fn new(config: ConnectionConfig, stats: NetworkStatsFn) -> Result<Self> {
        config.validate()?;
        let client = reqwest::Client::builder().build()?;
        let (series_tx, series_rx) = mpsc::channel(MAILBOX_CAPACITY);
        let (meta_tx, meta_rx) = mpsc::channel(MAILBOX_CAPACITY);
        let (config_tx, config_rx) = mpsc::channel(1);
        Ok(Self {
            series_tx,
            meta_tx,
            config_tx,
            worker: Mutex::new(Some(Worker {
                config: Arc::new(config),
                client,
                stats,
                loops: Vec::new(),
                metadata_loop: None,
                series_rx,
                meta_rx,
                config_rx,
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

    /// Stops the manager and every loop. Undelivered records are discarded.
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

    /// Replaces the connection configuration. Returns once the new loops are
    /// running. An identical configuration is a no-op; any other change drops
    /// records still queued in the old loops. Before [`start`](Self::start)
    /// the configuration is only stored.
    pub async fn update_config(&self, config: ConnectionConfig) -> Result<()> {
        config.validate()?;
        {
            let mut parked = self.worker.lock();
            if let Some(worker) = parked.as_mut() {
                worker.config = Arc::new(config);
                return Ok(());
            }
        }
        let (done, wait) = oneshot::channel();
        tokio::select! {
            sent = self.config_tx.send(ConfigUpdate { config, done }) => sent?,
            _ = self.token.cancelled() => return Err(Error::Stopped),
        }
        wait.await?
    }
}

impl Drop for NetworkManager {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl Worker {
    async fn run(mut self, token: CancellationToken) {
        self.build_loops();
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                Some(update) = self.config_rx.recv() => self.apply(update),
                Some(series) = self.series_rx.recv() => self.route_series(series, &token).await,
                Some(metadata) = self.meta_rx.recv() => self.route_metadata(metadata, &token).await,
                else => break,
            }
        }
        self.stop_loops();
        debug!(url = %self.config.url, "Network manager stopped");
    }

    fn build_loops(&mut self) {
        let config = &self.config;
        self.loops = (0..config.connections)
            .map(|shard| {
                SendLoop::spawn(
                    config.clone(),
                    false,
                    shard,
                    self.client.clone(),
                    self.stats.clone(),
                )
            })
            .collect();
        self.metadata_loop = Some(SendLoop::spawn(
            config.clone(),
            true,
            0,
            self.client.clone(),
            self.stats.clone(),
        ));
    }

    fn stop_loops(&mut self) {
        for l in self.loops.drain(..) {
            l.stop();
        }
        if let Some(l) = self.metadata_loop.take() {
            l.stop();
        }
    }

    fn apply(&mut self, update: ConfigUpdate) {
        let result = match update.config.validate() {
            Err(e) => Err(e),
            Ok(()) if *self.config == update.config => Ok(()),
            Ok(()) => {
                info!(
                    url = %update.config.url,
                    connections = update.config.connections,
                    batch_count = update.config.batch_count,
                    "Network configuration changed, recreating send loops"
                );
                self.stop_loops();
                self.config = Arc::new(update.config);
                self.build_loops();
                Ok(())
            }
        };
        let _ = update.done.send(result);
    }

    /// Hands a record to its shard. A configuration update that arrives while
    /// the shard is full is applied first, and the record is then routed under
    /// the new configuration.
    async fn route_series(&mut self, series: Box<TimeSeriesBinary>, token: &CancellationToken) {
        loop {
            let idx = shard_index(series.hash, self.loops.len());
            let tx = self.loops[idx].sender().clone();
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                Some(update) = self.config_rx.recv() => self.apply(update),
                permit = tx.reserve() => {
                    if let Ok(permit) = permit {
                        permit.send(series);
                        return;
                    }
                    break;
                }
            }
        }
        pool::put_series(series);
    }

    async fn route_metadata(&mut self, metadata: Box<TimeSeriesBinary>, token: &CancellationToken) {
        loop {
            let Some(tx) = self.metadata_loop.as_ref().map(|l| l.sender().clone()) else {
                break;
            };
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                Some(update) = self.config_rx.recv() => self.apply(update),
                permit = tx.reserve() => {
                    if let Ok(permit) = permit {
                        permit.send(metadata);
                        return;
                    }
                    break;
                }
            }
        }
        pool::put_series(metadata);
    }
}
