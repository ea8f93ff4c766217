//! One delivery destination: serializer → file queue → network.
//!
//! Producers write through an [`EndpointAppender`]. The serializer batches
//! records into the endpoint's file queue under `<base>/<name>/wal`. The
//! endpoint worker reads entries back, drops records that outlived the TTL
//! while on disk, and hands the rest to the network manager.

use crate::appender::EndpointAppender;
use crate::clock::{is_expired, Clock};
use crate::config::{EndpointConfig, SerializerConfig};
use crate::filequeue::{DataHandle, FileQueue};
use crate::network::NetworkManager;
use crate::serialization::{codec, EntryStore, Serializer};
use crate::series::{pool, SeriesGroup};
use crate::stats::{EndpointStats, EndpointStatsFn, StatsSinks};
use crate::Result;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// The file queue blocks once this many entries are waiting to be read.
const INCOMING_CAPACITY: usize = 1;

/// How long shutdown waits for the serializer to write its pending batch
/// while the rest of the pipeline is still draining.
const SHUTDOWN_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Directory holding an endpoint's file queue.
pub fn wal_dir(base: &Path, name: &str) -> PathBuf {
    base.join(name).join("wal")
}

pub struct Endpoint {
    name: String,
    config: Mutex<EndpointConfig>,
    serializer: Arc<Serializer>,
    queue: Arc<FileQueue>,
    network: Arc<NetworkManager>,
    ttl: watch::Sender<Duration>,
    worker: Mutex<Option<Worker>>,
    task: Mutex<Option<JoinHandle<()>>>,
    token: CancellationToken,
}

struct Worker {
    name: String,
    incoming: mpsc::Receiver<DataHandle>,
    network: Arc<NetworkManager>,
    clock: Arc<dyn Clock>,
    ttl: watch::Receiver<Duration>,
    stats: EndpointStatsFn,
}

impl Endpoint {
    pub fn new(
        base_dir: &Path,
        config: &EndpointConfig,
        serializer_config: SerializerConfig,
        clock: Arc<dyn Clock>,
        sinks: StatsSinks,
    ) -> Result<Self> {
        config.validate()?;
        serializer_config.validate()?;

        let (tx, rx) = mpsc::channel(INCOMING_CAPACITY);
        let queue = Arc::new(FileQueue::new(wal_dir(base_dir, &config.name), tx)?);
        let network = Arc::new(NetworkManager::new(
            config.to_connection_config(),
            sinks.network,
        )?);
        let store: Arc<dyn EntryStore> = queue.clone();
        let serializer = Arc::new(Serializer::new(
            serializer_config,
            store,
            clock.clone(),
            sinks.serializer,
        )?);
        let (ttl, ttl_rx) = watch::channel(serializer_config.ttl);

        Ok(Self {
            name: config.name.clone(),
            config: Mutex::new(config.clone()),
            serializer,
            queue,
            network: network.clone(),
            ttl,
            worker: Mutex::new(Some(Worker {
                name: config.name.clone(),
                incoming: rx,
                network,
                clock,
                ttl: ttl_rx,
                stats: sinks.endpoint,
            })),
            task: Mutex::new(None),
            token: CancellationToken::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> EndpointConfig {
        self.config.lock().clone()
    }

    pub fn wal_dir(&self) -> &Path {
        self.queue.dir()
    }

    /// Starts every stage. The file queue replays entries left from a previous
    /// run before new batches are accepted.
    pub fn start(&self) {
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        self.network.start();
        self.serializer.start();
        let token = self.token.clone();
        *self.task.lock() = Some(tokio::spawn(worker.run(token)));
        self.queue.start();
        info!(endpoint = %self.name, wal = ?self.queue.dir(), "Endpoint started");
    }

    /// Stops every stage without waiting.
    pub fn stop(&self) {
        self.token.cancel();
        self.serializer.stop();
        self.queue.stop();
        self.network.stop();
    }

    /// Stops the endpoint, letting the serializer write its pending batch to
    /// disk first. If the file queue stays blocked past
    /// `SHUTDOWN_FLUSH_TIMEOUT` the batch is abandoned.
    pub async fn shutdown(&self) {
        self.serializer.stop();
        if tokio::time::timeout(SHUTDOWN_FLUSH_TIMEOUT, self.serializer.join())
            .await
            .is_err()
        {
            warn!(endpoint = %self.name, "Timed out flushing pending batch on shutdown");
        }
        self.stop();
        self.queue.join().await;
        self.network.join().await;
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        info!(endpoint = %self.name, "Endpoint stopped");
    }

    pub fn appender(&self) -> EndpointAppender {
        EndpointAppender::new(self.serializer.clone())
    }

    /// Applies new settings. Serializer batching and TTL take effect before
    /// this returns; a changed connection rebuilds the send loops.
    pub async fn update_config(
        &self,
        config: &EndpointConfig,
        serializer_config: SerializerConfig,
    ) -> Result<()> {
        config.validate()?;
        self.serializer.update_config(serializer_config).await?;
        self.ttl.send_replace(serializer_config.ttl);
        self.network
            .update_config(config.to_connection_config())
            .await?;
        *self.config.lock() = config.clone();
        Ok(())
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Worker {
    async fn run(mut self, token: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                handle = self.incoming.recv() => match handle {
                    Some(handle) => self.process(handle).await,
                    None => break,
                },
            }
        }
        debug!(endpoint = %self.name, "Endpoint worker stopped");
    }

    async fn process(&mut self, handle: DataHandle) {
        let id = handle.id;
        let group = match handle.pop().await {
            Ok((meta, data)) => codec::deserialize(&meta, &data),
            Err(e) => Err(e),
        };
        let group = match group {
            Ok(group) => group,
            Err(e) => {
                error!(endpoint = %self.name, id, error = %e, "Dropping unreadable queue entry");
                (self.stats)(EndpointStats {
                    entry_errors: 1,
                    ..Default::default()
                });
                return;
            }
        };

        let stats = self.forward(group).await;
        debug!(
            endpoint = %self.name,
            id,
            forwarded = stats.series_forwarded + stats.metadata_forwarded,
            ttl_dropped = stats.ttl_dropped,
            "Processed queue entry"
        );
        (self.stats)(stats);
    }

    async fn forward(&self, group: SeriesGroup) -> EndpointStats {
        let mut stats = EndpointStats::default();
        let now = self.clock.now_millis();
        let ttl = *self.ttl.borrow();
        let SeriesGroup {
            series, metadata, ..
        } = group;

        for s in series {
            if is_expired(now, s.ts, ttl) {
                stats.ttl_dropped += 1;
                pool::put_series(s);
                continue;
            }
            match self.network.send_series(s).await {
                Ok(()) => stats.series_forwarded += 1,
                Err(e) => debug!(endpoint = %self.name, error = %e, "Failed to hand off series"),
            }
        }
        for m in metadata {
            match self.network.send_metadata(m).await {
                Ok(()) => stats.metadata_forwarded += 1,
                Err(e) => debug!(endpoint = %self.name, error = %e, "Failed to hand off metadata"),
            }
        }
        stats
    }
}
