//! Per-shard delivery worker.
//!
//! A loop accumulates records until the batch is full or a tick finds it
//! older than the flush interval, then encodes the batch once and sends it,
//! retrying recoverable failures with the same bytes.

use super::retry::{classify_status, first_line, RetryReason, SendOutcome};
use super::wire;
use crate::config::{ConnectionConfig, TICK_RESOLUTION};
use crate::series::{pool, TimeSeriesBinary};
use crate::stats::{CategoryStats, NetworkStats, NetworkStatsFn};
use crate::Result;
use bytes::Bytes;
use prost::Message;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE, RETRY_AFTER, USER_AGENT};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

const REMOTE_WRITE_VERSION: &str = "0.1.0";
const ERROR_BODY_LIMIT: usize = 1_000;

/// Handle to a running loop. Dropping it does not stop the task; call
/// [`SendLoop::stop`].
pub(crate) struct SendLoop {
    tx: mpsc::Sender<Box<TimeSeriesBinary>>,
    token: CancellationToken,
}

impl SendLoop {
    pub(crate) fn spawn(
        config: Arc<ConnectionConfig>,
        is_meta: bool,
        shard: usize,
        client: reqwest::Client,
        stats: NetworkStatsFn,
    ) -> Self {
        // Keep twice a full batch ready so the next send can start immediately.
        let (tx, rx) = mpsc::channel(config.batch_count.saturating_mul(2).max(1));
        let token = CancellationToken::new();
        let worker = LoopWorker {
            batch: Vec::with_capacity(config.batch_count),
            config,
            is_meta,
            shard,
            client,
            stats,
            rx,
            last_send: Instant::now(),
            token: token.clone(),
        };
        tokio::spawn(worker.run());
        Self { tx, token }
    }

    pub(crate) fn sender(&self) -> &mpsc::Sender<Box<TimeSeriesBinary>> {
        &self.tx
    }

    /// Stops the loop; queued and batched records are discarded. Also aborts a
    /// pending retry sleep.
    pub(crate) fn stop(&self) {
        self.token.cancel();
    }
}

struct LoopWorker {
    config: Arc<ConnectionConfig>,
    is_meta: bool,
    shard: usize,
    client: reqwest::Client,
    stats: NetworkStatsFn,
    rx: mpsc::Receiver<Box<TimeSeriesBinary>>,
    batch: Vec<Box<TimeSeriesBinary>>,
    last_send: Instant,
    token: CancellationToken,
}

impl LoopWorker {
    async fn run(mut self) {
        let mut ticker = tokio::time::interval(TICK_RESOLUTION);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                record = self.rx.recv() => {
                    let Some(record) = record else { break };
                    self.batch.push(record);
                    if self.batch.len() >= self.config.batch_count {
                        self.try_send().await;
                    }
                }
                _ = ticker.tick() => {
                    if !self.batch.is_empty()
                        && self.last_send.elapsed() >= self.config.flush_interval
                    {
                        self.try_send().await;
                    }
                }
            }
        }
        pool::put_series_slice(std::mem::take(&mut self.batch));
        debug!(shard = self.shard, metadata = self.is_meta, "Send loop stopped");
    }

    /// Sends the current batch, retrying as the configuration allows, then
    /// releases it.
    async fn try_send(&mut self) {
        let payload = match self.encode() {
            Ok(payload) => payload,
            Err(e) => {
                error!(shard = self.shard, error = %e, "Failed to encode batch");
                self.report_failed();
                self.cleanup();
                return;
            }
        };

        let mut attempts: u32 = 0;
        loop {
            let start = Instant::now();
            let outcome = self.send(&payload, attempts).await;
            self.record_outcome(&outcome, start.elapsed(), payload.len() as u64);

            match outcome {
                SendOutcome::Success => break,
                SendOutcome::NonRecoverable(msg) => {
                    error!(
                        shard = self.shard,
                        url = %self.config.url,
                        error = %msg,
                        "Dropping batch after non-recoverable error"
                    );
                    break;
                }
                SendOutcome::Recoverable { retry_after, .. } => {
                    attempts += 1;
                    let max = self.config.max_retry_attempts;
                    if max > 0 && attempts > max {
                        warn!(
                            shard = self.shard,
                            attempts,
                            records = self.batch.len(),
                            "Max retry attempts reached, dropping batch"
                        );
                        self.report_failed();
                        break;
                    }
                    if self.token.is_cancelled() {
                        return;
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(retry_after) => {}
                        _ = self.token.cancelled() => return,
                    }
                }
            }
        }
        self.cleanup();
    }

    fn encode(&self) -> Result<Bytes> {
        let request = if self.is_meta {
            wire::create_write_request_metadata(&self.batch)
        } else {
            wire::create_write_request(&self.batch, &self.config.external_labels)
        };
        let compressed = snap::raw::Encoder::new().compress_vec(&request.encode_to_vec())?;
        Ok(Bytes::from(compressed))
    }

    async fn send(&self, payload: &Bytes, attempts: u32) -> SendOutcome {
        let config = &self.config;
        let mut request = self
            .client
            .post(&config.url)
            .header(CONTENT_ENCODING, "snappy")
            .header(CONTENT_TYPE, "application/x-protobuf")
            .header(USER_AGENT, &config.user_agent)
            .header("X-Prometheus-Remote-Write-Version", REMOTE_WRITE_VERSION)
            .timeout(config.timeout)
            .body(payload.clone());
        if attempts > 0 {
            request = request.header("Retry-Attempt", attempts.to_string());
        }
        if let Some(auth) = &config.basic_auth {
            request = request.basic_auth(&auth.username, Some(&auth.password));
        } else if let Some(token) = &config.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(shard = self.shard, attempts, error = %e, "Error sending batch");
                return SendOutcome::Recoverable {
                    reason: RetryReason::Network,
                    retry_after: config.retry_backoff,
                };
            }
        };

        let status = response.status();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        match classify_status(status, retry_after.as_deref(), config.retry_backoff) {
            Some(outcome) => {
                if let SendOutcome::Recoverable { retry_after, .. } = &outcome {
                    warn!(
                        shard = self.shard,
                        attempts,
                        status = status.as_u16(),
                        retry_after = ?retry_after,
                        "Server responded with retryable status"
                    );
                }
                outcome
            }
            None => {
                let body = response.bytes().await.unwrap_or_default();
                SendOutcome::NonRecoverable(format!(
                    "server returned HTTP status {}: {}",
                    status,
                    first_line(&body, ERROR_BODY_LIMIT)
                ))
            }
        }
    }

    /// Category stats with `set` applied to each non-empty category using its
    /// record count.
    fn scaled(&self, set: impl Fn(&mut CategoryStats, u64)) -> (CategoryStats, CategoryStats, CategoryStats) {
        let mut series = CategoryStats::default();
        let mut histogram = CategoryStats::default();
        let mut metadata = CategoryStats::default();
        if self.is_meta {
            set(&mut metadata, self.batch.len() as u64);
        } else {
            let histograms = self.batch.iter().filter(|s| s.histogram.is_some()).count() as u64;
            let samples = self.batch.len() as u64 - histograms;
            if samples > 0 {
                set(&mut series, samples);
            }
            if histograms > 0 {
                set(&mut histogram, histograms);
            }
        }
        (series, histogram, metadata)
    }

    fn record_outcome(&self, outcome: &SendOutcome, duration: Duration, bytes: u64) {
        let (series, histogram, metadata) = match outcome {
            SendOutcome::Success => self.scaled(|c, n| c.sent = n),
            SendOutcome::NonRecoverable(_) => self.scaled(|c, n| c.failed = n),
            SendOutcome::Recoverable { reason, .. } => self.scaled(|c, n| {
                c.retried = n;
                match reason {
                    RetryReason::Network => c.network_failed = n,
                    RetryReason::TooManyRequests => c.retried_429 = n,
                    RetryReason::ServerError => c.retried_5xx = n,
                }
            }),
        };
        let mut stats = NetworkStats {
            series,
            histogram,
            metadata,
            send_duration: duration,
            ..Default::default()
        };
        if *outcome == SendOutcome::Success {
            if self.is_meta {
                stats.metadata_bytes = bytes;
            } else {
                stats.series_bytes = bytes;
                stats.newest_timestamp = self.batch.iter().map(|s| s.ts).max().unwrap_or(0);
            }
        }
        self.report(stats);
    }

    fn report_failed(&self) {
        let (series, histogram, metadata) = self.scaled(|c, n| c.failed = n);
        self.report(NetworkStats {
            series,
            histogram,
            metadata,
            ..Default::default()
        });
    }

    fn report(&self, stats: NetworkStats) {
        (self.stats)(stats);
    }

    fn cleanup(&mut self) {
        pool::put_series_slice(std::mem::take(&mut self.batch));
        self.batch.reserve(self.config.batch_count);
        self.last_send = Instant::now();
    }
}
