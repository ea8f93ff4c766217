//! walqueue binary
//!
//! Runs the queue from a TOML configuration file. Optionally generates a
//! synthetic workload so an endpoint can be exercised without a producer.
//!
//! ## Usage
//!
//! ```bash
//! walqueue --config walqueue.toml --data-dir /var/lib/walqueue \
//!   --load-series 500 --load-interval 1s
//! ```
//!
//! On unix, SIGHUP reloads the configuration file and applies it in place.

use walqueue::appender::Appender;
use walqueue::clock::{Clock, SystemClock};
use walqueue::config::QueueConfig;
use walqueue::queue::Queue;
use walqueue::series::{Labels, Metadata, MetricType};
use walqueue::stats::{StatsCounters, StatsSnapshot};
use walqueue::telemetry::Telemetry;

use anyhow::Context;
use clap::Parser;
use rand::Rng;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Durable remote-write queue
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Queue configuration file (TOML)
    #[arg(long, env = "WALQUEUE_CONFIG")]
    config: PathBuf,

    /// Directory holding one file queue per endpoint
    #[arg(long, env = "WALQUEUE_DATA_DIR", default_value = "/var/lib/walqueue")]
    data_dir: PathBuf,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// How often to log a statistics summary
    #[arg(long, default_value = "30s")]
    stats_interval: humantime::Duration,

    /// Number of synthetic series to generate (0 disables the load generator)
    #[arg(long, default_value = "0")]
    load_series: usize,

    /// Interval between synthetic sample rounds
    #[arg(long, default_value = "1s")]
    load_interval: humantime::Duration,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _telemetry = Telemetry::init("walqueue", &args.log_level)?;

    let config = QueueConfig::from_file(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    info!(
        config = %args.config.display(),
        data_dir = %args.data_dir.display(),
        endpoints = config.endpoints.len(),
        ttl = ?config.ttl,
        "Starting walqueue"
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let counters = StatsCounters::new();
    let queue = Arc::new(Queue::new(
        &args.data_dir,
        config,
        clock.clone(),
        Some(counters.clone()),
    )?);
    queue.start().await;

    let token = CancellationToken::new();
    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(log_stats(
        counters.clone(),
        args.stats_interval.into(),
        token.clone(),
    )));
    if args.load_series > 0 {
        info!(
            series = args.load_series,
            interval = %args.load_interval,
            "Synthetic load enabled"
        );
        tasks.push(tokio::spawn(generate_load(
            queue.clone(),
            clock,
            args.load_series,
            args.load_interval.into(),
            token.clone(),
        )));
    }
    tasks.push(tokio::spawn(reload_on_hangup(
        queue.clone(),
        args.config.clone(),
        token.clone(),
    )));

    shutdown_signal().await;
    info!("Shutdown requested");
    token.cancel();
    for task in tasks {
        let _ = task.await;
    }
    queue.shutdown().await;
    summarize(&counters.snapshot());
    info!("walqueue stopped");
    Ok(())
}

async fn log_stats(counters: Arc<StatsCounters>, every: Duration, token: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = ticker.tick() => summarize(&counters.snapshot()),
        }
    }
}

fn summarize(s: &StatsSnapshot) {
    info!(
        stored = s.serializer_series,
        metadata_stored = s.serializer_metadata,
        forwarded = s.endpoint_forwarded,
        sent = s.sent,
        retried = s.retried,
        retried_429 = s.retried_429,
        retried_5xx = s.retried_5xx,
        failed = s.failed,
        bytes_sent = s.bytes_sent,
        ttl_dropped = s.serializer_ttl_dropped + s.endpoint_ttl_dropped,
        newest_sent_timestamp = s.newest_sent_timestamp,
        "Queue statistics"
    );
}

const LOAD_METRIC: &str = "walqueue_synthetic_value";

/// Appends one sample per synthetic series every round, and the metric's
/// metadata every tenth round.
async fn generate_load(
    queue: Arc<Queue>,
    clock: Arc<dyn Clock>,
    series: usize,
    every: Duration,
    token: CancellationToken,
) {
    let labels: Vec<Labels> = (0..series)
        .map(|i| {
            Labels::from_pairs([
                ("__name__", LOAD_METRIC.to_string()),
                ("instance", format!("host-{:03}", i % 16)),
                ("series", i.to_string()),
            ])
        })
        .collect();
    let metadata = Metadata {
        metric_type: MetricType::Gauge,
        help: "Synthetic values generated by walqueue".to_string(),
        unit: "ratio".to_string(),
    };
    let family = Labels::from_pairs([("__name__", LOAD_METRIC)]);

    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut round: u64 = 0;
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let ts = clock.now_millis();
        let mut appender = queue.appender().await;
        let appended: walqueue::Result<()> = (|| {
            let mut rng = rand::thread_rng();
            for l in &labels {
                appender.append(l, ts, rng.gen_range(0.0..1.0))?;
            }
            if round % 10 == 0 {
                appender.update_metadata(&family, &metadata)?;
            }
            Ok(())
        })();
        let result = match appended {
            Ok(()) => appender.commit().await,
            Err(e) => {
                let _ = appender.rollback().await;
                Err(e)
            }
        };
        if let Err(e) = result {
            warn!(round, error = %e, "Synthetic load round failed");
        }
        round += 1;
    }
}

#[cfg(unix)]
async fn reload_on_hangup(queue: Arc<Queue>, path: PathBuf, token: CancellationToken) {
    let mut hangup = match signal::unix::signal(signal::unix::SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "Failed to install SIGHUP handler, reload disabled");
            return;
        }
    };
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = hangup.recv() => {}
        }
        let result = match QueueConfig::from_file(&path) {
            Ok(config) => queue.update(config).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => info!(config = %path.display(), "Configuration reloaded"),
            Err(e) => error!(config = %path.display(), error = %e, "Configuration reload failed"),
        }
    }
}

#[cfg(not(unix))]
async fn reload_on_hangup(_queue: Arc<Queue>, _path: PathBuf, token: CancellationToken) {
    token.cancelled().await;
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
