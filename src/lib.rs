//! # walqueue
//!
//! A disk-backed queue that delivers time-series samples, exemplars,
//! histograms and metadata to Prometheus remote-write endpoints.
//!
//! ## Pipeline
//!
//! Each configured endpoint owns an independent pipeline:
//!
//! - **Appender**: producers buffer records and commit them as a unit
//! - **Serializer**: batches records and writes them to the file queue as one
//!   compressed entry
//! - **File queue**: durable, ordered entries on disk that survive restarts
//! - **Network**: shards records across parallel send loops by label hash,
//!   batches them into remote-write requests, and retries recoverable failures
//!
//! Records older than the configured TTL are dropped both before they are
//! written and after they are read back.
//!
//! The [`queue::Queue`] component ties endpoints together behind one
//! [`appender::FanoutAppender`].

pub mod appender;
pub mod clock;
pub mod config;
pub mod endpoint;
pub mod filequeue;
pub mod network;
pub mod queue;
pub mod serialization;
pub mod series;
pub mod stats;
pub mod telemetry;

mod error;

pub use error::{Error, Result};

/// Re-exports for convenience
pub mod prelude {
    pub use crate::appender::{Appender, EndpointAppender, FanoutAppender};
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::config::{EndpointConfig, PersistenceConfig, QueueConfig};
    pub use crate::endpoint::Endpoint;
    pub use crate::queue::Queue;
    pub use crate::series::{Exemplar, HistogramPayload, Labels, Metadata};
    pub use crate::stats::{StatsCounters, StatsSnapshot};
    pub use crate::{Error, Result};
}
