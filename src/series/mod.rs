//! In-memory series model
//!
//! - [`Labels`]: sorted label sets with a stable hash used for sharding
//! - [`TimeSeriesBinary`]: the pooled record that moves through the pipeline
//! - [`SeriesGroup`]: the decoded contents of one queue entry

mod histogram;
mod labels;
pub mod pool;
mod record;

pub use histogram::{BucketSpan, CounterResetHint, FloatHistogram, Histogram, HistogramPayload};
pub use labels::{
    Label, Labels, META_HELP_LABEL, META_TYPE_LABEL, META_UNIT_LABEL, METRIC_NAME_LABEL,
};
pub use record::{Exemplar, Metadata, MetricType, SeriesKind, TimeSeriesBinary};

/// Records decoded from one queue entry.
#[derive(Debug, Default)]
pub struct SeriesGroup {
    pub series: Vec<Box<TimeSeriesBinary>>,
    pub metadata: Vec<Box<TimeSeriesBinary>>,
    /// Deduplicated strings the labels were rebuilt from.
    pub strings: Vec<String>,
}

impl SeriesGroup {
    /// Hand every record back to the pool.
    pub fn release(self) {
        pool::put_series_slice(self.series);
        pool::put_series_slice(self.metadata);
    }
}
