//! Native histogram payloads

/// A run of consecutive populated buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BucketSpan {
    /// Gap to the previous span, or the starting index for the first span.
    pub offset: i32,
    pub length: u32,
}

/// Counter reset hint carried with each histogram sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum CounterResetHint {
    #[default]
    Unknown = 0,
    Yes = 1,
    No = 2,
    Gauge = 3,
}

impl CounterResetHint {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Unknown),
            1 => Some(Self::Yes),
            2 => Some(Self::No),
            3 => Some(Self::Gauge),
            _ => None,
        }
    }
}

/// Integer-count histogram. Bucket counts are delta encoded.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Histogram {
    pub counter_reset_hint: CounterResetHint,
    pub schema: i32,
    pub zero_threshold: f64,
    pub zero_count: u64,
    pub count: u64,
    pub sum: f64,
    pub positive_spans: Vec<BucketSpan>,
    pub negative_spans: Vec<BucketSpan>,
    pub positive_buckets: Vec<i64>,
    pub negative_buckets: Vec<i64>,
    pub custom_values: Vec<f64>,
}

/// Float-count histogram. Bucket counts are absolute.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FloatHistogram {
    pub counter_reset_hint: CounterResetHint,
    pub schema: i32,
    pub zero_threshold: f64,
    pub zero_count: f64,
    pub count: f64,
    pub sum: f64,
    pub positive_spans: Vec<BucketSpan>,
    pub negative_spans: Vec<BucketSpan>,
    pub positive_buckets: Vec<f64>,
    pub negative_buckets: Vec<f64>,
    pub custom_values: Vec<f64>,
}

/// Histogram carried by a record in place of a scalar value.
#[derive(Debug, Clone, PartialEq)]
pub enum HistogramPayload {
    Int(Histogram),
    Float(FloatHistogram),
}

impl HistogramPayload {
    pub fn sum(&self) -> f64 {
        match self {
            HistogramPayload::Int(h) => h.sum,
            HistogramPayload::Float(h) => h.sum,
        }
    }
}
