//! Remote-write request construction.

use crate::series::{
    BucketSpan, FloatHistogram, Histogram, HistogramPayload, Labels, MetricType, SeriesKind,
    TimeSeriesBinary, METRIC_NAME_LABEL,
};
use std::collections::BTreeMap;
use tracing::error;

/// The proto module defines the remote-write protobuf message structure.
///
/// Tags follow the upstream `remote.proto` and `types.proto` definitions.
pub mod proto {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct WriteRequest {
        #[prost(message, repeated, tag = "1")]
        pub timeseries: Vec<TimeSeries>,
        #[prost(message, repeated, tag = "3")]
        pub metadata: Vec<MetricMetadata>,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct TimeSeries {
        #[prost(message, repeated, tag = "1")]
        pub labels: Vec<Label>,
        #[prost(message, repeated, tag = "2")]
        pub samples: Vec<Sample>,
        #[prost(message, repeated, tag = "3")]
        pub exemplars: Vec<Exemplar>,
        #[prost(message, repeated, tag = "4")]
        pub histograms: Vec<Histogram>,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct Label {
        #[prost(string, tag = "1")]
        pub name: String,
        #[prost(string, tag = "2")]
        pub value: String,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct Sample {
        #[prost(double, tag = "1")]
        pub value: f64,
        #[prost(int64, tag = "2")]
        pub timestamp: i64,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct Exemplar {
        #[prost(message, repeated, tag = "1")]
        pub labels: Vec<Label>,
        #[prost(double, tag = "2")]
        pub value: f64,
        #[prost(int64, tag = "3")]
        pub timestamp: i64,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct BucketSpan {
        #[prost(sint32, tag = "1")]
        pub offset: i32,
        #[prost(uint32, tag = "2")]
        pub length: u32,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct Histogram {
        #[prost(oneof = "histogram::Count", tags = "1, 2")]
        pub count: Option<histogram::Count>,
        #[prost(double, tag = "3")]
        pub sum: f64,
        #[prost(sint32, tag = "4")]
        pub schema: i32,
        #[prost(double, tag = "5")]
        pub zero_threshold: f64,
        #[prost(oneof = "histogram::ZeroCount", tags = "6, 7")]
        pub zero_count: Option<histogram::ZeroCount>,
        #[prost(message, repeated, tag = "8")]
        pub negative_spans: Vec<BucketSpan>,
        #[prost(sint64, repeated, tag = "9")]
        pub negative_deltas: Vec<i64>,
        #[prost(double, repeated, tag = "10")]
        pub negative_counts: Vec<f64>,
        #[prost(message, repeated, tag = "11")]
        pub positive_spans: Vec<BucketSpan>,
        #[prost(sint64, repeated, tag = "12")]
        pub positive_deltas: Vec<i64>,
        #[prost(double, repeated, tag = "13")]
        pub positive_counts: Vec<f64>,
        #[prost(enumeration = "histogram::ResetHint", tag = "14")]
        pub reset_hint: i32,
        #[prost(int64, tag = "15")]
        pub timestamp: i64,
        #[prost(double, repeated, tag = "16")]
        pub custom_values: Vec<f64>,
    }

    pub mod histogram {
        #[derive(Clone, Copy, PartialEq, prost::Oneof)]
        pub enum Count {
            #[prost(uint64, tag = "1")]
            CountInt(u64),
            #[prost(double, tag = "2")]
            CountFloat(f64),
        }

        #[derive(Clone, Copy, PartialEq, prost::Oneof)]
        pub enum ZeroCount {
            #[prost(uint64, tag = "6")]
            ZeroCountInt(u64),
            #[prost(double, tag = "7")]
            ZeroCountFloat(f64),
        }

        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
        #[repr(i32)]
        pub enum ResetHint {
            Unknown = 0,
            Yes = 1,
            No = 2,
            Gauge = 3,
        }
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct MetricMetadata {
        #[prost(enumeration = "metric_metadata::MetricType", tag = "1")]
        pub r#type: i32,
        #[prost(string, tag = "2")]
        pub metric_family_name: String,
        #[prost(string, tag = "4")]
        pub help: String,
        #[prost(string, tag = "5")]
        pub unit: String,
    }

    pub mod metric_metadata {
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
        #[repr(i32)]
        pub enum MetricType {
            Unknown = 0,
            Counter = 1,
            Gauge = 2,
            Histogram = 3,
            Gaugehistogram = 4,
            Summary = 5,
            Info = 6,
            Stateset = 7,
        }
    }
}

fn to_proto_labels(labels: &Labels) -> Vec<proto::Label> {
    labels
        .iter()
        .map(|l| proto::Label {
            name: l.name.clone(),
            value: l.value.clone(),
        })
        .collect()
}

/// External labels overwrite a same-named label or are appended.
fn apply_external_labels(labels: &mut Vec<proto::Label>, external: &BTreeMap<String, String>) {
    for (name, value) in external {
        match labels.iter_mut().find(|l| &l.name == name) {
            Some(existing) => existing.value = value.clone(),
            None => labels.push(proto::Label {
                name: name.clone(),
                value: value.clone(),
            }),
        }
    }
}

fn to_proto_spans(spans: &[BucketSpan]) -> Vec<proto::BucketSpan> {
    spans
        .iter()
        .map(|s| proto::BucketSpan {
            offset: s.offset,
            length: s.length,
        })
        .collect()
}

fn int_histogram(h: &Histogram, timestamp: i64) -> proto::Histogram {
    use proto::histogram::{Count, ZeroCount};
    proto::Histogram {
        count: Some(Count::CountInt(h.count)),
        sum: h.sum,
        schema: h.schema,
        zero_threshold: h.zero_threshold,
        zero_count: Some(ZeroCount::ZeroCountInt(h.zero_count)),
        negative_spans: to_proto_spans(&h.negative_spans),
        negative_deltas: h.negative_buckets.clone(),
        negative_counts: Vec::new(),
        positive_spans: to_proto_spans(&h.positive_spans),
        positive_deltas: h.positive_buckets.clone(),
        positive_counts: Vec::new(),
        reset_hint: h.counter_reset_hint as i32,
        timestamp,
        custom_values: h.custom_values.clone(),
    }
}

fn float_histogram(h: &FloatHistogram, timestamp: i64) -> proto::Histogram {
    use proto::histogram::{Count, ZeroCount};
    proto::Histogram {
        count: Some(Count::CountFloat(h.count)),
        sum: h.sum,
        schema: h.schema,
        zero_threshold: h.zero_threshold,
        zero_count: Some(ZeroCount::ZeroCountFloat(h.zero_count)),
        negative_spans: to_proto_spans(&h.negative_spans),
        negative_deltas: Vec::new(),
        negative_counts: h.negative_buckets.clone(),
        positive_spans: to_proto_spans(&h.positive_spans),
        positive_deltas: Vec::new(),
        positive_counts: h.positive_buckets.clone(),
        reset_hint: h.counter_reset_hint as i32,
        timestamp,
        custom_values: h.custom_values.clone(),
    }
}

/// One `TimeSeries` per record, in batch order.
pub fn create_write_request(
    series: &[Box<TimeSeriesBinary>],
    external_labels: &BTreeMap<String, String>,
) -> proto::WriteRequest {
    let timeseries = series
        .iter()
        .map(|record| {
            let mut labels = to_proto_labels(&record.labels);
            apply_external_labels(&mut labels, external_labels);

            let mut ts = proto::TimeSeries {
                labels,
                ..Default::default()
            };
            match (&record.histogram, record.kind) {
                (Some(HistogramPayload::Int(h)), _) => {
                    ts.histograms.push(int_histogram(h, record.ts));
                }
                (Some(HistogramPayload::Float(h)), _) => {
                    ts.histograms.push(float_histogram(h, record.ts));
                }
                (None, SeriesKind::Exemplar) => ts.exemplars.push(proto::Exemplar {
                    labels: to_proto_labels(&record.exemplar_labels),
                    value: record.value,
                    timestamp: record.ts,
                }),
                (None, _) => ts.samples.push(proto::Sample {
                    value: record.value,
                    timestamp: record.ts,
                }),
            }
            ts
        })
        .collect();
    proto::WriteRequest {
        timeseries,
        metadata: Vec::new(),
    }
}

fn to_proto_metric_type(t: MetricType) -> proto::metric_metadata::MetricType {
    use proto::metric_metadata::MetricType as P;
    match t {
        MetricType::Unknown => P::Unknown,
        MetricType::Counter => P::Counter,
        MetricType::Gauge => P::Gauge,
        MetricType::Histogram => P::Histogram,
        MetricType::GaugeHistogram => P::Gaugehistogram,
        MetricType::Summary => P::Summary,
        MetricType::Info => P::Info,
        MetricType::StateSet => P::Stateset,
    }
}

/// Metadata records without all three reserved labels are logged and skipped.
pub fn create_write_request_metadata(series: &[Box<TimeSeriesBinary>]) -> proto::WriteRequest {
    let metadata = series
        .iter()
        .filter_map(|record| match record.metadata() {
            Some(meta) => Some(proto::MetricMetadata {
                r#type: to_proto_metric_type(meta.metric_type) as i32,
                metric_family_name: record.labels.get(METRIC_NAME_LABEL).unwrap_or_default().to_string(),
                help: meta.help,
                unit: meta.unit,
            }),
            None => {
                error!(labels = %record.labels, "Invalid metadata was found");
                None
            }
        })
        .collect();
    proto::WriteRequest {
        timeseries: Vec::new(),
        metadata,
    }
}
