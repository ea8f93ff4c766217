//! The pooled unit of data flowing through the pipeline

use super::histogram::HistogramPayload;
use super::labels::{Labels, META_HELP_LABEL, META_TYPE_LABEL, META_UNIT_LABEL};

/// What a record represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum SeriesKind {
    #[default]
    Sample = 0,
    Exemplar = 1,
    Metadata = 2,
}

impl SeriesKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Sample),
            1 => Some(Self::Exemplar),
            2 => Some(Self::Metadata),
            _ => None,
        }
    }
}

/// Metric family type, as carried by metadata records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MetricType {
    #[default]
    Unknown,
    Counter,
    Gauge,
    Histogram,
    GaugeHistogram,
    Summary,
    Info,
    StateSet,
}

impl MetricType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Counter => "counter",
            Self::Gauge => "gauge",
            Self::Histogram => "histogram",
            Self::GaugeHistogram => "gaugehistogram",
            Self::Summary => "summary",
            Self::Info => "info",
            Self::StateSet => "stateset",
        }
    }
}

impl std::str::FromStr for MetricType {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "unknown" | "" => Ok(Self::Unknown),
            "counter" => Ok(Self::Counter),
            "gauge" => Ok(Self::Gauge),
            "histogram" => Ok(Self::Histogram),
            "gaugehistogram" => Ok(Self::GaugeHistogram),
            "summary" => Ok(Self::Summary),
            "info" => Ok(Self::Info),
            "stateset" => Ok(Self::StateSet),
            other => Err(format!("unknown metric type '{}'", other)),
        }
    }
}

/// Metric family metadata supplied by producers.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Metadata {
    pub metric_type: MetricType,
    pub help: String,
    pub unit: String,
}

/// An exemplar attached to a series.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Exemplar {
    pub labels: Labels,
    pub value: f64,
    pub ts: i64,
}

/// One observation: a sample, exemplar, histogram, or metadata entry.
///
/// Instances come from [`super::pool`] and are moved (boxed) between stages,
/// so exactly one stage owns a record at any time.
#[derive(Debug, Clone, Default)]
pub struct TimeSeriesBinary {
    pub labels: Labels,
    /// Exemplar labels; only populated for [`SeriesKind::Exemplar`].
    pub exemplar_labels: Labels,
    /// Milliseconds since the Unix epoch.
    pub ts: i64,
    pub value: f64,
    pub hash: u64,
    pub histogram: Option<HistogramPayload>,
    pub kind: SeriesKind,
}

impl TimeSeriesBinary {
    /// Replaces the label set and recomputes the hash.
    pub fn set_labels(&mut self, labels: &Labels) {
        self.labels.copy_from(labels);
        self.hash = self.labels.hash();
    }

    /// Clears every field, keeping label allocations.
    pub fn reset(&mut self) {
        self.labels.clear();
        self.exemplar_labels.clear();
        self.ts = 0;
        self.value = 0.0;
        self.hash = 0;
        self.histogram = None;
        self.kind = SeriesKind::Sample;
    }

    /// A metadata record must carry all three reserved labels.
    pub fn is_metadata(&self) -> bool {
        self.labels.has(META_TYPE_LABEL)
            && self.labels.has(META_HELP_LABEL)
            && self.labels.has(META_UNIT_LABEL)
    }

    /// Extracts the metadata carried in reserved labels, if complete.
    pub fn metadata(&self) -> Option<Metadata> {
        if !self.is_metadata() {
            return None;
        }
        Some(Metadata {
            metric_type: self
                .labels
                .get(META_TYPE_LABEL)
                .and_then(|t| t.parse().ok())
                .unwrap_or_default(),
            help: self.labels.get(META_HELP_LABEL).unwrap_or_default().to_string(),
            unit: self.labels.get(META_UNIT_LABEL).unwrap_or_default().to_string(),
        })
    }

    /// Fills a metadata record from series labels and metadata.
    pub fn fill_metadata(&mut self, labels: &Labels, metadata: &Metadata) {
        self.labels.copy_from(labels);
        self.labels.set(META_TYPE_LABEL, metadata.metric_type.as_str());
        self.labels.set(META_HELP_LABEL, metadata.help.as_str());
        self.labels.set(META_UNIT_LABEL, metadata.unit.as_str());
        self.hash = self.labels.hash();
        self.kind = SeriesKind::Metadata;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_requires_all_reserved_labels() {
        let mut record = TimeSeriesBinary::default();
        record.set_labels(&Labels::from_pairs([
            ("__name__", "http_requests_total"),
            (META_TYPE_LABEL, "counter"),
            (META_HELP_LABEL, "Total requests"),
        ]));
        assert!(!record.is_metadata());
        assert!(record.metadata().is_none());
    }

    #[test]
    fn test_fill_metadata_roundtrip() {
        let mut record = TimeSeriesBinary::default();
        let meta = Metadata {
            metric_type: MetricType::Counter,
            help: "Total requests".into(),
            unit: "seconds".into(),
        };
        record.fill_metadata(&Labels::from_pairs([("__name__", "reqs")]), &meta);
        assert_eq!(record.kind, SeriesKind::Metadata);
        assert_eq!(record.metadata(), Some(meta));
        assert_eq!(record.hash, record.labels.hash());
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut record = TimeSeriesBinary::default();
        record.set_labels(&Labels::from_pairs([("__name__", "x")]));
        record.ts = 10;
        record.value = 1.5;
        record.kind = SeriesKind::Exemplar;
        record.reset();
        assert!(record.labels.is_empty());
        assert_eq!(record.ts, 0);
        assert_eq!(record.hash, 0);
        assert_eq!(record.kind, SeriesKind::Sample);
    }

    #[test]
    fn test_metric_type_parse_is_case_insensitive() {
        assert_eq!("COUNTER".parse::<MetricType>().unwrap(), MetricType::Counter);
        assert!("bogus".parse::<MetricType>().is_err());
    }
}
