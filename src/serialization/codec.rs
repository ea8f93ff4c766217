//! String-table encoding for queue entries.
//!
//! An encoded batch is snappy compressed and, before compression, laid out as:
//!
//! ```text
//! format tag (u8)
//! string count (varint) | { len (varint) | utf-8 bytes }*
//! series count (varint) | record block*
//! meta count (varint)   | record block*
//! ```
//!
//! Each record block holds the record kind, a value tag, label name/value
//! indices into the string table, exemplar label indices, a zigzag timestamp,
//! and either the scalar value or the histogram fields. Every label name and
//! value appears in the string table exactly once per batch.
//!
//! The hash is not stored: it is recomputed from the decoded labels, which
//! keeps shard selection identical across a restart.

use crate::series::{
    pool, BucketSpan, CounterResetHint, FloatHistogram, Histogram, HistogramPayload, Label,
    Labels, SeriesGroup, SeriesKind, TimeSeriesBinary,
};
use crate::{Error, Result};
use lasso::{Rodeo, Spur};
use std::collections::HashMap;

/// Format version written into every entry's metadata.
pub const VERSION: &str = "walqueue.v1";

pub const META_VERSION: &str = "version";
pub const META_SERIES_COUNT: &str = "series_count";
pub const META_META_COUNT: &str = "meta_count";
pub const META_STRINGS_COUNT: &str = "strings_count";

const FORMAT_TAG: u8 = 1;

const VALUE_FLOAT: u8 = 0;
const VALUE_HISTOGRAM: u8 = 1;
const VALUE_FLOAT_HISTOGRAM: u8 = 2;

/// Encodes one batch. Returns the entry metadata and the compressed payload.
pub fn serialize(
    series: &[Box<TimeSeriesBinary>],
    metadata: &[Box<TimeSeriesBinary>],
) -> Result<(HashMap<String, String>, Vec<u8>)> {
    let mut rodeo = Rodeo::default();
    let mut blocks = Writer::with_capacity((series.len() + metadata.len()) * 32);

    blocks.varint(series.len() as u64);
    for record in series {
        write_record(&mut blocks, &mut rodeo, record);
    }
    blocks.varint(metadata.len() as u64);
    for record in metadata {
        write_record(&mut blocks, &mut rodeo, record);
    }

    let mut out = Writer::with_capacity(blocks.len() + rodeo.len() * 16 + 8);
    out.u8(FORMAT_TAG);
    out.varint(rodeo.len() as u64);
    for s in rodeo.strings() {
        out.bytes(s.as_bytes());
    }
    out.raw(&blocks.finish());

    let compressed = snap::raw::Encoder::new().compress_vec(&out.finish())?;

    let mut meta = HashMap::with_capacity(4);
    meta.insert(META_VERSION.to_string(), VERSION.to_string());
    meta.insert(META_SERIES_COUNT.to_string(), series.len().to_string());
    meta.insert(META_META_COUNT.to_string(), metadata.len().to_string());
    meta.insert(META_STRINGS_COUNT.to_string(), rodeo.len().to_string());
    Ok((meta, compressed))
}

/// Decodes one batch written by [`serialize`].
///
/// Fails with [`Error::UnsupportedVersion`] when the entry metadata names a
/// different format.
pub fn deserialize(meta: &HashMap<String, String>, data: &[u8]) -> Result<SeriesGroup> {
    match meta.get(META_VERSION) {
        Some(v) if v == VERSION => {}
        Some(v) => return Err(Error::UnsupportedVersion(v.clone())),
        None => return Err(Error::UnsupportedVersion("<missing>".to_string())),
    }

    let raw = snap::raw::Decoder::new().decompress_vec(data)?;
    let mut reader = Reader::new(&raw);

    let tag = reader.u8()?;
    if tag != FORMAT_TAG {
        return Err(Error::UnsupportedVersion(format!("format tag {}", tag)));
    }

    let strings_count = reader.len()?;
    let mut strings = Vec::with_capacity(strings_count);
    for _ in 0..strings_count {
        strings.push(reader.string()?);
    }

    let mut group = SeriesGroup {
        strings,
        ..Default::default()
    };
    let series_count = reader.len()?;
    group.series.reserve(series_count);
    for _ in 0..series_count {
        match read_record(&mut reader, &group.strings) {
            Ok(record) => group.series.push(record),
            Err(e) => {
                group.release();
                return Err(e);
            }
        }
    }
    let meta_count = reader.len()?;
    group.metadata.reserve(meta_count);
    for _ in 0..meta_count {
        match read_record(&mut reader, &group.strings) {
            Ok(record) => group.metadata.push(record),
            Err(e) => {
                group.release();
                return Err(e);
            }
        }
    }
    if !reader.is_empty() {
        group.release();
        return Err(Error::Serialization(
            "trailing bytes after last record".to_string(),
        ));
    }
    Ok(group)
}

fn intern(rodeo: &mut Rodeo, value: &str) -> u64 {
    let key: Spur = rodeo.get_or_intern(value);
    lasso::Key::into_usize(key) as u64
}

fn write_labels(w: &mut Writer, rodeo: &mut Rodeo, labels: &Labels) {
    w.varint(labels.len() as u64);
    for label in labels {
        let name = intern(rodeo, &label.name);
        let value = intern(rodeo, &label.value);
        w.varint(name);
        w.varint(value);
    }
}

fn write_record(w: &mut Writer, rodeo: &mut Rodeo, record: &TimeSeriesBinary) {
    w.u8(record.kind as u8);
    let value_tag = match &record.histogram {
        None => VALUE_FLOAT,
        Some(HistogramPayload::Int(_)) => VALUE_HISTOGRAM,
        Some(HistogramPayload::Float(_)) => VALUE_FLOAT_HISTOGRAM,
    };
    w.u8(value_tag);
    write_labels(w, rodeo, &record.labels);
    write_labels(w, rodeo, &record.exemplar_labels);
    w.zigzag(record.ts);
    match &record.histogram {
        None => w.f64(record.value),
        Some(HistogramPayload::Int(h)) => {
            w.u8(h.counter_reset_hint as u8);
            w.zigzag(h.schema as i64);
            w.f64(h.zero_threshold);
            w.varint(h.zero_count);
            w.varint(h.count);
            w.f64(h.sum);
            write_spans(w, &h.positive_spans);
            write_spans(w, &h.negative_spans);
            w.varint(h.positive_buckets.len() as u64);
            h.positive_buckets.iter().for_each(|b| w.zigzag(*b));
            w.varint(h.negative_buckets.len() as u64);
            h.negative_buckets.iter().for_each(|b| w.zigzag(*b));
            write_floats(w, &h.custom_values);
        }
        Some(HistogramPayload::Float(h)) => {
            w.u8(h.counter_reset_hint as u8);
            w.zigzag(h.schema as i64);
            w.f64(h.zero_threshold);
            w.f64(h.zero_count);
            w.f64(h.count);
            w.f64(h.sum);
            write_spans(w, &h.positive_spans);
            write_spans(w, &h.negative_spans);
            write_floats(w, &h.positive_buckets);
            write_floats(w, &h.negative_buckets);
            write_floats(w, &h.custom_values);
        }
    }
}

fn write_spans(w: &mut Writer, spans: &[BucketSpan]) {
    w.varint(spans.len() as u64);
    for span in spans {
        w.zigzag(span.offset as i64);
        w.varint(span.length as u64);
    }
}

fn write_floats(w: &mut Writer, values: &[f64]) {
    w.varint(values.len() as u64);
    values.iter().for_each(|v| w.f64(*v));
}

fn read_labels(r: &mut Reader<'_>, strings: &[String], into: &mut Labels) -> Result<()> {
    let count = r.len()?;
    let mut labels = Vec::with_capacity(count);
    for _ in 0..count {
        let name = lookup(strings, r.varint()?)?;
        let value = lookup(strings, r.varint()?)?;
        labels.push(Label::new(name, value));
    }
    *into = Labels::new(labels);
    Ok(())
}

fn lookup(strings: &[String], idx: u64) -> Result<&str> {
    strings
        .get(idx as usize)
        .map(String::as_str)
        .ok_or_else(|| {
            Error::Serialization(format!(
                "string index {} out of range ({} strings)",
                idx,
                strings.len()
            ))
        })
}

fn read_record(r: &mut Reader<'_>, strings: &[String]) -> Result<Box<TimeSeriesBinary>> {
    let mut record = pool::get_series();
    if let Err(e) = fill_record(r, strings, &mut record) {
        pool::put_series(record);
        return Err(e);
    }
    Ok(record)
}

fn fill_record(r: &mut Reader<'_>, strings: &[String], record: &mut TimeSeriesBinary) -> Result<()> {
    let kind = r.u8()?;
    record.kind = SeriesKind::from_u8(kind)
        .ok_or_else(|| Error::Serialization(format!("unknown record kind {}", kind)))?;
    let value_tag = r.u8()?;
    read_labels(r, strings, &mut record.labels)?;
    read_labels(r, strings, &mut record.exemplar_labels)?;
    record.hash = record.labels.hash();
    record.ts = r.zigzag()?;

    match value_tag {
        VALUE_FLOAT => record.value = r.f64()?,
        VALUE_HISTOGRAM => {
            let counter_reset_hint = r.reset_hint()?;
            let schema = r.zigzag()? as i32;
            let zero_threshold = r.f64()?;
            let zero_count = r.varint()?;
            let count = r.varint()?;
            let sum = r.f64()?;
            let positive_spans = read_spans(r)?;
            let negative_spans = read_spans(r)?;
            let positive_buckets = read_deltas(r)?;
            let negative_buckets = read_deltas(r)?;
            let custom_values = read_floats(r)?;
            record.histogram = Some(HistogramPayload::Int(Histogram {
                counter_reset_hint,
                schema,
                zero_threshold,
                zero_count,
                count,
                sum,
                positive_spans,
                negative_spans,
                positive_buckets,
                negative_buckets,
                custom_values,
            }));
        }
        VALUE_FLOAT_HISTOGRAM => {
            let counter_reset_hint = r.reset_hint()?;
            let schema = r.zigzag()? as i32;
            let zero_threshold = r.f64()?;
            let zero_count = r.f64()?;
            let count = r.f64()?;
            let sum = r.f64()?;
            let positive_spans = read_spans(r)?;
            let negative_spans = read_spans(r)?;
            let positive_buckets = read_floats(r)?;
            let negative_buckets = read_floats(r)?;
            let custom_values = read_floats(r)?;
            record.histogram = Some(HistogramPayload::Float(FloatHistogram {
                counter_reset_hint,
                schema,
                zero_threshold,
                zero_count,
                count,
                sum,
                positive_spans,
                negative_spans,
                positive_buckets,
                negative_buckets,
                custom_values,
            }));
        }
        other => {
            return Err(Error::Serialization(format!("unknown value tag {}", other)));
        }
    }
    Ok(())
}

fn read_spans(r: &mut Reader<'_>) -> Result<Vec<BucketSpan>> {
    let count = r.len()?;
    let mut spans = Vec::with_capacity(count);
    for _ in 0..count {
        let offset = r.zigzag()? as i32;
        let length = r.varint()? as u32;
        spans.push(BucketSpan { offset, length });
    }
    Ok(spans)
}

fn read_deltas(r: &mut Reader<'_>) -> Result<Vec<i64>> {
    let count = r.len()?;
    (0..count).map(|_| r.zigzag()).collect()
}

fn read_floats(r: &mut Reader<'_>) -> Result<Vec<f64>> {
    let count = r.len()?;
    (0..count).map(|_| r.f64()).collect()
}

struct Writer {
    output: Vec<u8>,
}

impl Writer {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            output: Vec::with_capacity(capacity),
        }
    }

    fn len(&self) -> usize {
        self.output.len()
    }

    fn u8(&mut self, value: u8) {
        self.output.push(value);
    }

    fn varint(&mut self, value: u64) {
        let mut buffer = unsigned_varint::encode::u64_buffer();
        let encoded = unsigned_varint::encode::u64(value, &mut buffer);
        self.output.extend_from_slice(encoded);
    }

    fn zigzag(&mut self, value: i64) {
        let zigzag = (value << 1) ^ (value >> 63);
        self.varint(zigzag as u64);
    }

    fn f64(&mut self, value: f64) {
        self.output.extend_from_slice(&value.to_le_bytes());
    }

    fn bytes(&mut self, value: &[u8]) {
        self.varint(value.len() as u64);
        self.output.extend_from_slice(value);
    }

    fn raw(&mut self, value: &[u8]) {
        self.output.extend_from_slice(value);
    }

    fn finish(self) -> Vec<u8> {
        self.output
    }
}

struct Reader<'a> {
    input: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(input: &'a [u8]) -> Self {
        Self { input }
    }

    fn is_empty(&self) -> bool {
        self.input.is_empty()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.input.len() < n {
            return Err(Error::Serialization(format!(
                "truncated batch: wanted {} bytes, {} left",
                n,
                self.input.len()
            )));
        }
        let (head, tail) = self.input.split_at(n);
        self.input = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn varint(&mut self) -> Result<u64> {
        let (value, tail) = unsigned_varint::decode::u64(self.input)
            .map_err(|e| Error::Serialization(format!("invalid varint: {}", e)))?;
        self.input = tail;
        Ok(value)
    }

    /// A count that must fit in the remaining input, so a corrupt length
    /// cannot trigger a huge allocation.
    fn len(&mut self) -> Result<usize> {
        let value = self.varint()?;
        if value > self.input.len() as u64 {
            return Err(Error::Serialization(format!(
                "length {} exceeds remaining {} bytes",
                value,
                self.input.len()
            )));
        }
        Ok(value as usize)
    }

    fn zigzag(&mut self) -> Result<i64> {
        let head = self.varint()?;
        Ok((head >> 1) as i64 ^ -((head & 1) as i64))
    }

    fn f64(&mut self) -> Result<f64> {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(self.take(8)?);
        Ok(f64::from_le_bytes(bytes))
    }

    fn string(&mut self) -> Result<String> {
        let len = self.len()?;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| Error::Serialization(format!("invalid utf-8 in string table: {}", e)))
    }

    fn reset_hint(&mut self) -> Result<CounterResetHint> {
        let raw = self.u8()?;
        CounterResetHint::from_u8(raw)
            .ok_or_else(|| Error::Serialization(format!("unknown counter reset hint {}", raw)))
    }
}
