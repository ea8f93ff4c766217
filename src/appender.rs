//! Producer-facing write interface.
//!
//! Appends are buffered in the appender; [`Appender::commit`] hands them to the
//! serializer and [`Appender::rollback`] discards them.

use crate::serialization::Serializer;
use crate::series::{
    pool, Exemplar, HistogramPayload, Labels, Metadata, SeriesKind, TimeSeriesBinary,
};
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait Appender: Send {
    /// Buffers one float sample.
    fn append(&mut self, labels: &Labels, ts: i64, value: f64) -> Result<()>;

    fn append_exemplar(&mut self, labels: &Labels, exemplar: &Exemplar) -> Result<()>;

    /// Buffers a native histogram sample, integer or float.
    fn append_histogram(
        &mut self,
        labels: &Labels,
        ts: i64,
        histogram: &HistogramPayload,
    ) -> Result<()>;

    fn update_metadata(&mut self, labels: &Labels, metadata: &Metadata) -> Result<()>;

    /// Hands everything buffered to the queue.
    async fn commit(&mut self) -> Result<()>;

    /// Discards everything buffered.
    async fn rollback(&mut self) -> Result<()>;
}

/// Appender for a single endpoint.
pub struct EndpointAppender {
    serializer: Arc<Serializer>,
    series: Vec<Box<TimeSeriesBinary>>,
    metadata: Vec<Box<TimeSeriesBinary>>,
}

impl EndpointAppender {
    pub(crate) fn new(serializer: Arc<Serializer>) -> Self {
        Self {
            serializer,
            series: Vec::new(),
            metadata: Vec::new(),
        }
    }

    /// Records buffered and not yet committed.
    pub fn pending(&self) -> usize {
        self.series.len() + self.metadata.len()
    }

    fn release(&mut self) {
        pool::put_series_slice(std::mem::take(&mut self.series));
        pool::put_series_slice(std::mem::take(&mut self.metadata));
    }
}

#[async_trait]
impl Appender for EndpointAppender {
    fn append(&mut self, labels: &Labels, ts: i64, value: f64) -> Result<()> {
        let mut s = pool::get_series();
        s.set_labels(labels);
        s.ts = ts;
        s.value = value;
        self.series.push(s);
        Ok(())
    }

    fn append_exemplar(&mut self, labels: &Labels, exemplar: &Exemplar) -> Result<()> {
        let mut s = pool::get_series();
        s.set_labels(labels);
        s.exemplar_labels.copy_from(&exemplar.labels);
        s.ts = exemplar.ts;
        s.value = exemplar.value;
        s.kind = SeriesKind::Exemplar;
        self.series.push(s);
        Ok(())
    }

    fn append_histogram(
        &mut self,
        labels: &Labels,
        ts: i64,
        histogram: &HistogramPayload,
    ) -> Result<()> {
        let mut s = pool::get_series();
        s.set_labels(labels);
        s.ts = ts;
        s.histogram = Some(histogram.clone());
        self.series.push(s);
        Ok(())
    }

    fn update_metadata(&mut self, labels: &Labels, metadata: &Metadata) -> Result<()> {
        let mut s = pool::get_series();
        s.fill_metadata(labels, metadata);
        self.metadata.push(s);
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        let series = std::mem::take(&mut self.series);
        let metadata = std::mem::take(&mut self.metadata);
        let mut series = series.into_iter();
        let mut metadata = metadata.into_iter();

        let result: Result<()> = async {
            for s in series.by_ref() {
                self.serializer.send_series(s).await?;
            }
            for m in metadata.by_ref() {
                self.serializer.send_metadata(m).await?;
            }
            Ok(())
        }
        .await;

        // Whatever was not handed off goes back to the pool.
        pool::put_series_slice(series.collect());
        pool::put_series_slice(metadata.collect());
        result
    }

    async fn rollback(&mut self) -> Result<()> {
        self.release();
        Ok(())
    }
}

impl Drop for EndpointAppender {
    fn drop(&mut self) {
        self.release();
    }
}

/// Forwards every call to one appender per endpoint, stopping at the first
/// error.
#[derive(Default)]
pub struct FanoutAppender {
    children: Vec<Box<dyn Appender>>,
}

impl FanoutAppender {
    pub fn new(children: Vec<Box<dyn Appender>>) -> Self {
        Self { children }
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }
}

#[async_trait]
impl Appender for FanoutAppender {
    fn append(&mut self, labels: &Labels, ts: i64, value: f64) -> Result<()> {
        for child in &mut self.children {
            child.append(labels, ts, value)?;
        }
        Ok(())
    }

    fn append_exemplar(&mut self, labels: &Labels, exemplar: &Exemplar) -> Result<()> {
        for child in &mut self.children {
            child.append_exemplar(labels, exemplar)?;
        }
        Ok(())
    }

    fn append_histogram(
        &mut self,
        labels: &Labels,
        ts: i64,
        histogram: &HistogramPayload,
    ) -> Result<()> {
        for child in &mut self.children {
            child.append_histogram(labels, ts, histogram)?;
        }
        Ok(())
    }

    fn update_metadata(&mut self, labels: &Labels, metadata: &Metadata) -> Result<()> {
        for child in &mut self.children {
            child.update_metadata(labels, metadata)?;
        }
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        for child in &mut self.children {
            child.commit().await?;
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        for child in &mut self.children {
            child.rollback().await?;
        }
        Ok(())
    }
}
