//! Shared helpers for the integration tests: a mock remote-write receiver and
//! a polling helper.

#![allow(dead_code)]

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use parking_lot::Mutex;
use prost::Message;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use walqueue::network::wire::proto;
use walqueue::series::{Labels, TimeSeriesBinary};

/// Polls `check` until it returns true or `timeout` elapses.
pub async fn wait_for(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check()
}

/// One request as seen by the mock receiver.
#[derive(Debug, Clone)]
pub struct ReceivedRequest {
    pub headers: HeaderMap,
    pub request: proto::WriteRequest,
    pub status: u16,
}

#[derive(Default)]
struct MockState {
    status: AtomicU16,
    retry_after: Mutex<Option<String>>,
    requests: AtomicU64,
    accepted_samples: AtomicU64,
    accepted_histograms: AtomicU64,
    accepted_metadata: AtomicU64,
    received: Mutex<Vec<ReceivedRequest>>,
}

/// In-process remote-write receiver answering every push with a configurable
/// status.
pub struct MockRemoteWrite {
    pub url: String,
    state: Arc<MockState>,
    task: JoinHandle<()>,
}

impl MockRemoteWrite {
    pub async fn start(status: u16) -> Self {
        let state = Arc::new(MockState::default());
        state.status.store(status, Ordering::SeqCst);

        let router = Router::new()
            .route("/api/v1/push", post(push))
            .with_state(state.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });

        Self {
            url: format!("http://{addr}/api/v1/push"),
            state,
            task,
        }
    }

    pub fn set_status(&self, status: u16) {
        self.state.status.store(status, Ordering::SeqCst);
    }

    pub fn set_retry_after(&self, value: Option<&str>) {
        *self.state.retry_after.lock() = value.map(str::to_string);
    }

    /// Every push received, accepted or not.
    pub fn requests(&self) -> u64 {
        self.state.requests.load(Ordering::SeqCst)
    }

    /// Float samples and exemplar series in accepted pushes.
    pub fn accepted_samples(&self) -> u64 {
        self.state.accepted_samples.load(Ordering::SeqCst)
    }

    pub fn accepted_histograms(&self) -> u64 {
        self.state.accepted_histograms.load(Ordering::SeqCst)
    }

    pub fn accepted_metadata(&self) -> u64 {
        self.state.accepted_metadata.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> Vec<ReceivedRequest> {
        self.state.received.lock().clone()
    }
}

impl Drop for MockRemoteWrite {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn push(State(state): State<Arc<MockState>>, headers: HeaderMap, body: Bytes) -> Response {
    let decoded = snap::raw::Decoder::new()
        .decompress_vec(&body)
        .ok()
        .and_then(|raw| proto::WriteRequest::decode(raw.as_slice()).ok());
    let Some(request) = decoded else {
        return (StatusCode::BAD_REQUEST, "undecodable body").into_response();
    };

    // Status is read before the request is counted so a test that waits on
    // the count sees every counted request answered with the old status.
    let status = state.status.load(Ordering::SeqCst);
    let accepted = (200..300).contains(&status);
    let (samples, histograms) = request.timeseries.iter().fold((0u64, 0u64), |(s, h), t| {
        if t.histograms.is_empty() {
            (s + 1, h)
        } else {
            (s, h + t.histograms.len() as u64)
        }
    });
    let metadata = request.metadata.len() as u64;
    state.received.lock().push(ReceivedRequest {
        headers,
        request,
        status,
    });
    state.requests.fetch_add(1, Ordering::SeqCst);
    if accepted {
        state.accepted_samples.fetch_add(samples, Ordering::SeqCst);
        state
            .accepted_histograms
            .fetch_add(histograms, Ordering::SeqCst);
        state.accepted_metadata.fetch_add(metadata, Ordering::SeqCst);
    }

    let code = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = (code, "mock response\nsecond line").into_response();
    if let Some(value) = state.retry_after.lock().as_deref() {
        if let Ok(v) = HeaderValue::from_str(value) {
            response.headers_mut().insert(header::RETRY_AFTER, v);
        }
    }
    response
}

/// A float sample record for series `i` of metric `name`.
pub fn sample(name: &str, i: usize, ts: i64, value: f64) -> Box<TimeSeriesBinary> {
    let mut s = walqueue::series::pool::get_series();
    s.set_labels(&series_labels(name, i));
    s.ts = ts;
    s.value = value;
    s
}

pub fn series_labels(name: &str, i: usize) -> Labels {
    Labels::from_pairs([
        ("__name__", name.to_string()),
        ("series", i.to_string()),
    ])
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
