//! Test doubles for the pipeline's collaborators.
//!
//! - [`MockUploader`]: an [`Uploader`] with a configurable status, failure
//!   injection and simulated latency
//! - [`ScriptedPositionSource`] / [`ScriptedHintSource`]: replay a fixed
//!   sequence of fixes or hints

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use geotrack_types::RawFix;

use crate::error::UploadError;
use crate::http::{UploadRequest, UploadResponse, Uploader};
use crate::motion::MotionHint;
use crate::traits::{MotionHintSource, PositionSource};

/// An uploader that never touches the network.
///
/// # Example
///
/// ```
/// use geotrack_core::mock::MockUploader;
///
/// let uploader = MockUploader::new();
/// uploader.set_status(503);
/// assert_eq!(uploader.upload_count(), 0);
/// ```
#[derive(Debug)]
pub struct MockUploader {
    status: AtomicU16,
    body: Mutex<String>,
    should_fail: AtomicBool,
    /// Number of uploads to fail before succeeding (0 = use `should_fail`).
    remaining_failures: AtomicU32,
    latency_ms: AtomicU64,
    upload_count: AtomicU32,
    requests: Mutex<Vec<UploadRequest>>,
}

impl Default for MockUploader {
    fn default() -> Self {
        Self::new()
    }
}

impl MockUploader {
    /// Create an uploader that answers `200 OK`.
    pub fn new() -> Self {
        Self {
            status: AtomicU16::new(200),
            body: Mutex::new("OK".to_string()),
            should_fail: AtomicBool::new(false),
            remaining_failures: AtomicU32::new(0),
            latency_ms: AtomicU64::new(0),
            upload_count: AtomicU32::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn set_status(&self, status: u16) {
        self.status.store(status, Ordering::Relaxed);
    }

    pub fn set_body(&self, body: impl Into<String>) {
        if let Ok(mut guard) = self.body.lock() {
            *guard = body.into();
        }
    }

    /// Fail every upload with a transport error.
    pub fn set_should_fail(&self, fail: bool) {
        self.should_fail.store(fail, Ordering::Relaxed);
    }

    /// Fail the next `count` uploads with a transport error.
    pub fn set_fail_count(&self, count: u32) {
        self.remaining_failures.store(count, Ordering::Relaxed);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms.store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    /// Uploads attempted, including failed ones.
    pub fn upload_count(&self) -> u32 {
        self.upload_count.load(Ordering::Relaxed)
    }

    /// Every request received so far.
    pub fn requests(&self) -> Vec<UploadRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn last_request(&self) -> Option<UploadRequest> {
        self.requests.lock().ok().and_then(|r| r.last().cloned())
    }

    fn take_failure(&self) -> bool {
        let remaining = self.remaining_failures.load(Ordering::Relaxed);
        if remaining > 0 {
            self.remaining_failures.store(remaining - 1, Ordering::Relaxed);
            return true;
        }
        self.should_fail.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Uploader for MockUploader {
    async fn upload(&self, request: UploadRequest) -> Result<UploadResponse, UploadError> {
        self.upload_count.fetch_add(1, Ordering::Relaxed);

        let latency = self.latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }

        if self.take_failure() {
            return Err(UploadError::Network("mock connection refused".to_string()));
        }

        let body = self.body.lock().map(|b| b.clone()).unwrap_or_default();
        Ok(UploadResponse {
            status: self.status.load(Ordering::Relaxed),
            body,
        })
    }
}

/// Replays a fixed list of fixes.
#[derive(Debug, Default)]
pub struct ScriptedPositionSource {
    fixes: VecDeque<RawFix>,
    interval: Option<Duration>,
    distance_filters: Vec<f64>,
}

impl ScriptedPositionSource {
    pub fn new(fixes: impl IntoIterator<Item = RawFix>) -> Self {
        Self {
            fixes: fixes.into_iter().collect(),
            ..Default::default()
        }
    }

    /// Wait `interval` before each fix.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    pub fn remaining(&self) -> usize {
        self.fixes.len()
    }

    /// Distance filters applied so far, in order.
    pub fn distance_filters(&self) -> &[f64] {
        &self.distance_filters
    }
}

#[async_trait]
impl PositionSource for ScriptedPositionSource {
    async fn next_fix(&mut self) -> Option<RawFix> {
        if let Some(interval) = self.interval {
            if !self.fixes.is_empty() {
                tokio::time::sleep(interval).await;
            }
        }
        self.fixes.pop_front()
    }

    fn set_distance_filter(&mut self, meters: f64) {
        self.distance_filters.push(meters);
    }
}

/// Replays a fixed list of motion hints.
#[derive(Debug, Default)]
pub struct ScriptedHintSource {
    hints: VecDeque<MotionHint>,
}

impl ScriptedHintSource {
    pub fn new(hints: impl IntoIterator<Item = MotionHint>) -> Self {
        Self {
            hints: hints.into_iter().collect(),
        }
    }
}

#[async_trait]
impl MotionHintSource for ScriptedHintSource {
    async fn next_hint(&mut self) -> Option<MotionHint> {
        self.hints.pop_front()
    }
}
