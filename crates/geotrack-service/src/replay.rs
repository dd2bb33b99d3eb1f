//! JSON-lines position source.
//!
//! Each non-empty line is one [`RawFix`] as JSON, for example:
//!
//! ```text
//! {"timestamp": 1700000000000, "latitude": 52.52, "longitude": 13.405, "accuracy": 8.0}
//! {"latitude": 52.521, "longitude": 13.406, "speed": 1.4, "activity": {"type": "walking", "confidence": 80}}
//! ```

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};
use tracing::{debug, warn};

use geotrack_core::PositionSource;
use geotrack_types::RawFix;

/// Replays fixes from a line-oriented reader.
pub struct ReplaySource<R> {
    lines: Lines<R>,
    line_number: usize,
    interval: Option<Duration>,
    distance_filter: Option<f64>,
    skipped: usize,
}

impl<R: AsyncBufRead + Unpin + Send> ReplaySource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            line_number: 0,
            interval: None,
            distance_filter: None,
            skipped: 0,
        }
    }

    /// Pause between fixes.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    /// Lines that could not be parsed.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Distance filter most recently requested by the pipeline.
    pub fn distance_filter(&self) -> Option<f64> {
        self.distance_filter
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> PositionSource for ReplaySource<R> {
    async fn next_fix(&mut self) -> Option<RawFix> {
        loop {
            let line = match self.lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return None,
                Err(e) => {
                    warn!("Failed to read input: {}", e);
                    return None;
                }
            };
            self.line_number += 1;

            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            match serde_json::from_str::<RawFix>(line) {
                Ok(fix) => {
                    if let Some(interval) = self.interval {
                        tokio::time::sleep(interval).await;
                    }
                    return Some(fix);
                }
                Err(e) => {
                    self.skipped += 1;
                    warn!("Skipping line {}: {}", self.line_number, e);
                }
            }
        }
    }

    fn set_distance_filter(&mut self, meters: f64) {
        debug!("Replay distance filter set to {:.1} m", meters);
        self.distance_filter = Some(meters);
    }
}
