//! Offline-first location event pipeline.
//!
//! Raw position fixes flow through a [`Tracker`] into a persistent SQLite
//! queue and are uploaded in batches by a single-flight [`SyncEngine`]:
//!
//! - **Ingestion**: validation, duplicate filtering, odometer, retention
//! - **Motion**: MOVING/STATIONARY state with a stop timer and an elastic
//!   distance filter
//! - **Schedule**: weekly or date-based windows that switch tracking on and
//!   off
//! - **Sync**: batch upload over HTTP; failed batches are unlocked and
//!   retried on the next trigger
//!
//! Collaborators (position providers, activity recognition, connectivity)
//! plug in through the traits in [`traits`]. Every component publishes
//! [`TrackerEvent`]s on a shared [`EventDispatcher`].
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use geotrack_core::{EventDispatcher, HttpUploader, Tracker, TrackingConfig, shared};
//! use geotrack_store::Store;
//! use geotrack_types::RawFix;
//! use tokio::sync::Mutex;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(Mutex::new(Store::open_default()?));
//!     let config = shared(TrackingConfig {
//!         url: "https://example.com/locations".into(),
//!         enabled: true,
//!         ..Default::default()
//!     });
//!     let events = EventDispatcher::default();
//!     let tracker = Tracker::with_uploader(store, config, events, Arc::new(HttpUploader::new()));
//!
//!     tracker.accept(RawFix::new(52.52, 13.405).with_accuracy(8.0)).await?;
//!     tracker.sync_engine().sync().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod http;
pub mod ingest;
pub mod mock;
pub mod motion;
pub mod schedule;
pub mod scheduler;
pub mod sync;
pub mod traits;

pub use config::{FieldError, HttpMethod, SharedConfig, TrackingConfig, shared};
pub use error::{Error, Result, UploadError};
pub use events::{DiscardReason, EventDispatcher, EventReceiver, EventSender, TrackerEvent};
pub use http::{HttpUploader, UploadRequest, UploadResponse, Uploader, build_body};
pub use ingest::{AcceptOutcome, Tracker};
pub use motion::{MotionDetector, MotionHint};
pub use schedule::{Schedule, ScheduleError, ScheduleWindow, Transition, next_transition};
pub use scheduler::{Clock, ScheduleRunner, local_now};
pub use sync::{SharedStore, SyncEngine, SyncOutcome};
pub use traits::{MotionHintSource, NetworkMonitor, NetworkSignal, PositionSource};

// Re-export the sibling crates so downstream users need one dependency.
pub use geotrack_store as store;
pub use geotrack_types as types;
