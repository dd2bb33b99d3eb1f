//! Tracking agent for the geotrack location pipeline.
//!
//! The agent wires [`geotrack_core`] to a replayed position source:
//! - Reads fixes as JSON lines from a file or stdin
//! - Queues them in the local SQLite database
//! - Uploads batches to the configured endpoint periodically, on new
//!   records and when connectivity returns
//! - Switches tracking on and off per the configured schedule
//!
//! # Configuration
//!
//! The agent reads configuration from `~/.config/geotrack/config.toml`:
//!
//! ```toml
//! [service]
//! event_buffer = 256
//! sync_interval_secs = 300
//!
//! [storage]
//! path = "~/.local/share/geotrack/locations.db"
//!
//! [tracking]
//! url = "https://example.com/locations"
//! distance_filter = 10.0
//! max_batch_size = 250
//! schedule = ["1-5 09:00-17:00"]
//!
//! [tracking.headers]
//! Authorization = "Bearer <token>"
//! ```

pub mod config;
pub mod replay;
pub mod runner;
pub mod state;

pub use config::{Config, ConfigError, ServiceConfig, StorageConfig, default_config_path};
pub use replay::ReplaySource;
pub use runner::{RunSummary, Runner};
pub use state::{AppState, PruneReport};
