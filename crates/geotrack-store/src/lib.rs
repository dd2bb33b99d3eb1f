//! Locking persistent queue for geotrack location records.
//!
//! Records wait here until the sync engine uploads them. Every row carries a
//! `locked` flag: a sync cycle takes ownership of a batch with
//! [`Store::select_and_lock`] and then either deletes it ([`Store::delete_all`])
//! or hands it back ([`Store::unlock`]). [`Store::unlock_all`] recovers rows
//! left behind by a cycle that failed mid-flight.
//!
//! # Example
//!
//! ```no_run
//! use geotrack_store::{LocationQuery, Store};
//!
//! let store = Store::open_default()?;
//!
//! let batch = store.select_and_lock(250)?;
//! let ids: Vec<i64> = batch.iter().map(|r| r.id).collect();
//! // ... upload ...
//! store.delete_all(&ids)?;
//!
//! let pending = store.query(&LocationQuery::new().unlocked().limit(10))?;
//! # Ok::<(), geotrack_store::Error>(())
//! ```

mod error;
mod models;
mod queries;
mod schema;
mod store;

pub use error::{Error, Result};
pub use models::QueueCounts;
pub use queries::LocationQuery;
pub use store::Store;

/// Default database path following platform conventions.
///
/// - Linux: `~/.local/share/geotrack/locations.db`
/// - macOS: `~/Library/Application Support/geotrack/locations.db`
/// - Windows: `C:\Users\<user>\AppData\Local\geotrack\locations.db`
pub fn default_db_path() -> std::path::PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join("geotrack")
        .join("locations.db")
}
