//! Query builder for listing queued records.
//!
//! Listing is read-only: it never takes or releases locks. Results are
//! ordered by id ascending (queue order) unless [`LocationQuery::newest_first`]
//! is set.
//!
//! # Example
//!
//! ```
//! use geotrack_store::{Store, LocationQuery};
//!
//! let store = Store::open_in_memory()?;
//!
//! let query = LocationQuery::new()
//!     .unlocked()
//!     .since(1_700_000_000_000)
//!     .limit(50);
//!
//! let records = store.query(&query)?;
//! assert!(records.is_empty());
//! # Ok::<(), geotrack_store::Error>(())
//! ```

/// Fluent query builder for queued records.
#[derive(Debug, Default, Clone)]
pub struct LocationQuery {
    /// Filter by lock state.
    pub locked: Option<bool>,
    /// Include records with `timestamp >= since` (epoch ms).
    pub since: Option<i64>,
    /// Include records with `timestamp <= until` (epoch ms).
    pub until: Option<i64>,
    /// Maximum number of results.
    pub limit: Option<u32>,
    /// Offset for pagination.
    pub offset: Option<u32>,
    /// Order by id descending.
    pub newest_first: bool,
}

impl LocationQuery {
    /// All records, oldest first.
    pub fn new() -> Self {
        Self::default()
    }

    /// Only records owned by an in-flight sync cycle.
    pub fn locked(mut self) -> Self {
        self.locked = Some(true);
        self
    }

    /// Only records waiting for upload.
    pub fn unlocked(mut self) -> Self {
        self.locked = Some(false);
        self
    }

    pub fn since(mut self, timestamp_ms: i64) -> Self {
        self.since = Some(timestamp_ms);
        self
    }

    pub fn until(mut self, timestamp_ms: i64) -> Self {
        self.until = Some(timestamp_ms);
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u32) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn newest_first(mut self) -> Self {
        self.newest_first = true;
        self
    }

    /// Build the SQL WHERE clause and parameters.
    pub(crate) fn build_where(&self) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
        let mut conditions = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(locked) = self.locked {
            conditions.push("locked = ?");
            params.push(Box::new(locked));
        }

        if let Some(since) = self.since {
            conditions.push("timestamp >= ?");
            params.push(Box::new(since));
        }

        if let Some(until) = self.until {
            conditions.push("timestamp <= ?");
            params.push(Box::new(until));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        (where_clause, params)
    }

    /// Build the full SQL query.
    pub(crate) fn build_sql(&self) -> String {
        let (where_clause, _) = self.build_where();
        let order = if self.newest_first { "DESC" } else { "ASC" };

        let mut sql = format!(
            "SELECT id, data, locked FROM locations {} ORDER BY id {}",
            where_clause, order
        );

        // SQLite needs a LIMIT before OFFSET
        match (self.limit, self.offset) {
            (Some(limit), Some(offset)) => {
                sql.push_str(&format!(" LIMIT {} OFFSET {}", limit, offset))
            }
            (Some(limit), None) => sql.push_str(&format!(" LIMIT {}", limit)),
            (None, Some(offset)) => sql.push_str(&format!(" LIMIT -1 OFFSET {}", offset)),
            (None, None) => {}
        }

        sql
    }
}
