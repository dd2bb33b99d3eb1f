//! Main store implementation.

use std::path::Path;
use std::time::Duration;

use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use geotrack_types::{LocationRecord, now_millis};

use crate::error::{Error, Result};
use crate::models::QueueCounts;
use crate::queries::LocationQuery;
use crate::schema;

/// Largest number of ids bound into one `IN (...)` statement.
const MAX_IDS_PER_STATEMENT: usize = 500;

const MILLIS_PER_DAY: i64 = 86_400_000;

/// SQLite-backed locking queue of location records.
///
/// Every mutating operation runs in its own transaction. Selection and
/// locking use an immediate transaction so two connections (or processes)
/// can never lock the same row.
#[derive(Debug)]
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| Error::CreateDirectory {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
            }
        }

        info!("Opening location queue at {}", path.display());
        let conn = Connection::open(path)?;

        // Concurrent lockers wait instead of failing with SQLITE_BUSY
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;

        schema::initialize(&conn)?;

        Ok(Self { conn })
    }

    /// Open the default database location.
    pub fn open_default() -> Result<Self> {
        Self::open(crate::default_db_path())
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::initialize(&conn)?;
        Ok(Self { conn })
    }

    fn immediate(&self) -> Result<Transaction<'_>> {
        Ok(Transaction::new_unchecked(
            &self.conn,
            TransactionBehavior::Immediate,
        )?)
    }
}

// Queue writes
impl Store {
    /// Insert a record as unlocked and return its uuid.
    ///
    /// A record without a uuid is assigned a fresh one.
    pub fn insert(&self, record: &LocationRecord) -> Result<String> {
        let mut record = record.clone();
        if record.uuid.is_empty() {
            record.uuid = uuid_v4();
        }
        let data = serde_json::to_string(&record)?;

        self.conn.execute(
            "INSERT INTO locations (uuid, timestamp, created_at, data, locked)
             VALUES (?1, ?2, ?3, ?4, 0)",
            rusqlite::params![
                record.uuid,
                record.timestamp,
                OffsetDateTime::now_utc().unix_timestamp(),
                data
            ],
        )?;

        debug!(
            "Queued location {} (id {})",
            record.uuid,
            self.conn.last_insert_rowid()
        );
        Ok(record.uuid)
    }

    /// Atomically take ownership of up to `limit` of the oldest unlocked records.
    ///
    /// The returned records carry `locked = true` and are ordered by id.
    pub fn select_and_lock(&self, limit: usize) -> Result<Vec<LocationRecord>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let tx = self.immediate()?;
        let mut records = {
            let mut stmt = tx.prepare(
                "SELECT id, data, locked FROM locations
                 WHERE locked = 0 ORDER BY id ASC LIMIT ?",
            )?;
            stmt.query_map([limit as i64], map_record)?
                .collect::<std::result::Result<Vec<_>, _>>()?
        };

        let ids: Vec<i64> = records.iter().map(|r| r.id).collect();
        let updated = update_in(&tx, "UPDATE locations SET locked = 1 WHERE id IN", &ids)?;
        tx.commit()?;

        if updated != ids.len() {
            warn!(
                "Locked {} of {} selected records",
                updated,
                ids.len()
            );
        }
        for record in &mut records {
            record.locked = true;
        }

        debug!("Locked {} records for sync", records.len());
        Ok(records)
    }

    /// Lock and return the single oldest unlocked record.
    pub fn first(&self) -> Result<Option<LocationRecord>> {
        Ok(self.select_and_lock(1)?.into_iter().next())
    }

    /// Release the given records.
    ///
    /// Returns true only when every id was updated; a mismatch means another
    /// party touched the rows.
    pub fn unlock(&self, ids: &[i64]) -> Result<bool> {
        if ids.is_empty() {
            return Ok(true);
        }

        let tx = self.conn.unchecked_transaction()?;
        let updated = update_in(&tx, "UPDATE locations SET locked = 0 WHERE id IN", ids)?;
        tx.commit()?;

        if updated != ids.len() {
            warn!("Unlock count mismatch: {} of {} records", updated, ids.len());
            return Ok(false);
        }
        debug!("Unlocked {} records", updated);
        Ok(true)
    }

    /// Delete the given records.
    ///
    /// Returns true only when every id was removed.
    pub fn delete_all(&self, ids: &[i64]) -> Result<bool> {
        if ids.is_empty() {
            return Ok(true);
        }

        let tx = self.conn.unchecked_transaction()?;
        let deleted = update_in(&tx, "DELETE FROM locations WHERE id IN", ids)?;
        tx.commit()?;

        if deleted != ids.len() {
            warn!("Delete count mismatch: {} of {} records", deleted, ids.len());
            return Ok(false);
        }
        debug!("Deleted {} records", deleted);
        Ok(true)
    }

    /// Clear every lock. Returns the number of rows released.
    pub fn unlock_all(&self) -> Result<usize> {
        let updated = self
            .conn
            .execute("UPDATE locations SET locked = 0 WHERE locked = 1", [])?;
        if updated > 0 {
            info!("Released {} stuck locks", updated);
        }
        Ok(updated)
    }

    /// Delete a single record by uuid.
    pub fn destroy(&self, uuid: &str) -> Result<bool> {
        let deleted = self
            .conn
            .execute("DELETE FROM locations WHERE uuid = ?", [uuid])?;
        Ok(deleted == 1)
    }

    /// Delete every record, locked or not.
    pub fn clear(&self) -> Result<usize> {
        let deleted = self.conn.execute("DELETE FROM locations", [])?;
        info!("Cleared {} records from the queue", deleted);
        Ok(deleted)
    }
}

// Retention
impl Store {
    /// Delete unlocked records older than `max_days` days.
    pub fn prune(&self, max_days: u32) -> Result<usize> {
        let cutoff = now_millis() - i64::from(max_days) * MILLIS_PER_DAY;
        self.prune_before(cutoff)
    }

    /// Delete unlocked records whose timestamp is before `cutoff_ms`.
    ///
    /// Locked rows belong to a sync cycle and are left alone.
    pub fn prune_before(&self, cutoff_ms: i64) -> Result<usize> {
        let deleted = self.conn.execute(
            "DELETE FROM locations WHERE timestamp < ? AND locked = 0",
            [cutoff_ms],
        )?;
        if deleted > 0 {
            info!("Pruned {} records older than {}", deleted, cutoff_ms);
        }
        Ok(deleted)
    }

    /// Keep only the newest `max_records` rows by id.
    ///
    /// Locked rows are never removed, so the queue can briefly exceed the
    /// limit while a batch is in flight.
    pub fn shrink(&self, max_records: u64) -> Result<usize> {
        let deleted = self.conn.execute(
            "DELETE FROM locations WHERE locked = 0 AND id <= (
                SELECT id FROM locations ORDER BY id DESC LIMIT 1 OFFSET ?
             )",
            [max_records as i64],
        )?;
        if deleted > 0 {
            info!("Shrunk queue by {} records (max {})", deleted, max_records);
        }
        Ok(deleted)
    }
}

// Reads
impl Store {
    /// Count records, optionally only those waiting for upload.
    pub fn count(&self, only_unlocked: bool) -> Result<u64> {
        let sql = if only_unlocked {
            "SELECT COUNT(*) FROM locations WHERE locked = 0"
        } else {
            "SELECT COUNT(*) FROM locations"
        };
        let count: i64 = self.conn.query_row(sql, [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Total, unlocked and locked counts in one pass.
    pub fn counts(&self) -> Result<QueueCounts> {
        let (total, locked): (i64, i64) = self.conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(locked), 0) FROM locations",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(QueueCounts {
            total: total as u64,
            unlocked: (total - locked) as u64,
            locked: locked as u64,
        })
    }

    /// Look up a record by uuid.
    pub fn get(&self, uuid: &str) -> Result<Option<LocationRecord>> {
        let record = self
            .conn
            .query_row(
                "SELECT id, data, locked FROM locations WHERE uuid = ?",
                [uuid],
                map_record,
            )
            .optional()?;
        Ok(record)
    }

    /// Every record in queue order.
    pub fn all(&self) -> Result<Vec<LocationRecord>> {
        self.query(&LocationQuery::new())
    }

    /// Query records with filters.
    pub fn query(&self, query: &LocationQuery) -> Result<Vec<LocationRecord>> {
        let sql = query.build_sql();
        let (_, params) = query.build_where();

        debug!("Executing query: {}", sql);

        let params_ref: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

        let mut stmt = self.conn.prepare(&sql)?;
        let records = stmt
            .query_map(params_ref.as_slice(), map_record)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(records)
    }
}

/// Run `<prefix> (?, ?, ...)` over `ids` in bounded chunks, summing affected rows.
fn update_in(conn: &Connection, prefix: &str, ids: &[i64]) -> Result<usize> {
    let mut affected = 0;
    for chunk in ids.chunks(MAX_IDS_PER_STATEMENT) {
        let placeholders = vec!["?"; chunk.len()].join(", ");
        let sql = format!("{} ({})", prefix, placeholders);
        affected += conn.execute(&sql, rusqlite::params_from_iter(chunk.iter()))?;
    }
    Ok(affected)
}

fn map_record(row: &Row<'_>) -> rusqlite::Result<LocationRecord> {
    let id: i64 = row.get(0)?;
    let data: String = row.get(1)?;
    let locked: bool = row.get(2)?;

    let mut record: LocationRecord = serde_json::from_str(&data)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(e)))?;
    record.id = id;
    record.locked = locked;
    Ok(record)
}

fn uuid_v4() -> String {
    uuid::Uuid::new_v4().to_string()
}
