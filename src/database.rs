//! Persistence adapter: document-collection semantics over SQLite.
//!
//! This module provides a thread-safe interface for:
//! - Storing raw frames and normalized records per device type
//! - The device allow-list consulted at login
//! - Periodic flushing of data to disk
//!
//! Collections are routed by device type: raw frames go to `raw_<type>`,
//! normalized records to `records_<type>`, with `<type>` lower-cased and
//! stripped to `[a-z0-9]`. Every row is `(imei, timestamp, doc)` where
//! `doc` is the canonical JSON document; the indexed columns exist only
//! for routing and ordering. The unique composite index on
//! `(timestamp, imei)` enforces record idempotence across replays:
//! duplicate inserts are classified as success.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, Transaction};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::{Duration, Instant};
use tracing::{debug, error, info};

use crate::config::DatabaseConfig;
use crate::errors::AvlRecorderError;
use crate::models::{iso_millis, Device, Imei, RawFrame, Record};

/// A guard that ensures proper shutdown of database background tasks.
///
/// When dropped, this guard ensures that:
/// - Background flush task is terminated gracefully
/// - All pending writes are flushed to disk
#[derive(Debug)]
pub struct DbDropGuard {
    /// The `Db` instance that will be shut down when this guard drops
    db: Db,
}

/// Thread-safe store handle.
///
/// This type is cloneable and can be shared between connection tasks and
/// the HTTP surface. It provides a safe interface to the underlying
/// database while managing concurrent access and periodic maintenance.
#[derive(Clone, Debug)]
pub struct Db {
    /// Handle to shared state
    shared: Arc<Shared>,
}

/// Shared state protected by a mutex
///
/// Uses std::sync::Mutex instead of tokio::sync::Mutex because:
/// - Critical sections are short
/// - No async operations are performed while holding the lock
/// - Operations are CPU-bound rather than IO-bound
#[derive(Debug)]
struct Shared {
    /// The database state protected by a mutex
    state: Mutex<DatabaseState>,
    /// Notifies the background task for flushing
    background_task: Notify,
}

/// Database connection and configuration state
#[derive(Debug)]
struct DatabaseState {
    /// Active SQLite connection
    connection: Connection,
    /// Database configuration parameters
    config: DatabaseConfig,
    /// Per-type collections whose tables are known to exist
    collections: HashSet<String>,
    /// Timestamp of last flush operation
    last_flush: Instant,
    /// Flag indicating shutdown state
    shutdown: bool,
}

/// Transaction error wrapper for better context
#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("Failed to execute transaction: {context}")]
    Execute {
        context: String,
        #[source]
        source: rusqlite::Error,
    },
    #[error("Failed to commit transaction: {context}")]
    Commit {
        context: String,
        #[source]
        source: rusqlite::Error,
    },
}

/// Collection routing: lower-case, `[a-z0-9]` only.
pub fn collection_suffix(modem_type: &str) -> String {
    let suffix: String = modem_type
        .chars()
        .filter_map(|c| {
            let c = c.to_ascii_lowercase();
            c.is_ascii_alphanumeric().then_some(c)
        })
        .collect();
    if suffix.is_empty() {
        "unknown".to_string()
    } else {
        suffix
    }
}

impl DbDropGuard {
    /// Creates a new store with the specified configuration.
    ///
    /// # Errors
    /// Returns error if the database file cannot be opened or the base
    /// tables and indices cannot be created.
    pub fn new(config: DatabaseConfig) -> Result<Self, AvlRecorderError> {
        Ok(DbDropGuard {
            db: Db::new(config)?,
        })
    }

    /// Gets a handle to the store.
    ///
    /// The returned handle is cheap to clone and can be shared between
    /// tasks; all clones share the underlying connection and state.
    pub fn db(&self) -> Db {
        self.db.clone()
    }
}

impl Drop for DbDropGuard {
    fn drop(&mut self) {
        self.db.shutdown();
    }
}

pub struct DbBuilder {
    path: Option<PathBuf>,
    flush_interval: Option<Duration>,
}

impl DbBuilder {
    pub fn new() -> Self {
        Self {
            path: None,
            flush_interval: None,
        }
    }

    pub fn path(mut self, path: PathBuf) -> Self {
        self.path = Some(path);
        self
    }

    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = Some(interval);
        self
    }

    pub fn build(self) -> Result<DbDropGuard, AvlRecorderError> {
        let path = self
            .path
            .unwrap_or_else(|| PathBuf::from("avl-recorder.db"));
        let flush_interval = self.flush_interval.unwrap_or(Duration::from_secs(10));

        let config = DatabaseConfig {
            path,
            flush_interval,
        };

        DbDropGuard::new(config)
    }
}

impl Default for DbBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl Db {
    /// Create a new store handle
    fn new(config: DatabaseConfig) -> Result<Self, AvlRecorderError> {
        config.validate()?;

        info!(
            "Initializing database: path={}, flush_interval={:?}",
            config.path.display(),
            config.flush_interval
        );

        let conn = DatabaseState::open_database(&config.path)?;
        DatabaseState::create_base_tables(&conn)?;

        let shared = Arc::new(Shared {
            state: Mutex::new(DatabaseState {
                connection: conn,
                config,
                collections: HashSet::new(),
                last_flush: Instant::now(),
                shutdown: false,
            }),
            background_task: Notify::new(),
        });

        // Synchronous callers (tests, admin tools) have no runtime; the
        // periodic checkpoint simply doesn't run for them.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(background_flush(shared.clone()));
        }

        Ok(Self { shared })
    }

    /// Insert a normalized record; duplicates of `(timestamp, imei)` are
    /// skipped silently and reported as success.
    pub fn insert_record(&self, modem_type: &str, record: &Record) -> Result<(), AvlRecorderError> {
        self.shared
            .execute_mut(|state| state.insert_record(modem_type, record))
    }

    /// Append a captured raw frame.
    pub fn insert_raw(&self, frame: &RawFrame) -> Result<(), AvlRecorderError> {
        self.shared.execute_mut(|state| state.insert_raw(frame))
    }

    /// Records in `[from, to]`, oldest first.
    pub fn find_range(
        &self,
        modem_type: &str,
        imei: &Imei,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Record>, AvlRecorderError> {
        self.shared
            .execute_mut(|state| state.find_range(modem_type, imei, from, to))
    }

    /// Newest records first, with paging.
    pub fn find_recent(
        &self,
        modem_type: &str,
        imei: &Imei,
        limit: u32,
        skip: u32,
    ) -> Result<Vec<Record>, AvlRecorderError> {
        self.shared
            .execute_mut(|state| state.find_recent(modem_type, imei, limit, skip))
    }

    /// The newest record, if any.
    pub fn find_latest(
        &self,
        modem_type: &str,
        imei: &Imei,
    ) -> Result<Option<Record>, AvlRecorderError> {
        self.shared
            .execute_mut(|state| Ok(state.find_recent(modem_type, imei, 1, 0)?.into_iter().next()))
    }

    /// Newest raw frames first.
    pub fn find_raw_recent(
        &self,
        modem_type: &str,
        imei: &Imei,
        limit: u32,
    ) -> Result<Vec<RawFrame>, AvlRecorderError> {
        self.shared
            .execute_mut(|state| state.find_raw_recent(modem_type, imei, limit))
    }

    pub fn count_records(&self, modem_type: &str, imei: &Imei) -> Result<u64, AvlRecorderError> {
        self.shared
            .execute_mut(|state| state.count_records(modem_type, imei, None))
    }

    pub fn count_records_since(
        &self,
        modem_type: &str,
        imei: &Imei,
        since: DateTime<Utc>,
    ) -> Result<u64, AvlRecorderError> {
        self.shared
            .execute_mut(|state| state.count_records(modem_type, imei, Some(since)))
    }

    pub fn get_device(&self, imei: &Imei) -> Result<Option<Device>, AvlRecorderError> {
        self.shared.execute_mut(|state| state.get_device(imei))
    }

    /// All devices, most recently seen first.
    pub fn list_devices(&self) -> Result<Vec<Device>, AvlRecorderError> {
        self.shared.execute_mut(|state| state.list_devices())
    }

    /// Insert a new device; fails with `DeviceExists` on a known IMEI.
    pub fn create_device(&self, device: &Device) -> Result<(), AvlRecorderError> {
        self.shared
            .execute_mut(|state| state.create_device(device))
    }

    /// Insert or replace a device document.
    pub fn upsert_device(&self, device: &Device) -> Result<(), AvlRecorderError> {
        self.shared
            .execute_mut(|state| state.upsert_device(device))
    }

    pub fn delete_device(&self, imei: &Imei) -> Result<bool, AvlRecorderError> {
        self.shared.execute_mut(|state| state.delete_device(imei))
    }

    /// Refresh `lastSeen` on an accepted frame.
    pub fn touch_last_seen(
        &self,
        imei: &Imei,
        now: DateTime<Utc>,
    ) -> Result<(), AvlRecorderError> {
        self.shared.execute_mut(|state| {
            state.modify_device(imei, |device| {
                device.last_seen = Some(now);
                device.updated_at = now;
            })
        })
    }

    /// Persist a VIN observed in the record stream.
    pub fn record_vin(
        &self,
        imei: &Imei,
        vin: &str,
        now: DateTime<Utc>,
    ) -> Result<(), AvlRecorderError> {
        self.shared.execute_mut(|state| {
            state.modify_device(imei, |device| {
                if device.vin.as_deref() != Some(vin) {
                    device.vin = Some(vin.to_string());
                    device.updated_at = now;
                }
            })
        })
    }

    /// Explicitly flush database
    pub fn flush(&self) -> Result<(), AvlRecorderError> {
        self.shared.execute_mut(|state| state.flush())
    }

    /// Signal the background task to shut down
    fn shutdown(&self) {
        if let Ok(mut state) = self.shared.state.lock() {
            state.shutdown = true;
        }
        self.shared.background_task.notify_one();
    }
}

impl Shared {
    /// Perform flush operation while holding the lock
    fn perform_flush(&self) -> Option<Instant> {
        let mut state = self.state.lock().unwrap();
        if state.shutdown {
            return None;
        }

        if state.should_flush() {
            if let Err(e) = state.flush() {
                error!("Flush error: {}", e);
            }
        }
        Some(state.next_flush_time())
    }

    /// Check if the database is shutting down
    fn is_shutdown(&self) -> bool {
        self.state.lock().unwrap().shutdown
    }

    /// Execute a query that requires mutable access to the database
    fn execute_mut<F, T>(&self, f: F) -> Result<T, AvlRecorderError>
    where
        F: FnOnce(&mut DatabaseState) -> Result<T, AvlRecorderError>,
    {
        let mut state = self
            .state
            .lock()
            .map_err(|e| AvlRecorderError::LockError(e.to_string()))?;
        f(&mut state)
    }
}

impl DatabaseState {
    /// Open or create the database with optimized settings
    fn open_database(path: &Path) -> Result<Connection, AvlRecorderError> {
        info!("Opening database at {}", path.display());
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_CREATE | OpenFlags::SQLITE_OPEN_READ_WRITE,
        )
        .map_err(|e| AvlRecorderError::DatabaseOpenError {
            path: path.to_path_buf(),
            origin: e.to_string(),
        })?;

        // Configure for performance
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| AvlRecorderError::DatabaseConfigError {
                message: "Failed to set journal_mode".to_string(),
                origin: e.to_string(),
            })?;

        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|e| AvlRecorderError::DatabaseConfigError {
                message: "Failed to set synchronous mode".to_string(),
                origin: e.to_string(),
            })?;

        conn.pragma_update(None, "temp_store", "MEMORY")
            .map_err(|e| AvlRecorderError::DatabaseConfigError {
                message: "Failed to set temp_store".to_string(),
                origin: e.to_string(),
            })?;
        Ok(conn)
    }

    /// Create the shared `devices` collection and its unique IMEI index.
    fn create_base_tables(conn: &Connection) -> Result<(), AvlRecorderError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS devices (
                imei TEXT NOT NULL,
                last_seen TEXT,
                doc TEXT NOT NULL
            )",
            [],
        )
        .map_err(|e| AvlRecorderError::TableCreationError {
            table: "devices".to_string(),
            origin: e.to_string(),
        })?;

        conn.execute(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_devices_imei ON devices(imei)",
            [],
        )
        .map_err(|e| AvlRecorderError::IndexCreationError {
            index: "idx_devices_imei".to_string(),
            origin: e.to_string(),
        })?;

        Ok(())
    }

    /// Create the per-type record and raw tables on first use.
    fn ensure_collections(&mut self, suffix: &str) -> Result<(), AvlRecorderError> {
        if self.collections.contains(suffix) {
            return Ok(());
        }

        let records = format!("records_{suffix}");
        let raw = format!("raw_{suffix}");

        for table in [&records, &raw] {
            self.connection
                .execute(
                    &format!(
                        "CREATE TABLE IF NOT EXISTS {table} (
                            imei TEXT NOT NULL,
                            timestamp TEXT NOT NULL,
                            doc TEXT NOT NULL
                        )"
                    ),
                    [],
                )
                .map_err(|e| AvlRecorderError::TableCreationError {
                    table: table.to_string(),
                    origin: e.to_string(),
                })?;
        }

        // Idempotence across replays hangs on this unique composite.
        self.connection
            .execute(
                &format!(
                    "CREATE UNIQUE INDEX IF NOT EXISTS idx_{records}_ts_imei
                     ON {records}(timestamp, imei)"
                ),
                [],
            )
            .map_err(|e| AvlRecorderError::IndexCreationError {
                index: format!("idx_{records}_ts_imei"),
                origin: e.to_string(),
            })?;

        for table in [&records, &raw] {
            self.connection
                .execute(
                    &format!(
                        "CREATE INDEX IF NOT EXISTS idx_{table}_imei_ts
                         ON {table}(imei, timestamp DESC)"
                    ),
                    [],
                )
                .map_err(|e| AvlRecorderError::IndexCreationError {
                    index: format!("idx_{table}_imei_ts"),
                    origin: e.to_string(),
                })?;
        }

        self.collections.insert(suffix.to_string());
        Ok(())
    }

    /// Check if it's time to flush
    fn should_flush(&self) -> bool {
        self.last_flush.elapsed() >= self.config.flush_interval
    }

    /// Calculate next flush time
    fn next_flush_time(&self) -> Instant {
        self.last_flush + self.config.flush_interval
    }

    /// Execute an operation within a transaction
    fn with_transaction<F, T>(&mut self, context: &str, f: F) -> Result<T, AvlRecorderError>
    where
        F: FnOnce(&Transaction) -> Result<T, AvlRecorderError>,
    {
        let tx = self.connection.transaction().map_err(|e| {
            AvlRecorderError::DatabaseTransactionError(TransactionError::Execute {
                context: format!("{}: failed to start transaction", context),
                source: e,
            })
        })?;

        let result = f(&tx)?;

        tx.commit().map_err(|e| {
            AvlRecorderError::DatabaseTransactionError(TransactionError::Commit {
                context: format!("{}: failed to commit", context),
                source: e,
            })
        })?;

        Ok(result)
    }

    fn insert_record(&mut self, modem_type: &str, record: &Record) -> Result<(), AvlRecorderError> {
        let suffix = collection_suffix(modem_type);
        self.ensure_collections(&suffix)?;
        let doc = serde_json::to_string(record)?;
        let changed = self.connection.execute(
            &format!(
                "INSERT OR IGNORE INTO records_{suffix} (imei, timestamp, doc)
                 VALUES (?1, ?2, ?3)"
            ),
            params![
                record.imei.as_str(),
                iso_millis::to_string(&record.timestamp),
                doc
            ],
        )?;
        if changed == 0 {
            debug!(
                imei = %record.imei,
                timestamp = %iso_millis::to_string(&record.timestamp),
                "Duplicate record skipped"
            );
        }
        Ok(())
    }

    fn insert_raw(&mut self, frame: &RawFrame) -> Result<(), AvlRecorderError> {
        let suffix = collection_suffix(&frame.modem_type);
        self.ensure_collections(&suffix)?;
        let doc = serde_json::to_string(frame)?;
        self.connection.execute(
            &format!("INSERT INTO raw_{suffix} (imei, timestamp, doc) VALUES (?1, ?2, ?3)"),
            params![
                frame.imei.as_str(),
                iso_millis::to_string(&frame.timestamp),
                doc
            ],
        )?;
        Ok(())
    }

    fn find_range(
        &mut self,
        modem_type: &str,
        imei: &Imei,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Record>, AvlRecorderError> {
        let suffix = collection_suffix(modem_type);
        self.ensure_collections(&suffix)?;
        let mut stmt = self.connection.prepare(&format!(
            "SELECT doc FROM records_{suffix}
             WHERE imei = ?1 AND timestamp >= ?2 AND timestamp <= ?3
             ORDER BY timestamp ASC"
        ))?;
        let rows = stmt.query_map(
            params![
                imei.as_str(),
                iso_millis::to_string(&from),
                iso_millis::to_string(&to)
            ],
            |row| row.get::<_, String>(0),
        )?;
        collect_docs(rows)
    }

    fn find_recent(
        &mut self,
        modem_type: &str,
        imei: &Imei,
        limit: u32,
        skip: u32,
    ) -> Result<Vec<Record>, AvlRecorderError> {
        let suffix = collection_suffix(modem_type);
        self.ensure_collections(&suffix)?;
        let mut stmt = self.connection.prepare(&format!(
            "SELECT doc FROM records_{suffix}
             WHERE imei = ?1
             ORDER BY timestamp DESC
             LIMIT ?2 OFFSET ?3"
        ))?;
        let rows = stmt.query_map(params![imei.as_str(), limit, skip], |row| {
            row.get::<_, String>(0)
        })?;
        collect_docs(rows)
    }

    fn find_raw_recent(
        &mut self,
        modem_type: &str,
        imei: &Imei,
        limit: u32,
    ) -> Result<Vec<RawFrame>, AvlRecorderError> {
        let suffix = collection_suffix(modem_type);
        self.ensure_collections(&suffix)?;
        let mut stmt = self.connection.prepare(&format!(
            "SELECT doc FROM raw_{suffix}
             WHERE imei = ?1
             ORDER BY timestamp DESC
             LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![imei.as_str(), limit], |row| {
            row.get::<_, String>(0)
        })?;
        collect_docs(rows)
    }

    fn count_records(
        &mut self,
        modem_type: &str,
        imei: &Imei,
        since: Option<DateTime<Utc>>,
    ) -> Result<u64, AvlRecorderError> {
        let suffix = collection_suffix(modem_type);
        self.ensure_collections(&suffix)?;
        let count: i64 = match since {
            Some(since) => self.connection.query_row(
                &format!(
                    "SELECT COUNT(*) FROM records_{suffix}
                     WHERE imei = ?1 AND timestamp >= ?2"
                ),
                params![imei.as_str(), iso_millis::to_string(&since)],
                |row| row.get(0),
            )?,
            None => self.connection.query_row(
                &format!("SELECT COUNT(*) FROM records_{suffix} WHERE imei = ?1"),
                params![imei.as_str()],
                |row| row.get(0),
            )?,
        };
        Ok(count as u64)
    }

    fn get_device(&mut self, imei: &Imei) -> Result<Option<Device>, AvlRecorderError> {
        let mut stmt = self
            .connection
            .prepare("SELECT doc FROM devices WHERE imei = ?1")?;
        let mut rows = stmt.query_map(params![imei.as_str()], |row| row.get::<_, String>(0))?;
        match rows.next() {
            Some(doc) => Ok(Some(serde_json::from_str(&doc?)?)),
            None => Ok(None),
        }
    }

    fn list_devices(&mut self) -> Result<Vec<Device>, AvlRecorderError> {
        let mut stmt = self.connection.prepare(
            "SELECT doc FROM devices ORDER BY last_seen IS NULL, last_seen DESC, imei ASC",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        collect_docs(rows)
    }

    fn create_device(&mut self, device: &Device) -> Result<(), AvlRecorderError> {
        let doc = serde_json::to_string(device)?;
        let result = self.connection.execute(
            "INSERT INTO devices (imei, last_seen, doc) VALUES (?1, ?2, ?3)",
            params![
                device.imei.as_str(),
                device.last_seen.map(|ts| iso_millis::to_string(&ts)),
                doc
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(AvlRecorderError::DeviceExists(
                    device.imei.as_str().to_string(),
                ))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn upsert_device(&mut self, device: &Device) -> Result<(), AvlRecorderError> {
        let doc = serde_json::to_string(device)?;
        self.connection.execute(
            "INSERT INTO devices (imei, last_seen, doc) VALUES (?1, ?2, ?3)
             ON CONFLICT(imei) DO UPDATE SET
                 last_seen = excluded.last_seen,
                 doc = excluded.doc",
            params![
                device.imei.as_str(),
                device.last_seen.map(|ts| iso_millis::to_string(&ts)),
                doc
            ],
        )?;
        Ok(())
    }

    fn delete_device(&mut self, imei: &Imei) -> Result<bool, AvlRecorderError> {
        let changed = self
            .connection
            .execute("DELETE FROM devices WHERE imei = ?1", params![imei.as_str()])?;
        Ok(changed > 0)
    }

    /// Read-modify-write of a device document in one transaction.
    fn modify_device<F>(&mut self, imei: &Imei, f: F) -> Result<(), AvlRecorderError>
    where
        F: FnOnce(&mut Device),
    {
        self.with_transaction("modify_device", |tx| {
            let doc: Option<String> = tx
                .query_row(
                    "SELECT doc FROM devices WHERE imei = ?1",
                    params![imei.as_str()],
                    |row| row.get(0),
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    e => Err(AvlRecorderError::from(e)),
                })?;

            let Some(doc) = doc else {
                return Err(AvlRecorderError::DeviceNotFound(imei.as_str().to_string()));
            };

            let mut device: Device = serde_json::from_str(&doc)?;
            f(&mut device);

            tx.execute(
                "UPDATE devices SET last_seen = ?2, doc = ?3 WHERE imei = ?1",
                params![
                    imei.as_str(),
                    device.last_seen.map(|ts| iso_millis::to_string(&ts)),
                    serde_json::to_string(&device)?
                ],
            )?;
            Ok(())
        })
    }

    /// Explicitly flush database
    fn flush(&mut self) -> Result<(), AvlRecorderError> {
        self.connection
            .pragma_update(None, "wal_checkpoint", "PASSIVE")?;
        self.last_flush = Instant::now();
        Ok(())
    }
}

fn collect_docs<T, I>(rows: I) -> Result<Vec<T>, AvlRecorderError>
where
    T: serde::de::DeserializeOwned,
    I: Iterator<Item = Result<String, rusqlite::Error>>,
{
    let mut out = Vec::new();
    for doc in rows {
        out.push(serde_json::from_str(&doc?)?);
    }
    Ok(out)
}

/// Background task that handles periodic flushing
async fn background_flush(shared: Arc<Shared>) {
    while !shared.is_shutdown() {
        if let Some(next_flush) = shared.perform_flush() {
            tokio::select! {
                _ = tokio::time::sleep_until(next_flush) => {}
                _ = shared.background_task.notified() => {}
            }
        } else {
            shared.background_task.notified().await;
        }
    }
    debug!("Background flush task shut down");
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::TimeZone;
    use tempfile::tempdir;

    use crate::models::{GpsPosition, IoValue};

    use super::*;

    /// Helper function to create a test database
    fn setup_test_db() -> Result<(tempfile::TempDir, Db), AvlRecorderError> {
        let temp_dir = tempdir().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let db_guard = DbBuilder::new().path(db_path).build()?;
        Ok((temp_dir, db_guard.db()))
    }

    fn imei() -> Imei {
        Imei::try_from("864275079658715").unwrap()
    }

    fn record_at(second: u32) -> Record {
        Record {
            imei: imei(),
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, second).unwrap(),
            priority: 0,
            gps: GpsPosition {
                latitude: 44.0,
                longitude: 26.0,
                altitude: 100,
                angle: 90,
                satellites: 9,
                speed: 50,
            },
            io_elements: vec![],
            fields: BTreeMap::from([("ignition".to_string(), IoValue::Unsigned(1))]),
        }
    }

    #[test]
    fn duplicate_record_insert_is_success() -> Result<(), AvlRecorderError> {
        let (_tmp, db) = setup_test_db()?;
        let record = record_at(0);
        db.insert_record("FMC003", &record)?;
        db.insert_record("FMC003", &record)?;
        assert_eq!(db.count_records("FMC003", &imei())?, 1);
        Ok(())
    }

    #[test]
    fn range_query_is_oldest_first() -> Result<(), AvlRecorderError> {
        let (_tmp, db) = setup_test_db()?;
        for second in [30u32, 10, 20] {
            db.insert_record("FMC003", &record_at(second))?;
        }
        let from = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let to = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 25).unwrap();
        let records = db.find_range("FMC003", &imei(), from, to)?;
        let seconds: Vec<u32> = records
            .iter()
            .map(|r| r.timestamp.timestamp() as u32 % 60)
            .collect();
        assert_eq!(seconds, vec![10, 20]);
        Ok(())
    }

    #[test]
    fn recent_query_is_newest_first_with_paging() -> Result<(), AvlRecorderError> {
        let (_tmp, db) = setup_test_db()?;
        for second in 0..5u32 {
            db.insert_record("FMC003", &record_at(second))?;
        }
        let page = db.find_recent("FMC003", &imei(), 2, 1)?;
        let seconds: Vec<u32> = page
            .iter()
            .map(|r| r.timestamp.timestamp() as u32 % 60)
            .collect();
        assert_eq!(seconds, vec![3, 2]);

        let latest = db.find_latest("FMC003", &imei())?.unwrap();
        assert_eq!(latest.timestamp.timestamp() % 60, 4);
        Ok(())
    }

    #[test]
    fn collection_routing_sanitizes_type() {
        assert_eq!(collection_suffix("FMC003"), "fmc003");
        assert_eq!(collection_suffix("FMB-920 rev2"), "fmb920rev2");
        assert_eq!(collection_suffix("///"), "unknown");
    }

    #[test]
    fn device_create_conflicts_on_duplicate() -> Result<(), AvlRecorderError> {
        let (_tmp, db) = setup_test_db()?;
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let device = Device::new(imei(), now);
        db.create_device(&device)?;
        match db.create_device(&device) {
            Err(AvlRecorderError::DeviceExists(reported)) => {
                assert_eq!(reported, "864275079658715")
            }
            other => panic!("unexpected {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn touch_last_seen_orders_device_list() -> Result<(), AvlRecorderError> {
        let (_tmp, db) = setup_test_db()?;
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let first = Imei::try_from("864275079658715").unwrap();
        let second = Imei::try_from("356307042441013").unwrap();
        db.create_device(&Device::new(first.clone(), now))?;
        db.create_device(&Device::new(second.clone(), now))?;

        db.touch_last_seen(&first, now + chrono::Duration::seconds(10))?;
        db.touch_last_seen(&second, now + chrono::Duration::seconds(20))?;

        let devices = db.list_devices()?;
        assert_eq!(devices[0].imei, second);
        assert_eq!(devices[1].imei, first);
        Ok(())
    }

    #[test]
    fn vin_recorded_once_observed() -> Result<(), AvlRecorderError> {
        let (_tmp, db) = setup_test_db()?;
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        db.create_device(&Device::new(imei(), now))?;
        db.record_vin(&imei(), "WVWZZZ1JZ3W386752", now)?;
        let device = db.get_device(&imei())?.unwrap();
        assert_eq!(device.vin.as_deref(), Some("WVWZZZ1JZ3W386752"));
        Ok(())
    }

    #[test]
    fn modify_missing_device_is_not_found() -> Result<(), AvlRecorderError> {
        let (_tmp, db) = setup_test_db()?;
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        match db.touch_last_seen(&imei(), now) {
            Err(AvlRecorderError::DeviceNotFound(_)) => Ok(()),
            other => panic!("unexpected {other:?}"),
        }
    }
}
