//! Local durable store for rollcall.
//!
//! Pending attendance records are kept in an append-only `SQLite` queue that
//! survives restarts. Records leave the queue only after the server has
//! confirmed a batch containing them.

pub mod migrations;
pub mod schema;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::record::{timestamp_millis, AttendanceRecord, Location, StudentId};

use schema::RECORD_COLUMNS;

/// Metadata key holding the drain lease shared by every process using a
/// database file.
pub const DRAIN_LEASE_KEY: &str = "sync.lease";

/// Handles that are currently open, keyed by resolved database path.
fn open_stores() -> &'static Mutex<HashMap<PathBuf, Weak<StoreInner>>> {
    static STORES: OnceLock<Mutex<HashMap<PathBuf, Weak<StoreInner>>>> = OnceLock::new();
    STORES.get_or_init(|| Mutex::new(HashMap::new()))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
struct StoreInner {
    path: PathBuf,
    conn: Mutex<Connection>,
    draining: AtomicBool,
}

impl StoreInner {
    fn new(path: PathBuf, conn: Connection) -> Self {
        Self {
            path,
            conn: Mutex::new(conn),
            draining: AtomicBool::new(false),
        }
    }
}

/// Durable, ordered queue of pending attendance records.
///
/// `LocalStore` is a cheap, cloneable handle. Opening the same path again
/// while a handle is alive returns the same underlying connection, and every
/// operation is serialised through it, so `append` never interleaves with a
/// snapshot or a clear.
#[derive(Debug, Clone)]
pub struct LocalStore {
    inner: Arc<StoreInner>,
}

/// A snapshot of the queue taken at the start of a sync attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncBatch {
    records: Vec<AttendanceRecord>,
    through_seq: i64,
    digest: String,
}

impl SyncBatch {
    /// The records, in insertion order.
    #[must_use]
    pub fn records(&self) -> &[AttendanceRecord] {
        &self.records
    }

    /// Highest queue sequence number included in this batch.
    #[must_use]
    pub fn through_seq(&self) -> i64 {
        self.through_seq
    }

    /// BLAKE3 digest over the content hashes of every record in the batch.
    ///
    /// Identical batches produce identical digests, so the server can use it
    /// to recognise a retried submission.
    #[must_use]
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Number of records in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the batch is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Statistics about the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreStats {
    /// Number of records waiting to be synced.
    pub pending: i64,
    /// Capture time of the oldest pending record.
    pub oldest_pending: Option<DateTime<Utc>>,
    /// Capture time of the newest pending record.
    pub newest_pending: Option<DateTime<Utc>>,
    /// Size of the database file in bytes.
    pub db_size_bytes: u64,
}

impl LocalStore {
    /// Open or create the queue at the given path.
    ///
    /// Creates parent directories and the schema as needed. Calling this
    /// again for the same path while another handle is alive returns a clone
    /// of that handle.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StorageUnavailable`] if the directory or database
    /// cannot be created, opened, or initialised.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = resolve_path(path.as_ref())?;

        let mut stores = lock(open_stores());
        if let Some(inner) = stores.get(&path).and_then(Weak::upgrade) {
            debug!("Reusing open store at {}", path.display());
            return Ok(Self { inner });
        }

        debug!("Opening database at {}", path.display());
        let conn =
            Connection::open(&path).map_err(|source| Error::storage_unavailable(&path, source))?;

        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL; PRAGMA busy_timeout=5000;",
        )
        .map_err(|source| Error::storage_unavailable(&path, source))?;

        migrations::initialize_schema(&conn)
            .map_err(|err| Error::storage_unavailable(&path, err.to_string()))?;

        let inner = Arc::new(StoreInner::new(path.clone(), conn));
        stores.retain(|_, weak| weak.strong_count() > 0);
        stores.insert(path.clone(), Arc::downgrade(&inner));

        info!("Local store opened at {}", path.display());
        Ok(Self { inner })
    }

    /// Create a private in-memory store.
    ///
    /// # Errors
    ///
    /// Returns an error if the in-memory database cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|source| Error::storage_unavailable(":memory:", source))?;
        migrations::initialize_schema(&conn)?;

        Ok(Self {
            inner: Arc::new(StoreInner::new(PathBuf::from(":memory:"), conn)),
        })
    }

    /// Get the path to the database file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Whether two handles refer to the same underlying store.
    #[must_use]
    pub fn same_store(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        lock(&self.inner.conn)
    }

    /// Claim the right to drain this store.
    ///
    /// Succeeds for at most one holder at a time: handles in this process
    /// share a flag, and other processes are excluded by a lease row written
    /// inside an immediate transaction. The lease expires `ttl` after it is
    /// claimed so a crashed holder cannot block draining for good. Returns
    /// `None` while someone else holds it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WriteFailed`] if the lease cannot be written.
    pub fn try_claim_drain(&self, ttl: Duration) -> Result<Option<DrainLease>> {
        if self
            .inner
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(None);
        }

        match self.write_lease(ttl) {
            Ok(Some(holder)) => Ok(Some(DrainLease {
                store: self.clone(),
                holder,
            })),
            Ok(None) => {
                self.inner.draining.store(false, Ordering::Release);
                Ok(None)
            }
            Err(e) => {
                self.inner.draining.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    /// Whether a drain lease is held through this store right now.
    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.inner.draining.load(Ordering::Acquire)
    }

    fn write_lease(&self, ttl: Duration) -> Result<Option<String>> {
        let now = Utc::now();
        let ttl = TimeDelta::from_std(ttl).unwrap_or(TimeDelta::hours(1));

        let mut conn = self.conn();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(Error::WriteFailed)?;

        let current: Option<String> = tx
            .query_row(
                "SELECT value FROM metadata WHERE key = ?1",
                [DRAIN_LEASE_KEY],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(expires) = current.as_deref().and_then(lease_expiry) {
            if expires > now {
                debug!(%expires, "Drain lease held elsewhere");
                return Ok(None);
            }
            warn!(%expires, "Taking over an expired drain lease");
        }

        let holder = format!(
            "{}|{}",
            std::process::id(),
            (now + ttl).to_rfc3339_opts(SecondsFormat::Nanos, true)
        );
        tx.execute(
            "INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)",
            [DRAIN_LEASE_KEY, holder.as_str()],
        )
        .map_err(Error::WriteFailed)?;
        tx.commit().map_err(Error::WriteFailed)?;
        Ok(Some(holder))
    }

    /// Append a record to the end of the queue.
    ///
    /// The write is committed before this returns. Returns the record's
    /// queue sequence number.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WriteFailed`] if the write fails.
    pub fn append(&self, record: &AttendanceRecord) -> Result<i64> {
        let student_id = record
            .student_id
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let (latitude, longitude) = record
            .location
            .map_or((None, None), |loc| (Some(loc.latitude), Some(loc.longitude)));

        let conn = self.conn();
        conn.execute(
            r"
            INSERT INTO pending_records
                (timestamp, student_id, image, latitude, longitude, is_offline, content_hash)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ",
            params![
                record.timestamp_string(),
                student_id,
                record.image,
                latitude,
                longitude,
                record.is_offline,
                record.fingerprint(),
            ],
        )
        .map_err(Error::WriteFailed)?;

        let seq = conn.last_insert_rowid();
        debug!(seq, "Appended pending record");
        Ok(seq)
    }

    /// All pending records in insertion order.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn read_all(&self) -> Result<Vec<AttendanceRecord>> {
        let conn = self.conn();
        let rows = Self::read_rows(&conn)?;
        Ok(rows.into_iter().map(|row| row.record).collect())
    }

    /// Take a snapshot of the queue for one sync attempt.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn snapshot(&self) -> Result<SyncBatch> {
        let conn = self.conn();
        let rows = Self::read_rows(&conn)?;

        let mut hasher = blake3::Hasher::new();
        let through_seq = rows.last().map_or(0, |row| row.seq);
        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            hasher.update(row.content_hash.as_bytes());
            records.push(row.record);
        }

        Ok(SyncBatch {
            records,
            through_seq,
            digest: hasher.finalize().to_hex().to_string(),
        })
    }

    /// Remove the records covered by a batch.
    ///
    /// Records appended after the snapshot was taken have a higher sequence
    /// number and are left in place. Returns the number of records removed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WriteFailed`] if the delete fails.
    pub fn clear_batch(&self, batch: &SyncBatch) -> Result<usize> {
        let mut conn = self.conn();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(Error::WriteFailed)?;
        let removed = tx
            .execute(
                "DELETE FROM pending_records WHERE seq <= ?1",
                [batch.through_seq],
            )
            .map_err(Error::WriteFailed)?;
        tx.commit().map_err(Error::WriteFailed)?;

        debug!(removed, through_seq = batch.through_seq, "Cleared synced batch");
        Ok(removed)
    }

    /// Remove every pending record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WriteFailed`] if the delete fails.
    pub fn clear_all(&self) -> Result<usize> {
        let removed = self
            .conn()
            .execute("DELETE FROM pending_records", [])
            .map_err(Error::WriteFailed)?;
        if removed > 0 {
            info!(removed, "Cleared all pending records");
        }
        Ok(removed)
    }

    /// Count pending records.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn count(&self) -> Result<i64> {
        let count = self
            .conn()
            .query_row("SELECT COUNT(*) FROM pending_records", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Get queue statistics.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn stats(&self) -> Result<StoreStats> {
        let (pending, oldest, newest): (i64, Option<String>, Option<String>) =
            self.conn().query_row(
                "SELECT COUNT(*), MIN(timestamp), MAX(timestamp) FROM pending_records",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )?;

        let parse = |s: Option<String>| s.and_then(|s| timestamp_millis::parse(&s).ok());

        let db_size_bytes = if self.inner.path.as_os_str() == ":memory:" {
            0
        } else {
            std::fs::metadata(&self.inner.path).map_or(0, |m| m.len())
        };

        Ok(StoreStats {
            pending,
            oldest_pending: parse(oldest),
            newest_pending: parse(newest),
            db_size_bytes,
        })
    }

    /// Read a metadata value.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn()
            .query_row("SELECT value FROM metadata WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    /// Write a metadata value, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WriteFailed`] if the write fails.
    pub fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)",
                [key, value],
            )
            .map_err(Error::WriteFailed)?;
        Ok(())
    }

    /// Delete a metadata value only if it still equals `expected`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WriteFailed`] if the delete fails.
    pub fn delete_meta_if(&self, key: &str, expected: &str) -> Result<bool> {
        let affected = self
            .conn()
            .execute(
                "DELETE FROM metadata WHERE key = ?1 AND value = ?2",
                [key, expected],
            )
            .map_err(Error::WriteFailed)?;
        Ok(affected > 0)
    }

    fn read_rows(conn: &Connection) -> Result<Vec<StoredRow>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM pending_records ORDER BY seq ASC"
        ))?;
        let rows = stmt
            .query_map([], Self::row_to_record)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Convert a database row to a stored record.
    fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<StoredRow> {
        let seq: i64 = row.get(0)?;
        let timestamp_str: String = row.get(1)?;
        let student_id_json: Option<String> = row.get(2)?;
        let image: String = row.get(3)?;
        let latitude: Option<f64> = row.get(4)?;
        let longitude: Option<f64> = row.get(5)?;
        let is_offline: bool = row.get(6)?;
        let content_hash: String = row.get(7)?;

        let timestamp = timestamp_millis::parse(&timestamp_str)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(e)))?;

        let student_id = student_id_json
            .map(|raw| serde_json::from_str::<StudentId>(&raw))
            .transpose()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?;

        let location = match (latitude, longitude) {
            (Some(latitude), Some(longitude)) => Some(Location {
                latitude,
                longitude,
            }),
            _ => None,
        };

        Ok(StoredRow {
            seq,
            content_hash,
            record: AttendanceRecord {
                timestamp,
                student_id,
                image,
                location,
                is_offline,
            },
        })
    }
}

/// Exclusive right to drain a store, released on drop.
#[derive(Debug)]
pub struct DrainLease {
    store: LocalStore,
    holder: String,
}

impl Drop for DrainLease {
    fn drop(&mut self) {
        if let Err(e) = self.store.delete_meta_if(DRAIN_LEASE_KEY, &self.holder) {
            warn!(error = %e, "Could not release drain lease; it will expire");
        }
        self.store.inner.draining.store(false, Ordering::Release);
    }
}

/// Expiry encoded in a lease value of the form `<pid>|<rfc3339>`.
fn lease_expiry(value: &str) -> Option<DateTime<Utc>> {
    let (_, expires) = value.rsplit_once('|')?;
    DateTime::parse_from_rfc3339(expires)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

struct StoredRow {
    seq: i64,
    content_hash: String,
    record: AttendanceRecord,
}

/// Make the path absolute and create its parent directory.
///
/// The parent is canonicalised so different spellings of the same location
/// share one handle.
fn resolve_path(path: &Path) -> Result<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|source| Error::storage_unavailable(path, source))?
            .join(path)
    };

    let file_name = absolute
        .file_name()
        .ok_or_else(|| Error::storage_unavailable(&absolute, "path has no file name"))?
        .to_owned();
    let parent = absolute.parent().unwrap_or_else(|| Path::new("/"));

    if !parent.exists() {
        std::fs::create_dir_all(parent).map_err(|source| {
            Error::storage_unavailable(
                &absolute,
                Error::DirectoryCreate {
                    path: parent.to_path_buf(),
                    source,
                },
            )
        })?;
    }
    let parent = parent
        .canonicalize()
        .map_err(|source| Error::storage_unavailable(parent, source))?;

    Ok(parent.join(file_name))
}
