//! `SQLite` schema definitions for rollcall.
//!
//! The queue is a single table of pending records. `metadata` holds small
//! key-value state such as the deferred-sync registration.

/// Pending attendance records, oldest first by `seq`.
///
/// `AUTOINCREMENT` keeps `seq` strictly increasing across deletes, so a
/// batch's snapshot token can never match a record appended later.
pub const CREATE_PENDING_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS pending_records (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    student_id TEXT,
    image TEXT NOT NULL,
    latitude REAL,
    longitude REAL,
    is_offline INTEGER NOT NULL DEFAULT 0,
    content_hash TEXT NOT NULL,
    enqueued_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
)
";

/// Key-value table for queue bookkeeping.
pub const CREATE_METADATA_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS metadata (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
";

/// Statements that make up schema version 1.
pub const V1_STATEMENTS: &[&str] = &[CREATE_PENDING_TABLE, CREATE_METADATA_TABLE];

/// Column list shared by every record query, in `row_to_record` order.
pub const RECORD_COLUMNS: &str =
    "seq, timestamp, student_id, image, latitude, longitude, is_offline, content_hash";
