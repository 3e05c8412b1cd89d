//! Schema versioning for the local queue.
//!
//! The version lives in `PRAGMA user_version`; each step runs inside its own
//! transaction so a crash mid-upgrade leaves the previous version intact.

use rusqlite::Connection;
use tracing::info;

use crate::error::{Error, Result};

use super::schema::V1_STATEMENTS;

/// The current schema version.
pub const CURRENT_VERSION: i32 = 1;

/// Bring the database up to [`CURRENT_VERSION`].
///
/// Safe to call on every open.
///
/// # Errors
///
/// Returns an error if the database is newer than this build or a step fails.
pub fn initialize_schema(conn: &Connection) -> Result<()> {
    let version = schema_version(conn)?;
    if version > CURRENT_VERSION {
        return Err(Error::DatabaseMigration {
            message: format!(
                "database schema version {version} is newer than supported version {CURRENT_VERSION}"
            ),
        });
    }

    for next in (version + 1)..=CURRENT_VERSION {
        let tx = conn.unchecked_transaction()?;
        for statement in migration_statements(next)? {
            tx.execute(statement, [])?;
        }
        tx.pragma_update(None, "user_version", next)?;
        tx.commit()?;
        info!(version = next, "Applied schema migration");
    }

    Ok(())
}

/// Read the schema version; 0 for a fresh database.
fn schema_version(conn: &Connection) -> Result<i32> {
    Ok(conn.pragma_query_value(None, "user_version", |row| row.get(0))?)
}

fn migration_statements(version: i32) -> Result<&'static [&'static str]> {
    match version {
        1 => Ok(V1_STATEMENTS),
        _ => Err(Error::DatabaseMigration {
            message: format!("unknown migration version: {version}"),
        }),
    }
}
