use std::path::Path;
use std::time::Duration;

use rusqlite::Connection;

use super::DatabaseError;

/// Per-call wait on a locked database before SQLite reports BUSY.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open the engine store at `path`, migrating it to the current schema.
pub fn open_database(path: &Path) -> Result<Connection, DatabaseError> {
    open_database_with_timeout(path, DEFAULT_BUSY_TIMEOUT)
}

/// Same as [`open_database`] with an explicit store timeout.
pub fn open_database_with_timeout(
    path: &Path,
    busy_timeout: Duration,
) -> Result<Connection, DatabaseError> {
    let conn = Connection::open(path)?;
    configure_pragmas(&conn, busy_timeout)?;
    run_migrations(&conn)?;
    Ok(conn)
}

/// Fresh migrated store that lives as long as the connection.
pub fn open_memory_database() -> Result<Connection, DatabaseError> {
    let conn = Connection::open_in_memory()?;
    configure_pragmas(&conn, DEFAULT_BUSY_TIMEOUT)?;
    run_migrations(&conn)?;
    Ok(conn)
}

fn configure_pragmas(conn: &Connection, busy_timeout: Duration) -> Result<(), DatabaseError> {
    conn.busy_timeout(busy_timeout)?;
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA foreign_keys=ON;",
    )?;
    Ok(())
}

/// Apply every migration newer than the recorded schema version.
pub fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    let current_version = get_current_version(conn);

    let migrations: Vec<(i64, &str)> = vec![
        (1, include_str!("../../resources/migrations/001_initial.sql")),
        (2, include_str!("../../resources/migrations/002_tracked_series.sql")),
    ];

    for (version, sql) in migrations {
        if version > current_version {
            tracing::info!("Running migration v{version}");
            conn.execute_batch(sql).map_err(|e| DatabaseError::MigrationFailed {
                version,
                reason: e.to_string(),
            })?;
        }
    }

    Ok(())
}

/// Highest applied migration; 0 on an empty file.
fn get_current_version(conn: &Connection) -> i64 {
    conn.query_row(
        "SELECT MAX(version) FROM schema_version",
        [],
        |row| row.get::<_, Option<i64>>(0),
    )
    .ok()
    .flatten()
    .unwrap_or(0)
}

/// Number of user tables.
pub fn count_tables(conn: &Connection) -> Result<i64, DatabaseError> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'",
        [],
        |row| row.get::<_, i64>(0),
    )?;
    Ok(count)
}
