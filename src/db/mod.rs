pub mod sqlite;
pub mod repository;

pub use sqlite::*;
pub use repository::*;

use thiserror::Error;

/// Timestamp column format; lexical order equals chronological order.
pub(crate) const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
/// Date column format.
pub(crate) const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Invalid enum value for {field}: {value}")]
    InvalidEnum { field: String, value: String },

    #[error("Migration failed at version {version}: {reason}")]
    MigrationFailed { version: i64, reason: String },

    #[error("Constraint violated: {0}")]
    ConstraintViolation(String),
}

impl DatabaseError {
    /// BUSY/LOCKED failures clear up on their own; the step is retried next tick.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_is_transient() {
        let err = DatabaseError::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        ));
        assert!(err.is_transient());
    }

    #[test]
    fn not_found_is_not_transient() {
        let err = DatabaseError::NotFound {
            entity_type: "ReminderSpec".into(),
            id: "x".into(),
        };
        assert!(!err.is_transient());
        assert!(!DatabaseError::ConstraintViolation("bad".into()).is_transient());
    }
}
