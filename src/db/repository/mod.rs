//! Repository layer — entity-scoped database operations.
//!
//! One sub-module per engine-owned store. Functions take the connection
//! explicitly; ownership rules (which component may call which writer) are
//! enforced one level up.

mod alert;
mod anomaly;
mod baseline;
mod behavior;
mod instance;
mod series;
mod spec;
mod trend;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use super::{DatabaseError, DATE_FORMAT, TS_FORMAT};

// Re-export all public items from sub-modules
pub use alert::*;
pub use anomaly::*;
pub use baseline::*;
pub use behavior::*;
pub use instance::*;
pub use series::*;
pub use spec::*;
pub use trend::*;

// ─── Column codecs shared by the sub-modules ───

pub(crate) fn ts(value: DateTime<Utc>) -> String {
    value.format(TS_FORMAT).to_string()
}

pub(crate) fn opt_ts(value: Option<DateTime<Utc>>) -> Option<String> {
    value.map(ts)
}

pub(crate) fn parse_ts(raw: &str) -> Result<DateTime<Utc>, DatabaseError> {
    NaiveDateTime::parse_from_str(raw, TS_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|e| DatabaseError::ConstraintViolation(format!("bad timestamp {raw:?}: {e}")))
}

pub(crate) fn parse_opt_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    raw.as_deref().map(parse_ts).transpose()
}

pub(crate) fn date(value: NaiveDate) -> String {
    value.format(DATE_FORMAT).to_string()
}

pub(crate) fn parse_date(raw: &str) -> Result<NaiveDate, DatabaseError> {
    NaiveDate::parse_from_str(raw, DATE_FORMAT)
        .map_err(|e| DatabaseError::ConstraintViolation(format!("bad date {raw:?}: {e}")))
}

pub(crate) fn parse_uuid(raw: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(raw).map_err(|e| DatabaseError::ConstraintViolation(e.to_string()))
}

pub(crate) fn to_json<T: Serialize>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::ConstraintViolation(e.to_string()))
}

pub(crate) fn from_json<T: DeserializeOwned>(raw: &str) -> Result<T, DatabaseError> {
    serde_json::from_str(raw).map_err(|e| DatabaseError::ConstraintViolation(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn timestamp_text_sorts_chronologically() {
        let early = Utc.with_ymd_and_hms(2025, 1, 9, 23, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2025, 1, 10, 1, 0, 0).unwrap();
        assert!(ts(early) < ts(late));
        assert_eq!(parse_ts(&ts(late)).unwrap(), late);
    }

    #[test]
    fn malformed_columns_are_constraint_violations() {
        assert!(matches!(parse_ts("yesterday"), Err(DatabaseError::ConstraintViolation(_))));
        assert!(matches!(parse_date("2025-13-01"), Err(DatabaseError::ConstraintViolation(_))));
        assert!(matches!(parse_uuid("nope"), Err(DatabaseError::ConstraintViolation(_))));
        assert!(from_json::<Vec<u8>>("[1,").is_err());
    }
}
