use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use super::{parse_opt_ts, parse_ts, parse_uuid, ts};
use crate::db::DatabaseError;
use crate::models::enums::*;
use crate::models::*;

const ANOMALY_COLUMNS: &str = "id, patient_id, metric_code, kind, severity, observed_value,
     reference_value, score, observed_at, detected_at, acknowledged_at, acknowledged_by";

/// Insert or refresh the scored fields of an anomaly.
/// `detected_at` and the ack stamp of an existing row are preserved.
/// Returns true when the row is new.
pub fn upsert_anomaly(conn: &Connection, anomaly: &Anomaly) -> Result<bool, DatabaseError> {
    let inserted = conn.execute(
        &format!(
            "INSERT OR IGNORE INTO anomalies ({ANOMALY_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
        ),
        params![
            anomaly.id.to_string(),
            anomaly.patient_id,
            anomaly.metric_code,
            anomaly.kind.as_str(),
            anomaly.severity.as_str(),
            anomaly.observed_value,
            anomaly.reference_value,
            anomaly.score,
            ts(anomaly.observed_at),
            ts(anomaly.detected_at),
            anomaly.acknowledged_at.map(ts),
            anomaly.acknowledged_by,
        ],
    )?;
    if inserted == 1 {
        return Ok(true);
    }

    conn.execute(
        "UPDATE anomalies SET severity = ?2, observed_value = ?3, reference_value = ?4, score = ?5
         WHERE id = ?1",
        params![
            anomaly.id.to_string(),
            anomaly.severity.as_str(),
            anomaly.observed_value,
            anomaly.reference_value,
            anomaly.score,
        ],
    )?;
    Ok(false)
}

pub fn get_anomaly(conn: &Connection, id: &Uuid) -> Result<Option<Anomaly>, DatabaseError> {
    let row = conn
        .query_row(
            &format!("SELECT {ANOMALY_COLUMNS} FROM anomalies WHERE id = ?1"),
            params![id.to_string()],
            anomaly_row_from_rusqlite,
        )
        .optional()?;
    row.map(anomaly_from_row).transpose()
}

/// Anomalies for a patient detected at or after `since`, oldest observation first.
pub fn list_anomalies_since(
    conn: &Connection,
    patient_id: &str,
    since: DateTime<Utc>,
) -> Result<Vec<Anomaly>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ANOMALY_COLUMNS} FROM anomalies
         WHERE patient_id = ?1 AND detected_at >= ?2
         ORDER BY observed_at ASC, kind ASC"
    ))?;
    let rows = stmt.query_map(params![patient_id, ts(since)], anomaly_row_from_rusqlite)?;

    let mut anomalies = Vec::new();
    for row in rows {
        anomalies.push(anomaly_from_row(row?)?);
    }
    Ok(anomalies)
}

/// Stamp an acknowledgment. A second call keeps the first stamp.
pub fn acknowledge_anomaly(
    conn: &Connection,
    id: &Uuid,
    actor: &str,
    at: DateTime<Utc>,
) -> Result<Anomaly, DatabaseError> {
    conn.execute(
        "UPDATE anomalies SET acknowledged_at = ?2, acknowledged_by = ?3
         WHERE id = ?1 AND acknowledged_at IS NULL",
        params![id.to_string(), ts(at), actor],
    )?;
    get_anomaly(conn, id)?.ok_or_else(|| DatabaseError::NotFound {
        entity_type: "Anomaly".into(),
        id: id.to_string(),
    })
}

// Internal row type for Anomaly mapping
struct AnomalyRow {
    id: String,
    patient_id: String,
    metric_code: String,
    kind: String,
    severity: String,
    observed_value: f64,
    reference_value: f64,
    score: f64,
    observed_at: String,
    detected_at: String,
    acknowledged_at: Option<String>,
    acknowledged_by: Option<String>,
}

fn anomaly_row_from_rusqlite(row: &rusqlite::Row<'_>) -> Result<AnomalyRow, rusqlite::Error> {
    Ok(AnomalyRow {
        id: row.get(0)?,
        patient_id: row.get(1)?,
        metric_code: row.get(2)?,
        kind: row.get(3)?,
        severity: row.get(4)?,
        observed_value: row.get(5)?,
        reference_value: row.get(6)?,
        score: row.get(7)?,
        observed_at: row.get(8)?,
        detected_at: row.get(9)?,
        acknowledged_at: row.get(10)?,
        acknowledged_by: row.get(11)?,
    })
}

fn anomaly_from_row(row: AnomalyRow) -> Result<Anomaly, DatabaseError> {
    Ok(Anomaly {
        id: parse_uuid(&row.id)?,
        patient_id: row.patient_id,
        metric_code: row.metric_code,
        kind: AnomalyKind::from_str(&row.kind)?,
        severity: Severity::from_str(&row.severity)?,
        observed_value: row.observed_value,
        reference_value: row.reference_value,
        score: row.score,
        observed_at: parse_ts(&row.observed_at)?,
        detected_at: parse_ts(&row.detected_at)?,
        acknowledged_at: parse_opt_ts(row.acknowledged_at)?,
        acknowledged_by: row.acknowledged_by,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::sqlite::open_memory_database;
    use chrono::{Duration, TimeZone};

    fn make_anomaly(score: f64, severity: Severity) -> Anomaly {
        let observed = Utc.with_ymd_and_hms(2025, 2, 1, 9, 0, 0).unwrap();
        Anomaly {
            id: Anomaly::key_id("p-1", "HBA1C", observed, AnomalyKind::StatisticalOutlier),
            patient_id: "p-1".into(),
            metric_code: "HBA1C".into(),
            kind: AnomalyKind::StatisticalOutlier,
            severity,
            observed_value: 9.0,
            reference_value: 7.0,
            score,
            observed_at: observed,
            detected_at: observed + Duration::minutes(1),
            acknowledged_at: None,
            acknowledged_by: None,
        }
    }

    #[test]
    fn upsert_is_idempotent() {
        let conn = open_memory_database().unwrap();
        let anomaly = make_anomaly(4.0, Severity::Critical);
        assert!(upsert_anomaly(&conn, &anomaly).unwrap());
        assert!(!upsert_anomaly(&conn, &anomaly).unwrap());

        let since = anomaly.observed_at - Duration::days(1);
        let stored = list_anomalies_since(&conn, "p-1", since).unwrap();
        assert_eq!(stored, vec![anomaly]);
    }

    #[test]
    fn rescoring_keeps_detected_at() {
        let conn = open_memory_database().unwrap();
        let first = make_anomaly(2.6, Severity::Medium);
        upsert_anomaly(&conn, &first).unwrap();

        let mut second = make_anomaly(3.1, Severity::High);
        second.detected_at = first.detected_at + Duration::hours(5);
        upsert_anomaly(&conn, &second).unwrap();

        let stored = get_anomaly(&conn, &first.id).unwrap().unwrap();
        assert_eq!(stored.severity, Severity::High);
        assert_eq!(stored.detected_at, first.detected_at);
    }

    #[test]
    fn acknowledge_stamps_once() {
        let conn = open_memory_database().unwrap();
        let anomaly = make_anomaly(4.0, Severity::Critical);
        upsert_anomaly(&conn, &anomaly).unwrap();

        let at = anomaly.detected_at + Duration::hours(1);
        let acked = acknowledge_anomaly(&conn, &anomaly.id, "dr-lee", at).unwrap();
        assert_eq!(acked.acknowledged_by.as_deref(), Some("dr-lee"));

        let again =
            acknowledge_anomaly(&conn, &anomaly.id, "nurse", at + Duration::hours(1)).unwrap();
        assert_eq!(again.acknowledged_at, Some(at));
        assert_eq!(again.acknowledged_by.as_deref(), Some("dr-lee"));
    }

    #[test]
    fn acknowledge_unknown_is_not_found() {
        let conn = open_memory_database().unwrap();
        let result = acknowledge_anomaly(&conn, &Uuid::new_v4(), "dr-lee", Utc::now());
        assert!(matches!(result, Err(DatabaseError::NotFound { .. })));
    }
}
