use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use super::{parse_opt_ts, parse_ts, ts};
use crate::db::DatabaseError;

/// Refresh bookkeeping for one patient-metric stream seen by the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedSeries {
    pub patient_id: String,
    pub metric_code: String,
    pub first_seen_at: DateTime<Utc>,
    pub last_sample_at: DateTime<Utc>,
    pub last_trend_at: Option<DateTime<Utc>>,
    pub last_baseline_check_at: Option<DateTime<Utc>>,
}

const SERIES_COLUMNS: &str = "patient_id, metric_code, first_seen_at, last_sample_at,
     last_trend_at, last_baseline_check_at";

/// Register a sample for its series; `last_sample_at` only moves forward.
pub fn touch_series(
    conn: &Connection,
    patient_id: &str,
    metric_code: &str,
    sample_at: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO tracked_series (patient_id, metric_code, first_seen_at, last_sample_at)
         VALUES (?1, ?2, ?3, ?3)
         ON CONFLICT(patient_id, metric_code) DO UPDATE SET
            last_sample_at = MAX(last_sample_at, excluded.last_sample_at)",
        params![patient_id, metric_code, ts(sample_at)],
    )?;
    Ok(())
}

/// Series whose trend was never computed or last computed before `cutoff`.
pub fn list_series_due_for_trend(
    conn: &Connection,
    cutoff: DateTime<Utc>,
) -> Result<Vec<TrackedSeries>, DatabaseError> {
    query_series(
        conn,
        &format!(
            "SELECT {SERIES_COLUMNS} FROM tracked_series
             WHERE last_trend_at IS NULL OR last_trend_at <= ?1
             ORDER BY patient_id, metric_code"
        ),
        ts(cutoff),
    )
}

/// Series whose baseline was never checked or last checked before `cutoff`.
pub fn list_series_due_for_baseline(
    conn: &Connection,
    cutoff: DateTime<Utc>,
) -> Result<Vec<TrackedSeries>, DatabaseError> {
    query_series(
        conn,
        &format!(
            "SELECT {SERIES_COLUMNS} FROM tracked_series
             WHERE last_baseline_check_at IS NULL OR last_baseline_check_at <= ?1
             ORDER BY patient_id, metric_code"
        ),
        ts(cutoff),
    )
}

pub fn mark_trend_refreshed(
    conn: &Connection,
    patient_id: &str,
    metric_code: &str,
    at: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE tracked_series SET last_trend_at = ?3 WHERE patient_id = ?1 AND metric_code = ?2",
        params![patient_id, metric_code, ts(at)],
    )?;
    Ok(())
}

pub fn mark_baseline_checked(
    conn: &Connection,
    patient_id: &str,
    metric_code: &str,
    at: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE tracked_series SET last_baseline_check_at = ?3
         WHERE patient_id = ?1 AND metric_code = ?2",
        params![patient_id, metric_code, ts(at)],
    )?;
    Ok(())
}

fn query_series(
    conn: &Connection,
    sql: &str,
    cutoff: String,
) -> Result<Vec<TrackedSeries>, DatabaseError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params![cutoff], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, Option<String>>(4)?,
            row.get::<_, Option<String>>(5)?,
        ))
    })?;

    let mut series = Vec::new();
    for row in rows {
        let (patient_id, metric_code, first_seen_at, last_sample_at, last_trend_at, last_check) =
            row?;
        series.push(TrackedSeries {
            patient_id,
            metric_code,
            first_seen_at: parse_ts(&first_seen_at)?,
            last_sample_at: parse_ts(&last_sample_at)?,
            last_trend_at: parse_opt_ts(last_trend_at)?,
            last_baseline_check_at: parse_opt_ts(last_check)?,
        });
    }
    Ok(series)
}
