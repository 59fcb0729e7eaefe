use rusqlite::{params, Connection, OptionalExtension};

use super::{parse_ts, ts};
use crate::db::DatabaseError;
use crate::models::*;

/// Idempotent upsert keyed on (patient_id, metric_code).
pub fn upsert_baseline(conn: &Connection, baseline: &Baseline) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO baselines (patient_id, metric_code, mean, std_dev, sample_count,
         window_start, window_end, computed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(patient_id, metric_code) DO UPDATE SET
            mean = excluded.mean,
            std_dev = excluded.std_dev,
            sample_count = excluded.sample_count,
            window_start = excluded.window_start,
            window_end = excluded.window_end,
            computed_at = excluded.computed_at",
        params![
            baseline.patient_id,
            baseline.metric_code,
            baseline.mean,
            baseline.std_dev,
            baseline.sample_count,
            ts(baseline.window_start),
            ts(baseline.window_end),
            ts(baseline.computed_at),
        ],
    )?;
    Ok(())
}

pub fn get_baseline(
    conn: &Connection,
    patient_id: &str,
    metric_code: &str,
) -> Result<Option<Baseline>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT patient_id, metric_code, mean, std_dev, sample_count,
             window_start, window_end, computed_at
             FROM baselines WHERE patient_id = ?1 AND metric_code = ?2",
            params![patient_id, metric_code],
            baseline_row_from_rusqlite,
        )
        .optional()?;
    row.map(baseline_from_row).transpose()
}

// Internal row type for Baseline mapping
struct BaselineRow {
    patient_id: String,
    metric_code: String,
    mean: f64,
    std_dev: f64,
    sample_count: u32,
    window_start: String,
    window_end: String,
    computed_at: String,
}

fn baseline_row_from_rusqlite(row: &rusqlite::Row<'_>) -> Result<BaselineRow, rusqlite::Error> {
    Ok(BaselineRow {
        patient_id: row.get(0)?,
        metric_code: row.get(1)?,
        mean: row.get(2)?,
        std_dev: row.get(3)?,
        sample_count: row.get(4)?,
        window_start: row.get(5)?,
        window_end: row.get(6)?,
        computed_at: row.get(7)?,
    })
}

fn baseline_from_row(row: BaselineRow) -> Result<Baseline, DatabaseError> {
    Ok(Baseline {
        patient_id: row.patient_id,
        metric_code: row.metric_code,
        mean: row.mean,
        std_dev: row.std_dev,
        sample_count: row.sample_count,
        window_start: parse_ts(&row.window_start)?,
        window_end: parse_ts(&row.window_end)?,
        computed_at: parse_ts(&row.computed_at)?,
    })
}
