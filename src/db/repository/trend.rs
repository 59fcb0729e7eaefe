use std::str::FromStr;

use rusqlite::{params, Connection, OptionalExtension};

use super::{parse_ts, parse_uuid, ts};
use crate::db::DatabaseError;
use crate::models::enums::*;
use crate::models::*;

const TREND_COLUMNS: &str = "id, patient_id, metric_code, window_start, window_end,
     slope_per_month, r_squared, direction, sample_count, mean_value, description, computed_at";

pub fn insert_trend_report(conn: &Connection, report: &TrendReport) -> Result<(), DatabaseError> {
    conn.execute(
        &format!(
            "INSERT INTO trend_reports ({TREND_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
        ),
        params![
            report.id.to_string(),
            report.patient_id,
            report.metric_code,
            ts(report.window_start),
            ts(report.window_end),
            report.slope_per_month,
            report.r_squared,
            report.direction.as_str(),
            report.sample_count,
            report.mean_value,
            report.description,
            ts(report.computed_at),
        ],
    )?;
    Ok(())
}

/// Most recent report; it supersedes older ones for display.
pub fn latest_trend_report(
    conn: &Connection,
    patient_id: &str,
    metric_code: &str,
) -> Result<Option<TrendReport>, DatabaseError> {
    let row = conn
        .query_row(
            &format!(
                "SELECT {TREND_COLUMNS} FROM trend_reports
                 WHERE patient_id = ?1 AND metric_code = ?2
                 ORDER BY computed_at DESC, rowid DESC LIMIT 1"
            ),
            params![patient_id, metric_code],
            trend_row_from_rusqlite,
        )
        .optional()?;
    row.map(trend_from_row).transpose()
}

pub fn list_trend_reports(
    conn: &Connection,
    patient_id: &str,
    metric_code: &str,
) -> Result<Vec<TrendReport>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {TREND_COLUMNS} FROM trend_reports
         WHERE patient_id = ?1 AND metric_code = ?2
         ORDER BY computed_at ASC, rowid ASC"
    ))?;
    let rows = stmt.query_map(params![patient_id, metric_code], trend_row_from_rusqlite)?;

    let mut reports = Vec::new();
    for row in rows {
        reports.push(trend_from_row(row?)?);
    }
    Ok(reports)
}

// Internal row type for TrendReport mapping
struct TrendRow {
    id: String,
    patient_id: String,
    metric_code: String,
    window_start: String,
    window_end: String,
    slope_per_month: f64,
    r_squared: f64,
    direction: String,
    sample_count: u32,
    mean_value: f64,
    description: String,
    computed_at: String,
}

fn trend_row_from_rusqlite(row: &rusqlite::Row<'_>) -> Result<TrendRow, rusqlite::Error> {
    Ok(TrendRow {
        id: row.get(0)?,
        patient_id: row.get(1)?,
        metric_code: row.get(2)?,
        window_start: row.get(3)?,
        window_end: row.get(4)?,
        slope_per_month: row.get(5)?,
        r_squared: row.get(6)?,
        direction: row.get(7)?,
        sample_count: row.get(8)?,
        mean_value: row.get(9)?,
        description: row.get(10)?,
        computed_at: row.get(11)?,
    })
}

fn trend_from_row(row: TrendRow) -> Result<TrendReport, DatabaseError> {
    Ok(TrendReport {
        id: parse_uuid(&row.id)?,
        patient_id: row.patient_id,
        metric_code: row.metric_code,
        window_start: parse_ts(&row.window_start)?,
        window_end: parse_ts(&row.window_end)?,
        slope_per_month: row.slope_per_month,
        r_squared: row.r_squared,
        direction: TrendDirection::from_str(&row.direction)?,
        sample_count: row.sample_count,
        mean_value: row.mean_value,
        description: row.description,
        computed_at: parse_ts(&row.computed_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::sqlite::open_memory_database;
    use chrono::{Duration, TimeZone, Utc};
    use uuid::Uuid;

    fn make_report(direction: TrendDirection, computed_offset_days: i64) -> TrendReport {
        let end = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        TrendReport {
            id: Uuid::new_v4(),
            patient_id: "p-1".into(),
            metric_code: "GLUCOSE_FBS".into(),
            window_start: end - Duration::days(180),
            window_end: end,
            slope_per_month: 6.2,
            r_squared: 0.8,
            direction,
            sample_count: 9,
            mean_value: 131.0,
            description: "worsening".into(),
            computed_at: end + Duration::days(computed_offset_days),
        }
    }

    #[test]
    fn latest_supersedes_older() {
        let conn = open_memory_database().unwrap();
        insert_trend_report(&conn, &make_report(TrendDirection::Stable, 0)).unwrap();
        let newer = make_report(TrendDirection::Worsening, 1);
        insert_trend_report(&conn, &newer).unwrap();

        let latest = latest_trend_report(&conn, "p-1", "GLUCOSE_FBS").unwrap().unwrap();
        assert_eq!(latest, newer);
        assert_eq!(list_trend_reports(&conn, "p-1", "GLUCOSE_FBS").unwrap().len(), 2);
    }

    #[test]
    fn r_squared_out_of_range_rejected() {
        let conn = open_memory_database().unwrap();
        let mut report = make_report(TrendDirection::Stable, 0);
        report.r_squared = 1.5;
        assert!(insert_trend_report(&conn, &report).is_err());
    }
}
