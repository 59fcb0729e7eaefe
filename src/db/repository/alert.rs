use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use super::{date, from_json, opt_ts, parse_opt_ts, parse_ts, parse_uuid, to_json, ts};
use crate::db::DatabaseError;
use crate::models::enums::*;
use crate::models::*;

const ALERT_COLUMNS: &str = "id, patient_id, kind, priority, title, body, sources, created_at,
     expires_at, resolution_state, resolved_at, resolved_by, resolution_notes";

/// Insert a new alert for `created_day`. Fails with a constraint error when
/// an alert of the same kind already exists for that patient and day.
pub fn insert_alert(
    conn: &Connection,
    alert: &Alert,
    created_day: NaiveDate,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO alerts (id, patient_id, kind, priority, title, body, sources, created_at,
         created_day, expires_at, resolution_state, resolved_at, resolved_by, resolution_notes)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            alert.id.to_string(),
            alert.patient_id,
            alert.kind.as_str(),
            alert.priority.as_str(),
            alert.title,
            alert.body,
            to_json(&alert.sources)?,
            ts(alert.created_at),
            date(created_day),
            ts(alert.expires_at),
            alert.resolution_state.as_str(),
            opt_ts(alert.resolved_at),
            alert.resolved_by,
            alert.resolution_notes,
        ],
    )?;
    Ok(())
}

/// The alert holding the (patient, kind, day) dedup slot, if any.
pub fn find_alert_for_day(
    conn: &Connection,
    patient_id: &str,
    kind: AlertKind,
    day: NaiveDate,
) -> Result<Option<Alert>, DatabaseError> {
    let row = conn
        .query_row(
            &format!(
                "SELECT {ALERT_COLUMNS} FROM alerts
                 WHERE patient_id = ?1 AND kind = ?2 AND created_day = ?3"
            ),
            params![patient_id, kind.as_str(), date(day)],
            alert_row_from_rusqlite,
        )
        .optional()?;
    row.map(alert_from_row).transpose()
}

/// Rewrite the mutable content of an open alert after new sources attached.
pub fn update_alert_content(conn: &Connection, alert: &Alert) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE alerts SET priority = ?2, title = ?3, body = ?4, sources = ?5, expires_at = ?6
         WHERE id = ?1",
        params![
            alert.id.to_string(),
            alert.priority.as_str(),
            alert.title,
            alert.body,
            to_json(&alert.sources)?,
            ts(alert.expires_at),
        ],
    )?;
    Ok(())
}

pub fn get_alert(conn: &Connection, id: &Uuid) -> Result<Option<Alert>, DatabaseError> {
    let row = conn
        .query_row(
            &format!("SELECT {ALERT_COLUMNS} FROM alerts WHERE id = ?1"),
            params![id.to_string()],
            alert_row_from_rusqlite,
        )
        .optional()?;
    row.map(alert_from_row).transpose()
}

/// Open, unexpired alerts for a patient, newest first.
pub fn list_active_alerts(
    conn: &Connection,
    patient_id: &str,
    now: DateTime<Utc>,
) -> Result<Vec<Alert>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ALERT_COLUMNS} FROM alerts
         WHERE patient_id = ?1 AND resolution_state = 'open' AND expires_at > ?2
         ORDER BY created_at DESC"
    ))?;
    let rows = stmt.query_map(params![patient_id, ts(now)], alert_row_from_rusqlite)?;

    let mut alerts = Vec::new();
    for row in rows {
        alerts.push(alert_from_row(row?)?);
    }
    Ok(alerts)
}

/// Mark an open alert RESOLVED. Returns rows changed (0 when already resolved).
pub fn resolve_alert(
    conn: &Connection,
    id: &Uuid,
    actor: &str,
    notes: Option<&str>,
    at: DateTime<Utc>,
) -> Result<usize, DatabaseError> {
    let changed = conn.execute(
        "UPDATE alerts SET resolution_state = 'resolved', resolved_at = ?2,
         resolved_by = ?3, resolution_notes = ?4
         WHERE id = ?1 AND resolution_state = 'open'",
        params![id.to_string(), ts(at), actor, notes],
    )?;
    Ok(changed)
}

// Internal row type for Alert mapping
struct AlertRow {
    id: String,
    patient_id: String,
    kind: String,
    priority: String,
    title: String,
    body: String,
    sources: String,
    created_at: String,
    expires_at: String,
    resolution_state: String,
    resolved_at: Option<String>,
    resolved_by: Option<String>,
    resolution_notes: Option<String>,
}

fn alert_row_from_rusqlite(row: &rusqlite::Row<'_>) -> Result<AlertRow, rusqlite::Error> {
    Ok(AlertRow {
        id: row.get(0)?,
        patient_id: row.get(1)?,
        kind: row.get(2)?,
        priority: row.get(3)?,
        title: row.get(4)?,
        body: row.get(5)?,
        sources: row.get(6)?,
        created_at: row.get(7)?,
        expires_at: row.get(8)?,
        resolution_state: row.get(9)?,
        resolved_at: row.get(10)?,
        resolved_by: row.get(11)?,
        resolution_notes: row.get(12)?,
    })
}

fn alert_from_row(row: AlertRow) -> Result<Alert, DatabaseError> {
    Ok(Alert {
        id: parse_uuid(&row.id)?,
        patient_id: row.patient_id,
        kind: AlertKind::from_str(&row.kind)?,
        priority: Priority::from_str(&row.priority)?,
        title: row.title,
        body: row.body,
        sources: from_json(&row.sources)?,
        created_at: parse_ts(&row.created_at)?,
        expires_at: parse_ts(&row.expires_at)?,
        resolution_state: ResolutionState::from_str(&row.resolution_state)?,
        resolved_at: parse_opt_ts(row.resolved_at)?,
        resolved_by: row.resolved_by,
        resolution_notes: row.resolution_notes,
    })
}
