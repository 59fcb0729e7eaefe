use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use super::{date, from_json, opt_ts, parse_date, parse_opt_ts, parse_ts, parse_uuid, to_json, ts};
use crate::db::DatabaseError;
use crate::models::enums::*;
use crate::models::*;

const SPEC_COLUMNS: &str = "id, patient_id, task_kind, title, description, start_date, end_date,
     cadence, times_per_day, day_mask, preferred_hours, priority, critical, adaptive, state,
     last_tuned_at, tuned_best_hours, created_at, updated_at";

/// Insert or replace the authored fields of a spec.
/// `created_at` of an existing row is kept.
pub fn upsert_spec(conn: &Connection, spec: &ReminderSpec) -> Result<(), DatabaseError> {
    let tuned = spec.tuned_best_hours.as_ref().map(to_json).transpose()?;
    conn.execute(
        &format!(
            "INSERT INTO reminder_specs ({SPEC_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)
             ON CONFLICT(id) DO UPDATE SET
                patient_id = excluded.patient_id,
                task_kind = excluded.task_kind,
                title = excluded.title,
                description = excluded.description,
                start_date = excluded.start_date,
                end_date = excluded.end_date,
                cadence = excluded.cadence,
                times_per_day = excluded.times_per_day,
                day_mask = excluded.day_mask,
                preferred_hours = excluded.preferred_hours,
                priority = excluded.priority,
                critical = excluded.critical,
                adaptive = excluded.adaptive,
                state = excluded.state,
                last_tuned_at = excluded.last_tuned_at,
                tuned_best_hours = excluded.tuned_best_hours,
                updated_at = excluded.updated_at"
        ),
        params![
            spec.id.to_string(),
            spec.patient_id,
            spec.task_kind.as_str(),
            spec.title,
            spec.description,
            date(spec.start_date),
            spec.end_date.map(date),
            spec.cadence.as_str(),
            spec.times_per_day,
            to_json(&spec.day_mask)?,
            to_json(&spec.preferred_hours)?,
            spec.priority,
            spec.critical,
            spec.adaptive,
            spec.state.as_str(),
            opt_ts(spec.last_tuned_at),
            tuned,
            ts(spec.created_at),
            ts(spec.updated_at),
        ],
    )?;
    Ok(())
}

pub fn get_spec(conn: &Connection, id: &Uuid) -> Result<Option<ReminderSpec>, DatabaseError> {
    let row = conn
        .query_row(
            &format!("SELECT {SPEC_COLUMNS} FROM reminder_specs WHERE id = ?1"),
            params![id.to_string()],
            spec_row_from_rusqlite,
        )
        .optional()?;
    row.map(spec_from_row).transpose()
}

/// Returns rows changed (0 when the spec does not exist).
pub fn update_spec_state(
    conn: &Connection,
    id: &Uuid,
    state: SpecState,
    at: DateTime<Utc>,
) -> Result<usize, DatabaseError> {
    let changed = conn.execute(
        "UPDATE reminder_specs SET state = ?2, updated_at = ?3 WHERE id = ?1",
        params![id.to_string(), state.as_str(), ts(at)],
    )?;
    Ok(changed)
}

/// Stamp a completed tune: new preferred hours and the best hours it used.
pub fn record_spec_tune(
    conn: &Connection,
    id: &Uuid,
    preferred_hours: &[u8],
    tuned_best_hours: &[u8],
    at: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE reminder_specs SET preferred_hours = ?2, tuned_best_hours = ?3,
         last_tuned_at = ?4, updated_at = ?4
         WHERE id = ?1",
        params![
            id.to_string(),
            to_json(&preferred_hours)?,
            to_json(&tuned_best_hours)?,
            ts(at),
        ],
    )?;
    Ok(())
}

pub fn list_specs_by_state(
    conn: &Connection,
    state: SpecState,
) -> Result<Vec<ReminderSpec>, DatabaseError> {
    query_specs(
        conn,
        &format!("SELECT {SPEC_COLUMNS} FROM reminder_specs WHERE state = ?1 ORDER BY created_at, id"),
        params![state.as_str()],
    )
}

/// Active adaptive specs, the candidates for re-tuning.
pub fn list_adaptive_specs(conn: &Connection) -> Result<Vec<ReminderSpec>, DatabaseError> {
    query_specs(
        conn,
        &format!(
            "SELECT {SPEC_COLUMNS} FROM reminder_specs
             WHERE state = 'active' AND adaptive = 1 ORDER BY created_at, id"
        ),
        [],
    )
}

pub fn list_specs_for_patient(
    conn: &Connection,
    patient_id: &str,
) -> Result<Vec<ReminderSpec>, DatabaseError> {
    query_specs(
        conn,
        &format!("SELECT {SPEC_COLUMNS} FROM reminder_specs WHERE patient_id = ?1 ORDER BY created_at, id"),
        params![patient_id],
    )
}

fn query_specs(
    conn: &Connection,
    sql: &str,
    args: impl rusqlite::Params,
) -> Result<Vec<ReminderSpec>, DatabaseError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(args, spec_row_from_rusqlite)?;

    let mut specs = Vec::new();
    for row in rows {
        specs.push(spec_from_row(row?)?);
    }
    Ok(specs)
}

// Internal row type for ReminderSpec mapping
struct SpecRow {
    id: String,
    patient_id: String,
    task_kind: String,
    title: String,
    description: String,
    start_date: String,
    end_date: Option<String>,
    cadence: String,
    times_per_day: u8,
    day_mask: String,
    preferred_hours: String,
    priority: u8,
    critical: bool,
    adaptive: bool,
    state: String,
    last_tuned_at: Option<String>,
    tuned_best_hours: Option<String>,
    created_at: String,
    updated_at: String,
}

fn spec_row_from_rusqlite(row: &rusqlite::Row<'_>) -> Result<SpecRow, rusqlite::Error> {
    Ok(SpecRow {
        id: row.get(0)?,
        patient_id: row.get(1)?,
        task_kind: row.get(2)?,
        title: row.get(3)?,
        description: row.get(4)?,
        start_date: row.get(5)?,
        end_date: row.get(6)?,
        cadence: row.get(7)?,
        times_per_day: row.get(8)?,
        day_mask: row.get(9)?,
        preferred_hours: row.get(10)?,
        priority: row.get(11)?,
        critical: row.get(12)?,
        adaptive: row.get(13)?,
        state: row.get(14)?,
        last_tuned_at: row.get(15)?,
        tuned_best_hours: row.get(16)?,
        created_at: row.get(17)?,
        updated_at: row.get(18)?,
    })
}

fn spec_from_row(row: SpecRow) -> Result<ReminderSpec, DatabaseError> {
    Ok(ReminderSpec {
        id: parse_uuid(&row.id)?,
        patient_id: row.patient_id,
        task_kind: TaskKind::from_str(&row.task_kind)?,
        title: row.title,
        description: row.description,
        start_date: parse_date(&row.start_date)?,
        end_date: row.end_date.as_deref().map(parse_date).transpose()?,
        cadence: Cadence::from_str(&row.cadence)?,
        times_per_day: row.times_per_day,
        day_mask: from_json(&row.day_mask)?,
        preferred_hours: from_json(&row.preferred_hours)?,
        priority: row.priority,
        critical: row.critical,
        adaptive: row.adaptive,
        state: SpecState::from_str(&row.state)?,
        last_tuned_at: parse_opt_ts(row.last_tuned_at)?,
        tuned_best_hours: row.tuned_best_hours.as_deref().map(from_json).transpose()?,
        created_at: parse_ts(&row.created_at)?,
        updated_at: parse_ts(&row.updated_at)?,
    })
}
