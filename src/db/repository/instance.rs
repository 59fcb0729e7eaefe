use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use super::{opt_ts, parse_opt_ts, parse_ts, parse_uuid, ts};
use crate::db::DatabaseError;
use crate::models::enums::*;
use crate::models::*;

const INSTANCE_COLUMNS: &str = "id, spec_id, scheduled_at, sent_at, attempt_count,
     notification_id, acknowledged_at, outcome, notes";

/// Insert a slot unless a row with its id already exists. Returns true when inserted.
pub fn insert_instance_if_absent(
    conn: &Connection,
    instance: &ReminderInstance,
) -> Result<bool, DatabaseError> {
    let inserted = conn.execute(
        &format!(
            "INSERT OR IGNORE INTO reminder_instances ({INSTANCE_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
        ),
        params![
            instance.id.to_string(),
            instance.spec_id.to_string(),
            ts(instance.scheduled_at),
            opt_ts(instance.sent_at),
            instance.attempt_count,
            instance.notification_id,
            opt_ts(instance.acknowledged_at),
            instance.outcome.as_str(),
            instance.notes,
        ],
    )?;
    Ok(inserted == 1)
}

pub fn get_instance(
    conn: &Connection,
    id: &Uuid,
) -> Result<Option<ReminderInstance>, DatabaseError> {
    let row = conn
        .query_row(
            &format!("SELECT {INSTANCE_COLUMNS} FROM reminder_instances WHERE id = ?1"),
            params![id.to_string()],
            instance_row_from_rusqlite,
        )
        .optional()?;
    row.map(instance_from_row).transpose()
}

pub fn list_instances_for_spec(
    conn: &Connection,
    spec_id: &Uuid,
) -> Result<Vec<ReminderInstance>, DatabaseError> {
    query_instances(
        conn,
        &format!(
            "SELECT {INSTANCE_COLUMNS} FROM reminder_instances
             WHERE spec_id = ?1 ORDER BY scheduled_at, id"
        ),
        params![spec_id.to_string()],
    )
}

/// Slots of `spec_id` after `now` that were never sent, in schedule order.
pub fn list_future_unsent(
    conn: &Connection,
    spec_id: &Uuid,
    now: DateTime<Utc>,
) -> Result<Vec<ReminderInstance>, DatabaseError> {
    query_instances(
        conn,
        &format!(
            "SELECT {INSTANCE_COLUMNS} FROM reminder_instances
             WHERE spec_id = ?1 AND scheduled_at > ?2 AND sent_at IS NULL AND outcome = 'pending'
             ORDER BY scheduled_at, id"
        ),
        params![spec_id.to_string(), ts(now)],
    )
}

/// Delete future unsent slots of a spec. Sent or past slots are never touched.
pub fn delete_future_unsent(
    conn: &Connection,
    spec_id: &Uuid,
    now: DateTime<Utc>,
) -> Result<usize, DatabaseError> {
    let deleted = conn.execute(
        "DELETE FROM reminder_instances
         WHERE spec_id = ?1 AND scheduled_at > ?2 AND sent_at IS NULL AND outcome = 'pending'",
        params![spec_id.to_string(), ts(now)],
    )?;
    Ok(deleted)
}

/// Delete one slot if it is still unsent and pending. Returns rows removed.
pub fn delete_unsent_instance(conn: &Connection, id: &Uuid) -> Result<usize, DatabaseError> {
    let deleted = conn.execute(
        "DELETE FROM reminder_instances
         WHERE id = ?1 AND sent_at IS NULL AND outcome = 'pending'",
        params![id.to_string()],
    )?;
    Ok(deleted)
}

/// PENDING slots within `[from, to]` whose spec is ACTIVE, in schedule order.
pub fn list_due_instances(
    conn: &Connection,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<Vec<ReminderInstance>, DatabaseError> {
    query_instances(
        conn,
        "SELECT i.id, i.spec_id, i.scheduled_at, i.sent_at, i.attempt_count,
                i.notification_id, i.acknowledged_at, i.outcome, i.notes
         FROM reminder_instances i
         JOIN reminder_specs s ON s.id = i.spec_id
         WHERE i.outcome = 'pending' AND i.scheduled_at >= ?1 AND i.scheduled_at <= ?2
           AND s.state = 'active'
         ORDER BY i.scheduled_at, i.id",
        params![ts(from), ts(to)],
    )
}

/// The single PENDING → SENT linearization point.
/// Returns false when another worker already claimed the slot.
pub fn claim_for_send(
    conn: &Connection,
    id: &Uuid,
    now: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE reminder_instances
         SET outcome = 'sent', sent_at = ?2, attempt_count = attempt_count + 1
         WHERE id = ?1 AND outcome = 'pending'",
        params![id.to_string(), ts(now)],
    )?;
    Ok(changed == 1)
}

pub fn set_notification_id(
    conn: &Connection,
    id: &Uuid,
    notification_id: &str,
) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE reminder_instances SET notification_id = ?2 WHERE id = ?1",
        params![id.to_string(), notification_id],
    )?;
    Ok(())
}

/// Undo a claim whose send was rejected. The attempt stays counted.
pub fn revert_claim(conn: &Connection, id: &Uuid) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE reminder_instances SET outcome = 'pending', sent_at = NULL
         WHERE id = ?1 AND outcome = 'sent' AND acknowledged_at IS NULL",
        params![id.to_string()],
    )?;
    Ok(changed == 1)
}

/// Move a slot in `from` to MISSED. Returns false if it left `from` meanwhile.
pub fn mark_missed(
    conn: &Connection,
    id: &Uuid,
    from: Outcome,
    notes: Option<&str>,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE reminder_instances SET outcome = 'missed', notes = COALESCE(?3, notes)
         WHERE id = ?1 AND outcome = ?2",
        params![id.to_string(), from.as_str(), notes],
    )?;
    Ok(changed == 1)
}

/// SENT slots delivered before `cutoff` that nobody acknowledged.
pub fn list_unacknowledged_sent_before(
    conn: &Connection,
    cutoff: DateTime<Utc>,
) -> Result<Vec<ReminderInstance>, DatabaseError> {
    query_instances(
        conn,
        &format!(
            "SELECT {INSTANCE_COLUMNS} FROM reminder_instances
             WHERE outcome = 'sent' AND acknowledged_at IS NULL AND sent_at < ?1
             ORDER BY sent_at, id"
        ),
        params![ts(cutoff)],
    )
}

/// PENDING slots scheduled before `cutoff`; they can no longer be delivered.
pub fn list_stale_pending(
    conn: &Connection,
    cutoff: DateTime<Utc>,
) -> Result<Vec<ReminderInstance>, DatabaseError> {
    query_instances(
        conn,
        &format!(
            "SELECT {INSTANCE_COLUMNS} FROM reminder_instances
             WHERE outcome = 'pending' AND scheduled_at < ?1
             ORDER BY scheduled_at, id"
        ),
        params![ts(cutoff)],
    )
}

/// Close a SENT slot with the patient's action. Returns false if it was not SENT.
pub fn record_acknowledgment(
    conn: &Connection,
    id: &Uuid,
    outcome: Outcome,
    at: DateTime<Utc>,
    notes: Option<&str>,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE reminder_instances SET outcome = ?2, acknowledged_at = ?3, notes = ?4
         WHERE id = ?1 AND outcome = 'sent'",
        params![id.to_string(), outcome.as_str(), ts(at), notes],
    )?;
    Ok(changed == 1)
}

fn query_instances(
    conn: &Connection,
    sql: &str,
    args: impl rusqlite::Params,
) -> Result<Vec<ReminderInstance>, DatabaseError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(args, instance_row_from_rusqlite)?;

    let mut instances = Vec::new();
    for row in rows {
        instances.push(instance_from_row(row?)?);
    }
    Ok(instances)
}

// Internal row type for ReminderInstance mapping
struct InstanceRow {
    id: String,
    spec_id: String,
    scheduled_at: String,
    sent_at: Option<String>,
    attempt_count: u32,
    notification_id: Option<String>,
    acknowledged_at: Option<String>,
    outcome: String,
    notes: Option<String>,
}

fn instance_row_from_rusqlite(row: &rusqlite::Row<'_>) -> Result<InstanceRow, rusqlite::Error> {
    Ok(InstanceRow {
        id: row.get(0)?,
        spec_id: row.get(1)?,
        scheduled_at: row.get(2)?,
        sent_at: row.get(3)?,
        attempt_count: row.get(4)?,
        notification_id: row.get(5)?,
        acknowledged_at: row.get(6)?,
        outcome: row.get(7)?,
        notes: row.get(8)?,
    })
}

fn instance_from_row(row: InstanceRow) -> Result<ReminderInstance, DatabaseError> {
    Ok(ReminderInstance {
        id: parse_uuid(&row.id)?,
        spec_id: parse_uuid(&row.spec_id)?,
        scheduled_at: parse_ts(&row.scheduled_at)?,
        sent_at: parse_opt_ts(row.sent_at)?,
        attempt_count: row.attempt_count,
        notification_id: row.notification_id,
        acknowledged_at: parse_opt_ts(row.acknowledged_at)?,
        outcome: Outcome::from_str(&row.outcome)?,
        notes: row.notes,
    })
}
