use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use super::{from_json, parse_ts, parse_uuid, to_json, ts};
use crate::db::DatabaseError;
use crate::models::enums::*;
use crate::models::*;

// ─── Behaviour profiles ───

const PROFILE_COLUMNS: &str = "patient_id, task_kind, best_hours, worst_hours, total_sent,
     total_acknowledged, compliance_rate, avg_response_delay_secs, delay_samples,
     preferred_channel, updated_at";

pub fn upsert_profile(conn: &Connection, profile: &BehaviorProfile) -> Result<(), DatabaseError> {
    conn.execute(
        &format!(
            "INSERT INTO behavior_profiles ({PROFILE_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(patient_id, task_kind) DO UPDATE SET
                best_hours = excluded.best_hours,
                worst_hours = excluded.worst_hours,
                total_sent = excluded.total_sent,
                total_acknowledged = excluded.total_acknowledged,
                compliance_rate = excluded.compliance_rate,
                avg_response_delay_secs = excluded.avg_response_delay_secs,
                delay_samples = excluded.delay_samples,
                preferred_channel = excluded.preferred_channel,
                updated_at = excluded.updated_at"
        ),
        params![
            profile.patient_id,
            profile.task_kind.as_str(),
            to_json(&profile.best_hours)?,
            to_json(&profile.worst_hours)?,
            profile.total_sent,
            profile.total_acknowledged,
            profile.compliance_rate,
            profile.avg_response_delay_secs,
            profile.delay_samples,
            profile.preferred_channel.as_str(),
            ts(profile.updated_at),
        ],
    )?;
    Ok(())
}

pub fn get_profile(
    conn: &Connection,
    patient_id: &str,
    task_kind: TaskKind,
) -> Result<Option<BehaviorProfile>, DatabaseError> {
    let row = conn
        .query_row(
            &format!(
                "SELECT {PROFILE_COLUMNS} FROM behavior_profiles
                 WHERE patient_id = ?1 AND task_kind = ?2"
            ),
            params![patient_id, task_kind.as_str()],
            profile_row_from_rusqlite,
        )
        .optional()?;
    row.map(profile_from_row).transpose()
}

pub fn list_profiles_for_patient(
    conn: &Connection,
    patient_id: &str,
) -> Result<Vec<BehaviorProfile>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {PROFILE_COLUMNS} FROM behavior_profiles WHERE patient_id = ?1 ORDER BY task_kind"
    ))?;
    let rows = stmt.query_map(params![patient_id], profile_row_from_rusqlite)?;

    let mut profiles = Vec::new();
    for row in rows {
        profiles.push(profile_from_row(row?)?);
    }
    Ok(profiles)
}

/// Profiles written after `since`.
pub fn list_profiles_updated_since(
    conn: &Connection,
    since: DateTime<Utc>,
) -> Result<Vec<BehaviorProfile>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {PROFILE_COLUMNS} FROM behavior_profiles
         WHERE updated_at > ?1 ORDER BY patient_id, task_kind"
    ))?;
    let rows = stmt.query_map(params![ts(since)], profile_row_from_rusqlite)?;

    let mut profiles = Vec::new();
    for row in rows {
        profiles.push(profile_from_row(row?)?);
    }
    Ok(profiles)
}

// Internal row type for BehaviorProfile mapping
struct ProfileRow {
    patient_id: String,
    task_kind: String,
    best_hours: String,
    worst_hours: String,
    total_sent: u32,
    total_acknowledged: u32,
    compliance_rate: f64,
    avg_response_delay_secs: f64,
    delay_samples: u32,
    preferred_channel: String,
    updated_at: String,
}

fn profile_row_from_rusqlite(row: &rusqlite::Row<'_>) -> Result<ProfileRow, rusqlite::Error> {
    Ok(ProfileRow {
        patient_id: row.get(0)?,
        task_kind: row.get(1)?,
        best_hours: row.get(2)?,
        worst_hours: row.get(3)?,
        total_sent: row.get(4)?,
        total_acknowledged: row.get(5)?,
        compliance_rate: row.get(6)?,
        avg_response_delay_secs: row.get(7)?,
        delay_samples: row.get(8)?,
        preferred_channel: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

fn profile_from_row(row: ProfileRow) -> Result<BehaviorProfile, DatabaseError> {
    Ok(BehaviorProfile {
        patient_id: row.patient_id,
        task_kind: TaskKind::from_str(&row.task_kind)?,
        best_hours: from_json(&row.best_hours)?,
        worst_hours: from_json(&row.worst_hours)?,
        total_sent: row.total_sent,
        total_acknowledged: row.total_acknowledged,
        compliance_rate: row.compliance_rate,
        avg_response_delay_secs: row.avg_response_delay_secs,
        delay_samples: row.delay_samples,
        preferred_channel: Channel::from_str(&row.preferred_channel)?,
        updated_at: parse_ts(&row.updated_at)?,
    })
}

// ─── Response events ───

const RESPONSE_COLUMNS: &str = "id, instance_id, patient_id, task_kind, critical, scheduled_at,
     observed_at, response_kind, action, delay_secs";

/// Append a response. Returns false when the instance already has one.
pub fn insert_response_event(
    conn: &Connection,
    event: &ResponseEvent,
) -> Result<bool, DatabaseError> {
    let inserted = conn.execute(
        &format!(
            "INSERT OR IGNORE INTO response_events ({RESPONSE_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
        ),
        params![
            event.id.to_string(),
            event.instance_id.to_string(),
            event.patient_id,
            event.task_kind.as_str(),
            event.critical,
            ts(event.scheduled_at),
            ts(event.observed_at),
            event.response_kind.as_str(),
            event.action.map(|a| a.as_str()),
            event.delay_secs,
        ],
    )?;
    Ok(inserted == 1)
}

pub fn get_response_for_instance(
    conn: &Connection,
    instance_id: &Uuid,
) -> Result<Option<ResponseEvent>, DatabaseError> {
    let row = conn
        .query_row(
            &format!("SELECT {RESPONSE_COLUMNS} FROM response_events WHERE instance_id = ?1"),
            params![instance_id.to_string()],
            response_row_from_rusqlite,
        )
        .optional()?;
    row.map(response_from_row).transpose()
}

/// Latest `limit` responses of a patient, optionally for one task kind, newest first.
pub fn recent_response_events(
    conn: &Connection,
    patient_id: &str,
    task_kind: Option<TaskKind>,
    limit: usize,
) -> Result<Vec<ResponseEvent>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {RESPONSE_COLUMNS} FROM response_events
         WHERE patient_id = ?1 AND (?2 IS NULL OR task_kind = ?2)
         ORDER BY observed_at DESC, id DESC LIMIT ?3"
    ))?;
    let rows = stmt.query_map(
        params![patient_id, task_kind.map(|k| k.as_str()), limit as i64],
        response_row_from_rusqlite,
    )?;

    let mut events = Vec::new();
    for row in rows {
        events.push(response_from_row(row?)?);
    }
    Ok(events)
}

/// Unanswered critical reminders observed at or after `since`.
pub fn count_critical_no_response_since(
    conn: &Connection,
    patient_id: &str,
    since: DateTime<Utc>,
) -> Result<u32, DatabaseError> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM response_events
         WHERE patient_id = ?1 AND critical = 1 AND response_kind = 'none'
           AND action IS NULL AND observed_at >= ?2",
        params![patient_id, ts(since)],
        |row| row.get::<_, u32>(0),
    )?;
    Ok(count)
}

// Internal row type for ResponseEvent mapping
struct ResponseRow {
    id: String,
    instance_id: String,
    patient_id: String,
    task_kind: String,
    critical: bool,
    scheduled_at: String,
    observed_at: String,
    response_kind: String,
    action: Option<String>,
    delay_secs: i64,
}

fn response_row_from_rusqlite(row: &rusqlite::Row<'_>) -> Result<ResponseRow, rusqlite::Error> {
    Ok(ResponseRow {
        id: row.get(0)?,
        instance_id: row.get(1)?,
        patient_id: row.get(2)?,
        task_kind: row.get(3)?,
        critical: row.get(4)?,
        scheduled_at: row.get(5)?,
        observed_at: row.get(6)?,
        response_kind: row.get(7)?,
        action: row.get(8)?,
        delay_secs: row.get(9)?,
    })
}

fn response_from_row(row: ResponseRow) -> Result<ResponseEvent, DatabaseError> {
    Ok(ResponseEvent {
        id: parse_uuid(&row.id)?,
        instance_id: parse_uuid(&row.instance_id)?,
        patient_id: row.patient_id,
        task_kind: TaskKind::from_str(&row.task_kind)?,
        critical: row.critical,
        scheduled_at: parse_ts(&row.scheduled_at)?,
        observed_at: parse_ts(&row.observed_at)?,
        response_kind: ResponseKind::from_str(&row.response_kind)?,
        action: row.action.as_deref().map(ResponseAction::from_str).transpose()?,
        delay_secs: row.delay_secs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repository::{insert_instance_if_absent, upsert_spec};
    use crate::db::sqlite::open_memory_database;
    use chrono::{Duration, NaiveDate, TimeZone};

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, day, hour, 0, 0).unwrap()
    }

    fn make_instance(conn: &Connection, critical: bool, scheduled_at: DateTime<Utc>) -> Uuid {
        let spec = ReminderSpec {
            id: Uuid::new_v4(),
            patient_id: "p-1".into(),
            task_kind: TaskKind::Medication,
            title: "Insulin".into(),
            description: String::new(),
            start_date: NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
            end_date: None,
            cadence: Cadence::Once,
            times_per_day: 1,
            day_mask: vec![],
            preferred_hours: vec![],
            priority: 9,
            critical,
            adaptive: false,
            state: SpecState::Active,
            last_tuned_at: None,
            tuned_best_hours: None,
            created_at: at(1, 0),
            updated_at: at(1, 0),
        };
        upsert_spec(conn, &spec).unwrap();
        let instance = ReminderInstance::pending(Uuid::new_v4(), spec.id, scheduled_at);
        insert_instance_if_absent(conn, &instance).unwrap();
        instance.id
    }

    fn make_event(instance_id: Uuid, critical: bool, observed_at: DateTime<Utc>) -> ResponseEvent {
        ResponseEvent {
            id: Uuid::new_v4(),
            instance_id,
            patient_id: "p-1".into(),
            task_kind: TaskKind::Medication,
            critical,
            scheduled_at: observed_at - Duration::hours(6),
            observed_at,
            response_kind: ResponseKind::NoResponse,
            action: None,
            delay_secs: 6 * 3600,
        }
    }

    #[test]
    fn profile_upsert_round_trip() {
        let conn = open_memory_database().unwrap();
        let mut profile = BehaviorProfile::empty("p-1", TaskKind::Medication, at(1, 0));
        profile.best_hours = vec![9, 20];
        profile.total_sent = 4;
        profile.total_acknowledged = 3;
        profile.compliance_rate = 0.75;
        upsert_profile(&conn, &profile).unwrap();

        let stored = get_profile(&conn, "p-1", TaskKind::Medication).unwrap().unwrap();
        assert_eq!(stored, profile);
        assert!(get_profile(&conn, "p-1", TaskKind::LabTest).unwrap().is_none());
    }

    #[test]
    fn schema_rejects_ack_above_sent() {
        let conn = open_memory_database().unwrap();
        let mut profile = BehaviorProfile::empty("p-1", TaskKind::Medication, at(1, 0));
        profile.total_sent = 1;
        profile.total_acknowledged = 2;
        assert!(upsert_profile(&conn, &profile).is_err());
    }

    #[test]
    fn one_response_per_instance() {
        let conn = open_memory_database().unwrap();
        let instance = make_instance(&conn, false, at(2, 8));
        assert!(insert_response_event(&conn, &make_event(instance, false, at(2, 14))).unwrap());
        assert!(!insert_response_event(&conn, &make_event(instance, false, at(2, 15))).unwrap());

        let stored = get_response_for_instance(&conn, &instance).unwrap().unwrap();
        assert_eq!(stored.observed_at, at(2, 14));
    }

    #[test]
    fn recent_events_newest_first_and_limited() {
        let conn = open_memory_database().unwrap();
        for day in 1..=5 {
            let instance = make_instance(&conn, false, at(day, 8));
            insert_response_event(&conn, &make_event(instance, false, at(day, 14))).unwrap();
        }
        let events = recent_response_events(&conn, "p-1", Some(TaskKind::Medication), 3).unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].observed_at, at(5, 14));
        assert!(recent_response_events(&conn, "p-1", Some(TaskKind::LabTest), 3)
            .unwrap()
            .is_empty());
        assert_eq!(recent_response_events(&conn, "p-1", None, 10).unwrap().len(), 5);
    }

    #[test]
    fn counts_critical_no_responses() {
        let conn = open_memory_database().unwrap();
        for day in 1..=3 {
            let instance = make_instance(&conn, true, at(day, 8));
            insert_response_event(&conn, &make_event(instance, true, at(day, 14))).unwrap();
        }
        let plain = make_instance(&conn, false, at(4, 8));
        insert_response_event(&conn, &make_event(plain, false, at(4, 14))).unwrap();

        assert_eq!(count_critical_no_response_since(&conn, "p-1", at(1, 0)).unwrap(), 3);
        assert_eq!(count_critical_no_response_since(&conn, "p-1", at(2, 0)).unwrap(), 2);
    }
}
