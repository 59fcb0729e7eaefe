//! Behavior ledger: per (patient, task kind) response history folded into a
//! [`BehaviorProfile`].

use chrono::{DateTime, FixedOffset, Timelike, Utc};
use rusqlite::Connection;

use crate::config::EngineConfig;
use crate::db::repository;
use crate::models::enums::{ResponseAction, ResponseKind, TaskKind};
use crate::models::{BehaviorProfile, ResponseEvent};

use super::types::ReminderError;

#[derive(Debug, Clone)]
pub struct BehaviorLedger {
    offset: FixedOffset,
}

impl BehaviorLedger {
    pub fn new(offset: FixedOffset) -> Self {
        Self { offset }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.local_offset())
    }

    /// Append a response and fold it into the profile, atomically.
    ///
    /// Returns `None` when the instance already has a response; the
    /// profile is then left as it was.
    pub fn record(
        &self,
        conn: &Connection,
        event: &ResponseEvent,
        now: DateTime<Utc>,
    ) -> Result<Option<BehaviorProfile>, ReminderError> {
        let tx = conn.unchecked_transaction()?;
        let profile = self.append(&tx, event, now)?;
        tx.commit()?;
        Ok(profile)
    }

    /// [`record`](Self::record) for callers already inside a transaction.
    pub fn append(
        &self,
        conn: &Connection,
        event: &ResponseEvent,
        now: DateTime<Utc>,
    ) -> Result<Option<BehaviorProfile>, ReminderError> {
        if !repository::insert_response_event(conn, event)? {
            tracing::debug!(instance_id = %event.instance_id, "Response already recorded");
            return Ok(None);
        }

        let mut profile = repository::get_profile(conn, &event.patient_id, event.task_kind)?
            .unwrap_or_else(|| BehaviorProfile::empty(&event.patient_id, event.task_kind, now));
        self.apply(&mut profile, event, now);
        repository::upsert_profile(conn, &profile)?;

        tracing::debug!(
            patient_id = %profile.patient_id,
            task_kind = %profile.task_kind,
            response = %event.response_kind,
            compliance = profile.compliance_rate,
            "Behavior profile updated"
        );
        Ok(Some(profile))
    }

    /// Fold one response into `profile`.
    pub fn apply(&self, profile: &mut BehaviorProfile, event: &ResponseEvent, now: DateTime<Utc>) {
        profile.total_sent += 1;
        if event.action.is_some() {
            profile.total_acknowledged += 1;
            // Running mean over acknowledged responses only.
            profile.delay_samples += 1;
            let delta = event.delay_secs as f64 - profile.avg_response_delay_secs;
            profile.avg_response_delay_secs += delta / f64::from(profile.delay_samples);
        }
        profile.compliance_rate =
            f64::from(profile.total_acknowledged) / f64::from(profile.total_sent);

        let hour = event.scheduled_at.with_timezone(&self.offset).hour() as u8;
        match (event.response_kind, event.action) {
            (ResponseKind::Immediate, Some(ResponseAction::Taken)) => {
                insert_hour(&mut profile.best_hours, hour);
                profile.worst_hours.retain(|h| *h != hour);
            }
            (ResponseKind::NoResponse, None) => {
                insert_hour(&mut profile.worst_hours, hour);
                profile.best_hours.retain(|h| *h != hour);
            }
            _ => {}
        }
        profile.updated_at = now;
    }

    pub fn profile(
        &self,
        conn: &Connection,
        patient_id: &str,
        task_kind: TaskKind,
    ) -> Result<Option<BehaviorProfile>, ReminderError> {
        Ok(repository::get_profile(conn, patient_id, task_kind)?)
    }

    /// Zero when nothing has been delivered yet.
    pub fn compliance(
        &self,
        conn: &Connection,
        patient_id: &str,
        task_kind: TaskKind,
    ) -> Result<f64, ReminderError> {
        Ok(self
            .profile(conn, patient_id, task_kind)?
            .map_or(0.0, |p| p.compliance_rate))
    }
}

fn insert_hour(hours: &mut Vec<u8>, hour: u8) {
    if let Err(pos) = hours.binary_search(&hour) {
        hours.insert(pos, hour);
    }
}
