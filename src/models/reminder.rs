use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::derive_id;
use super::enums::{Cadence, Outcome, SpecState, TaskKind};
use crate::db::DATE_FORMAT;

/// Declarative reminder template for one patient-task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReminderSpec {
    pub id: Uuid,
    pub patient_id: String,
    pub task_kind: TaskKind,
    pub title: String,
    pub description: String,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    pub cadence: Cadence,
    pub times_per_day: u8,
    /// Weekdays, Monday = 0 .. Sunday = 6.
    pub day_mask: Vec<u8>,
    pub preferred_hours: Vec<u8>,
    /// 1..10
    pub priority: u8,
    pub critical: bool,
    pub adaptive: bool,
    pub state: SpecState,
    pub last_tuned_at: Option<DateTime<Utc>>,
    /// Best hours the schedule was last tuned against.
    pub tuned_best_hours: Option<Vec<u8>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One materialized send slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReminderInstance {
    pub id: Uuid,
    pub spec_id: Uuid,
    pub scheduled_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub attempt_count: u32,
    pub notification_id: Option<String>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub outcome: Outcome,
    pub notes: Option<String>,
}

impl ReminderInstance {
    pub fn pending(id: Uuid, spec_id: Uuid, scheduled_at: DateTime<Utc>) -> Self {
        Self {
            id,
            spec_id,
            scheduled_at,
            sent_at: None,
            attempt_count: 0,
            notification_id: None,
            acknowledged_at: None,
            outcome: Outcome::Pending,
            notes: None,
        }
    }

    /// Slot id for occurrence `index` of `date`.
    pub fn slot_id(spec_id: Uuid, date: NaiveDate, index: usize) -> Uuid {
        derive_id(&[
            "slot",
            &spec_id.to_string(),
            &date.format(DATE_FORMAT).to_string(),
            &index.to_string(),
        ])
    }

    /// Id of the single follow-up slot a postponement may create.
    pub fn follow_up_id(instance_id: Uuid) -> Uuid {
        derive_id(&["follow_up", &instance_id.to_string()])
    }
}
