use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::{Channel, ResponseAction, ResponseKind, TaskKind};

/// How the patient reacted to one delivered slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEvent {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub patient_id: String,
    pub task_kind: TaskKind,
    pub critical: bool,
    pub scheduled_at: DateTime<Utc>,
    pub observed_at: DateTime<Utc>,
    pub response_kind: ResponseKind,
    pub action: Option<ResponseAction>,
    pub delay_secs: i64,
}

impl ResponseEvent {
    pub fn delay(&self) -> Duration {
        Duration::seconds(self.delay_secs)
    }
}

/// Learned response statistics for one patient-task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehaviorProfile {
    pub patient_id: String,
    pub task_kind: TaskKind,
    pub best_hours: Vec<u8>,
    pub worst_hours: Vec<u8>,
    pub total_sent: u32,
    pub total_acknowledged: u32,
    pub compliance_rate: f64,
    pub avg_response_delay_secs: f64,
    /// Number of delays folded into the running mean.
    pub delay_samples: u32,
    pub preferred_channel: Channel,
    pub updated_at: DateTime<Utc>,
}

impl BehaviorProfile {
    pub fn empty(patient_id: &str, task_kind: TaskKind, now: DateTime<Utc>) -> Self {
        Self {
            patient_id: patient_id.to_string(),
            task_kind,
            best_hours: Vec::new(),
            worst_hours: Vec::new(),
            total_sent: 0,
            total_acknowledged: 0,
            compliance_rate: 0.0,
            avg_response_delay_secs: 0.0,
            delay_samples: 0,
            preferred_channel: Channel::InApp,
            updated_at: now,
        }
    }

    pub fn avg_response_delay(&self) -> Duration {
        Duration::seconds(self.avg_response_delay_secs.round() as i64)
    }
}
