use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::{AlertKind, Priority, ResolutionState, TaskKind};

/// What an alert was synthesized from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AlertSource {
    Anomaly { id: Uuid },
    Trend { id: Uuid },
    Adherence { task_kind: TaskKind },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub patient_id: String,
    pub kind: AlertKind,
    pub priority: Priority,
    pub title: String,
    pub body: String,
    pub sources: Vec<AlertSource>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub resolution_state: ResolutionState,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
    pub resolution_notes: Option<String>,
}

impl Alert {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.resolution_state == ResolutionState::Open && self.expires_at > now
    }

    /// Add a source unless already attached. Returns true when added.
    pub fn attach(&mut self, source: AlertSource) -> bool {
        if self.sources.contains(&source) {
            return false;
        }
        self.sources.push(source);
        true
    }
}
