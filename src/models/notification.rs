use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::{Priority, ReferenceKind};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationReference {
    pub kind: ReferenceKind,
    pub resource_id: Uuid,
}

/// Outbound message handed to the transport sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub recipient_id: String,
    pub title: String,
    pub body: String,
    pub priority: Priority,
    pub reference: NotificationReference,
    pub created_at: DateTime<Utc>,
}
