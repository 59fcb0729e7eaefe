use thiserror::Error;
use uuid::Uuid;

use crate::db::DatabaseError;
use crate::models::enums::Outcome;
use crate::models::Notification;

// ---------------------------------------------------------------------------
// ReminderError
// ---------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum ReminderError {
    #[error("Database error: {0}")]
    Database(DatabaseError),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Invalid reminder spec: {0}")]
    InvalidSpec(String),

    #[error("Reminder spec not found: {0}")]
    SpecNotFound(Uuid),

    #[error("Reminder instance not found: {0}")]
    InstanceNotFound(Uuid),

    #[error("Instance {0} was claimed by another worker")]
    ConflictingTransition(Uuid),

    #[error("Transport rejected notification for instance {instance_id}: {reason}")]
    TransportRejected { instance_id: Uuid, reason: String },

    #[error("Instance {0} has not been delivered yet")]
    NotDelivered(Uuid),

    #[error("Instance {instance_id} is closed ({outcome})")]
    AcknowledgementClosed { instance_id: Uuid, outcome: Outcome },
}

impl ReminderError {
    /// Failures that a later tick may not hit again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_) | Self::TransportRejected { .. })
    }
}

impl From<DatabaseError> for ReminderError {
    fn from(err: DatabaseError) -> Self {
        if err.is_transient() {
            Self::StoreUnavailable(err.to_string())
        } else {
            Self::Database(err)
        }
    }
}

impl From<rusqlite::Error> for ReminderError {
    fn from(err: rusqlite::Error) -> Self {
        DatabaseError::from(err).into()
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("rejected: {0}")]
    Rejected(String),

    #[error("unavailable: {0}")]
    Unavailable(String),
}

/// Outbound delivery channel. Must tolerate duplicate notifications.
pub trait TransportSink: Send + Sync {
    /// Hand over a notification; returns the channel's notification id.
    fn send(&self, notification: &Notification) -> Result<String, TransportError>;
}
