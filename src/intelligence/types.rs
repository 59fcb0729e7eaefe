use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::db::DatabaseError;
use crate::models::{Alert, LabSample};

// ---------------------------------------------------------------------------
// IntelligenceError
// ---------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum IntelligenceError {
    #[error("Database error: {0}")]
    Database(DatabaseError),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Insufficient data for {patient_id}/{metric_code}: {found} usable samples, {required} required")]
    InsufficientData {
        patient_id: String,
        metric_code: String,
        found: usize,
        required: usize,
    },

    #[error("Compute deadline exceeded during {0}")]
    DeadlineExceeded(&'static str),

    #[error("Alert not found: {0}")]
    AlertNotFound(Uuid),

    #[error("Anomaly not found: {0}")]
    AnomalyNotFound(Uuid),
}

impl IntelligenceError {
    /// Failures that a later tick may not hit again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_) | Self::DeadlineExceeded(_))
    }
}

impl From<DatabaseError> for IntelligenceError {
    fn from(err: DatabaseError) -> Self {
        if err.is_transient() {
            Self::StoreUnavailable(err.to_string())
        } else {
            Self::Database(err)
        }
    }
}

// ---------------------------------------------------------------------------
// External collaborators
// ---------------------------------------------------------------------------

/// Failure reported by an external read store.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SourceError {
    #[error("source unavailable: {0}")]
    Unavailable(String),

    #[error("source call timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl From<SourceError> for IntelligenceError {
    fn from(err: SourceError) -> Self {
        Self::StoreUnavailable(err.to_string())
    }
}

/// Read interface over the external lab-result store.
pub trait LabSource: Send + Sync {
    /// Samples for one patient-metric with `taken_at` in `[from, to]`, any order.
    fn samples(
        &self,
        patient_id: &str,
        metric_code: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<LabSample>, SourceError>;
}

/// Consumer of synthesized alerts (dashboards, care-team inbox).
pub trait AlertSink: Send + Sync {
    fn publish(&self, alert: &Alert);
}
