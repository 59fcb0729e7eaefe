use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::derive_id;
use super::enums::{AnomalyKind, Severity};
use crate::db::TS_FORMAT;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub id: Uuid,
    pub patient_id: String,
    pub metric_code: String,
    pub kind: AnomalyKind,
    pub severity: Severity,
    pub observed_value: f64,
    /// Baseline mean for outliers, previous sample for sudden changes.
    pub reference_value: f64,
    /// z-score or percent change, unit-free.
    pub score: f64,
    pub observed_at: DateTime<Utc>,
    pub detected_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub acknowledged_by: Option<String>,
}

impl Anomaly {
    /// Id keyed on (patient, metric, observed_at, kind); re-scoring hits the same row.
    pub fn key_id(
        patient_id: &str,
        metric_code: &str,
        observed_at: DateTime<Utc>,
        kind: AnomalyKind,
    ) -> Uuid {
        derive_id(&[
            "anomaly",
            patient_id,
            metric_code,
            &observed_at.format(TS_FORMAT).to_string(),
            kind.as_str(),
        ])
    }
}
