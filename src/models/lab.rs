use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One lab measurement read from the external clinical store. Immutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabSample {
    pub patient_id: String,
    /// Stable code such as "HBA1C" or "GLUCOSE_FBS".
    pub metric_code: String,
    pub value: f64,
    pub unit: String,
    pub taken_at: DateTime<Utc>,
}

impl LabSample {
    pub fn new(
        patient_id: impl Into<String>,
        metric_code: impl Into<String>,
        value: f64,
        unit: impl Into<String>,
        taken_at: DateTime<Utc>,
    ) -> Self {
        Self {
            patient_id: patient_id.into(),
            metric_code: metric_code.into(),
            value,
            unit: unit.into(),
            taken_at,
        }
    }
}
