use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reference statistics for one patient-metric pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    pub patient_id: String,
    pub metric_code: String,
    pub mean: f64,
    pub std_dev: f64,
    pub sample_count: u32,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub computed_at: DateTime<Utc>,
}

impl Baseline {
    /// Zero dispersion carries no signal; outlier scoring is suppressed.
    pub fn is_flat(&self) -> bool {
        self.std_dev <= f64::EPSILON
    }
}
