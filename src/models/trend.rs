use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::TrendDirection;

/// Regression summary over one window. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendReport {
    pub id: Uuid,
    pub patient_id: String,
    pub metric_code: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub slope_per_month: f64,
    pub r_squared: f64,
    pub direction: TrendDirection,
    pub sample_count: u32,
    pub mean_value: f64,
    pub description: String,
    pub computed_at: DateTime<Utc>,
}
