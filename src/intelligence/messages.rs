use crate::models::enums::{TaskKind, TrendDirection};
use crate::models::{Anomaly, BehaviorProfile, TrendReport};

use super::reference::MetricFamily;

/// Message template builder for alert titles, bodies and trend narratives.
/// Calm, factual framing; numbers carry their unit.
pub struct MessageTemplates;

impl MessageTemplates {
    /// One-line trend narrative stored on every report.
    pub fn trend_description(
        direction: TrendDirection,
        slope_per_month: f64,
        unit: &str,
        samples: usize,
    ) -> String {
        match direction {
            TrendDirection::Stable => format!("stable over {samples} samples"),
            other => format!(
                "{} at {:+.2} {}/month over {} samples",
                other.as_str(),
                slope_per_month,
                unit,
                samples,
            ),
        }
    }

    pub fn deterioration_title(family: MetricFamily, metric_code: &str) -> String {
        match family {
            MetricFamily::Hba1c => "HbA1c control deteriorating".to_string(),
            MetricFamily::Glucose => "Glucose control deteriorating".to_string(),
            MetricFamily::Other => format!("{metric_code} trending upward"),
        }
    }

    pub fn deterioration_body(report: &TrendReport) -> String {
        format!(
            "{} readings are rising by {:.2} per month (r² {:.2}, {} samples, average {:.1}). \
             A review of the current treatment plan may be worthwhile.",
            report.metric_code,
            report.slope_per_month,
            report.r_squared,
            report.sample_count,
            report.mean_value,
        )
    }

    pub fn critical_anomaly_title(metric_code: &str) -> String {
        format!("Critical {metric_code} reading")
    }

    pub fn critical_anomaly_body(anomaly: &Anomaly) -> String {
        format!(
            "{} of {} recorded at {} deviates sharply from the reference value {:.1} \
             ({} score {:.1}). Please review promptly.",
            anomaly.metric_code,
            anomaly.observed_value,
            anomaly.observed_at.format("%Y-%m-%d %H:%M"),
            anomaly.reference_value,
            anomaly.kind.as_str().replace('_', " "),
            anomaly.score,
        )
    }

    pub fn adherence_title(task_kind: TaskKind) -> String {
        format!("Low {} adherence", task_label(task_kind))
    }

    pub fn adherence_body(profile: &BehaviorProfile) -> String {
        format!(
            "Only {} of the last {} {} reminders were acknowledged ({:.0}%). \
             Consider checking in with the patient about their routine.",
            profile.total_acknowledged,
            profile.total_sent,
            task_label(profile.task_kind),
            profile.compliance_rate * 100.0,
        )
    }
}

pub(crate) fn task_label(task_kind: TaskKind) -> &'static str {
    match task_kind {
        TaskKind::Medication => "medication",
        TaskKind::LabTest => "lab test",
        TaskKind::Appointment => "appointment",
        TaskKind::SelfCheck => "self-check",
    }
}
