//! Read-only behaviour insights over the ledger.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, FixedOffset, Timelike, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::db::repository;
use crate::intelligence::messages::task_label;
use crate::models::enums::{ResponseAction, Severity, TaskKind};

use super::types::ReminderError;

const LOW_COMPLIANCE_BELOW: f64 = 0.5;
const SLOW_RESPONSE_SECS: f64 = 2.0 * 3600.0;
const CRITICAL_MISSED_ABOVE: u32 = 2;
const CRITICAL_LOOKBACK_DAYS: i64 = 7;
const PREDICTION_EVENTS: usize = 200;
const PREDICTION_MIN_EVENTS: usize = 5;
const DEFAULT_BEST_HOURS: [(u8, f64); 3] = [(8, 0.7), (12, 0.6), (20, 0.5)];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightKind {
    LowCompliance,
    SlowResponse,
    CriticalMissed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    pub kind: InsightKind,
    pub severity: Severity,
    pub task_kind: Option<TaskKind>,
    pub message: String,
    pub suggestion: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HourScore {
    pub hour: u8,
    pub score: f64,
}

pub fn generate_insights(
    conn: &Connection,
    patient_id: &str,
    now: DateTime<Utc>,
) -> Result<Vec<Insight>, ReminderError> {
    let mut insights = Vec::new();

    for profile in repository::list_profiles_for_patient(conn, patient_id)? {
        if profile.total_sent == 0 {
            continue;
        }
        let label = task_label(profile.task_kind);
        if profile.compliance_rate < LOW_COMPLIANCE_BELOW {
            insights.push(Insight {
                kind: InsightKind::LowCompliance,
                severity: Severity::High,
                task_kind: Some(profile.task_kind),
                message: format!(
                    "Compliance with {label} reminders is low ({:.1}%)",
                    profile.compliance_rate * 100.0
                ),
                suggestion: "Consider changing the reminder time or channel".into(),
            });
        }
        if profile.delay_samples > 0 && profile.avg_response_delay_secs > SLOW_RESPONSE_SECS {
            insights.push(Insight {
                kind: InsightKind::SlowResponse,
                severity: Severity::Medium,
                task_kind: Some(profile.task_kind),
                message: format!("Average response time to {label} reminders is high"),
                suggestion: "Try repeated reminders or different wording".into(),
            });
        }
    }

    let since = now - Duration::days(CRITICAL_LOOKBACK_DAYS);
    let missed = repository::count_critical_no_response_since(conn, patient_id, since)?;
    if missed > CRITICAL_MISSED_ABOVE {
        insights.push(Insight {
            kind: InsightKind::CriticalMissed,
            severity: Severity::Critical,
            task_kind: None,
            message: format!("{missed} critical reminders went unanswered in the last week"),
            suggestion: "Direct contact or urgent follow-up is recommended".into(),
        });
    }

    Ok(insights)
}

/// Up to three local hours ranked by how often an answered reminder was
/// TAKEN at that hour. Hours with fewer than five answers are ignored.
pub fn predict_best_hours(
    conn: &Connection,
    patient_id: &str,
    task_kind: TaskKind,
    offset: FixedOffset,
) -> Result<Vec<HourScore>, ReminderError> {
    let events: Vec<_> =
        repository::recent_response_events(conn, patient_id, Some(task_kind), PREDICTION_EVENTS)?
            .into_iter()
            .filter(|e| e.action.is_some())
            .collect();
    if events.is_empty() {
        return Ok(DEFAULT_BEST_HOURS
            .iter()
            .map(|(hour, score)| HourScore { hour: *hour, score: *score })
            .collect());
    }

    // hour -> (total, taken)
    let mut tally: BTreeMap<u8, (usize, usize)> = BTreeMap::new();
    for event in &events {
        let hour = event.observed_at.with_timezone(&offset).hour() as u8;
        let entry = tally.entry(hour).or_default();
        entry.0 += 1;
        if event.action == Some(ResponseAction::Taken) {
            entry.1 += 1;
        }
    }

    let mut scores: Vec<HourScore> = tally
        .into_iter()
        .filter(|(_, (total, _))| *total >= PREDICTION_MIN_EVENTS)
        .map(|(hour, (total, taken))| HourScore {
            hour,
            score: taken as f64 / total as f64,
        })
        .collect();
    scores.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.hour.cmp(&b.hour)));
    scores.truncate(3);
    Ok(scores)
}
