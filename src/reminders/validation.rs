use crate::models::enums::Cadence;
use crate::models::ReminderSpec;

use super::types::ReminderError;

/// Check the structural invariants of a spec. All violations are reported
/// together in one `InvalidSpec`.
pub fn validate_spec(spec: &ReminderSpec) -> Result<(), ReminderError> {
    let mut problems = Vec::new();

    if spec.title.trim().is_empty() {
        problems.push("title must not be empty".to_string());
    }
    if spec.patient_id.trim().is_empty() {
        problems.push("patient_id must not be empty".to_string());
    }
    if spec.times_per_day < 1 {
        problems.push("times_per_day must be at least 1".to_string());
    }
    if !spec.preferred_hours.is_empty() && spec.preferred_hours.len() != spec.times_per_day as usize {
        problems.push(format!(
            "preferred_hours has {} entries but times_per_day is {}",
            spec.preferred_hours.len(),
            spec.times_per_day
        ));
    }
    if let Some(hour) = spec.preferred_hours.iter().find(|h| **h > 23) {
        problems.push(format!("preferred hour {hour} is not within 0..23"));
    }
    if let Some(end) = spec.end_date {
        if end < spec.start_date {
            problems.push(format!("end_date {end} precedes start_date {}", spec.start_date));
        }
    }
    if spec.cadence == Cadence::Weekly && spec.day_mask.is_empty() {
        problems.push("day_mask is required for weekly cadence".to_string());
    }
    if let Some(day) = spec.day_mask.iter().find(|d| **d > 6) {
        problems.push(format!("day_mask entry {day} is not within 0..6"));
    }
    if !(1..=10).contains(&spec.priority) {
        problems.push(format!("priority {} is not within 1..10", spec.priority));
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(ReminderError::InvalidSpec(problems.join("; ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::enums::{SpecState, TaskKind};
    use chrono::{NaiveDate, TimeZone, Utc};
    use uuid::Uuid;

    fn make_spec() -> ReminderSpec {
        let at = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();
        ReminderSpec {
            id: Uuid::new_v4(),
            patient_id: "p-1".into(),
            task_kind: TaskKind::Medication,
            title: "Metformin".into(),
            description: String::new(),
            start_date: NaiveDate::from_ymd_opt(2025, 3, 3).unwrap(),
            end_date: None,
            cadence: Cadence::Daily,
            times_per_day: 2,
            day_mask: vec![],
            preferred_hours: vec![8, 20],
            priority: 5,
            critical: false,
            adaptive: false,
            state: SpecState::Active,
            last_tuned_at: None,
            tuned_best_hours: None,
            created_at: at,
            updated_at: at,
        }
    }

    fn problems(spec: &ReminderSpec) -> String {
        match validate_spec(spec) {
            Err(ReminderError::InvalidSpec(msg)) => msg,
            other => panic!("expected InvalidSpec, got {other:?}"),
        }
    }

    #[test]
    fn valid_spec_passes() {
        assert!(validate_spec(&make_spec()).is_ok());
    }

    #[test]
    fn zero_times_per_day_rejected() {
        let mut spec = make_spec();
        spec.times_per_day = 0;
        spec.preferred_hours.clear();
        assert!(problems(&spec).contains("times_per_day"));
    }

    #[test]
    fn preferred_hours_must_match_times_per_day() {
        let mut spec = make_spec();
        spec.preferred_hours = vec![8];
        assert!(problems(&spec).contains("preferred_hours"));
    }

    #[test]
    fn end_before_start_rejected() {
        let mut spec = make_spec();
        spec.end_date = NaiveDate::from_ymd_opt(2025, 3, 1);
        assert!(problems(&spec).contains("end_date"));
    }

    #[test]
    fn weekly_needs_day_mask() {
        let mut spec = make_spec();
        spec.cadence = Cadence::Weekly;
        assert!(problems(&spec).contains("day_mask"));
        spec.day_mask = vec![0, 7];
        assert!(problems(&spec).contains("entry 7"));
    }

    #[test]
    fn all_violations_reported_together() {
        let mut spec = make_spec();
        spec.priority = 0;
        spec.preferred_hours = vec![8, 24];
        let msg = problems(&spec);
        assert!(msg.contains("priority"));
        assert!(msg.contains("24"));
    }
}
