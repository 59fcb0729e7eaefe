//! Adaptive tuning: re-plans future slots of an adaptive spec around the
//! hours the patient actually responds at.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rusqlite::Connection;

use crate::config::EngineConfig;
use crate::db::repository;
use crate::models::{BehaviorProfile, ReminderSpec};

use super::scheduler::Scheduler;
use super::types::ReminderError;

#[derive(Debug, Clone, PartialEq)]
pub struct TuneOutcome {
    pub deleted: usize,
    pub inserted: usize,
    /// Slots whose time actually moved.
    pub moved: usize,
    pub hours: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct AdaptiveTuner {
    compliance_threshold: f64,
    max_delete_fraction: f64,
}

impl AdaptiveTuner {
    pub fn new(compliance_threshold: f64, max_delete_fraction: f64) -> Self {
        Self {
            compliance_threshold,
            max_delete_fraction,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.tuner_compliance_threshold, config.tuner_max_delete_fraction)
    }

    /// Low compliance, or best hours that moved since the last tune.
    pub fn needs_tune(&self, spec: &ReminderSpec, profile: &BehaviorProfile) -> bool {
        if !spec.adaptive {
            return false;
        }
        let tuned: &[u8] = spec.tuned_best_hours.as_deref().unwrap_or(&[]);
        profile.compliance_rate < self.compliance_threshold || profile.best_hours != tuned
    }

    /// Replace the spec's future unsent scheduled slots with a plan built
    /// from the current profile; follow-ups are kept. `None` when nothing
    /// needed changing.
    pub fn tune(
        &self,
        conn: &Connection,
        scheduler: &Scheduler,
        spec: &ReminderSpec,
        now: DateTime<Utc>,
    ) -> Result<Option<TuneOutcome>, ReminderError> {
        let Some(profile) = repository::get_profile(conn, &spec.patient_id, spec.task_kind)? else {
            return Ok(None);
        };
        if !self.needs_tune(spec, &profile) {
            return Ok(None);
        }

        let tx = conn.unchecked_transaction()?;
        let existing: Vec<_> = repository::list_future_unsent(&tx, &spec.id, now)?
            .into_iter()
            .filter(|slot| scheduler.owns(spec, slot))
            .collect();
        let planned = scheduler.plan(spec, Some(&profile), now);
        let kept: HashSet<_> = planned.iter().map(|s| (s.id, s.scheduled_at)).collect();
        let moved = existing
            .iter()
            .filter(|s| !kept.contains(&(s.id, s.scheduled_at)))
            .count();

        if !existing.is_empty() {
            let fraction = moved as f64 / existing.len() as f64;
            if fraction > self.max_delete_fraction {
                tracing::warn!(
                    spec_id = %spec.id,
                    moved,
                    pending = existing.len(),
                    "Tuning moves more than the allowed fraction of pending reminders"
                );
            }
        }

        let mut deleted = 0;
        for slot in &existing {
            deleted += repository::delete_unsent_instance(&tx, &slot.id)?;
        }
        let mut inserted = 0;
        for slot in &planned {
            if repository::insert_instance_if_absent(&tx, slot)? {
                inserted += 1;
            }
        }
        let hours = Scheduler::effective_hours(spec, Some(&profile));
        repository::record_spec_tune(&tx, &spec.id, &hours, &profile.best_hours, now)?;
        tx.commit()?;

        tracing::info!(
            spec_id = %spec.id,
            patient_id = %spec.patient_id,
            compliance = profile.compliance_rate,
            hours = ?hours,
            deleted,
            inserted,
            moved,
            "Reminder spec tuned"
        );
        Ok(Some(TuneOutcome {
            deleted,
            inserted,
            moved,
            hours,
        }))
    }
}
