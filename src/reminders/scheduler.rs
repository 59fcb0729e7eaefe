//! Expands a reminder spec into concrete delivery slots.
//!
//! Planning is pure: the same spec, profile and `now` always produce the same
//! slots with the same ids, so materializing twice inserts nothing new.

use chrono::{DateTime, Datelike, Duration, FixedOffset, Months, NaiveDate, TimeZone, Utc};
use rusqlite::Connection;
use sha2::{Digest, Sha256};

use crate::config::EngineConfig;
use crate::db::repository;
use crate::models::enums::{Cadence, SpecState};
use crate::models::{BehaviorProfile, ReminderInstance, ReminderSpec};

use super::types::ReminderError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaterializeSummary {
    pub planned: usize,
    pub inserted: usize,
}

#[derive(Debug, Clone)]
pub struct Scheduler {
    horizon: Duration,
    offset: FixedOffset,
}

impl Scheduler {
    pub fn new(horizon: Duration, offset: FixedOffset) -> Self {
        Self { horizon, offset }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.scheduler_horizon(), config.local_offset())
    }

    /// Local hour of each daily occurrence, in occurrence order.
    ///
    /// Adaptive specs take learned best hours first, then the preferred
    /// hours, then the task kind's defaults.
    pub fn effective_hours(spec: &ReminderSpec, profile: Option<&BehaviorProfile>) -> Vec<u8> {
        let defaults = spec.task_kind.default_hours();
        let best: &[u8] = match profile {
            Some(p) if spec.adaptive => &p.best_hours,
            _ => &[],
        };
        (0..spec.times_per_day.max(1) as usize)
            .map(|i| {
                best.get(i)
                    .or_else(|| spec.preferred_hours.get(i))
                    .copied()
                    .unwrap_or(defaults[i % defaults.len()])
            })
            .collect()
    }

    /// Slots for `spec` from `now` to the end of its range, never earlier than `now`.
    pub fn plan(
        &self,
        spec: &ReminderSpec,
        profile: Option<&BehaviorProfile>,
        now: DateTime<Utc>,
    ) -> Vec<ReminderInstance> {
        if spec.state != SpecState::Active {
            return Vec::new();
        }

        let today = now.with_timezone(&self.offset).date_naive();
        let horizon_end = today + self.horizon;
        let last = spec.end_date.map_or(horizon_end, |end| end.min(horizon_end));
        if last < spec.start_date {
            return Vec::new();
        }

        let hours = Self::effective_hours(spec, profile);
        let per_day = match spec.cadence {
            Cadence::Once | Cadence::Monthly => 1,
            Cadence::Daily | Cadence::Weekly => hours.len(),
        };

        let mut slots = Vec::new();
        for date in occurrence_dates(spec, today.max(spec.start_date), last) {
            for (index, hour) in hours.iter().take(per_day).enumerate() {
                let minute = slot_minute(spec, date, index);
                let Some(at) = self.local_to_utc(date, *hour, minute) else {
                    continue;
                };
                if at < now {
                    continue;
                }
                slots.push(ReminderInstance::pending(
                    ReminderInstance::slot_id(spec.id, date, index),
                    spec.id,
                    at,
                ));
            }
        }
        slots.sort_by(|a, b| a.scheduled_at.cmp(&b.scheduled_at).then(a.id.cmp(&b.id)));
        slots
    }

    /// True for the regular occurrences `plan` produces for `spec`; false for
    /// ad-hoc slots such as postpone follow-ups.
    pub fn owns(&self, spec: &ReminderSpec, slot: &ReminderInstance) -> bool {
        let date = slot.scheduled_at.with_timezone(&self.offset).date_naive();
        (0..spec.times_per_day.max(1) as usize)
            .any(|index| ReminderInstance::slot_id(spec.id, date, index) == slot.id)
    }

    /// Persist the plan. Slots that already exist are left untouched.
    pub fn materialize(
        &self,
        conn: &Connection,
        spec: &ReminderSpec,
        profile: Option<&BehaviorProfile>,
        now: DateTime<Utc>,
    ) -> Result<MaterializeSummary, ReminderError> {
        let slots = self.plan(spec, profile, now);
        let tx = conn.unchecked_transaction()?;
        let mut inserted = 0;
        for slot in &slots {
            if repository::insert_instance_if_absent(&tx, slot)? {
                inserted += 1;
            }
        }
        tx.commit()?;

        tracing::debug!(
            spec_id = %spec.id,
            patient_id = %spec.patient_id,
            planned = slots.len(),
            inserted,
            "Reminder slots materialized"
        );
        Ok(MaterializeSummary {
            planned: slots.len(),
            inserted,
        })
    }

    fn local_to_utc(&self, date: NaiveDate, hour: u8, minute: u32) -> Option<DateTime<Utc>> {
        let local = date.and_hms_opt(u32::from(hour), minute, 0)?;
        self.offset
            .from_local_datetime(&local)
            .single()
            .map(|at| at.with_timezone(&Utc))
    }
}

/// Calendar dates in `[first, last]` on which the spec fires.
fn occurrence_dates(spec: &ReminderSpec, first: NaiveDate, last: NaiveDate) -> Vec<NaiveDate> {
    match spec.cadence {
        Cadence::Once => {
            if spec.start_date >= first && spec.start_date <= last {
                vec![spec.start_date]
            } else {
                Vec::new()
            }
        }
        Cadence::Daily => first.iter_days().take_while(|d| *d <= last).collect(),
        Cadence::Weekly => first
            .iter_days()
            .take_while(|d| *d <= last)
            .filter(|d| {
                let weekday = d.weekday().num_days_from_monday() as u8;
                spec.day_mask.contains(&weekday)
            })
            .collect(),
        Cadence::Monthly => monthly_dates(spec.start_date, first, last),
    }
}

/// Same day-of-month as `anchor`, clamped to the month's last day.
fn monthly_dates(anchor: NaiveDate, first: NaiveDate, last: NaiveDate) -> Vec<NaiveDate> {
    let mut dates = Vec::new();
    let Some(mut month_start) = anchor.with_day(1) else {
        return dates;
    };
    while month_start <= last {
        let date = clamp_day(month_start, anchor.day());
        if date >= first && date <= last {
            dates.push(date);
        }
        match month_start.checked_add_months(Months::new(1)) {
            Some(next) => month_start = next,
            None => break,
        }
    }
    dates
}

fn clamp_day(month_start: NaiveDate, day: u32) -> NaiveDate {
    (1..=day)
        .rev()
        .find_map(|d| month_start.with_day(d))
        .unwrap_or(month_start)
}

/// Deterministic minute within the hour, spreading slots that share an hour.
pub fn slot_minute(spec: &ReminderSpec, date: NaiveDate, index: usize) -> u32 {
    let digest = Sha256::digest(format!("{}|{}|{}", spec.id, date, index).as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(head) % 60) as u32
}
