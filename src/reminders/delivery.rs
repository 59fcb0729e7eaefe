//! Delivery coordination: dispatching due slots, sweeping missed ones and
//! recording patient acknowledgements.
//!
//! Every state change goes through a conditional UPDATE in the repository,
//! so two workers racing on the same slot cannot both win.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use uuid::Uuid;

use crate::config::{EngineConfig, ShardConfig};
use crate::db::repository;
use crate::models::derive_id;
use crate::models::enums::{Outcome, ResponseAction, ResponseKind};
use crate::models::{BehaviorProfile, ReminderInstance, ReminderSpec, ResponseEvent};

use super::ledger::BehaviorLedger;
use super::messages::compose_notification;
use super::types::{ReminderError, TransportSink};

#[derive(Debug, Default)]
pub struct DispatchReport {
    pub sent: usize,
    /// Slots another worker claimed first.
    pub conflicts: usize,
    /// Rejected sends put back for another attempt.
    pub retried: usize,
    /// Slots closed as MISSED after the last allowed attempt.
    pub abandoned: usize,
    /// One `TransportRejected` per refused send.
    pub rejections: Vec<ReminderError>,
    pub failures: Vec<(Uuid, ReminderError)>,
}

#[derive(Debug, Default)]
pub struct SweepReport {
    /// Delivered but never acknowledged.
    pub missed: usize,
    /// Never delivered before the grace period ran out.
    pub stale: usize,
    /// Profiles touched by synthesized non-responses.
    pub profiles: Vec<BehaviorProfile>,
    pub failures: Vec<(Uuid, ReminderError)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Acknowledgement {
    pub instance: ReminderInstance,
    pub event: ResponseEvent,
    pub follow_up: Option<ReminderInstance>,
    /// Set when this call changed the ledger.
    pub profile: Option<BehaviorProfile>,
}

enum SendResult {
    Sent,
    Retried(ReminderError),
    Abandoned(ReminderError),
}

#[derive(Debug, Clone)]
pub struct DeliveryCoordinator {
    send_window: Duration,
    grace: Duration,
    max_attempts: u32,
    postpone_delay: Duration,
    immediate: Duration,
    delayed: Duration,
    shard: ShardConfig,
    ledger: BehaviorLedger,
}

impl DeliveryCoordinator {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            send_window: config.send_window(),
            grace: config.grace(),
            max_attempts: config.deliver_max_attempts.max(1),
            postpone_delay: config.postpone_delay(),
            immediate: config.immediate_response(),
            delayed: config.delayed_response(),
            shard: config.shard,
            ledger: BehaviorLedger::from_config(config),
        }
    }

    pub fn ledger(&self) -> &BehaviorLedger {
        &self.ledger
    }

    pub fn classify_response(&self, delay: Duration) -> ResponseKind {
        if delay < self.immediate {
            ResponseKind::Immediate
        } else if delay < self.delayed {
            ResponseKind::Delayed
        } else {
            ResponseKind::NoResponse
        }
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Send every PENDING slot of this shard within the send window of `now`.
    pub fn dispatch_due(
        &self,
        conn: &Connection,
        transport: &dyn TransportSink,
        now: DateTime<Utc>,
    ) -> Result<DispatchReport, ReminderError> {
        let due = repository::list_due_instances(conn, now - self.send_window, now + self.send_window)?;
        let mut specs = SpecCache::default();
        let mut report = DispatchReport::default();

        for instance in due {
            let spec = match specs.get(conn, &instance.spec_id) {
                Ok(spec) => spec,
                Err(e) => {
                    report.failures.push((instance.id, e));
                    continue;
                }
            };
            if !self.shard.owns(&spec.patient_id) {
                continue;
            }
            match self.dispatch_one(conn, transport, &spec, &instance, now) {
                Ok(SendResult::Sent) => report.sent += 1,
                Ok(SendResult::Retried(rejection)) => {
                    report.retried += 1;
                    report.rejections.push(rejection);
                }
                Ok(SendResult::Abandoned(rejection)) => {
                    report.abandoned += 1;
                    report.rejections.push(rejection);
                }
                Err(ReminderError::ConflictingTransition(id)) => {
                    tracing::debug!(instance_id = %id, "Slot claimed elsewhere");
                    report.conflicts += 1;
                }
                Err(e) => {
                    tracing::warn!(instance_id = %instance.id, error = %e, "Dispatch failed");
                    report.failures.push((instance.id, e));
                }
            }
        }

        if report.sent + report.retried + report.abandoned > 0 {
            tracing::info!(
                sent = report.sent,
                retried = report.retried,
                abandoned = report.abandoned,
                conflicts = report.conflicts,
                "Reminder dispatch complete"
            );
        }
        Ok(report)
    }

    fn dispatch_one(
        &self,
        conn: &Connection,
        transport: &dyn TransportSink,
        spec: &ReminderSpec,
        instance: &ReminderInstance,
        now: DateTime<Utc>,
    ) -> Result<SendResult, ReminderError> {
        if !repository::claim_for_send(conn, &instance.id, now)? {
            return Err(ReminderError::ConflictingTransition(instance.id));
        }

        let notification = compose_notification(spec, instance, instance.attempt_count, now);
        match transport.send(&notification) {
            Ok(notification_id) => {
                repository::set_notification_id(conn, &instance.id, &notification_id)?;
                tracing::debug!(
                    instance_id = %instance.id,
                    patient_id = %spec.patient_id,
                    notification_id = %notification_id,
                    "Reminder sent"
                );
                Ok(SendResult::Sent)
            }
            Err(e) => {
                let attempts = instance.attempt_count + 1;
                tracing::warn!(
                    instance_id = %instance.id,
                    attempts,
                    error = %e,
                    "Transport rejected reminder"
                );
                let rejection = ReminderError::TransportRejected {
                    instance_id: instance.id,
                    reason: e.to_string(),
                };
                if attempts >= self.max_attempts {
                    let note = format!("transport rejected after {attempts} attempts: {e}");
                    repository::mark_missed(conn, &instance.id, Outcome::Sent, Some(&note))?;
                    Ok(SendResult::Abandoned(rejection))
                } else {
                    repository::revert_claim(conn, &instance.id)?;
                    Ok(SendResult::Retried(rejection))
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Sweep
    // -----------------------------------------------------------------------

    /// Close slots the grace period has run out on.
    ///
    /// Unacknowledged SENT slots become MISSED and feed a NONE response to
    /// the ledger. PENDING slots that were never delivered become MISSED
    /// without touching the ledger.
    pub fn sweep_missed(
        &self,
        conn: &Connection,
        now: DateTime<Utc>,
    ) -> Result<SweepReport, ReminderError> {
        let cutoff = now - self.grace;
        let mut specs = SpecCache::default();
        let mut report = SweepReport::default();

        for instance in repository::list_unacknowledged_sent_before(conn, cutoff)? {
            match self.close_unanswered(conn, &mut specs, &instance, now) {
                Ok(Some(profile)) => {
                    report.missed += 1;
                    report.profiles.push(profile);
                }
                Ok(None) => {}
                Err(e) => report.failures.push((instance.id, e)),
            }
        }

        for instance in repository::list_stale_pending(conn, cutoff)? {
            let owned = specs
                .get(conn, &instance.spec_id)
                .map(|spec| self.shard.owns(&spec.patient_id));
            match owned {
                Ok(true) => {
                    match repository::mark_missed(conn, &instance.id, Outcome::Pending, Some("not delivered")) {
                        Ok(true) => report.stale += 1,
                        Ok(false) => {}
                        Err(e) => report.failures.push((instance.id, e.into())),
                    }
                }
                Ok(false) => {}
                Err(e) => report.failures.push((instance.id, e)),
            }
        }

        if report.missed + report.stale > 0 {
            tracing::info!(missed = report.missed, stale = report.stale, "Missed reminder sweep complete");
        }
        Ok(report)
    }

    fn close_unanswered(
        &self,
        conn: &Connection,
        specs: &mut SpecCache,
        instance: &ReminderInstance,
        now: DateTime<Utc>,
    ) -> Result<Option<BehaviorProfile>, ReminderError> {
        let spec = specs.get(conn, &instance.spec_id)?;
        if !self.shard.owns(&spec.patient_id) {
            return Ok(None);
        }
        let tx = conn.unchecked_transaction()?;
        if !repository::mark_missed(&tx, &instance.id, Outcome::Sent, None)? {
            return Ok(None);
        }
        let sent_at = instance.sent_at.unwrap_or(instance.scheduled_at);
        let event = response_event(&spec, instance, ResponseKind::NoResponse, None, now - sent_at, now);
        let profile = self.ledger.append(&tx, &event, now)?;
        tx.commit()?;
        Ok(profile)
    }

    // -----------------------------------------------------------------------
    // Acknowledgement
    // -----------------------------------------------------------------------

    /// Record the patient's action on a delivered slot.
    ///
    /// A repeated call returns the first result and changes nothing.
    pub fn acknowledge(
        &self,
        conn: &Connection,
        instance_id: &Uuid,
        action: ResponseAction,
        notes: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Acknowledgement, ReminderError> {
        let instance = repository::get_instance(conn, instance_id)?
            .ok_or(ReminderError::InstanceNotFound(*instance_id))?;

        match instance.outcome {
            Outcome::Sent => {}
            Outcome::Pending => return Err(ReminderError::NotDelivered(instance.id)),
            _ => return self.previous_acknowledgement(conn, instance),
        }

        let spec = repository::get_spec(conn, &instance.spec_id)?
            .ok_or(ReminderError::SpecNotFound(instance.spec_id))?;
        let sent_at = instance.sent_at.unwrap_or(instance.scheduled_at);
        let acknowledged_at = now.max(sent_at);
        let delay = acknowledged_at - sent_at;
        let kind = self.classify_response(delay);

        let tx = conn.unchecked_transaction()?;
        if !repository::record_acknowledgment(&tx, &instance.id, action.outcome(), acknowledged_at, notes)? {
            drop(tx);
            let current = repository::get_instance(conn, instance_id)?
                .ok_or(ReminderError::InstanceNotFound(*instance_id))?;
            return self.previous_acknowledgement(conn, current);
        }
        let event = response_event(&spec, &instance, kind, Some(action), delay, acknowledged_at);
        let profile = self.ledger.append(&tx, &event, now)?;

        let follow_up = if action == ResponseAction::Postponed {
            let slot = ReminderInstance::pending(
                ReminderInstance::follow_up_id(instance.id),
                spec.id,
                acknowledged_at + self.postpone_delay,
            );
            repository::insert_instance_if_absent(&tx, &slot)?;
            Some(slot)
        } else {
            None
        };
        tx.commit()?;

        let instance = repository::get_instance(conn, instance_id)?
            .ok_or(ReminderError::InstanceNotFound(*instance_id))?;
        tracing::info!(
            instance_id = %instance.id,
            patient_id = %spec.patient_id,
            action = %action,
            response = %kind,
            "Reminder acknowledged"
        );
        Ok(Acknowledgement {
            instance,
            event,
            follow_up,
            profile,
        })
    }

    /// Result of an earlier acknowledgement, or why none is possible.
    fn previous_acknowledgement(
        &self,
        conn: &Connection,
        instance: ReminderInstance,
    ) -> Result<Acknowledgement, ReminderError> {
        let event = repository::get_response_for_instance(conn, &instance.id)?;
        match event {
            Some(event) if event.action.is_some() => {
                let follow_up = if event.action == Some(ResponseAction::Postponed) {
                    repository::get_instance(conn, &ReminderInstance::follow_up_id(instance.id))?
                } else {
                    None
                };
                Ok(Acknowledgement {
                    instance,
                    event,
                    follow_up,
                    profile: None,
                })
            }
            _ => Err(ReminderError::AcknowledgementClosed {
                instance_id: instance.id,
                outcome: instance.outcome,
            }),
        }
    }
}

fn response_event(
    spec: &ReminderSpec,
    instance: &ReminderInstance,
    kind: ResponseKind,
    action: Option<ResponseAction>,
    delay: Duration,
    observed_at: DateTime<Utc>,
) -> ResponseEvent {
    ResponseEvent {
        id: derive_id(&["response", &instance.id.to_string()]),
        instance_id: instance.id,
        patient_id: spec.patient_id.clone(),
        task_kind: spec.task_kind,
        critical: spec.critical,
        scheduled_at: instance.scheduled_at,
        observed_at,
        response_kind: kind,
        action,
        delay_secs: delay.num_seconds().max(0),
    }
}

/// Specs looked up once per pass.
#[derive(Default)]
struct SpecCache {
    specs: HashMap<Uuid, ReminderSpec>,
}

impl SpecCache {
    fn get(&mut self, conn: &Connection, id: &Uuid) -> Result<ReminderSpec, ReminderError> {
        if let Some(spec) = self.specs.get(id) {
            return Ok(spec.clone());
        }
        let spec = repository::get_spec(conn, id)?.ok_or(ReminderError::SpecNotFound(*id))?;
        self.specs.insert(*id, spec.clone());
        Ok(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::sqlite::open_memory_database;
    use crate::models::enums::TaskKind;
    use crate::engine::sinks::MemoryTransport;
    use crate::reminders::test_support::{daily_spec, seed_instance};
    use chrono::TimeZone;

    fn coordinator() -> DeliveryCoordinator {
        DeliveryCoordinator::from_config(&EngineConfig::default())
    }

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 3, hour, minute, 0).unwrap()
    }

    fn sent_instance(conn: &Connection, spec: &ReminderSpec) -> ReminderInstance {
        let instance = seed_instance(conn, spec, at(8, 0));
        assert!(repository::claim_for_send(conn, &instance.id, at(8, 0)).unwrap());
        repository::get_instance(conn, &instance.id).unwrap().unwrap()
    }

    #[test]
    fn classifies_response_delays() {
        let c = coordinator();
        assert_eq!(c.classify_response(Duration::minutes(2)), ResponseKind::Immediate);
        assert_eq!(c.classify_response(Duration::minutes(5)), ResponseKind::Delayed);
        assert_eq!(c.classify_response(Duration::minutes(59)), ResponseKind::Delayed);
        assert_eq!(c.classify_response(Duration::minutes(60)), ResponseKind::NoResponse);
    }

    #[test]
    fn dispatches_due_slot_once() {
        let conn = open_memory_database().unwrap();
        let spec = daily_spec("p-1", &[8]);
        let instance = seed_instance(&conn, &spec, at(8, 0));
        let transport = MemoryTransport::default();

        let report = coordinator().dispatch_due(&conn, &transport, at(8, 1)).unwrap();
        assert_eq!(report.sent, 1);
        let stored = repository::get_instance(&conn, &instance.id).unwrap().unwrap();
        assert_eq!(stored.outcome, Outcome::Sent);
        assert_eq!(stored.sent_at, Some(at(8, 1)));
        assert_eq!(stored.attempt_count, 1);
        assert!(stored.notification_id.is_some());

        let again = coordinator().dispatch_due(&conn, &transport, at(8, 2)).unwrap();
        assert_eq!(again.sent, 0);
        assert_eq!(transport.sent().len(), 1);
    }

    #[test]
    fn slots_outside_window_are_not_sent() {
        let conn = open_memory_database().unwrap();
        let spec = daily_spec("p-1", &[8]);
        seed_instance(&conn, &spec, at(8, 30));
        let transport = MemoryTransport::default();
        let report = coordinator().dispatch_due(&conn, &transport, at(8, 0)).unwrap();
        assert_eq!(report.sent, 0);
        assert!(transport.sent().is_empty());
    }

    #[test]
    fn rejected_send_is_retried_then_abandoned() {
        let conn = open_memory_database().unwrap();
        let spec = daily_spec("p-1", &[8]);
        let instance = seed_instance(&conn, &spec, at(8, 0));
        let transport = MemoryTransport::rejecting();
        let c = coordinator();

        let first = c.dispatch_due(&conn, &transport, at(8, 0)).unwrap();
        assert_eq!(first.retried, 1);
        assert!(matches!(
            first.rejections[0],
            ReminderError::TransportRejected { instance_id, .. } if instance_id == instance.id
        ));
        let stored = repository::get_instance(&conn, &instance.id).unwrap().unwrap();
        assert_eq!(stored.outcome, Outcome::Pending);
        assert!(stored.sent_at.is_none());
        assert_eq!(stored.attempt_count, 1);

        c.dispatch_due(&conn, &transport, at(8, 1)).unwrap();
        let last = c.dispatch_due(&conn, &transport, at(8, 2)).unwrap();
        assert_eq!(last.abandoned, 1);
        let stored = repository::get_instance(&conn, &instance.id).unwrap().unwrap();
        assert_eq!(stored.outcome, Outcome::Missed);
        assert_eq!(stored.attempt_count, 3);

        let titles: Vec<String> = transport.attempts().iter().map(|n| n.title.clone()).collect();
        assert!(titles[1].ends_with("(reminder attempt 2)"));
    }

    #[test]
    fn foreign_shard_slots_are_skipped() {
        let conn = open_memory_database().unwrap();
        let mut config = EngineConfig::default();
        config.shard = ShardConfig { index: 0, count: 2 };
        let patient = (0..50)
            .map(|i| format!("p-{i}"))
            .find(|p| !config.shard.owns(p))
            .unwrap();
        let spec = daily_spec(&patient, &[8]);
        seed_instance(&conn, &spec, at(8, 0));

        let transport = MemoryTransport::default();
        let report = DeliveryCoordinator::from_config(&config)
            .dispatch_due(&conn, &transport, at(8, 0))
            .unwrap();
        assert_eq!(report.sent, 0);
        assert!(transport.sent().is_empty());
    }

    #[test]
    fn acknowledge_taken_quickly_is_immediate() {
        let conn = open_memory_database().unwrap();
        let spec = daily_spec("p-1", &[8]);
        let instance = sent_instance(&conn, &spec);

        let ack = coordinator()
            .acknowledge(&conn, &instance.id, ResponseAction::Taken, Some("with food"), at(8, 3))
            .unwrap();
        assert_eq!(ack.instance.outcome, Outcome::Taken);
        assert_eq!(ack.instance.acknowledged_at, Some(at(8, 3)));
        assert_eq!(ack.event.response_kind, ResponseKind::Immediate);
        assert_eq!(ack.event.delay_secs, 180);
        assert!(ack.follow_up.is_none());
        let profile = ack.profile.unwrap();
        assert_eq!(profile.best_hours, vec![8]);
        assert_eq!(profile.total_acknowledged, 1);
    }

    #[test]
    fn acknowledge_is_idempotent() {
        let conn = open_memory_database().unwrap();
        let spec = daily_spec("p-1", &[8]);
        let instance = sent_instance(&conn, &spec);
        let c = coordinator();

        let first = c
            .acknowledge(&conn, &instance.id, ResponseAction::Taken, None, at(8, 10))
            .unwrap();
        let second = c
            .acknowledge(&conn, &instance.id, ResponseAction::Skipped, None, at(9, 0))
            .unwrap();
        assert_eq!(second.instance, first.instance);
        assert_eq!(second.event, first.event);
        assert!(second.profile.is_none());

        let profile = c.ledger().profile(&conn, "p-1", TaskKind::Medication).unwrap().unwrap();
        assert_eq!(profile.total_sent, 1);
    }

    #[test]
    fn postpone_creates_follow_up() {
        let conn = open_memory_database().unwrap();
        let spec = daily_spec("p-1", &[8]);
        let instance = sent_instance(&conn, &spec);

        let ack = coordinator()
            .acknowledge(&conn, &instance.id, ResponseAction::Postponed, None, at(8, 20))
            .unwrap();
        assert_eq!(ack.event.response_kind, ResponseKind::Delayed);
        let follow_up = ack.follow_up.unwrap();
        assert_eq!(follow_up.scheduled_at, at(8, 50));
        assert_eq!(follow_up.outcome, Outcome::Pending);
        assert!(repository::get_instance(&conn, &follow_up.id).unwrap().is_some());
    }

    #[test]
    fn acknowledge_rejects_undelivered_and_missed() {
        let conn = open_memory_database().unwrap();
        let spec = daily_spec("p-1", &[8]);
        let pending = seed_instance(&conn, &spec, at(8, 0));
        let c = coordinator();
        assert!(matches!(
            c.acknowledge(&conn, &pending.id, ResponseAction::Taken, None, at(8, 5)),
            Err(ReminderError::NotDelivered(_))
        ));
        assert!(matches!(
            c.acknowledge(&conn, &Uuid::new_v4(), ResponseAction::Taken, None, at(8, 5)),
            Err(ReminderError::InstanceNotFound(_))
        ));

        let sent = sent_instance(&conn, &daily_spec("p-1", &[8]));
        c.sweep_missed(&conn, at(14, 1)).unwrap();
        assert!(matches!(
            c.acknowledge(&conn, &sent.id, ResponseAction::Taken, None, at(14, 2)),
            Err(ReminderError::AcknowledgementClosed { outcome: Outcome::Missed, .. })
        ));
    }

    #[test]
    fn sweep_closes_unanswered_and_stale_slots() {
        let conn = open_memory_database().unwrap();
        let mut spec = daily_spec("p-1", &[8]);
        spec.critical = true;
        let sent = sent_instance(&conn, &spec);
        let never_sent = seed_instance(&conn, &spec, at(7, 0));

        let early = coordinator().sweep_missed(&conn, at(13, 0)).unwrap();
        assert_eq!(early.missed + early.stale, 0);

        let report = coordinator().sweep_missed(&conn, at(14, 30)).unwrap();
        assert_eq!(report.missed, 1);
        assert_eq!(report.stale, 1);
        assert_eq!(report.profiles.len(), 1);
        assert_eq!(report.profiles[0].worst_hours, vec![8]);

        let sent = repository::get_instance(&conn, &sent.id).unwrap().unwrap();
        assert_eq!(sent.outcome, Outcome::Missed);
        let event = repository::get_response_for_instance(&conn, &sent.id).unwrap().unwrap();
        assert_eq!(event.response_kind, ResponseKind::NoResponse);
        assert!(event.action.is_none());
        assert!(event.critical);

        let never_sent = repository::get_instance(&conn, &never_sent.id).unwrap().unwrap();
        assert_eq!(never_sent.outcome, Outcome::Missed);
        assert!(repository::get_response_for_instance(&conn, &never_sent.id).unwrap().is_none());

        let rerun = coordinator().sweep_missed(&conn, at(15, 0)).unwrap();
        assert_eq!(rerun.missed + rerun.stale, 0);
    }
}
