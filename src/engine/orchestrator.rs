//! The engine: owns the store connection and the pipeline components, takes
//! inbound events, and runs one ordered pass over all pipelines per tick.
//!
//! Synchronous calls (`spec_upserted`, `acknowledge`, ...) propagate their
//! errors. Failures inside `tick` are swallowed per patient: logged at warn
//! and recorded through the audit hook, and the step is retried on a later
//! tick when the error is transient.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::Connection;
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use crate::clock::{Clock, Deadline, SystemClock};
use crate::config::EngineConfig;
use crate::db::repository::{self, TrackedSeries};
use crate::db::sqlite::open_database_with_timeout;
use crate::intelligence::{
    AlertSynthesizer, AnomalyDetector, BaselineCalculator, BaselineStore, IntelligenceError,
    MetricReferenceTable, TrendAnalyzer,
};
use crate::models::enums::{ResponseAction, SpecState, TaskKind};
use crate::models::{Alert, Anomaly, Baseline, LabSample, ReminderInstance, ReminderSpec};
use crate::reminders::{
    self, validate_spec, Acknowledgement, AdaptiveTuner, DeliveryCoordinator, HourScore, Insight,
    MaterializeSummary, ReminderError, Scheduler, TuneOutcome,
};

use super::sinks::{
    AlertSink, AuditSink, LabSource, MemoryLabSource, TracingAlertSink, TracingAuditSink,
    TracingTransport, TransportSink,
};
use super::EngineError;

const ENGINE_ACTOR: &str = "engine";

/// External collaborators injected at construction.
#[derive(Clone)]
pub struct Collaborators {
    pub clock: Arc<dyn Clock>,
    pub labs: Arc<dyn LabSource>,
    pub transport: Arc<dyn TransportSink>,
    pub alerts: Arc<dyn AlertSink>,
    pub audit: Arc<dyn AuditSink>,
}

impl Collaborators {
    /// Wall clock and tracing-backed sinks around the given lab store.
    pub fn tracing(labs: Arc<dyn LabSource>) -> Self {
        Self {
            clock: Arc::new(SystemClock),
            labs,
            transport: Arc::new(TracingTransport),
            alerts: Arc::new(TracingAlertSink),
            audit: Arc::new(TracingAuditSink),
        }
    }

    /// Tracing sinks with an empty in-memory lab store.
    pub fn standalone() -> Self {
        Self::tracing(Arc::new(MemoryLabSource::default()))
    }
}

/// What one tick did.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub labs_processed: usize,
    pub labs_requeued: usize,
    pub anomalies: usize,
    pub alerts: usize,
    pub baselines_refreshed: usize,
    pub trends: usize,
    pub sent: usize,
    pub conflicts: usize,
    pub retried: usize,
    pub abandoned: usize,
    pub missed: usize,
    pub scheduled: usize,
    pub tuned: usize,
    pub failures: usize,
    pub deadline_exceeded: bool,
}

/// Slots removed and created by a spec state change.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StateChange {
    pub deleted: usize,
    pub inserted: usize,
}

/// Last runs of the coarse-grained steps.
#[derive(Debug, Default)]
struct Watermarks {
    last_sweep: Option<DateTime<Utc>>,
    topped_up_on: Option<NaiveDate>,
}

pub struct Engine {
    conn: Mutex<Connection>,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    labs: Arc<dyn LabSource>,
    transport: Arc<dyn TransportSink>,
    alert_sink: Arc<dyn AlertSink>,
    audit: Arc<dyn AuditSink>,
    reference: MetricReferenceTable,
    baselines: BaselineStore,
    calculator: BaselineCalculator,
    detector: AnomalyDetector,
    trends: TrendAnalyzer,
    synthesizer: AlertSynthesizer,
    scheduler: Scheduler,
    tuner: AdaptiveTuner,
    delivery: DeliveryCoordinator,
    lab_queue: Mutex<VecDeque<LabSample>>,
    watermarks: Mutex<Watermarks>,
}

impl Engine {
    pub fn new(conn: Connection, config: EngineConfig, collaborators: Collaborators) -> Self {
        Self {
            conn: Mutex::new(conn),
            clock: collaborators.clock,
            labs: collaborators.labs,
            transport: collaborators.transport,
            alert_sink: collaborators.alerts,
            audit: collaborators.audit,
            reference: MetricReferenceTable::standard(),
            baselines: BaselineStore::from_config(&config),
            calculator: BaselineCalculator::from_config(&config),
            detector: AnomalyDetector::from_config(&config),
            trends: TrendAnalyzer::from_config(&config),
            synthesizer: AlertSynthesizer::from_config(&config),
            scheduler: Scheduler::from_config(&config),
            tuner: AdaptiveTuner::from_config(&config),
            delivery: DeliveryCoordinator::from_config(&config),
            lab_queue: Mutex::new(VecDeque::new()),
            watermarks: Mutex::new(Watermarks::default()),
            config,
        }
    }

    /// Open (and migrate) the database at `path` with the configured busy timeout.
    pub fn open(
        path: &Path,
        config: EngineConfig,
        collaborators: Collaborators,
    ) -> Result<Self, EngineError> {
        let conn = open_database_with_timeout(path, config.store_timeout())?;
        Ok(Self::new(conn, config, collaborators))
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Lab events waiting for the next tick.
    pub fn pending_lab_events(&self) -> usize {
        self.lab_queue.lock().map(|q| q.len()).unwrap_or_default()
    }

    // -----------------------------------------------------------------------
    // Inbound events
    // -----------------------------------------------------------------------

    /// Queue a new lab sample for the anomaly pipeline.
    pub fn lab_sample_arrived(&self, sample: LabSample) -> Result<(), EngineError> {
        self.ensure_owned(&sample.patient_id)?;
        tracing::debug!(
            patient_id = %sample.patient_id,
            metric_code = %sample.metric_code,
            taken_at = %sample.taken_at,
            "Lab sample queued"
        );
        self.lab_queue
            .lock()
            .map_err(|_| EngineError::LockFailed)?
            .push_back(sample);
        Ok(())
    }

    /// Store a spec and rebuild its future slots.
    ///
    /// Creation time and tuning history survive an update; the patient of an
    /// existing spec cannot change.
    pub fn spec_upserted(&self, mut spec: ReminderSpec) -> Result<MaterializeSummary, EngineError> {
        self.ensure_owned(&spec.patient_id)?;
        validate_spec(&spec)?;
        let now = self.now();
        let conn = self.lock()?;

        if let Some(existing) = repository::get_spec(&conn, &spec.id)? {
            if existing.patient_id != spec.patient_id {
                return Err(ReminderError::InvalidSpec(format!(
                    "patient_id of spec {} cannot change",
                    spec.id
                ))
                .into());
            }
            spec.created_at = existing.created_at;
            spec.last_tuned_at = existing.last_tuned_at;
            spec.tuned_best_hours = existing.tuned_best_hours;
        }
        spec.updated_at = now;

        let tx = conn.unchecked_transaction()?;
        repository::upsert_spec(&tx, &spec)?;
        let cleared = repository::delete_future_unsent(&tx, &spec.id, now)?;
        tx.commit()?;

        let summary = self.materialize_spec(&conn, &spec, now)?;
        self.audit.record(
            &patient_actor(&spec.patient_id),
            "spec_upserted",
            &json!({
                "spec_id": spec.id,
                "state": spec.state.as_str(),
                "cleared": cleared,
                "inserted": summary.inserted,
            }),
        );
        tracing::info!(
            spec_id = %spec.id,
            patient_id = %spec.patient_id,
            cleared,
            planned = summary.planned,
            inserted = summary.inserted,
            "Spec upserted"
        );
        Ok(summary)
    }

    /// Move a spec to `state`. Leaving ACTIVE drops every future unsent slot;
    /// entering ACTIVE re-materializes.
    pub fn spec_state_changed(&self, spec_id: Uuid, state: SpecState) -> Result<StateChange, EngineError> {
        let now = self.now();
        let conn = self.lock()?;
        let spec = repository::get_spec(&conn, &spec_id)?.ok_or(ReminderError::SpecNotFound(spec_id))?;
        self.ensure_owned(&spec.patient_id)?;

        let mut change = StateChange::default();
        if state == SpecState::Active {
            repository::update_spec_state(&conn, &spec_id, state, now)?;
            let active = ReminderSpec { state, ..spec.clone() };
            change.inserted = self.materialize_spec(&conn, &active, now)?.inserted;
        } else {
            let tx = conn.unchecked_transaction()?;
            repository::update_spec_state(&tx, &spec_id, state, now)?;
            change.deleted = repository::delete_future_unsent(&tx, &spec_id, now)?;
            tx.commit()?;
        }

        self.audit.record(
            &patient_actor(&spec.patient_id),
            "spec_state_changed",
            &json!({
                "spec_id": spec_id,
                "state": state.as_str(),
                "deleted": change.deleted,
                "inserted": change.inserted,
            }),
        );
        tracing::info!(
            spec_id = %spec_id,
            state = state.as_str(),
            deleted = change.deleted,
            inserted = change.inserted,
            "Spec state changed"
        );
        Ok(change)
    }

    /// Record the patient's response to a delivered slot.
    pub fn acknowledge(
        &self,
        instance_id: Uuid,
        action: ResponseAction,
        notes: Option<&str>,
    ) -> Result<Acknowledgement, EngineError> {
        let now = self.now();
        let conn = self.lock()?;
        let patient_id = self.instance_patient(&conn, &instance_id)?;
        self.ensure_owned(&patient_id)?;

        let ack = self.delivery.acknowledge(&conn, &instance_id, action, notes, now)?;
        if ack.profile.is_some() {
            self.audit.record(
                &patient_actor(&patient_id),
                "reminder_acknowledged",
                &json!({
                    "instance_id": instance_id,
                    "action": action.as_str(),
                    "response_kind": ack.event.response_kind.as_str(),
                    "follow_up": ack.follow_up.as_ref().map(|f| f.id),
                }),
            );
        }
        Ok(ack)
    }

    pub fn resolve_alert(
        &self,
        alert_id: Uuid,
        actor: &str,
        notes: Option<&str>,
    ) -> Result<Alert, EngineError> {
        let now = self.now();
        let conn = self.lock()?;
        let alert = repository::get_alert(&conn, &alert_id)?
            .ok_or(IntelligenceError::AlertNotFound(alert_id))?;
        self.ensure_owned(&alert.patient_id)?;

        let resolved = self.synthesizer.resolve(&conn, &alert_id, actor, notes, now)?;
        self.audit.record(
            actor,
            "alert_resolved",
            &json!({ "alert_id": alert_id, "kind": resolved.kind.as_str() }),
        );
        Ok(resolved)
    }

    pub fn acknowledge_anomaly(&self, anomaly_id: Uuid, actor: &str) -> Result<Anomaly, EngineError> {
        let now = self.now();
        let conn = self.lock()?;
        let anomaly = repository::get_anomaly(&conn, &anomaly_id)?
            .ok_or(IntelligenceError::AnomalyNotFound(anomaly_id))?;
        self.ensure_owned(&anomaly.patient_id)?;

        let acknowledged = self.detector.acknowledge(&conn, &anomaly_id, actor, now)?;
        self.audit.record(actor, "anomaly_acknowledged", &json!({ "anomaly_id": anomaly_id }));
        Ok(acknowledged)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn active_alerts(&self, patient_id: &str) -> Result<Vec<Alert>, EngineError> {
        let now = self.now();
        let conn = self.lock()?;
        Ok(self.synthesizer.active_alerts(&conn, patient_id, now)?)
    }

    pub fn insights(&self, patient_id: &str) -> Result<Vec<Insight>, EngineError> {
        let now = self.now();
        let conn = self.lock()?;
        Ok(reminders::generate_insights(&conn, patient_id, now)?)
    }

    pub fn predict_best_hours(
        &self,
        patient_id: &str,
        task_kind: TaskKind,
    ) -> Result<Vec<HourScore>, EngineError> {
        let conn = self.lock()?;
        Ok(reminders::predict_best_hours(
            &conn,
            patient_id,
            task_kind,
            self.config.local_offset(),
        )?)
    }

    pub fn spec(&self, spec_id: Uuid) -> Result<Option<ReminderSpec>, EngineError> {
        let conn = self.lock()?;
        Ok(repository::get_spec(&conn, &spec_id)?)
    }

    /// Every slot of a spec in schedule order.
    pub fn instances(&self, spec_id: Uuid) -> Result<Vec<ReminderInstance>, EngineError> {
        let conn = self.lock()?;
        Ok(repository::list_instances_for_spec(&conn, &spec_id)?)
    }

    // -----------------------------------------------------------------------
    // Tick
    // -----------------------------------------------------------------------

    /// One ordered pass: lab events, baseline and trend refresh, dispatch,
    /// missed sweep, re-tuning, then the daily schedule top-up.
    pub fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let deadline = Deadline::after(self.config.tick_budget());
        let mut report = TickReport::default();
        let conn = match self.lock() {
            Ok(conn) => conn,
            Err(e) => {
                self.swallow("tick", "*", &e, &mut report);
                return report;
            }
        };

        self.process_lab_queue(&conn, now, &deadline, &mut report);
        self.refresh_baselines(&conn, now, &deadline, &mut report);
        self.refresh_trends(&conn, now, &deadline, &mut report);
        self.dispatch(&conn, now, &mut report);
        self.sweep(&conn, now, &mut report);
        self.retune(&conn, now, &mut report);
        self.top_up_schedules(&conn, now, &mut report);

        tracing::debug!(
            labs = report.labs_processed,
            anomalies = report.anomalies,
            alerts = report.alerts,
            sent = report.sent,
            missed = report.missed,
            tuned = report.tuned,
            failures = report.failures,
            "Tick complete"
        );
        report
    }

    fn process_lab_queue(
        &self,
        conn: &Connection,
        now: DateTime<Utc>,
        deadline: &Deadline,
        report: &mut TickReport,
    ) {
        let mut batch: Vec<LabSample> = match self.lab_queue.lock() {
            Ok(mut queue) => queue.drain(..).collect(),
            Err(_) => {
                self.swallow("lab_queue", "*", &EngineError::LockFailed, report);
                return;
            }
        };
        if batch.is_empty() {
            return;
        }
        batch.sort_by(|a, b| {
            (&a.patient_id, &a.metric_code, a.taken_at).cmp(&(&b.patient_id, &b.metric_code, b.taken_at))
        });

        // One baseline per series for the whole batch.
        let mut snapshot: HashMap<(String, String), Option<Baseline>> = HashMap::new();
        let mut retry = Vec::new();
        let mut samples = batch.into_iter();
        while let Some(sample) = samples.next() {
            if deadline.expired() {
                report.deadline_exceeded = true;
                retry.push(sample);
                retry.extend(samples.by_ref());
                break;
            }
            match self.process_sample(conn, &sample, &mut snapshot, now, report) {
                Ok(()) => report.labs_processed += 1,
                Err(e) => {
                    self.swallow("lab_sample", &sample.patient_id, &e, report);
                    if e.is_retryable() {
                        retry.push(sample);
                    }
                }
            }
        }

        report.labs_requeued = retry.len();
        if !retry.is_empty() {
            if let Ok(mut queue) = self.lab_queue.lock() {
                for sample in retry.into_iter().rev() {
                    queue.push_front(sample);
                }
            }
        }
    }

    fn process_sample(
        &self,
        conn: &Connection,
        sample: &LabSample,
        snapshot: &mut HashMap<(String, String), Option<Baseline>>,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<(), EngineError> {
        repository::touch_series(conn, &sample.patient_id, &sample.metric_code, sample.taken_at)?;

        let key = (sample.patient_id.clone(), sample.metric_code.clone());
        let baseline = match snapshot.get(&key) {
            Some(baseline) => baseline.clone(),
            None => {
                let baseline = self.current_baseline(conn, &sample.patient_id, &sample.metric_code, now, report)?;
                snapshot.insert(key, baseline.clone());
                baseline
            }
        };

        let scored = self.detector.score(
            conn,
            self.labs.as_ref(),
            &self.reference,
            sample,
            baseline.as_ref(),
            now,
        )?;
        // Pairs already stored were alerted when first seen.
        for entry in scored.iter().filter(|entry| entry.is_new) {
            report.anomalies += 1;
            if self
                .synthesizer
                .from_anomaly(conn, self.alert_sink.as_ref(), &entry.anomaly, now)?
                .is_some()
            {
                report.alerts += 1;
            }
        }
        Ok(())
    }

    /// Fresh stored baseline, or a recomputed one when stale. `None` when
    /// there is not enough history yet.
    fn current_baseline(
        &self,
        conn: &Connection,
        patient_id: &str,
        metric_code: &str,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<Option<Baseline>, EngineError> {
        let stored = self.baselines.get(conn, patient_id, metric_code);
        if !self.baselines.is_stale(stored.as_ref(), now) {
            return Ok(stored);
        }
        match self.compute_baseline(conn, patient_id, metric_code, now)? {
            Some(baseline) => {
                report.baselines_refreshed += 1;
                Ok(Some(baseline))
            }
            None => Ok(None),
        }
    }

    fn compute_baseline(
        &self,
        conn: &Connection,
        patient_id: &str,
        metric_code: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Baseline>, EngineError> {
        match self.calculator.compute(
            conn,
            &self.baselines,
            self.labs.as_ref(),
            &self.reference,
            patient_id,
            metric_code,
            now,
        ) {
            Ok(baseline) => Ok(Some(baseline)),
            Err(IntelligenceError::InsufficientData { found, required, .. }) => {
                tracing::debug!(patient_id, metric_code, found, required, "Baseline not computed yet");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn refresh_baselines(
        &self,
        conn: &Connection,
        now: DateTime<Utc>,
        deadline: &Deadline,
        report: &mut TickReport,
    ) {
        let cutoff = now - self.config.baseline_refresh_cadence();
        let due = match repository::list_series_due_for_baseline(conn, cutoff) {
            Ok(due) => due,
            Err(e) => {
                self.swallow("baseline_refresh", "*", &e.into(), report);
                return;
            }
        };

        for series in due.iter().filter(|s| self.config.shard.owns(&s.patient_id)) {
            if deadline.expired() {
                report.deadline_exceeded = true;
                break;
            }
            let outcome = self.refresh_baseline(conn, series, now);
            let mark = match &outcome {
                Ok(refreshed) => {
                    if *refreshed {
                        report.baselines_refreshed += 1;
                    }
                    true
                }
                Err(e) => {
                    self.swallow("baseline_refresh", &series.patient_id, e, report);
                    !e.is_retryable()
                }
            };
            if mark {
                if let Err(e) =
                    repository::mark_baseline_checked(conn, &series.patient_id, &series.metric_code, now)
                {
                    self.swallow("baseline_refresh", &series.patient_id, &e.into(), report);
                }
            }
        }
    }

    /// Recompute when stale by age or when enough new samples arrived.
    fn refresh_baseline(
        &self,
        conn: &Connection,
        series: &TrackedSeries,
        now: DateTime<Utc>,
    ) -> Result<bool, EngineError> {
        let stored = self.baselines.get(conn, &series.patient_id, &series.metric_code);
        let due = match &stored {
            Some(baseline) if !self.baselines.is_stale(Some(baseline), now) => self.calculator.needs_resample(
                self.labs.as_ref(),
                &self.reference,
                baseline,
                now,
                self.config.baseline_resample_after,
            )?,
            _ => true,
        };
        if !due {
            return Ok(false);
        }
        Ok(self
            .compute_baseline(conn, &series.patient_id, &series.metric_code, now)?
            .is_some())
    }

    fn refresh_trends(
        &self,
        conn: &Connection,
        now: DateTime<Utc>,
        deadline: &Deadline,
        report: &mut TickReport,
    ) {
        let cutoff = now - self.config.trend_refresh();
        let due = match repository::list_series_due_for_trend(conn, cutoff) {
            Ok(due) => due,
            Err(e) => {
                self.swallow("trend", "*", &e.into(), report);
                return;
            }
        };

        for series in due.iter().filter(|s| self.config.shard.owns(&s.patient_id)) {
            if deadline.expired() {
                report.deadline_exceeded = true;
                break;
            }
            let mark = match self.refresh_trend(conn, series, now, deadline, report) {
                Ok(()) => true,
                Err(e) => {
                    self.swallow("trend", &series.patient_id, &e, report);
                    !e.is_retryable()
                }
            };
            if mark {
                if let Err(e) =
                    repository::mark_trend_refreshed(conn, &series.patient_id, &series.metric_code, now)
                {
                    self.swallow("trend", &series.patient_id, &e.into(), report);
                }
            }
        }
    }

    fn refresh_trend(
        &self,
        conn: &Connection,
        series: &TrackedSeries,
        now: DateTime<Utc>,
        deadline: &Deadline,
        report: &mut TickReport,
    ) -> Result<(), EngineError> {
        let window = self.trends.default_window(&self.reference, &series.metric_code);
        let Some(trend) = self.trends.analyze(
            self.labs.as_ref(),
            &self.reference,
            &series.patient_id,
            &series.metric_code,
            window,
            now,
            deadline,
        )?
        else {
            return Ok(());
        };

        let tx = conn.unchecked_transaction()?;
        self.trends.record(&tx, &trend)?;
        let alert = self
            .synthesizer
            .from_trend(&tx, self.alert_sink.as_ref(), &self.reference, &trend, now)?;
        tx.commit()?;

        report.trends += 1;
        if alert.is_some() {
            report.alerts += 1;
        }
        Ok(())
    }

    fn dispatch(&self, conn: &Connection, now: DateTime<Utc>, report: &mut TickReport) {
        let dispatched = match self.delivery.dispatch_due(conn, self.transport.as_ref(), now) {
            Ok(dispatched) => dispatched,
            Err(e) => {
                self.swallow("dispatch", "*", &e.into(), report);
                return;
            }
        };
        report.sent += dispatched.sent;
        report.conflicts += dispatched.conflicts;
        report.retried += dispatched.retried;
        report.abandoned += dispatched.abandoned;

        for rejection in &dispatched.rejections {
            tracing::warn!(error = %rejection, "Notification rejected");
            self.audit.record(
                ENGINE_ACTOR,
                "transport_rejected",
                &json!({ "error": rejection.to_string() }),
            );
        }
        for (instance_id, err) in dispatched.failures {
            self.swallow("dispatch", &instance_id.to_string(), &err.into(), report);
        }
    }

    fn sweep(&self, conn: &Connection, now: DateTime<Utc>, report: &mut TickReport) {
        let due = {
            let marks = self.watermarks.lock().unwrap_or_else(|e| e.into_inner());
            marks
                .last_sweep
                .map_or(true, |at| now - at >= self.config.sweep_interval())
        };
        if !due {
            return;
        }

        let swept = match self.delivery.sweep_missed(conn, now) {
            Ok(swept) => swept,
            Err(e) => {
                self.swallow("sweep", "*", &e.into(), report);
                return;
            }
        };
        report.missed += swept.missed + swept.stale;
        for (instance_id, err) in swept.failures {
            self.swallow("sweep", &instance_id.to_string(), &err.into(), report);
        }
        // Only non-responses lower compliance, so only swept profiles can
        // cross an adherence threshold.
        for profile in &swept.profiles {
            match self
                .synthesizer
                .from_adherence(conn, self.alert_sink.as_ref(), profile, now)
            {
                Ok(Some(_)) => report.alerts += 1,
                Ok(None) => {}
                Err(e) => self.swallow("adherence", &profile.patient_id, &e.into(), report),
            }
        }

        self.watermarks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last_sweep = Some(now);
    }

    fn retune(&self, conn: &Connection, now: DateTime<Utc>, report: &mut TickReport) {
        let specs = match repository::list_adaptive_specs(conn) {
            Ok(specs) => specs,
            Err(e) => {
                self.swallow("tune", "*", &e.into(), report);
                return;
            }
        };
        for spec in specs.iter().filter(|s| self.config.shard.owns(&s.patient_id)) {
            match self.retune_spec(conn, spec, now) {
                Ok(Some(outcome)) => {
                    report.tuned += 1;
                    self.audit.record(
                        ENGINE_ACTOR,
                        "spec_tuned",
                        &json!({
                            "spec_id": spec.id,
                            "hours": outcome.hours,
                            "moved": outcome.moved,
                        }),
                    );
                }
                Ok(None) => {}
                Err(e) => self.swallow("tune", &spec.patient_id, &e, report),
            }
        }
    }

    /// Tune only when the profile changed after the last tune.
    fn retune_spec(
        &self,
        conn: &Connection,
        spec: &ReminderSpec,
        now: DateTime<Utc>,
    ) -> Result<Option<TuneOutcome>, EngineError> {
        let Some(profile) = repository::get_profile(conn, &spec.patient_id, spec.task_kind)? else {
            return Ok(None);
        };
        if spec.last_tuned_at.is_some_and(|at| profile.updated_at <= at) {
            return Ok(None);
        }
        Ok(self.tuner.tune(conn, &self.scheduler, spec, now)?)
    }

    /// Once per local day, extend every active spec up to the horizon.
    fn top_up_schedules(&self, conn: &Connection, now: DateTime<Utc>, report: &mut TickReport) {
        let today = now.with_timezone(&self.config.local_offset()).date_naive();
        {
            let marks = self.watermarks.lock().unwrap_or_else(|e| e.into_inner());
            if marks.topped_up_on == Some(today) {
                return;
            }
        }

        let specs = match repository::list_specs_by_state(conn, SpecState::Active) {
            Ok(specs) => specs,
            Err(e) => {
                self.swallow("top_up", "*", &e.into(), report);
                return;
            }
        };
        let mut complete = true;
        for spec in specs.iter().filter(|s| self.config.shard.owns(&s.patient_id)) {
            match self.materialize_spec(conn, spec, now) {
                Ok(summary) => report.scheduled += summary.inserted,
                Err(e) => {
                    complete = false;
                    self.swallow("top_up", &spec.patient_id, &e, report);
                }
            }
        }
        if complete {
            self.watermarks
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .topped_up_on = Some(today);
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn materialize_spec(
        &self,
        conn: &Connection,
        spec: &ReminderSpec,
        now: DateTime<Utc>,
    ) -> Result<MaterializeSummary, EngineError> {
        let profile = if spec.adaptive {
            repository::get_profile(conn, &spec.patient_id, spec.task_kind)?
        } else {
            None
        };
        Ok(self.scheduler.materialize(conn, spec, profile.as_ref(), now)?)
    }

    fn instance_patient(&self, conn: &Connection, instance_id: &Uuid) -> Result<String, EngineError> {
        let instance = repository::get_instance(conn, instance_id)?
            .ok_or(ReminderError::InstanceNotFound(*instance_id))?;
        let spec = repository::get_spec(conn, &instance.spec_id)?
            .ok_or(ReminderError::SpecNotFound(instance.spec_id))?;
        Ok(spec.patient_id)
    }

    fn ensure_owned(&self, patient_id: &str) -> Result<(), EngineError> {
        if self.config.shard.owns(patient_id) {
            Ok(())
        } else {
            Err(EngineError::ForeignShard(patient_id.to_string()))
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, EngineError> {
        self.conn.lock().map_err(|_| EngineError::LockFailed)
    }

    fn swallow(&self, stage: &'static str, subject: &str, err: &EngineError, report: &mut TickReport) {
        report.failures += 1;
        if matches!(err, EngineError::Intelligence(IntelligenceError::DeadlineExceeded(_))) {
            report.deadline_exceeded = true;
        }
        let retryable = err.is_retryable();
        tracing::warn!(stage, subject, retryable, error = %err, "Pipeline step failed");
        self.audit.record(
            ENGINE_ACTOR,
            "pipeline_failure",
            &json!({
                "stage": stage,
                "subject": subject,
                "retryable": retryable,
                "error": err.to_string(),
            }),
        );
    }
}

fn patient_actor(patient_id: &str) -> String {
    format!("patient:{patient_id}")
}
