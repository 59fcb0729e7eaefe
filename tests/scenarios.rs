//! End-to-end clinical and reminder scenarios.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Timelike, Utc};
use uuid::Uuid;

use glycowatch_lib::clock::{Deadline, ManualClock};
use glycowatch_lib::config::EngineConfig;
use glycowatch_lib::db::repository;
use glycowatch_lib::db::sqlite::{open_database, open_memory_database};
use glycowatch_lib::engine::sinks::{
    MemoryAlertSink, MemoryAuditSink, MemoryLabSource, MemoryTransport,
};
use glycowatch_lib::engine::{Collaborators, Engine};
use glycowatch_lib::intelligence::{
    AlertSynthesizer, AnomalyDetector, BaselineStore, MetricReferenceTable, TrendAnalyzer,
};
use glycowatch_lib::models::enums::{
    AlertKind, AnomalyKind, Cadence, Outcome, Priority, ResponseAction, ResponseKind, Severity,
    SpecState, TaskKind, TrendDirection,
};
use glycowatch_lib::models::{Baseline, LabSample, ReminderInstance, ReminderSpec, ResponseEvent};
use glycowatch_lib::reminders::{BehaviorLedger, DeliveryCoordinator, DispatchReport, Scheduler};

fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
}

/// Mon 2025-03-03 through Sun 2025-03-09, twice a day.
fn medication_week(adaptive: bool) -> ReminderSpec {
    let created = at(2025, 3, 1, 0, 0);
    ReminderSpec {
        id: Uuid::new_v4(),
        patient_id: "p-1".into(),
        task_kind: TaskKind::Medication,
        title: "Metformin 500mg".into(),
        description: "With breakfast and dinner".into(),
        start_date: NaiveDate::from_ymd_opt(2025, 3, 3).unwrap(),
        end_date: Some(NaiveDate::from_ymd_opt(2025, 3, 9).unwrap()),
        cadence: Cadence::Daily,
        times_per_day: 2,
        day_mask: vec![],
        preferred_hours: vec![8, 20],
        priority: 5,
        critical: false,
        adaptive,
        state: SpecState::Active,
        last_tuned_at: None,
        tuned_best_hours: None,
        created_at: created,
        updated_at: created,
    }
}

#[test]
fn outlier_on_hba1c() {
    let config = EngineConfig::default();
    let conn = open_memory_database().unwrap();
    let now = at(2025, 3, 2, 12, 0);
    let baseline = Baseline {
        patient_id: "p-1".into(),
        metric_code: "HBA1C".into(),
        mean: 7.0,
        std_dev: 0.5,
        sample_count: 6,
        window_start: now - Duration::days(360),
        window_end: now - Duration::days(1),
        computed_at: now - Duration::days(1),
    };
    BaselineStore::from_config(&config).put(&conn, &baseline).unwrap();

    let labs = MemoryLabSource::default();
    let sample = LabSample::new("p-1", "HBA1C", 9.0, "%", now);
    let scored = AnomalyDetector::from_config(&config)
        .score(&conn, &labs, &MetricReferenceTable::standard(), &sample, Some(&baseline), now)
        .unwrap();

    assert_eq!(scored.len(), 1);
    let anomaly = &scored[0].anomaly;
    assert_eq!(anomaly.kind, AnomalyKind::StatisticalOutlier);
    assert!((anomaly.score - 4.0).abs() < 1e-9);
    assert_eq!(anomaly.severity, Severity::Critical);

    let sink = MemoryAlertSink::default();
    let alert = AlertSynthesizer::from_config(&config)
        .from_anomaly(&conn, &sink, anomaly, now)
        .unwrap()
        .unwrap();
    assert_eq!(alert.priority, Priority::Urgent);
    assert_eq!(sink.published().len(), 1);
}

#[test]
fn sudden_glucose_jump() {
    let config = EngineConfig::default();
    let start = at(2025, 3, 1, 7, 30);
    let labs = MemoryLabSource::default();
    let values = [110.0, 115.0, 120.0, 118.0, 160.0];
    let samples: Vec<_> = values
        .iter()
        .enumerate()
        .map(|(i, v)| {
            LabSample::new("p-1", "GLUCOSE_FBS", *v, "mg/dL", start + Duration::days(i as i64 * 5 / 2))
        })
        .collect();
    labs.extend(samples.clone());

    let latest = samples.last().unwrap();
    let found = AnomalyDetector::from_config(&config)
        .evaluate(&labs, &MetricReferenceTable::standard(), latest, None, latest.taken_at)
        .unwrap();

    assert_eq!(found.len(), 1);
    assert_eq!(found[0].kind, AnomalyKind::SuddenChange);
    assert!((found[0].score - 35.59).abs() < 0.01);
    assert_eq!(found[0].severity, Severity::Medium);
    assert_eq!(found[0].reference_value, 118.0);
}

#[test]
fn worsening_hba1c_trend() {
    let config = EngineConfig::default();
    let conn = open_memory_database().unwrap();
    let reference = MetricReferenceTable::standard();
    let first = at(2024, 4, 1, 9, 0);
    let labs = MemoryLabSource::default();
    labs.extend((0..12).map(|i| {
        let value = 7.0 + f64::from(i) * (1.8 / 11.0);
        LabSample::new("p-1", "HBA1C", value, "%", first + Duration::days(30 * i64::from(i)))
    }));
    let now = first + Duration::days(330);

    let analyzer = TrendAnalyzer::from_config(&config);
    let window = analyzer.default_window(&reference, "HBA1C");
    let report = analyzer
        .analyze(&labs, &reference, "p-1", "HBA1C", window, now, &Deadline::unbounded())
        .unwrap()
        .unwrap();

    assert_eq!(report.direction, TrendDirection::Worsening);
    assert!(report.r_squared > 0.95);
    assert!((report.slope_per_month - 1.8 / 11.0).abs() < 1e-6);
    analyzer.record(&conn, &report).unwrap();

    let sink = MemoryAlertSink::default();
    let alert = AlertSynthesizer::from_config(&config)
        .from_trend(&conn, &sink, &reference, &report, now)
        .unwrap()
        .unwrap();
    assert_eq!(alert.kind, AlertKind::DeterioratingControl);
    assert_eq!(alert.priority, Priority::High);
}

#[test]
fn daily_medication_schedule() {
    let config = EngineConfig::default();
    let spec = medication_week(false);
    let slots = Scheduler::from_config(&config).plan(&spec, None, at(2025, 3, 2, 0, 0));

    assert_eq!(slots.len(), 14);
    let first = slots.first().unwrap().scheduled_at;
    let last = slots.last().unwrap().scheduled_at;
    assert_eq!(first.date_naive(), NaiveDate::from_ymd_opt(2025, 3, 3).unwrap());
    assert_eq!(first.hour(), 8);
    assert_eq!(last.date_naive(), NaiveDate::from_ymd_opt(2025, 3, 9).unwrap());
    assert_eq!(last.hour(), 20);
    assert!(slots.iter().all(|s| s.outcome == Outcome::Pending));
}

#[test]
fn adaptive_retune() {
    let config = EngineConfig::default();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("engine.db");
    let now = at(2025, 3, 2, 12, 0);

    let engine = Engine::open(
        &path,
        config.clone(),
        Collaborators {
            clock: Arc::new(ManualClock::new(now)),
            labs: Arc::new(MemoryLabSource::default()),
            transport: Arc::new(MemoryTransport::default()),
            alerts: Arc::new(MemoryAlertSink::default()),
            audit: Arc::new(MemoryAuditSink::default()),
        },
    )
    .unwrap();
    let spec = medication_week(true);
    assert_eq!(engine.spec_upserted(spec.clone()).unwrap().inserted, 14);

    // Last week's history: 08:00 never answered, 09:00 and 20:00 taken at once.
    let conn = open_database(&path).unwrap();
    let mut history = medication_week(false);
    history.state = SpecState::Completed;
    repository::upsert_spec(&conn, &history).unwrap();
    let ledger = BehaviorLedger::from_config(&config);
    let mut profile = None;
    for day in 0..10 {
        let date = at(2025, 2, 18 + day, 0, 0);
        for (hour, answered) in [(8, false), (9, true), (20, true)] {
            let scheduled_at = date + Duration::hours(hour);
            let slot = ReminderInstance::pending(Uuid::new_v4(), history.id, scheduled_at);
            repository::insert_instance_if_absent(&conn, &slot).unwrap();
            let (kind, action, delay_secs) = if answered {
                (ResponseKind::Immediate, Some(ResponseAction::Taken), 60)
            } else {
                (ResponseKind::NoResponse, None, 6 * 3600)
            };
            let event = ResponseEvent {
                id: Uuid::new_v4(),
                instance_id: slot.id,
                patient_id: "p-1".into(),
                task_kind: TaskKind::Medication,
                critical: false,
                scheduled_at,
                observed_at: scheduled_at + Duration::seconds(delay_secs),
                response_kind: kind,
                action,
                delay_secs,
            };
            profile = ledger.record(&conn, &event, now).unwrap();
        }
    }
    let profile = profile.unwrap();
    assert_eq!(profile.best_hours, vec![9, 20]);
    assert_eq!(profile.worst_hours, vec![8]);
    drop(conn);

    let report = engine.tick(now);
    assert_eq!(report.tuned, 1);

    let tuned = engine.spec(spec.id).unwrap().unwrap();
    assert_eq!(tuned.preferred_hours, vec![9, 20]);
    assert!(tuned.last_tuned_at.is_some());

    let slots = engine.instances(spec.id).unwrap();
    assert_eq!(slots.len(), 14);
    let hours: BTreeSet<u32> = slots.iter().map(|s| s.scheduled_at.hour()).collect();
    assert_eq!(hours, BTreeSet::from([9, 20]));

    // Nothing new to learn: the next tick leaves the schedule alone.
    assert_eq!(engine.tick(now + Duration::minutes(1)).tuned, 0);
}

#[test]
fn delivery_is_idempotent_across_workers() {
    let config = EngineConfig::default();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("engine.db");
    let now = at(2025, 3, 3, 8, 0);

    let first = open_database(&path).unwrap();
    let second = open_database(&path).unwrap();
    let spec = medication_week(false);
    repository::upsert_spec(&first, &spec).unwrap();
    let slot = ReminderInstance::pending(Uuid::new_v4(), spec.id, now);
    repository::insert_instance_if_absent(&first, &slot).unwrap();

    let transport = Arc::new(MemoryTransport::default());
    let config_ref = &config;
    let reports: Vec<DispatchReport> = std::thread::scope(|scope| {
        let workers: Vec<_> = [first, second]
            .into_iter()
            .map(|conn| {
                let transport = transport.clone();
                scope.spawn(move || {
                    DeliveryCoordinator::from_config(config_ref)
                        .dispatch_due(&conn, transport.as_ref(), now)
                        .unwrap()
                })
            })
            .collect();
        workers.into_iter().map(|w| w.join().unwrap()).collect()
    });

    assert_eq!(reports.iter().map(|r| r.sent).sum::<usize>(), 1);
    assert_eq!(transport.sent().len(), 1);

    let check = open_database(&path).unwrap();
    let stored = repository::get_instance(&check, &slot.id).unwrap().unwrap();
    assert_eq!(stored.outcome, Outcome::Sent);
    assert_eq!(stored.attempt_count, 1);
    assert!(stored.notification_id.is_some());

    // The claim itself: only the first of two racing updates wins.
    let late = ReminderInstance::pending(Uuid::new_v4(), spec.id, now + Duration::hours(1));
    repository::insert_instance_if_absent(&check, &late).unwrap();
    let other = open_database(&path).unwrap();
    let at_send = now + Duration::hours(1);
    assert!(repository::claim_for_send(&check, &late.id, at_send).unwrap());
    assert!(!repository::claim_for_send(&other, &late.id, at_send).unwrap());
}
