//! Alert synthesis: turns anomalies, trends and adherence profiles into
//! graded alerts, one per (patient, kind, local day).

use chrono::{DateTime, Duration, FixedOffset, Utc};
use rusqlite::Connection;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::db::{repository, DatabaseError};
use crate::models::enums::{AlertKind, Priority, ResolutionState, Severity, TrendDirection};
use crate::models::{Alert, AlertSource, Anomaly, BehaviorProfile, TrendReport};

use super::messages::MessageTemplates;
use super::reference::{MetricFamily, MetricReferenceTable};
use super::types::{AlertSink, IntelligenceError};

/// Alert content before de-duplication.
#[derive(Debug, Clone)]
struct AlertDraft {
    patient_id: String,
    kind: AlertKind,
    priority: Priority,
    title: String,
    body: String,
    source: AlertSource,
    expires_in: Duration,
}

#[derive(Debug, Clone)]
pub struct AlertSynthesizer {
    offset: FixedOffset,
    deterioration_expiry: Duration,
    adherence_expiry: Duration,
    anomaly_expiry: Duration,
    min_r_squared: f64,
    adherence_min_sent: u32,
    adherence_high_below: f64,
    adherence_medium_below: f64,
}

impl AlertSynthesizer {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            offset: config.local_offset(),
            deterioration_expiry: Duration::days(config.alert_expiry_deterioration_days),
            adherence_expiry: Duration::days(config.alert_expiry_adherence_days),
            anomaly_expiry: Duration::days(config.alert_expiry_anomaly_days),
            min_r_squared: config.trend_min_r_squared,
            adherence_min_sent: config.adherence_min_sent,
            adherence_high_below: config.adherence_high_below,
            adherence_medium_below: config.adherence_medium_below,
        }
    }

    /// CRITICAL anomalies raise an URGENT alert; anything milder raises nothing.
    pub fn from_anomaly(
        &self,
        conn: &Connection,
        sink: &dyn AlertSink,
        anomaly: &Anomaly,
        now: DateTime<Utc>,
    ) -> Result<Option<Alert>, IntelligenceError> {
        if anomaly.severity != Severity::Critical {
            return Ok(None);
        }
        let draft = AlertDraft {
            patient_id: anomaly.patient_id.clone(),
            kind: AlertKind::CriticalAnomaly,
            priority: Priority::Urgent,
            title: MessageTemplates::critical_anomaly_title(&anomaly.metric_code),
            body: MessageTemplates::critical_anomaly_body(anomaly),
            source: AlertSource::Anomaly { id: anomaly.id },
            expires_in: self.anomaly_expiry,
        };
        self.raise(conn, sink, draft, now)
    }

    /// A confident WORSENING trend raises DETERIORATING_CONTROL.
    pub fn from_trend(
        &self,
        conn: &Connection,
        sink: &dyn AlertSink,
        reference: &MetricReferenceTable,
        report: &TrendReport,
        now: DateTime<Utc>,
    ) -> Result<Option<Alert>, IntelligenceError> {
        if report.direction != TrendDirection::Worsening || report.r_squared < self.min_r_squared {
            return Ok(None);
        }
        let family = reference.family(&report.metric_code);
        let priority = match family {
            MetricFamily::Hba1c => Priority::High,
            MetricFamily::Glucose => Priority::Medium,
            MetricFamily::Other => Priority::Low,
        };
        let draft = AlertDraft {
            patient_id: report.patient_id.clone(),
            kind: AlertKind::DeterioratingControl,
            priority,
            title: MessageTemplates::deterioration_title(family, &report.metric_code),
            body: MessageTemplates::deterioration_body(report),
            source: AlertSource::Trend { id: report.id },
            expires_in: self.deterioration_expiry,
        };
        self.raise(conn, sink, draft, now)
    }

    /// Low compliance over enough deliveries raises NON_ADHERENCE.
    pub fn from_adherence(
        &self,
        conn: &Connection,
        sink: &dyn AlertSink,
        profile: &BehaviorProfile,
        now: DateTime<Utc>,
    ) -> Result<Option<Alert>, IntelligenceError> {
        if profile.total_sent < self.adherence_min_sent {
            return Ok(None);
        }
        let priority = if profile.compliance_rate < self.adherence_high_below {
            Priority::High
        } else if profile.compliance_rate < self.adherence_medium_below {
            Priority::Medium
        } else {
            return Ok(None);
        };
        let draft = AlertDraft {
            patient_id: profile.patient_id.clone(),
            kind: AlertKind::NonAdherence,
            priority,
            title: MessageTemplates::adherence_title(profile.task_kind),
            body: MessageTemplates::adherence_body(profile),
            source: AlertSource::Adherence {
                task_kind: profile.task_kind,
            },
            expires_in: self.adherence_expiry,
        };
        self.raise(conn, sink, draft, now)
    }

    /// Mark an alert RESOLVED. Resolving twice keeps the first stamp.
    pub fn resolve(
        &self,
        conn: &Connection,
        alert_id: &Uuid,
        actor: &str,
        notes: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Alert, IntelligenceError> {
        let changed = repository::resolve_alert(conn, alert_id, actor, notes, now)?;
        let alert = repository::get_alert(conn, alert_id)?
            .ok_or(IntelligenceError::AlertNotFound(*alert_id))?;
        if changed == 1 {
            tracing::info!(alert_id = %alert_id, actor, kind = alert.kind.as_str(), "Alert resolved");
        }
        Ok(alert)
    }

    /// Open alerts that have not expired, newest first.
    pub fn active_alerts(
        &self,
        conn: &Connection,
        patient_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Alert>, IntelligenceError> {
        Ok(repository::list_active_alerts(conn, patient_id, now)?)
    }

    fn raise(
        &self,
        conn: &Connection,
        sink: &dyn AlertSink,
        draft: AlertDraft,
        now: DateTime<Utc>,
    ) -> Result<Option<Alert>, IntelligenceError> {
        let day = now.with_timezone(&self.offset).date_naive();
        if let Some(existing) = repository::find_alert_for_day(conn, &draft.patient_id, draft.kind, day)? {
            return self.attach(conn, sink, existing, draft);
        }

        let alert = Alert {
            id: Uuid::new_v4(),
            patient_id: draft.patient_id.clone(),
            kind: draft.kind,
            priority: draft.priority,
            title: draft.title.clone(),
            body: draft.body.clone(),
            sources: vec![draft.source.clone()],
            created_at: now,
            expires_at: now + draft.expires_in,
            resolution_state: ResolutionState::Open,
            resolved_at: None,
            resolved_by: None,
            resolution_notes: None,
        };

        match repository::insert_alert(conn, &alert, day) {
            Ok(()) => {
                tracing::info!(
                    patient_id = %alert.patient_id,
                    kind = alert.kind.as_str(),
                    priority = alert.priority.as_str(),
                    "Alert raised"
                );
                sink.publish(&alert);
                Ok(Some(alert))
            }
            Err(e) if is_unique_violation(&e) => {
                // Another writer took the day slot between lookup and insert.
                match repository::find_alert_for_day(conn, &draft.patient_id, draft.kind, day)? {
                    Some(existing) => self.attach(conn, sink, existing, draft),
                    None => Err(e.into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    fn attach(
        &self,
        conn: &Connection,
        sink: &dyn AlertSink,
        mut existing: Alert,
        draft: AlertDraft,
    ) -> Result<Option<Alert>, IntelligenceError> {
        if existing.resolution_state == ResolutionState::Resolved {
            tracing::debug!(
                alert_id = %existing.id,
                kind = existing.kind.as_str(),
                "Alert for today already resolved, source not attached"
            );
            return Ok(None);
        }

        let added = existing.attach(draft.source);
        let escalated = draft.priority > existing.priority;
        if escalated {
            existing.priority = draft.priority;
            existing.title = draft.title;
            existing.body = draft.body;
        }
        if !added && !escalated {
            return Ok(None);
        }

        repository::update_alert_content(conn, &existing)?;
        tracing::debug!(
            alert_id = %existing.id,
            sources = existing.sources.len(),
            escalated,
            "Source attached to existing alert"
        );
        if escalated {
            sink.publish(&existing);
        }
        Ok(Some(existing))
    }
}

fn is_unique_violation(err: &DatabaseError) -> bool {
    matches!(
        err,
        DatabaseError::Sqlite(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}
