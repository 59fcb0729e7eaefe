//! Anomaly scoring: statistical outliers against the baseline and sudden
//! changes between adjacent samples.

use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::db::repository;
use crate::models::enums::{AnomalyKind, Severity};
use crate::models::{Anomaly, Baseline, LabSample};

use super::reference::MetricReferenceTable;
use super::types::{IntelligenceError, LabSource};

/// Severity for a z-score against ascending LOW..CRITICAL gates.
pub fn classify_z(z: f64, gates: &[f64; 4]) -> Option<Severity> {
    if z >= gates[3] {
        Some(Severity::Critical)
    } else if z >= gates[2] {
        Some(Severity::High)
    } else if z >= gates[1] {
        Some(Severity::Medium)
    } else if z >= gates[0] {
        Some(Severity::Low)
    } else {
        None
    }
}

/// Severity for a percent change. The LOW gate must be strictly exceeded.
pub fn classify_change(percent: f64, gates: &[f64; 4]) -> Option<Severity> {
    if percent <= gates[0] {
        None
    } else if percent >= gates[3] {
        Some(Severity::Critical)
    } else if percent >= gates[2] {
        Some(Severity::High)
    } else if percent >= gates[1] {
        Some(Severity::Medium)
    } else {
        Some(Severity::Low)
    }
}

/// Z-score check. `None` when the baseline carries no dispersion or the
/// score falls under the lowest gate.
pub fn detect_outlier(
    sample: &LabSample,
    baseline: &Baseline,
    gates: &[f64; 4],
    now: DateTime<Utc>,
) -> Option<Anomaly> {
    if baseline.is_flat() || !sample.value.is_finite() {
        return None;
    }
    let z = (sample.value - baseline.mean).abs() / baseline.std_dev;
    let severity = classify_z(z, gates)?;
    Some(new_anomaly(
        sample,
        AnomalyKind::StatisticalOutlier,
        severity,
        baseline.mean,
        z,
        now,
    ))
}

/// Adjacent-pair percent changes over samples ordered by `taken_at`.
/// Needs at least three samples.
pub fn detect_sudden_changes(
    samples: &[LabSample],
    gates: &[f64; 4],
    now: DateTime<Utc>,
) -> Vec<Anomaly> {
    if samples.len() < 3 {
        return Vec::new();
    }
    samples
        .windows(2)
        .filter_map(|pair| {
            let (prev, next) = (&pair[0], &pair[1]);
            if prev.value == 0.0 {
                return None;
            }
            let percent = (next.value - prev.value).abs() / prev.value.abs() * 100.0;
            let severity = classify_change(percent, gates)?;
            Some(new_anomaly(
                next,
                AnomalyKind::SuddenChange,
                severity,
                prev.value,
                percent,
                now,
            ))
        })
        .collect()
}

fn new_anomaly(
    sample: &LabSample,
    kind: AnomalyKind,
    severity: Severity,
    reference_value: f64,
    score: f64,
    now: DateTime<Utc>,
) -> Anomaly {
    Anomaly {
        id: Anomaly::key_id(&sample.patient_id, &sample.metric_code, sample.taken_at, kind),
        patient_id: sample.patient_id.clone(),
        metric_code: sample.metric_code.clone(),
        kind,
        severity,
        observed_value: sample.value,
        reference_value,
        score,
        observed_at: sample.taken_at,
        detected_at: now,
        acknowledged_at: None,
        acknowledged_by: None,
    }
}

/// An anomaly as persisted, with whether this scoring created it.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredAnomaly {
    pub anomaly: Anomaly,
    pub is_new: bool,
}

#[derive(Debug, Clone)]
pub struct AnomalyDetector {
    z_gates: [f64; 4],
    change_gates: [f64; 4],
    lookback: Duration,
}

impl AnomalyDetector {
    pub fn new(z_gates: [f64; 4], change_gates: [f64; 4], lookback: Duration) -> Self {
        Self {
            z_gates,
            change_gates,
            lookback,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            config.outlier_z_thresholds,
            config.sudden_change_thresholds,
            config.sudden_change_lookback(),
        )
    }

    /// Run both checks for a new sample. Nothing is written.
    ///
    /// `baseline` must already be filtered for staleness by the caller;
    /// pass `None` to suppress outlier scoring.
    pub fn evaluate(
        &self,
        labs: &dyn LabSource,
        reference: &MetricReferenceTable,
        sample: &LabSample,
        baseline: Option<&Baseline>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Anomaly>, IntelligenceError> {
        if !reference.in_range(&sample.metric_code, sample.value) {
            tracing::debug!(
                patient_id = %sample.patient_id,
                metric_code = %sample.metric_code,
                value = sample.value,
                "Sample outside physiological range, not scored"
            );
            return Ok(Vec::new());
        }

        let mut found = Vec::new();
        if let Some(baseline) = baseline {
            found.extend(detect_outlier(sample, baseline, &self.z_gates, now));
        }

        let mut window = labs.samples(
            &sample.patient_id,
            &sample.metric_code,
            sample.taken_at - self.lookback,
            sample.taken_at,
        )?;
        if !window.iter().any(|s| s.taken_at == sample.taken_at) {
            window.push(sample.clone());
        }
        window.retain(|s| reference.in_range(&s.metric_code, s.value));
        window.sort_by_key(|s| s.taken_at);
        window.dedup_by_key(|s| s.taken_at);
        found.extend(detect_sudden_changes(&window, &self.change_gates, now));

        found.sort_by(|a, b| {
            a.observed_at
                .cmp(&b.observed_at)
                .then_with(|| a.kind.cmp(&b.kind))
        });
        Ok(found)
    }

    /// Evaluate and upsert; results in `observed_at` order.
    pub fn score(
        &self,
        conn: &Connection,
        labs: &dyn LabSource,
        reference: &MetricReferenceTable,
        sample: &LabSample,
        baseline: Option<&Baseline>,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScoredAnomaly>, IntelligenceError> {
        let anomalies = self.evaluate(labs, reference, sample, baseline, now)?;
        let mut scored = Vec::with_capacity(anomalies.len());
        for anomaly in anomalies {
            let is_new = repository::upsert_anomaly(conn, &anomaly)?;
            if is_new {
                tracing::info!(
                    patient_id = %anomaly.patient_id,
                    metric_code = %anomaly.metric_code,
                    kind = anomaly.kind.as_str(),
                    severity = anomaly.severity.as_str(),
                    score = anomaly.score,
                    "Anomaly detected"
                );
            }
            scored.push(ScoredAnomaly { anomaly, is_new });
        }
        Ok(scored)
    }

    /// Stamp an anomaly as seen. The record itself is never removed and a
    /// second acknowledgement keeps the first stamp.
    pub fn acknowledge(
        &self,
        conn: &Connection,
        anomaly_id: &Uuid,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<Anomaly, IntelligenceError> {
        if repository::get_anomaly(conn, anomaly_id)?.is_none() {
            return Err(IntelligenceError::AnomalyNotFound(*anomaly_id));
        }
        let anomaly = repository::acknowledge_anomaly(conn, anomaly_id, actor, now)?;
        tracing::info!(anomaly_id = %anomaly_id, actor, "Anomaly acknowledged");
        Ok(anomaly)
    }
}
