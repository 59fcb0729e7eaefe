//! Baseline learning: per patient-metric mean and dispersion used as the
//! reference frame for outlier scoring.

use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;

use crate::config::EngineConfig;
use crate::db::repository;
use crate::models::{Baseline, LabSample};

use super::reference::MetricReferenceTable;
use super::types::{IntelligenceError, LabSource};

// ---------------------------------------------------------------------------
// BaselineStore
// ---------------------------------------------------------------------------

/// Access to persisted baselines. Writes go through [`BaselineCalculator`].
#[derive(Debug, Clone)]
pub struct BaselineStore {
    refresh_interval: Duration,
}

impl BaselineStore {
    pub fn new(refresh_interval: Duration) -> Self {
        Self { refresh_interval }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.baseline_refresh_interval())
    }

    /// Absent when not computed yet or when the store cannot be read.
    pub fn get(&self, conn: &Connection, patient_id: &str, metric_code: &str) -> Option<Baseline> {
        match repository::get_baseline(conn, patient_id, metric_code) {
            Ok(baseline) => baseline,
            Err(e) => {
                tracing::warn!(patient_id, metric_code, error = %e, "Baseline read failed");
                None
            }
        }
    }

    pub fn put(&self, conn: &Connection, baseline: &Baseline) -> Result<(), IntelligenceError> {
        repository::upsert_baseline(conn, baseline)?;
        Ok(())
    }

    /// Missing, or older than the refresh interval.
    pub fn stale(
        &self,
        conn: &Connection,
        patient_id: &str,
        metric_code: &str,
        now: DateTime<Utc>,
    ) -> bool {
        self.is_stale(self.get(conn, patient_id, metric_code).as_ref(), now)
    }

    pub fn is_stale(&self, baseline: Option<&Baseline>, now: DateTime<Utc>) -> bool {
        match baseline {
            Some(b) => now - b.computed_at > self.refresh_interval,
            None => true,
        }
    }
}

// ---------------------------------------------------------------------------
// BaselineCalculator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct BaselineCalculator {
    min_samples: usize,
    horizon: Duration,
}

impl BaselineCalculator {
    pub fn new(min_samples: usize, horizon: Duration) -> Self {
        Self { min_samples, horizon }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.baseline_min_samples, config.baseline_horizon())
    }

    pub fn horizon(&self) -> Duration {
        self.horizon
    }

    /// Fetch the horizon's samples, summarize them and store the result.
    #[allow(clippy::too_many_arguments)]
    pub fn compute(
        &self,
        conn: &Connection,
        store: &BaselineStore,
        labs: &dyn LabSource,
        reference: &MetricReferenceTable,
        patient_id: &str,
        metric_code: &str,
        now: DateTime<Utc>,
    ) -> Result<Baseline, IntelligenceError> {
        let window_start = now - self.horizon;
        let samples = labs.samples(patient_id, metric_code, window_start, now)?;
        let baseline = self.summarize(patient_id, metric_code, &samples, reference, now)?;
        store.put(conn, &baseline)?;

        tracing::info!(
            patient_id,
            metric_code,
            mean = baseline.mean,
            std_dev = baseline.std_dev,
            samples = baseline.sample_count,
            "Baseline computed"
        );
        Ok(baseline)
    }

    /// Mean and Bessel-corrected standard deviation of the in-range samples
    /// within `[now - horizon, now]`.
    pub fn summarize(
        &self,
        patient_id: &str,
        metric_code: &str,
        samples: &[LabSample],
        reference: &MetricReferenceTable,
        now: DateTime<Utc>,
    ) -> Result<Baseline, IntelligenceError> {
        let window_start = now - self.horizon;
        let values: Vec<f64> = samples
            .iter()
            .filter(|s| s.taken_at >= window_start && s.taken_at <= now)
            .filter(|s| reference.in_range(metric_code, s.value))
            .map(|s| s.value)
            .collect();

        if values.len() < self.min_samples {
            return Err(IntelligenceError::InsufficientData {
                patient_id: patient_id.to_string(),
                metric_code: metric_code.to_string(),
                found: values.len(),
                required: self.min_samples,
            });
        }

        let (mean, std_dev) = mean_and_std(&values);
        Ok(Baseline {
            patient_id: patient_id.to_string(),
            metric_code: metric_code.to_string(),
            mean,
            std_dev,
            sample_count: values.len() as u32,
            window_start,
            window_end: now,
            computed_at: now,
        })
    }

    /// True when at least `threshold` in-range samples were taken after the
    /// baseline's window closed.
    pub fn needs_resample(
        &self,
        labs: &dyn LabSource,
        reference: &MetricReferenceTable,
        baseline: &Baseline,
        now: DateTime<Utc>,
        threshold: usize,
    ) -> Result<bool, IntelligenceError> {
        if now <= baseline.window_end {
            return Ok(false);
        }
        let fresh = labs
            .samples(&baseline.patient_id, &baseline.metric_code, baseline.window_end, now)?
            .into_iter()
            .filter(|s| s.taken_at > baseline.window_end)
            .filter(|s| reference.in_range(&baseline.metric_code, s.value))
            .count();
        Ok(fresh >= threshold)
    }
}

/// Mean and sample standard deviation; the deviation is 0 below two values.
pub fn mean_and_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    if values.len() < 2 {
        return (mean, 0.0);
    }
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    (mean, variance.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::sqlite::open_memory_database;
    use crate::intelligence::types::SourceError;
    use chrono::TimeZone;

    struct FixedLabs(Vec<LabSample>);

    impl LabSource for FixedLabs {
        fn samples(
            &self,
            patient_id: &str,
            metric_code: &str,
            from: DateTime<Utc>,
            to: DateTime<Utc>,
        ) -> Result<Vec<LabSample>, SourceError> {
            Ok(self
                .0
                .iter()
                .filter(|s| s.patient_id == patient_id && s.metric_code == metric_code)
                .filter(|s| s.taken_at >= from && s.taken_at <= to)
                .cloned()
                .collect())
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn hba1c(days_ago: i64, value: f64) -> LabSample {
        LabSample::new("p-1", "HBA1C", value, "%", now() - Duration::days(days_ago))
    }

    #[test]
    fn mean_and_bessel_std() {
        let (mean, std) = mean_and_std(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
        assert!((mean - 5.0).abs() < 1e-12);
        assert!((std - 2.138_089_935).abs() < 1e-6);
        assert_eq!(mean_and_std(&[3.0]), (3.0, 0.0));
    }

    #[test]
    fn out_of_range_and_non_finite_values_dropped() {
        let calc = BaselineCalculator::new(3, Duration::days(360));
        let table = MetricReferenceTable::standard();
        let samples = vec![
            hba1c(90, 7.0),
            hba1c(60, 7.5),
            hba1c(30, 6.5),
            hba1c(20, 42.0),
            hba1c(10, f64::NAN),
        ];
        let baseline = calc.summarize("p-1", "HBA1C", &samples, &table, now()).unwrap();
        assert_eq!(baseline.sample_count, 3);
        assert!((baseline.mean - 7.0).abs() < 1e-12);
        assert!((baseline.std_dev - 0.5).abs() < 1e-12);
    }

    #[test]
    fn fewer_than_min_samples_is_insufficient() {
        let calc = BaselineCalculator::new(3, Duration::days(360));
        let table = MetricReferenceTable::standard();
        let samples = vec![hba1c(30, 7.0), hba1c(400, 7.1), hba1c(10, 3.0)];
        let err = calc.summarize("p-1", "HBA1C", &samples, &table, now()).unwrap_err();
        assert!(matches!(err, IntelligenceError::InsufficientData { found: 1, required: 3, .. }));
    }

    #[test]
    fn compute_writes_to_store() {
        let conn = open_memory_database().unwrap();
        let store = BaselineStore::new(Duration::days(30));
        let calc = BaselineCalculator::new(3, Duration::days(360));
        let labs = FixedLabs(vec![hba1c(90, 7.0), hba1c(60, 7.0), hba1c(30, 7.0)]);
        let table = MetricReferenceTable::standard();

        assert!(store.stale(&conn, "p-1", "HBA1C", now()));
        let baseline = calc
            .compute(&conn, &store, &labs, &table, "p-1", "HBA1C", now())
            .unwrap();
        assert!(baseline.is_flat());
        assert_eq!(store.get(&conn, "p-1", "HBA1C"), Some(baseline));
        assert!(!store.stale(&conn, "p-1", "HBA1C", now()));
        assert!(store.stale(&conn, "p-1", "HBA1C", now() + Duration::days(31)));
    }

    #[test]
    fn resample_after_enough_new_samples() {
        let calc = BaselineCalculator::new(3, Duration::days(360));
        let table = MetricReferenceTable::standard();
        let baseline = calc
            .summarize(
                "p-1",
                "HBA1C",
                &[hba1c(90, 7.0), hba1c(60, 7.2), hba1c(30, 7.4)],
                &table,
                now() - Duration::days(20),
            )
            .unwrap();

        let labs = FixedLabs(vec![hba1c(15, 7.5), hba1c(10, 7.6), hba1c(5, 99.0)]);
        assert!(calc.needs_resample(&labs, &table, &baseline, now(), 2).unwrap());
        assert!(!calc.needs_resample(&labs, &table, &baseline, now(), 3).unwrap());
    }
}
