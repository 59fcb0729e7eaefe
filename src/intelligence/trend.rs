//! Linear trend fitting over sliding windows.

use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use uuid::Uuid;

use crate::clock::Deadline;
use crate::config::{EngineConfig, SlopeThresholds};
use crate::db::repository;
use crate::models::enums::TrendDirection;
use crate::models::TrendReport;

use super::messages::MessageTemplates;
use super::reference::MetricReferenceTable;
use super::types::{IntelligenceError, LabSource};

/// Points processed between deadline checks.
const DEADLINE_STRIDE: usize = 256;

/// Ordinary least-squares fit result. `slope` is per x unit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearFit {
    pub slope: f64,
    pub intercept: f64,
    pub r_squared: f64,
}

/// Fit y = slope·x + intercept. A zero x-variance yields slope 0 and r² 0.
pub fn fit_linear(points: &[(f64, f64)], deadline: &Deadline) -> Result<LinearFit, IntelligenceError> {
    let n = points.len() as f64;
    if points.is_empty() {
        return Ok(LinearFit { slope: 0.0, intercept: 0.0, r_squared: 0.0 });
    }

    let (mut sum_x, mut sum_y) = (0.0, 0.0);
    for (i, (x, y)) in points.iter().enumerate() {
        check_deadline(i, deadline)?;
        sum_x += x;
        sum_y += y;
    }
    let (mean_x, mean_y) = (sum_x / n, sum_y / n);

    let (mut sxx, mut sxy, mut syy) = (0.0, 0.0, 0.0);
    for (i, (x, y)) in points.iter().enumerate() {
        check_deadline(i, deadline)?;
        let (dx, dy) = (x - mean_x, y - mean_y);
        sxx += dx * dx;
        sxy += dx * dy;
        syy += dy * dy;
    }

    if sxx == 0.0 {
        return Ok(LinearFit { slope: 0.0, intercept: mean_y, r_squared: 0.0 });
    }

    let slope = sxy / sxx;
    let intercept = mean_y - slope * mean_x;
    let r_squared = if syy == 0.0 {
        0.0
    } else {
        ((sxy * sxy) / (sxx * syy)).clamp(0.0, 1.0)
    };
    Ok(LinearFit { slope, intercept, r_squared })
}

fn check_deadline(i: usize, deadline: &Deadline) -> Result<(), IntelligenceError> {
    if i % DEADLINE_STRIDE == 0 && deadline.expired() {
        return Err(IntelligenceError::DeadlineExceeded("trend regression"));
    }
    Ok(())
}

pub fn classify_direction(slope_per_month: f64, thresholds: &SlopeThresholds) -> TrendDirection {
    if slope_per_month.abs() < thresholds.stable {
        TrendDirection::Stable
    } else if slope_per_month > thresholds.change {
        TrendDirection::Worsening
    } else if slope_per_month < -thresholds.change {
        TrendDirection::Improving
    } else {
        TrendDirection::Fluctuating
    }
}

#[derive(Debug, Clone)]
pub struct TrendAnalyzer {
    config: EngineConfig,
}

impl TrendAnalyzer {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Metric-specific default window.
    pub fn default_window(&self, reference: &MetricReferenceTable, metric_code: &str) -> Duration {
        reference.trend_window(metric_code, &self.config)
    }

    /// Fit the window ending at `now`. `Ok(None)` on insufficient data.
    /// Nothing is written.
    #[allow(clippy::too_many_arguments)]
    pub fn analyze(
        &self,
        labs: &dyn LabSource,
        reference: &MetricReferenceTable,
        patient_id: &str,
        metric_code: &str,
        window: Duration,
        now: DateTime<Utc>,
        deadline: &Deadline,
    ) -> Result<Option<TrendReport>, IntelligenceError> {
        let window_start = now - window;
        let mut samples = labs.samples(patient_id, metric_code, window_start, now)?;
        samples.retain(|s| {
            s.taken_at >= window_start && s.taken_at <= now && reference.in_range(metric_code, s.value)
        });
        if samples.len() < self.config.trend_min_samples {
            tracing::debug!(
                patient_id,
                metric_code,
                samples = samples.len(),
                "Not enough samples for trend"
            );
            return Ok(None);
        }
        samples.sort_by_key(|s| s.taken_at);

        let first = samples[0].taken_at;
        let points: Vec<(f64, f64)> = samples
            .iter()
            .map(|s| ((s.taken_at - first).num_days() as f64, s.value))
            .collect();
        let fit = fit_linear(&points, deadline)?;

        let slope_per_month = fit.slope * 30.0;
        let thresholds = reference.slope_thresholds(metric_code, &self.config);
        let direction = classify_direction(slope_per_month, &thresholds);
        let mean_value = points.iter().map(|(_, y)| y).sum::<f64>() / points.len() as f64;
        let description = MessageTemplates::trend_description(
            direction,
            slope_per_month,
            reference.unit(metric_code),
            samples.len(),
        );

        Ok(Some(TrendReport {
            id: Uuid::new_v4(),
            patient_id: patient_id.to_string(),
            metric_code: metric_code.to_string(),
            window_start,
            window_end: now,
            slope_per_month,
            r_squared: fit.r_squared,
            direction,
            sample_count: samples.len() as u32,
            mean_value,
            description,
            computed_at: now,
        }))
    }

    /// Append a report to the trend store.
    pub fn record(&self, conn: &Connection, report: &TrendReport) -> Result<(), IntelligenceError> {
        repository::insert_trend_report(conn, report)?;
        tracing::info!(
            patient_id = %report.patient_id,
            metric_code = %report.metric_code,
            direction = report.direction.as_str(),
            slope_per_month = report.slope_per_month,
            r_squared = report.r_squared,
            "Trend recorded"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intelligence::types::SourceError;
    use crate::models::LabSample;
    use chrono::TimeZone;
    use std::time::Duration as StdDuration;

    struct FixedLabs(Vec<LabSample>);

    impl LabSource for FixedLabs {
        fn samples(
            &self,
            _patient_id: &str,
            _metric_code: &str,
            from: DateTime<Utc>,
            to: DateTime<Utc>,
        ) -> Result<Vec<LabSample>, SourceError> {
            Ok(self
                .0
                .iter()
                .filter(|s| s.taken_at >= from && s.taken_at <= to)
                .cloned()
                .collect())
        }
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap()
    }

    fn glucose_thresholds() -> SlopeThresholds {
        SlopeThresholds { stable: 2.0, change: 5.0 }
    }

    #[test]
    fn perfect_line() {
        let points = vec![(0.0, 1.0), (1.0, 3.0), (2.0, 5.0), (3.0, 7.0)];
        let fit = fit_linear(&points, &Deadline::unbounded()).unwrap();
        assert!((fit.slope - 2.0).abs() < 1e-12);
        assert!((fit.intercept - 1.0).abs() < 1e-12);
        assert!((fit.r_squared - 1.0).abs() < 1e-12);
    }

    #[test]
    fn same_day_points_are_degenerate() {
        let points = vec![(0.0, 100.0), (0.0, 150.0), (0.0, 120.0)];
        let fit = fit_linear(&points, &Deadline::unbounded()).unwrap();
        assert_eq!(fit.slope, 0.0);
        assert_eq!(fit.r_squared, 0.0);
        assert_eq!(classify_direction(fit.slope * 30.0, &glucose_thresholds()), TrendDirection::Stable);
    }

    #[test]
    fn expired_deadline_aborts_fit() {
        let points = vec![(0.0, 1.0), (1.0, 2.0), (2.0, 3.0)];
        let err = fit_linear(&points, &Deadline::after(StdDuration::ZERO)).unwrap_err();
        assert!(matches!(err, IntelligenceError::DeadlineExceeded(_)));
    }

    #[test]
    fn direction_rules() {
        let th = glucose_thresholds();
        assert_eq!(classify_direction(1.9, &th), TrendDirection::Stable);
        assert_eq!(classify_direction(-1.9, &th), TrendDirection::Stable);
        assert_eq!(classify_direction(5.1, &th), TrendDirection::Worsening);
        assert_eq!(classify_direction(-5.1, &th), TrendDirection::Improving);
        assert_eq!(classify_direction(3.0, &th), TrendDirection::Fluctuating);
        assert_eq!(classify_direction(-5.0, &th), TrendDirection::Fluctuating);
    }

    #[test]
    fn worsening_hba1c_series() {
        let labs = FixedLabs(
            (0..12)
                .map(|i| {
                    let value = 7.0 + 1.8 * i as f64 / 11.0;
                    LabSample::new("p-1", "HBA1C", value, "%", start() + Duration::days(30 * i))
                })
                .collect(),
        );
        let analyzer = TrendAnalyzer::from_config(&EngineConfig::default());
        let table = MetricReferenceTable::standard();
        let now = start() + Duration::days(331);
        let window = analyzer.default_window(&table, "HBA1C");

        let report = analyzer
            .analyze(&labs, &table, "p-1", "HBA1C", window, now, &Deadline::unbounded())
            .unwrap()
            .unwrap();
        assert_eq!(report.direction, TrendDirection::Worsening);
        assert!(report.r_squared > 0.95);
        assert!((report.slope_per_month - 1.8 / 11.0).abs() < 1e-9);
        assert_eq!(report.sample_count, 12);
        assert!((report.mean_value - 7.9).abs() < 1e-9);
        assert!(report.description.contains("worsening"));
    }

    #[test]
    fn too_few_samples_is_none() {
        let labs = FixedLabs(vec![
            LabSample::new("p-1", "GLUCOSE_FBS", 120.0, "mg/dL", start()),
            LabSample::new("p-1", "GLUCOSE_FBS", 900.0, "mg/dL", start() + Duration::days(1)),
            LabSample::new("p-1", "GLUCOSE_FBS", 130.0, "mg/dL", start() + Duration::days(2)),
        ]);
        let analyzer = TrendAnalyzer::from_config(&EngineConfig::default());
        let table = MetricReferenceTable::standard();
        let report = analyzer
            .analyze(
                &labs,
                &table,
                "p-1",
                "GLUCOSE_FBS",
                Duration::days(180),
                start() + Duration::days(3),
                &Deadline::unbounded(),
            )
            .unwrap();
        assert!(report.is_none());
    }
}
