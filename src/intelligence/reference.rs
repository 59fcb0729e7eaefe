use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::config::{EngineConfig, SlopeThresholds};

/// Groups metrics that share trend windows, slope units and alert priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetricFamily {
    Hba1c,
    Glucose,
    Other,
}

/// Physiological plausibility range for one metric code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricReference {
    pub code: String,
    pub family: MetricFamily,
    pub unit: String,
    pub min: f64,
    pub max: f64,
}

/// Known metrics. Unknown codes accept any finite value.
#[derive(Debug, Clone)]
pub struct MetricReferenceTable {
    pub metrics: Vec<MetricReference>,
}

impl MetricReferenceTable {
    /// Built-in diabetes panel.
    pub fn standard() -> Self {
        let metric = |code: &str, family, unit: &str, min, max| MetricReference {
            code: code.into(),
            family,
            unit: unit.into(),
            min,
            max,
        };
        Self {
            metrics: vec![
                metric("HBA1C", MetricFamily::Hba1c, "%", 4.0, 18.0),
                metric("GLUCOSE_FBS", MetricFamily::Glucose, "mg/dL", 20.0, 800.0),
                metric("GLUCOSE_2HPP", MetricFamily::Glucose, "mg/dL", 20.0, 800.0),
                metric("GLUCOSE_RANDOM", MetricFamily::Glucose, "mg/dL", 20.0, 800.0),
                metric("CREATININE", MetricFamily::Other, "mg/dL", 0.1, 20.0),
                metric("LDL", MetricFamily::Other, "mg/dL", 10.0, 500.0),
            ],
        }
    }

    pub fn lookup(&self, code: &str) -> Option<&MetricReference> {
        self.metrics.iter().find(|m| m.code.eq_ignore_ascii_case(code))
    }

    pub fn family(&self, code: &str) -> MetricFamily {
        self.lookup(code).map_or(MetricFamily::Other, |m| m.family)
    }

    /// Finite and inside the physiological range when one is known.
    pub fn in_range(&self, code: &str, value: f64) -> bool {
        if !value.is_finite() {
            return false;
        }
        match self.lookup(code) {
            Some(m) => value >= m.min && value <= m.max,
            None => true,
        }
    }

    pub fn trend_window(&self, code: &str, config: &EngineConfig) -> Duration {
        match self.family(code) {
            MetricFamily::Hba1c => Duration::days(config.trend_window_hba1c_days),
            MetricFamily::Glucose | MetricFamily::Other => {
                Duration::days(config.trend_window_glucose_days)
            }
        }
    }

    pub fn slope_thresholds(&self, code: &str, config: &EngineConfig) -> SlopeThresholds {
        match self.family(code) {
            MetricFamily::Hba1c => config.trend_slope_hba1c,
            MetricFamily::Glucose => config.trend_slope_glucose,
            MetricFamily::Other => config.trend_slope_other,
        }
    }

    /// Display unit, falling back to "units".
    pub fn unit<'a>(&'a self, code: &str) -> &'a str {
        self.lookup(code).map_or("units", |m| m.unit.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hba1c_range_and_family() {
        let table = MetricReferenceTable::standard();
        assert_eq!(table.family("HBA1C"), MetricFamily::Hba1c);
        assert_eq!(table.family("hba1c"), MetricFamily::Hba1c);
        assert!(table.in_range("HBA1C", 7.2));
        assert!(!table.in_range("HBA1C", 3.9));
        assert!(!table.in_range("HBA1C", 18.5));
    }

    #[test]
    fn unknown_metric_accepts_any_finite_value() {
        let table = MetricReferenceTable::standard();
        assert_eq!(table.family("TSH"), MetricFamily::Other);
        assert!(table.in_range("TSH", -3.0));
        assert!(!table.in_range("TSH", f64::NAN));
        assert!(!table.in_range("GLUCOSE_FBS", f64::INFINITY));
        assert_eq!(table.unit("TSH"), "units");
    }

    #[test]
    fn windows_and_thresholds_follow_family() {
        let table = MetricReferenceTable::standard();
        let config = EngineConfig::default();
        assert_eq!(table.trend_window("HBA1C", &config), Duration::days(360));
        assert_eq!(table.trend_window("GLUCOSE_FBS", &config), Duration::days(180));
        assert_eq!(table.slope_thresholds("HBA1C", &config).change, 0.1);
        assert_eq!(table.slope_thresholds("GLUCOSE_2HPP", &config).stable, 2.0);
    }
}
