//! Clinical signal pipeline: baselines, anomaly scoring, trend analysis and
//! alert synthesis.

pub mod alerts;
pub mod baseline;
pub mod detection;
pub mod messages;
pub mod reference;
pub mod trend;
pub mod types;

pub use alerts::AlertSynthesizer;
pub use baseline::{BaselineCalculator, BaselineStore};
pub use detection::{AnomalyDetector, ScoredAnomaly};
pub use reference::{MetricFamily, MetricReference, MetricReferenceTable};
pub use trend::TrendAnalyzer;
pub use types::*;
