//! Reminder pipeline: spec validation, slot materialization, delivery,
//! behaviour learning and adaptive re-timing.

pub mod delivery;
pub mod insights;
pub mod ledger;
pub mod messages;
pub mod scheduler;
pub mod tuner;
pub mod types;
pub mod validation;

pub use delivery::{Acknowledgement, DeliveryCoordinator, DispatchReport, SweepReport};
pub use insights::{generate_insights, predict_best_hours, HourScore, Insight, InsightKind};
pub use ledger::BehaviorLedger;
pub use scheduler::{MaterializeSummary, Scheduler};
pub use tuner::{AdaptiveTuner, TuneOutcome};
pub use types::*;
pub use validation::validate_spec;
