use std::path::{Path, PathBuf};

use chrono::{Duration, FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Application-level constants
pub const APP_NAME: &str = "Glycowatch";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Env var naming a JSON file with `EngineConfig` overrides.
pub const CONFIG_ENV_VAR: &str = "GLYCOWATCH_CONFIG";

/// Default tracing filter when `RUST_LOG` is unset.
pub fn default_log_filter() -> &'static str {
    "info,glycowatch_lib=debug"
}

/// Get the application data directory (~/Glycowatch/).
/// Falls back to the working directory when no home directory is known.
pub fn app_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}

/// Path of the engine database.
pub fn database_path() -> PathBuf {
    app_data_dir().join("engine.db")
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config value: {0}")]
    Invalid(String),
}

// ═══════════════════════════════════════════════════════════
// EngineConfig
// ═══════════════════════════════════════════════════════════

/// Slope cut-offs (units per month) used to classify a trend direction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SlopeThresholds {
    /// `|slope| < stable` → STABLE.
    pub stable: f64,
    /// `slope > change` → WORSENING, `slope < -change` → IMPROVING.
    pub change: f64,
}

/// Which slice of the patient population this engine instance owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardConfig {
    pub index: u32,
    pub count: u32,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self { index: 0, count: 1 }
    }
}

impl ShardConfig {
    /// Stable shard of a patient id, independent of process and platform.
    pub fn shard_of(patient_id: &str, count: u32) -> u32 {
        if count <= 1 {
            return 0;
        }
        let digest = Sha256::digest(patient_id.as_bytes());
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        (u64::from_be_bytes(head) % u64::from(count)) as u32
    }

    pub fn owns(&self, patient_id: &str) -> bool {
        Self::shard_of(patient_id, self.count) == self.index
    }
}

/// Every tunable of the engine. Missing JSON fields keep their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Fixed offset used for wall-clock hours and calendar days.
    pub utc_offset_minutes: i32,
    pub shard: ShardConfig,

    // Baselines
    pub baseline_refresh_days: i64,
    pub baseline_min_samples: usize,
    pub baseline_horizon_days: i64,
    /// New in-range samples since `computed_at` that force a recompute.
    pub baseline_resample_after: usize,
    /// Cadence of the nightly baseline refresh pass.
    pub baseline_refresh_cadence_hours: i64,

    // Anomaly detection
    /// LOW, MEDIUM, HIGH, CRITICAL z-score gates.
    pub outlier_z_thresholds: [f64; 4],
    /// LOW (strictly exceeded), MEDIUM, HIGH, CRITICAL percent gates.
    pub sudden_change_thresholds: [f64; 4],
    pub sudden_change_lookback_days: i64,

    // Trends
    pub trend_window_glucose_days: i64,
    pub trend_window_hba1c_days: i64,
    pub trend_min_samples: usize,
    pub trend_slope_glucose: SlopeThresholds,
    pub trend_slope_hba1c: SlopeThresholds,
    pub trend_slope_other: SlopeThresholds,
    pub trend_min_r_squared: f64,
    pub trend_refresh_hours: i64,

    // Delivery
    pub deliver_send_window_minutes: i64,
    pub deliver_grace_hours: i64,
    pub deliver_sweep_interval_minutes: i64,
    pub deliver_max_attempts: u32,
    pub postpone_delay_minutes: i64,
    pub immediate_response_minutes: i64,
    pub delayed_response_minutes: i64,

    // Scheduling & tuning
    pub scheduler_horizon_days: i64,
    pub tuner_compliance_threshold: f64,
    pub tuner_max_delete_fraction: f64,

    // Alerts
    pub alert_expiry_deterioration_days: i64,
    pub alert_expiry_adherence_days: i64,
    pub alert_expiry_anomaly_days: i64,
    pub adherence_min_sent: u32,
    pub adherence_high_below: f64,
    pub adherence_medium_below: f64,

    // Orchestrator
    pub tick_seconds: u64,
    pub tick_budget_ms: u64,
    pub store_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            utc_offset_minutes: 0,
            shard: ShardConfig::default(),
            baseline_refresh_days: 30,
            baseline_min_samples: 3,
            baseline_horizon_days: 360,
            baseline_resample_after: 5,
            baseline_refresh_cadence_hours: 24,
            outlier_z_thresholds: [2.0, 2.5, 3.0, 3.5],
            sudden_change_thresholds: [25.0, 30.0, 40.0, 50.0],
            sudden_change_lookback_days: 30,
            trend_window_glucose_days: 180,
            trend_window_hba1c_days: 360,
            trend_min_samples: 3,
            trend_slope_glucose: SlopeThresholds { stable: 2.0, change: 5.0 },
            trend_slope_hba1c: SlopeThresholds { stable: 0.05, change: 0.1 },
            trend_slope_other: SlopeThresholds { stable: 2.0, change: 5.0 },
            trend_min_r_squared: 0.3,
            trend_refresh_hours: 24,
            deliver_send_window_minutes: 5,
            deliver_grace_hours: 6,
            deliver_sweep_interval_minutes: 60,
            deliver_max_attempts: 3,
            postpone_delay_minutes: 30,
            immediate_response_minutes: 5,
            delayed_response_minutes: 60,
            scheduler_horizon_days: 365,
            tuner_compliance_threshold: 0.7,
            tuner_max_delete_fraction: 0.5,
            alert_expiry_deterioration_days: 7,
            alert_expiry_adherence_days: 14,
            alert_expiry_anomaly_days: 7,
            adherence_min_sent: 5,
            adherence_high_below: 0.6,
            adherence_medium_below: 0.8,
            tick_seconds: 60,
            tick_budget_ms: 5_000,
            store_timeout_ms: 5_000,
        }
    }
}

impl EngineConfig {
    pub fn local_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_minutes * 60)
            .unwrap_or_else(|| Utc.fix())
    }

    pub fn baseline_refresh_interval(&self) -> Duration {
        Duration::days(self.baseline_refresh_days)
    }

    pub fn baseline_horizon(&self) -> Duration {
        Duration::days(self.baseline_horizon_days)
    }

    pub fn baseline_refresh_cadence(&self) -> Duration {
        Duration::hours(self.baseline_refresh_cadence_hours)
    }

    pub fn sudden_change_lookback(&self) -> Duration {
        Duration::days(self.sudden_change_lookback_days)
    }

    pub fn trend_refresh(&self) -> Duration {
        Duration::hours(self.trend_refresh_hours)
    }

    pub fn send_window(&self) -> Duration {
        Duration::minutes(self.deliver_send_window_minutes)
    }

    pub fn grace(&self) -> Duration {
        Duration::hours(self.deliver_grace_hours)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::minutes(self.deliver_sweep_interval_minutes)
    }

    pub fn postpone_delay(&self) -> Duration {
        Duration::minutes(self.postpone_delay_minutes)
    }

    pub fn immediate_response(&self) -> Duration {
        Duration::minutes(self.immediate_response_minutes)
    }

    pub fn delayed_response(&self) -> Duration {
        Duration::minutes(self.delayed_response_minutes)
    }

    pub fn scheduler_horizon(&self) -> Duration {
        Duration::days(self.scheduler_horizon_days)
    }

    pub fn tick_budget(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.tick_budget_ms)
    }

    pub fn store_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.store_timeout_ms)
    }

    /// Reject values the pipelines cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.shard.count == 0 || self.shard.index >= self.shard.count {
            return Err(ConfigError::Invalid(format!(
                "shard index {} out of range for {} shards",
                self.shard.index, self.shard.count
            )));
        }
        if FixedOffset::east_opt(self.utc_offset_minutes * 60).is_none() {
            return Err(ConfigError::Invalid(format!(
                "utc_offset_minutes {} out of range",
                self.utc_offset_minutes
            )));
        }
        if !is_ascending(&self.outlier_z_thresholds) {
            return Err(ConfigError::Invalid(
                "outlier_z_thresholds must be ascending".into(),
            ));
        }
        if !is_ascending(&self.sudden_change_thresholds) {
            return Err(ConfigError::Invalid(
                "sudden_change_thresholds must be ascending".into(),
            ));
        }
        for (name, value) in [
            ("tuner_compliance_threshold", self.tuner_compliance_threshold),
            ("tuner_max_delete_fraction", self.tuner_max_delete_fraction),
            ("trend_min_r_squared", self.trend_min_r_squared),
            ("adherence_high_below", self.adherence_high_below),
            ("adherence_medium_below", self.adherence_medium_below),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid(format!("{name} must be within [0, 1]")));
            }
        }
        if self.baseline_min_samples < 2 {
            return Err(ConfigError::Invalid(
                "baseline_min_samples must be at least 2".into(),
            ));
        }
        if self.tick_seconds == 0 {
            return Err(ConfigError::Invalid("tick_seconds must be at least 1".into()));
        }
        if self.deliver_max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "deliver_max_attempts must be at least 1".into(),
            ));
        }
        if self.immediate_response_minutes >= self.delayed_response_minutes {
            return Err(ConfigError::Invalid(
                "immediate_response_minutes must be below delayed_response_minutes".into(),
            ));
        }
        Ok(())
    }
}

fn is_ascending(values: &[f64]) -> bool {
    values.windows(2).all(|w| w[0] < w[1])
}

/// Load and validate an `EngineConfig` from a JSON file.
pub fn load_engine_config(path: &Path) -> Result<EngineConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let config: EngineConfig = serde_json::from_str(&raw)?;
    config.validate()?;
    Ok(config)
}

/// Config from `GLYCOWATCH_CONFIG` if set, defaults otherwise.
pub fn engine_config_from_env() -> Result<EngineConfig, ConfigError> {
    match std::env::var(CONFIG_ENV_VAR) {
        Ok(path) => load_engine_config(Path::new(&path)),
        Err(_) => Ok(EngineConfig::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_data_dir_ends_with_app_name() {
        assert!(app_data_dir().ends_with(APP_NAME));
        assert!(database_path().starts_with(app_data_dir()));
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.baseline_refresh_interval(), Duration::days(30));
        assert_eq!(config.send_window(), Duration::minutes(5));
        assert_eq!(config.grace(), Duration::hours(6));
        assert_eq!(config.scheduler_horizon(), Duration::days(365));
        assert_eq!(config.tuner_compliance_threshold, 0.7);
        assert_eq!(config.outlier_z_thresholds, [2.0, 2.5, 3.0, 3.5]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"deliver_grace_hours": 2, "shard": {"index": 1, "count": 4}}"#)
                .unwrap();
        assert_eq!(config.grace(), Duration::hours(2));
        assert_eq!(config.shard, ShardConfig { index: 1, count: 4 });
        assert_eq!(config.scheduler_horizon_days, 365);
    }

    #[test]
    fn validate_rejects_bad_shard() {
        let config = EngineConfig {
            shard: ShardConfig { index: 2, count: 2 },
            ..EngineConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn validate_rejects_unsorted_thresholds() {
        let config = EngineConfig {
            outlier_z_thresholds: [2.0, 3.0, 2.5, 3.5],
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn shards_partition_patients() {
        let shards: Vec<ShardConfig> = (0..3).map(|index| ShardConfig { index, count: 3 }).collect();
        for patient in ["p-1", "p-2", "p-3", "patient-42", ""] {
            let owners = shards.iter().filter(|s| s.owns(patient)).count();
            assert_eq!(owners, 1, "{patient} owned by {owners} shards");
        }
        assert!(ShardConfig::default().owns("anyone"));
        assert_eq!(ShardConfig::shard_of("p-1", 3), ShardConfig::shard_of("p-1", 3));
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(&path, r#"{"utc_offset_minutes": 210}"#).unwrap();
        let config = load_engine_config(&path).unwrap();
        assert_eq!(config.local_offset().local_minus_utc(), 210 * 60);
    }

    #[test]
    fn load_missing_file_is_io_error() {
        let result = load_engine_config(Path::new("/nonexistent/engine.json"));
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }
}
