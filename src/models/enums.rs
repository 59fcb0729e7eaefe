use crate::db::DatabaseError;
use serde::{Deserialize, Serialize};

/// Macro to generate enum with as_str + std::str::FromStr pattern
macro_rules! str_enum {
    ($name:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = DatabaseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok(Self::$variant)),+,
                    _ => Err(DatabaseError::InvalidEnum {
                        field: stringify!($name).into(),
                        value: s.into(),
                    }),
                }
            }
        }
    };
}

// ─── Clinical signals ───

str_enum!(AnomalyKind {
    StatisticalOutlier => "statistical_outlier",
    SuddenChange => "sudden_change",
});

// Declared in ascending order so `Ord` ranks gravity.
str_enum!(Severity {
    Low => "low",
    Medium => "medium",
    High => "high",
    Critical => "critical",
});

str_enum!(TrendDirection {
    Improving => "improving",
    Stable => "stable",
    Fluctuating => "fluctuating",
    Worsening => "worsening",
});

str_enum!(AlertKind {
    DeterioratingControl => "deteriorating_control",
    CriticalAnomaly => "critical_anomaly",
    NonAdherence => "non_adherence",
});

str_enum!(Priority {
    Low => "low",
    Medium => "medium",
    High => "high",
    Urgent => "urgent",
});

impl Priority {
    /// Numeric level on the 1..10 reminder scale.
    pub fn level(&self) -> u8 {
        match self {
            Self::Low => 3,
            Self::Medium => 5,
            Self::High => 8,
            Self::Urgent => 10,
        }
    }

    /// critical → URGENT, ≥8 HIGH, ≥5 MEDIUM, else LOW.
    pub fn from_reminder(priority: u8, critical: bool) -> Self {
        if critical {
            Self::Urgent
        } else if priority >= 8 {
            Self::High
        } else if priority >= 5 {
            Self::Medium
        } else {
            Self::Low
        }
    }
}

str_enum!(ResolutionState {
    Open => "open",
    Resolved => "resolved",
});

// ─── Reminders ───

str_enum!(TaskKind {
    Medication => "medication",
    LabTest => "lab_test",
    Appointment => "appointment",
    SelfCheck => "self_check",
});

impl TaskKind {
    /// Fallback send hours when neither behaviour nor preference is known.
    pub fn default_hours(&self) -> &'static [u8] {
        match self {
            Self::Medication => &[8, 12, 20],
            Self::LabTest => &[9],
            Self::Appointment => &[8],
            Self::SelfCheck => &[7, 11, 16, 21],
        }
    }

    pub fn all() -> [TaskKind; 4] {
        [Self::Medication, Self::LabTest, Self::Appointment, Self::SelfCheck]
    }
}

str_enum!(Cadence {
    Once => "once",
    Daily => "daily",
    Weekly => "weekly",
    Monthly => "monthly",
});

str_enum!(SpecState {
    Active => "active",
    Paused => "paused",
    Completed => "completed",
    Cancelled => "cancelled",
});

str_enum!(Outcome {
    Pending => "pending",
    Sent => "sent",
    Taken => "taken",
    Postponed => "postponed",
    Skipped => "skipped",
    Missed => "missed",
});

impl Outcome {
    /// Outcomes after which no acknowledgment is accepted.
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Taken | Self::Postponed | Self::Skipped | Self::Missed)
    }
}

str_enum!(ResponseKind {
    Immediate => "immediate",
    Delayed => "delayed",
    NoResponse => "none",
});

str_enum!(ResponseAction {
    Taken => "taken",
    Postponed => "postponed",
    Skipped => "skipped",
});

impl ResponseAction {
    pub fn outcome(&self) -> Outcome {
        match self {
            Self::Taken => Outcome::Taken,
            Self::Postponed => Outcome::Postponed,
            Self::Skipped => Outcome::Skipped,
        }
    }
}

str_enum!(Channel {
    InApp => "in_app",
    Push => "push",
    Sms => "sms",
    Email => "email",
});

str_enum!(ReferenceKind {
    ReminderInstance => "reminder_instance",
    Alert => "alert",
});

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn unknown_value_is_invalid_enum() {
        let err = Outcome::from_str("delivered").unwrap_err();
        match err {
            DatabaseError::InvalidEnum { field, value } => {
                assert_eq!(field, "Outcome");
                assert_eq!(value, "delivered");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn severity_orders_by_gravity() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::Medium > Severity::Low);
        assert!(Priority::Urgent > Priority::High);
    }

    #[test]
    fn no_response_stored_as_none() {
        assert_eq!(ResponseKind::NoResponse.as_str(), "none");
        assert_eq!(ResponseKind::from_str("none").unwrap(), ResponseKind::NoResponse);
    }

    #[test]
    fn reminder_priority_mapping() {
        assert_eq!(Priority::from_reminder(2, true), Priority::Urgent);
        assert_eq!(Priority::from_reminder(9, false), Priority::High);
        assert_eq!(Priority::from_reminder(8, false), Priority::High);
        assert_eq!(Priority::from_reminder(5, false), Priority::Medium);
        assert_eq!(Priority::from_reminder(4, false), Priority::Low);
        assert_eq!(Priority::Urgent.level(), 10);
    }

    #[test]
    fn final_outcomes() {
        assert!(!Outcome::Pending.is_final());
        assert!(!Outcome::Sent.is_final());
        assert!(Outcome::Missed.is_final());
        assert_eq!(ResponseAction::Postponed.outcome(), Outcome::Postponed);
    }

    #[test]
    fn default_hours_per_task() {
        assert_eq!(TaskKind::Medication.default_hours(), &[8, 12, 20]);
        assert_eq!(TaskKind::SelfCheck.default_hours(), &[7, 11, 16, 21]);
    }
}
