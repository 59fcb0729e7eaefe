use chrono::{DateTime, Utc};

use crate::models::derive_id;
use crate::models::enums::{Priority, ReferenceKind, TaskKind};
use crate::models::{Notification, NotificationReference, ReminderInstance, ReminderSpec};

/// Patient-facing notification for one delivery attempt of `instance`.
///
/// `previous_attempts` counts earlier rejected attempts; the id is stable per
/// attempt so a channel that sees the same attempt twice can drop the copy.
pub fn compose_notification(
    spec: &ReminderSpec,
    instance: &ReminderInstance,
    previous_attempts: u32,
    now: DateTime<Utc>,
) -> Notification {
    let mut title = match spec.task_kind {
        TaskKind::Medication => format!("Medication reminder: {}", spec.title),
        TaskKind::LabTest => format!("Lab test reminder: {}", spec.title),
        TaskKind::Appointment => format!("Appointment reminder: {}", spec.title),
        TaskKind::SelfCheck => format!("Time to check: {}", spec.title),
    };
    if previous_attempts > 0 {
        title.push_str(&format!(" (reminder attempt {})", previous_attempts + 1));
    }

    let lead = match spec.task_kind {
        TaskKind::Medication => format!("Time to take {}.", spec.title),
        TaskKind::LabTest => format!("Your {} is due.", spec.title),
        TaskKind::Appointment => format!("You have an upcoming appointment: {}.", spec.title),
        TaskKind::SelfCheck => format!("Please record your {}.", spec.title),
    };
    let body = if spec.description.trim().is_empty() {
        lead
    } else {
        format!("{lead} {}", spec.description.trim())
    };

    Notification {
        id: derive_id(&[
            "notification",
            &instance.id.to_string(),
            &previous_attempts.to_string(),
        ]),
        recipient_id: spec.patient_id.clone(),
        title,
        body,
        priority: Priority::from_reminder(spec.priority, spec.critical),
        reference: NotificationReference {
            kind: ReferenceKind::ReminderInstance,
            resource_id: instance.id,
        },
        created_at: now,
    }
}
