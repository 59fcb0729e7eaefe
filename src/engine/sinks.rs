//! Collaborator interfaces injected into the engine, with the tracing-backed
//! implementations the binary uses and in-memory ones for tests and demos.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::models::{Alert, LabSample, Notification};

pub use crate::intelligence::types::{AlertSink, LabSource, SourceError};
pub use crate::reminders::types::{TransportError, TransportSink};

// ═══════════════════════════════════════════════════════════
// Audit
// ═══════════════════════════════════════════════════════════

/// Optional hook on state-changing operations.
pub trait AuditSink: Send + Sync {
    fn record(&self, actor: &str, operation: &str, payload: &Value);
}

/// A single audit entry.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditRecord {
    pub actor: String,
    pub operation: String,
    pub payload: Value,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, actor: &str, operation: &str, payload: &Value) {
        tracing::info!(target: "glycowatch::audit", actor, operation, payload = %payload, "Audit");
    }
}

#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    entries: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    pub fn entries(&self) -> Vec<AuditRecord> {
        self.entries
            .lock()
            .map(|buf| buf.clone())
            .unwrap_or_default()
    }

    pub fn operations(&self) -> Vec<String> {
        self.entries().into_iter().map(|e| e.operation).collect()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, actor: &str, operation: &str, payload: &Value) {
        if let Ok(mut buf) = self.entries.lock() {
            buf.push(AuditRecord {
                actor: actor.to_string(),
                operation: operation.to_string(),
                payload: payload.clone(),
            });
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Transport
// ═══════════════════════════════════════════════════════════

/// Logs each notification; the notification id doubles as the channel id.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTransport;

impl TransportSink for TracingTransport {
    fn send(&self, notification: &Notification) -> Result<String, TransportError> {
        tracing::info!(
            notification_id = %notification.id,
            recipient_id = %notification.recipient_id,
            priority = %notification.priority,
            title = %notification.title,
            "Notification emitted"
        );
        Ok(notification.id.to_string())
    }
}

/// Records every attempt. Can be switched to refuse sends.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    rejecting: AtomicBool,
    attempts: Mutex<Vec<(Notification, bool)>>,
}

impl MemoryTransport {
    pub fn rejecting() -> Self {
        let transport = Self::default();
        transport.set_rejecting(true);
        transport
    }

    pub fn set_rejecting(&self, rejecting: bool) {
        self.rejecting.store(rejecting, Ordering::SeqCst);
    }

    /// Every notification handed over, accepted or not.
    pub fn attempts(&self) -> Vec<Notification> {
        self.attempts
            .lock()
            .map(|buf| buf.iter().map(|(n, _)| n.clone()).collect())
            .unwrap_or_default()
    }

    /// Notifications the channel accepted.
    pub fn sent(&self) -> Vec<Notification> {
        self.attempts
            .lock()
            .map(|buf| buf.iter().filter(|(_, ok)| *ok).map(|(n, _)| n.clone()).collect())
            .unwrap_or_default()
    }
}

impl TransportSink for MemoryTransport {
    fn send(&self, notification: &Notification) -> Result<String, TransportError> {
        let accepted = !self.rejecting.load(Ordering::SeqCst);
        if let Ok(mut buf) = self.attempts.lock() {
            buf.push((notification.clone(), accepted));
        }
        if accepted {
            Ok(format!("mem-{}", notification.id))
        } else {
            Err(TransportError::Rejected("channel refused".into()))
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Alerts
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn publish(&self, alert: &Alert) {
        tracing::info!(
            alert_id = %alert.id,
            patient_id = %alert.patient_id,
            kind = %alert.kind,
            priority = %alert.priority,
            title = %alert.title,
            "Alert published"
        );
    }
}

#[derive(Debug, Default)]
pub struct MemoryAlertSink {
    published: Mutex<Vec<Alert>>,
}

impl MemoryAlertSink {
    pub fn published(&self) -> Vec<Alert> {
        self.published
            .lock()
            .map(|buf| buf.clone())
            .unwrap_or_default()
    }
}

impl AlertSink for MemoryAlertSink {
    fn publish(&self, alert: &Alert) {
        if let Ok(mut buf) = self.published.lock() {
            buf.push(alert.clone());
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Labs
// ═══════════════════════════════════════════════════════════

/// Lab store held in memory, keyed by patient and metric.
#[derive(Debug, Default)]
pub struct MemoryLabSource {
    samples: RwLock<HashMap<(String, String), Vec<LabSample>>>,
    unavailable: AtomicBool,
}

impl MemoryLabSource {
    pub fn insert(&self, sample: LabSample) {
        if let Ok(mut map) = self.samples.write() {
            map.entry((sample.patient_id.clone(), sample.metric_code.clone()))
                .or_default()
                .push(sample);
        }
    }

    pub fn extend(&self, samples: impl IntoIterator<Item = LabSample>) {
        for sample in samples {
            self.insert(sample);
        }
    }

    /// Make every read fail as if the store were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

impl LabSource for MemoryLabSource {
    fn samples(
        &self,
        patient_id: &str,
        metric_code: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<LabSample>, SourceError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SourceError::Unavailable("lab store offline".into()));
        }
        let map = self
            .samples
            .read()
            .map_err(|_| SourceError::Unavailable("lab store lock poisoned".into()))?;
        Ok(map
            .get(&(patient_id.to_string(), metric_code.to_string()))
            .map(|all| {
                all.iter()
                    .filter(|s| s.taken_at >= from && s.taken_at <= to)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::enums::{Priority, ReferenceKind};
    use crate::models::NotificationReference;
    use chrono::{Duration, TimeZone};
    use serde_json::json;
    use uuid::Uuid;

    fn notification() -> Notification {
        Notification {
            id: Uuid::new_v4(),
            recipient_id: "p-1".into(),
            title: "Medication reminder: Metformin".into(),
            body: "Time to take Metformin.".into(),
            priority: Priority::Medium,
            reference: NotificationReference {
                kind: ReferenceKind::ReminderInstance,
                resource_id: Uuid::new_v4(),
            },
            created_at: Utc.with_ymd_and_hms(2025, 3, 3, 8, 0, 0).unwrap(),
        }
    }

    #[test]
    fn memory_transport_can_reject() {
        let transport = MemoryTransport::default();
        assert!(transport.send(&notification()).is_ok());
        transport.set_rejecting(true);
        assert!(matches!(
            transport.send(&notification()),
            Err(TransportError::Rejected(_))
        ));
        assert_eq!(transport.attempts().len(), 2);
        assert_eq!(transport.sent().len(), 1);
    }

    #[test]
    fn tracing_transport_returns_notification_id() {
        let n = notification();
        assert_eq!(TracingTransport.send(&n).unwrap(), n.id.to_string());
    }

    #[test]
    fn memory_lab_source_filters_window() {
        let labs = MemoryLabSource::default();
        let base = Utc.with_ymd_and_hms(2025, 1, 1, 8, 0, 0).unwrap();
        for day in 0..5 {
            labs.insert(LabSample::new("p-1", "HBA1C", 7.0, "%", base + Duration::days(day)));
        }
        labs.insert(LabSample::new("p-2", "HBA1C", 9.0, "%", base));

        let got = labs
            .samples("p-1", "HBA1C", base + Duration::days(1), base + Duration::days(3))
            .unwrap();
        assert_eq!(got.len(), 3);
        assert!(labs.samples("p-1", "LDL", base, base).unwrap().is_empty());

        labs.set_unavailable(true);
        assert!(labs.samples("p-1", "HBA1C", base, base).is_err());
    }

    #[test]
    fn memory_audit_keeps_order() {
        let audit = MemoryAuditSink::default();
        audit.record("system", "spec_upserted", &json!({"spec_id": "a"}));
        audit.record("clinician:7", "alert_resolved", &json!({}));
        assert_eq!(audit.operations(), vec!["spec_upserted", "alert_resolved"]);
        assert_eq!(audit.entries()[1].actor, "clinician:7");
    }
}
