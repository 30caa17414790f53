//! Audit logging of administrative changes and enforcement decisions.

use crate::policy::PolicyKind;
use crate::version::{current_timestamp, Timestamp};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Counter for generating unique event IDs.
static EVENT_COUNTER: AtomicU64 = AtomicU64::new(0);

fn generate_event_id() -> [u8; 16] {
    let ts = current_timestamp();
    let counter = EVENT_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut id = [0u8; 16];
    id[0..8].copy_from_slice(&ts.to_be_bytes());
    id[8..16].copy_from_slice(&counter.to_be_bytes());
    id
}

/// Types of audit events.
#[derive(Debug, Clone, PartialEq)]
pub enum AuditEventType {
    /// First version of a policy stored.
    PolicyCreated {
        /// Masking or row access.
        kind: PolicyKind,
        /// Policy name.
        policy: String,
        /// Version number.
        version: u64,
    },
    /// New version of an existing policy stored.
    PolicyReplaced {
        /// Masking or row access.
        kind: PolicyKind,
        /// Policy name.
        policy: String,
        /// Version number.
        version: u64,
    },
    /// Live version of a policy closed.
    PolicyDropped {
        /// Masking or row access.
        kind: PolicyKind,
        /// Policy name.
        policy: String,
    },
    /// Policy attached to a column or table.
    PolicyAttached {
        /// Column or table.
        target: String,
        /// Policy name.
        policy: String,
    },
    /// Policy detached from a column or table.
    PolicyDetached {
        /// Column or table.
        target: String,
        /// Policy name.
        policy: String,
    },
    /// Role granted.
    RoleGranted {
        /// Grantee display name.
        grantee: String,
        /// Role name.
        role: String,
    },
    /// Role grant revoked.
    RoleRevoked {
        /// Grantee display name.
        grantee: String,
        /// Role name.
        role: String,
    },
    /// Obligations computed for a statement.
    StatementPlanned {
        /// Statement id.
        statement_id: u64,
        /// Number of projected columns with a mask.
        masked_columns: usize,
        /// Number of tables with a row filter.
        row_filters: usize,
    },
    /// Evaluation faults contained while applying a statement's obligations.
    FaultsContained {
        /// Statement id.
        statement_id: u64,
        /// Total fault count.
        total: u64,
        /// Counts by column or table.
        by_target: Vec<(String, u64)>,
    },
}

/// An audit event with metadata.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    /// Unique event ID.
    pub id: [u8; 16],
    /// When the event occurred.
    pub timestamp: Timestamp,
    /// Principal that caused the event.
    pub actor: String,
    /// Event details.
    pub event_type: AuditEventType,
}

impl AuditEvent {
    /// Create a new audit event.
    pub fn new(actor: impl Into<String>, event_type: AuditEventType) -> Self {
        Self {
            id: generate_event_id(),
            timestamp: current_timestamp(),
            actor: actor.into(),
            event_type,
        }
    }

    /// Set the event time, for events stamped by the engine clock.
    pub fn at(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Format the event as a log line.
    pub fn to_log_line(&self) -> String {
        let id_hex: String = self.id.iter().map(|b| format!("{:02x}", b)).collect();
        let event_desc = match &self.event_type {
            AuditEventType::PolicyCreated {
                kind,
                policy,
                version,
            } => format!("POLICY_CREATED kind={} policy={} version={}", kind, policy, version),
            AuditEventType::PolicyReplaced {
                kind,
                policy,
                version,
            } => format!("POLICY_REPLACED kind={} policy={} version={}", kind, policy, version),
            AuditEventType::PolicyDropped { kind, policy } => {
                format!("POLICY_DROPPED kind={} policy={}", kind, policy)
            }
            AuditEventType::PolicyAttached { target, policy } => {
                format!("POLICY_ATTACHED target={} policy={}", target, policy)
            }
            AuditEventType::PolicyDetached { target, policy } => {
                format!("POLICY_DETACHED target={} policy={}", target, policy)
            }
            AuditEventType::RoleGranted { grantee, role } => {
                format!("ROLE_GRANTED grantee={} role={}", grantee, role)
            }
            AuditEventType::RoleRevoked { grantee, role } => {
                format!("ROLE_REVOKED grantee={} role={}", grantee, role)
            }
            AuditEventType::StatementPlanned {
                statement_id,
                masked_columns,
                row_filters,
            } => format!(
                "STATEMENT_PLANNED statement={} masked_columns={} row_filters={}",
                statement_id, masked_columns, row_filters
            ),
            AuditEventType::FaultsContained {
                statement_id,
                total,
                by_target,
            } => {
                let targets: Vec<String> = by_target
                    .iter()
                    .map(|(t, n)| format!("{}:{}", t, n))
                    .collect();
                format!(
                    "FAULTS_CONTAINED statement={} total={} targets=[{}]",
                    statement_id,
                    total,
                    targets.join(",")
                )
            }
        };

        format!(
            "{} id={} actor={} {}",
            self.timestamp, id_hex, self.actor, event_desc
        )
    }
}

/// Audit logging error.
#[derive(Debug, Error)]
#[error("audit error: {0}")]
pub struct AuditError(pub String);

/// Trait for audit log backends.
pub trait AuditLogger: Send + Sync {
    /// Log an audit event.
    fn log(&self, event: AuditEvent);

    /// Flush any buffered events.
    fn flush(&self) -> Result<(), AuditError>;
}

/// In-memory audit logger for testing.
#[derive(Debug, Default, Clone)]
pub struct MemoryAuditLogger {
    events: Arc<Mutex<Vec<AuditEvent>>>,
}

impl MemoryAuditLogger {
    /// Create a new memory logger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all logged events.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    /// Clear all events.
    pub fn clear(&self) {
        self.events.lock().clear();
    }

    /// Get event count.
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl AuditLogger for MemoryAuditLogger {
    fn log(&self, event: AuditEvent) {
        self.events.lock().push(event);
    }

    fn flush(&self) -> Result<(), AuditError> {
        Ok(())
    }
}

/// No-op audit logger that discards all events.
#[derive(Debug, Default)]
pub struct NullAuditLogger;

impl AuditLogger for NullAuditLogger {
    fn log(&self, _event: AuditEvent) {}

    fn flush(&self) -> Result<(), AuditError> {
        Ok(())
    }
}

/// Audit logger that emits each event as a `tracing` record on the
/// `veil::audit` target.
#[derive(Debug, Default)]
pub struct TracingAuditLogger;

impl AuditLogger for TracingAuditLogger {
    fn log(&self, event: AuditEvent) {
        tracing::info!(target: "veil::audit", "{}", event.to_log_line());
    }

    fn flush(&self) -> Result<(), AuditError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_event_log_line() {
        let event = AuditEvent::new(
            "admin",
            AuditEventType::PolicyReplaced {
                kind: PolicyKind::Masking,
                policy: "email_mask".into(),
                version: 2,
            },
        )
        .at(42);
        let line = event.to_log_line();
        assert!(line.starts_with("42 "));
        assert!(line.contains("POLICY_REPLACED"));
        assert!(line.contains("kind=masking"));
        assert!(line.contains("version=2"));
        assert!(line.contains("actor=admin"));
    }

    #[test]
    fn test_fault_event_log_line() {
        let event = AuditEvent::new(
            "alice",
            AuditEventType::FaultsContained {
                statement_id: 9,
                total: 3,
                by_target: vec![("users.email".into(), 2), ("users".into(), 1)],
            },
        );
        let line = event.to_log_line();
        assert!(line.contains("total=3"));
        assert!(line.contains("targets=[users.email:2,users:1]"));
    }

    #[test]
    fn test_event_ids_are_unique() {
        let a = AuditEvent::new("x", AuditEventType::PolicyDropped {
            kind: PolicyKind::RowAccess,
            policy: "p".into(),
        });
        let b = AuditEvent::new("x", a.event_type.clone());
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_memory_logger() {
        let logger = MemoryAuditLogger::new();
        logger.log(AuditEvent::new(
            "admin",
            AuditEventType::RoleGranted {
                grantee: "user alice".into(),
                role: "ANALYST".into(),
            },
        ));
        assert_eq!(logger.len(), 1);
        assert!(matches!(
            logger.events()[0].event_type,
            AuditEventType::RoleGranted { .. }
        ));
        logger.clear();
        assert!(logger.is_empty());
    }

    #[test]
    fn test_null_logger() {
        let logger = NullAuditLogger;
        logger.log(AuditEvent::new(
            "admin",
            AuditEventType::PolicyDropped {
                kind: PolicyKind::Masking,
                policy: "p".into(),
            },
        ));
        logger.flush().unwrap();
    }
}
