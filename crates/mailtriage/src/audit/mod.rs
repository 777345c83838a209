//! Append-only audit trail.
//!
//! Every pipeline decision is recorded here. Writes never propagate
//! errors: a failed audit insert is logged and the caller's operation
//! continues.

use chrono::Utc;

use crate::db::audit_repo::{self, AuditEventRow, AuditFilter, AuditStats, SecurityEventRow};
use crate::db::{Database, DatabaseError};

/// Event outcomes.
pub mod outcome {
    pub const SUCCESS: &str = "success";
    pub const FAILURE: &str = "failure";
}

#[derive(Clone)]
pub struct EmailAuditService {
    db: Database,
}

impl EmailAuditService {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Records a pipeline event. Never fails the caller.
    pub fn log_event(
        &self,
        entity_type: &str,
        entity_id: &str,
        actor: &str,
        action: &str,
        outcome: &str,
        metadata: serde_json::Value,
    ) {
        let event = AuditEventRow {
            id: uuid::Uuid::new_v4().to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            actor: actor.to_string(),
            action: action.to_string(),
            outcome: outcome.to_string(),
            metadata: metadata.to_string(),
            created_at: Utc::now().to_rfc3339(),
        };
        if let Err(e) = audit_repo::insert_audit(&self.db, &event) {
            log::warn!("Failed to write audit event '{}': {}", action, e);
        }
    }

    /// Records an access event. Never fails the caller.
    pub fn log_access(
        &self,
        entity_type: &str,
        entity_id: &str,
        actor: &str,
        action: &str,
        outcome: &str,
        metadata: serde_json::Value,
    ) {
        let event = AuditEventRow {
            id: uuid::Uuid::new_v4().to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            actor: actor.to_string(),
            action: action.to_string(),
            outcome: outcome.to_string(),
            metadata: metadata.to_string(),
            created_at: Utc::now().to_rfc3339(),
        };
        if let Err(e) = audit_repo::insert_access(&self.db, &event) {
            log::warn!("Failed to write access event '{}': {}", action, e);
        }
    }

    /// Records a security scan result. Never fails the caller.
    pub fn log_security_event(
        &self,
        message_id: &str,
        sender: &str,
        risk_level: &str,
        score: u32,
        threats: &[String],
        warnings: &[String],
    ) {
        let event = SecurityEventRow {
            id: uuid::Uuid::new_v4().to_string(),
            message_id: message_id.to_string(),
            sender: sender.to_string(),
            risk_level: risk_level.to_string(),
            score: score as i64,
            threats: serde_json::to_string(threats).unwrap_or_else(|_| "[]".into()),
            warnings: serde_json::to_string(warnings).unwrap_or_else(|_| "[]".into()),
            created_at: Utc::now().to_rfc3339(),
        };
        if let Err(e) = audit_repo::insert_security(&self.db, &event) {
            log::warn!("Failed to write security event for '{}': {}", message_id, e);
        }
    }

    /// Filtered, paginated read-back of the audit trail.
    pub fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditEventRow>, DatabaseError> {
        audit_repo::query_audit(&self.db, filter)
    }

    /// Aggregate statistics since the given timestamp.
    pub fn stats(&self, since: &str) -> Result<AuditStats, DatabaseError> {
        audit_repo::stats(&self.db, since)
    }

    /// Deletes records older than the cutoff across all event kinds.
    pub fn purge_older_than(&self, cutoff: &str) -> Result<u64, DatabaseError> {
        audit_repo::purge_older_than(&self.db, cutoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> EmailAuditService {
        EmailAuditService::new(Database::open_in_memory().unwrap())
    }

    #[test]
    fn test_log_event_and_query() {
        let audit = service();
        audit.log_event(
            "email",
            "m1",
            "mailtriage",
            "parsed",
            outcome::SUCCESS,
            serde_json::json!({"confidence": 80}),
        );

        let events = audit.query(&AuditFilter::default()).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, "parsed");
        assert!(events[0].metadata.contains("confidence"));
    }

    #[test]
    fn test_security_events_feed_stats() {
        let audit = service();
        audit.log_security_event("m1", "a@x.com", "HIGH", 65, &["threat".into()], &[]);
        audit.log_event("email", "m1", "mailtriage", "blocked", outcome::FAILURE, serde_json::json!({}));

        let stats = audit.stats("2000-01-01T00:00:00Z").unwrap();
        assert_eq!(stats.total_events, 1);
        assert_eq!(stats.failure_events, 1);
        assert_eq!(stats.risk_levels[0].0, "HIGH");
    }
}
