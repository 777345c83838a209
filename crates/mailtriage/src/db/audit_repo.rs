//! Audit trail repository.
//!
//! Three append-only tables: entity audit events, access events and
//! security scan events.

use rusqlite::{params, types::Value, Row};

use super::{Database, DatabaseError};

#[derive(Debug, Clone)]
pub struct AuditEventRow {
    pub id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub actor: String,
    pub action: String,
    pub outcome: String,
    /// JSON metadata attached to the event.
    pub metadata: String,
    pub created_at: String,
}

impl AuditEventRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            entity_type: row.get("entity_type")?,
            entity_id: row.get("entity_id")?,
            actor: row.get("actor")?,
            action: row.get("action")?,
            outcome: row.get("outcome")?,
            metadata: row.get("metadata")?,
            created_at: row.get("created_at")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct SecurityEventRow {
    pub id: String,
    pub message_id: String,
    pub sender: String,
    pub risk_level: String,
    pub score: i64,
    /// JSON arrays of threat / warning descriptions.
    pub threats: String,
    pub warnings: String,
    pub created_at: String,
}

impl SecurityEventRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            message_id: row.get("message_id")?,
            sender: row.get("sender")?,
            risk_level: row.get("risk_level")?,
            score: row.get("score")?,
            threats: row.get("threats")?,
            warnings: row.get("warnings")?,
            created_at: row.get("created_at")?,
        })
    }
}

/// Filter for audit event queries. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub actor: Option<String>,
    pub action: Option<String>,
    pub since: Option<String>,
    pub until: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

fn insert_event(
    db: &Database,
    table: &str,
    event: &AuditEventRow,
) -> Result<(), DatabaseError> {
    let sql = format!(
        "INSERT INTO {} (id, entity_type, entity_id, actor, action, outcome, metadata, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        table
    );
    db.with_conn(|conn| {
        conn.execute(
            &sql,
            params![
                event.id,
                event.entity_type,
                event.entity_id,
                event.actor,
                event.action,
                event.outcome,
                event.metadata,
                event.created_at,
            ],
        )?;
        Ok(())
    })
}

pub fn insert_audit(db: &Database, event: &AuditEventRow) -> Result<(), DatabaseError> {
    insert_event(db, "audit_events", event)
}

pub fn insert_access(db: &Database, event: &AuditEventRow) -> Result<(), DatabaseError> {
    insert_event(db, "access_events", event)
}

pub fn insert_security(db: &Database, event: &SecurityEventRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO security_events (id, message_id, sender, risk_level, score, threats,
             warnings, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                event.id,
                event.message_id,
                event.sender,
                event.risk_level,
                event.score,
                event.threats,
                event.warnings,
                event.created_at,
            ],
        )?;
        Ok(())
    })
}

/// Queries audit events with dynamic filters, newest first.
pub fn query_audit(db: &Database, filter: &AuditFilter) -> Result<Vec<AuditEventRow>, DatabaseError> {
    let mut sql = String::from("SELECT * FROM audit_events WHERE 1=1");
    let mut bind: Vec<Value> = Vec::new();

    let mut add = |sql: &mut String, clause: &str, value: &Option<String>| {
        if let Some(v) = value {
            sql.push_str(clause);
            bind.push(Value::Text(v.clone()));
        }
    };
    add(&mut sql, " AND entity_type = ?", &filter.entity_type);
    add(&mut sql, " AND entity_id = ?", &filter.entity_id);
    add(&mut sql, " AND actor = ?", &filter.actor);
    add(&mut sql, " AND action = ?", &filter.action);
    add(&mut sql, " AND created_at >= ?", &filter.since);
    add(&mut sql, " AND created_at <= ?", &filter.until);

    sql.push_str(" ORDER BY created_at DESC");
    sql.push_str(&format!(" LIMIT {}", filter.limit.unwrap_or(100)));
    if let Some(offset) = filter.offset {
        sql.push_str(&format!(" OFFSET {}", offset));
    }

    db.with_conn(|conn| {
        let mut stmt = conn.prepare(&sql)?;
        let rows: Vec<AuditEventRow> = stmt
            .query_map(rusqlite::params_from_iter(bind.iter()), AuditEventRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Security events recorded for a sender, newest first.
pub fn query_security_by_sender(
    db: &Database,
    sender: &str,
    limit: u32,
) -> Result<Vec<SecurityEventRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM security_events WHERE sender = ?1
             ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows: Vec<SecurityEventRow> = stmt
            .query_map(params![sender, limit], SecurityEventRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Aggregate view over the audit trail.
#[derive(Debug, Clone, Default)]
pub struct AuditStats {
    pub total_events: u64,
    pub success_events: u64,
    pub failure_events: u64,
    /// (risk_level, count) pairs from the security log.
    pub risk_levels: Vec<(String, u64)>,
}

impl AuditStats {
    pub fn success_rate(&self) -> f64 {
        if self.total_events == 0 {
            return 1.0;
        }
        self.success_events as f64 / self.total_events as f64
    }
}

pub fn stats(db: &Database, since: &str) -> Result<AuditStats, DatabaseError> {
    db.with_conn(|conn| {
        let mut out = AuditStats::default();

        let mut stmt = conn.prepare(
            "SELECT outcome, COUNT(*) FROM audit_events WHERE created_at >= ?1 GROUP BY outcome",
        )?;
        let rows = stmt.query_map(params![since], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
        })?;
        for row in rows {
            let (outcome, count) = row?;
            out.total_events += count;
            if outcome == "success" {
                out.success_events += count;
            } else {
                out.failure_events += count;
            }
        }

        let mut stmt = conn.prepare(
            "SELECT risk_level, COUNT(*) FROM security_events
             WHERE created_at >= ?1 GROUP BY risk_level ORDER BY COUNT(*) DESC",
        )?;
        let rows = stmt.query_map(params![since], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
        })?;
        out.risk_levels = rows.collect::<Result<Vec<_>, _>>()?;

        Ok(out)
    })
}

/// Deletes events older than the cutoff from all three tables.
/// Returns the total number of rows removed.
pub fn purge_older_than(db: &Database, cutoff: &str) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let mut total = 0u64;
        for table in ["audit_events", "access_events", "security_events"] {
            let sql = format!("DELETE FROM {} WHERE created_at < ?1", table);
            total += conn.execute(&sql, params![cutoff])? as u64;
        }
        Ok(total)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Database {
        Database::open_in_memory().expect("Failed to create test database")
    }

    fn sample_audit(id: &str, action: &str, outcome: &str, created_at: &str) -> AuditEventRow {
        AuditEventRow {
            id: id.to_string(),
            entity_type: "email".to_string(),
            entity_id: "m1".to_string(),
            actor: "mailtriage".to_string(),
            action: action.to_string(),
            outcome: outcome.to_string(),
            metadata: "{}".to_string(),
            created_at: created_at.to_string(),
        }
    }

    #[test]
    fn test_query_with_filters() {
        let db = test_db();
        insert_audit(&db, &sample_audit("e1", "parsed", "success", "2026-03-01T10:00:00Z"))
            .unwrap();
        insert_audit(&db, &sample_audit("e2", "blocked", "failure", "2026-03-01T11:00:00Z"))
            .unwrap();

        let all = query_audit(&db, &AuditFilter::default()).unwrap();
        assert_eq!(all.len(), 2);
        // Newest first.
        assert_eq!(all[0].id, "e2");

        let filtered = query_audit(
            &db,
            &AuditFilter {
                action: Some("parsed".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].id, "e1");

        let windowed = query_audit(
            &db,
            &AuditFilter {
                since: Some("2026-03-01T10:30:00Z".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(windowed.len(), 1);
        assert_eq!(windowed[0].id, "e2");
    }

    #[test]
    fn test_query_pagination() {
        let db = test_db();
        for i in 0..5 {
            insert_audit(
                &db,
                &sample_audit(
                    &format!("e{}", i),
                    "parsed",
                    "success",
                    &format!("2026-03-01T10:0{}:00Z", i),
                ),
            )
            .unwrap();
        }

        let page = query_audit(
            &db,
            &AuditFilter {
                limit: Some(2),
                offset: Some(2),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].id, "e2");
        assert_eq!(page[1].id, "e1");
    }

    #[test]
    fn test_stats_and_security_distribution() {
        let db = test_db();
        insert_audit(&db, &sample_audit("e1", "parsed", "success", "2026-03-01T10:00:00Z"))
            .unwrap();
        insert_audit(&db, &sample_audit("e2", "parsed", "success", "2026-03-01T10:01:00Z"))
            .unwrap();
        insert_audit(&db, &sample_audit("e3", "blocked", "failure", "2026-03-01T10:02:00Z"))
            .unwrap();

        for (id, level) in [("s1", "LOW"), ("s2", "LOW"), ("s3", "CRITICAL")] {
            insert_security(
                &db,
                &SecurityEventRow {
                    id: id.to_string(),
                    message_id: "m1".to_string(),
                    sender: "a@x.com".to_string(),
                    risk_level: level.to_string(),
                    score: 10,
                    threats: "[]".to_string(),
                    warnings: "[]".to_string(),
                    created_at: "2026-03-01T10:00:00Z".to_string(),
                },
            )
            .unwrap();
        }

        let stats = stats(&db, "2026-01-01T00:00:00Z").unwrap();
        assert_eq!(stats.total_events, 3);
        assert_eq!(stats.success_events, 2);
        assert!((stats.success_rate() - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(stats.risk_levels[0], ("LOW".to_string(), 2));
    }

    #[test]
    fn test_purge_older_than() {
        let db = test_db();
        insert_audit(&db, &sample_audit("old", "parsed", "success", "2025-01-01T00:00:00Z"))
            .unwrap();
        insert_audit(&db, &sample_audit("new", "parsed", "success", "2026-03-01T00:00:00Z"))
            .unwrap();

        let purged = purge_older_than(&db, "2026-01-01T00:00:00Z").unwrap();
        assert_eq!(purged, 1);
        assert_eq!(query_audit(&db, &AuditFilter::default()).unwrap().len(), 1);
    }
}
