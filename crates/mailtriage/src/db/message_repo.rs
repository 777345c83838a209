//! Processed-message repository.
//!
//! One row per inbound message, keyed by provider message id. Doubles as
//! the idempotency check and the sender-history source for reputation
//! scoring.

use rusqlite::{params, Row};

use super::{Database, DatabaseError};

/// Message dispositions recorded after processing.
pub mod disposition {
    pub const PROCESSED: &str = "processed";
    pub const QUARANTINED: &str = "quarantined";
    pub const BLOCKED: &str = "blocked";
    pub const REJECTED: &str = "rejected";
}

#[derive(Debug, Clone)]
pub struct MessageRow {
    pub message_id: String,
    pub thread_id: Option<String>,
    pub parent_message_id: Option<String>,
    pub depth: u32,
    pub provider_thread_id: Option<String>,
    pub sender: String,
    pub sender_name: Option<String>,
    pub subject: String,
    pub disposition: String,
    pub ticket_id: Option<String>,
    pub received_at: String,
}

impl MessageRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            message_id: row.get("message_id")?,
            thread_id: row.get("thread_id")?,
            parent_message_id: row.get("parent_message_id")?,
            depth: row.get("depth")?,
            provider_thread_id: row.get("provider_thread_id")?,
            sender: row.get("sender")?,
            sender_name: row.get("sender_name")?,
            subject: row.get("subject")?,
            disposition: row.get("disposition")?,
            ticket_id: row.get("ticket_id")?,
            received_at: row.get("received_at")?,
        })
    }
}

/// Aggregated sender history for reputation scoring.
#[derive(Debug, Clone, Default)]
pub struct SenderHistory {
    pub total: u64,
    pub quarantined: u64,
    pub blocked: u64,
}

impl SenderHistory {
    /// Fraction of messages that were quarantined or blocked.
    pub fn failure_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.quarantined + self.blocked) as f64 / self.total as f64
    }
}

pub fn insert(db: &Database, message: &MessageRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO messages (message_id, thread_id, parent_message_id, depth,
             provider_thread_id, sender, sender_name, subject, disposition, ticket_id, received_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                message.message_id,
                message.thread_id,
                message.parent_message_id,
                message.depth,
                message.provider_thread_id,
                message.sender,
                message.sender_name,
                message.subject,
                message.disposition,
                message.ticket_id,
                message.received_at,
            ],
        )?;
        Ok(())
    })
}

pub fn find_by_id(db: &Database, message_id: &str) -> Result<Option<MessageRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT * FROM messages WHERE message_id = ?1")?;
        let mut rows = stmt.query_map(params![message_id], MessageRow::from_row)?;
        match rows.next() {
            Some(Ok(row)) => Ok(Some(row)),
            Some(Err(e)) => Err(DatabaseError::Sqlite(e)),
            None => Ok(None),
        }
    })
}

/// True if the message id has already been recorded.
pub fn exists(db: &Database, message_id: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE message_id = ?1",
            params![message_id],
            |r| r.get(0),
        )?;
        Ok(count > 0)
    })
}

/// Finds the thread a message id belongs to, if any.
pub fn find_thread_id(db: &Database, message_id: &str) -> Result<Option<String>, DatabaseError> {
    Ok(find_by_id(db, message_id)?.and_then(|m| m.thread_id))
}

/// Finds the thread associated with a provider-native conversation id.
pub fn find_thread_by_provider_id(
    db: &Database,
    provider_thread_id: &str,
) -> Result<Option<String>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT thread_id FROM messages
             WHERE provider_thread_id = ?1 AND thread_id IS NOT NULL
             ORDER BY received_at DESC LIMIT 1",
        )?;
        let mut rows = stmt.query_map(params![provider_thread_id], |row| {
            row.get::<_, Option<String>>(0)
        })?;
        match rows.next() {
            Some(Ok(id)) => Ok(id),
            Some(Err(e)) => Err(DatabaseError::Sqlite(e)),
            None => Ok(None),
        }
    })
}

/// Most recent message in a thread.
pub fn find_latest_in_thread(
    db: &Database,
    thread_id: &str,
) -> Result<Option<MessageRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM messages WHERE thread_id = ?1 ORDER BY received_at DESC LIMIT 1",
        )?;
        let mut rows = stmt.query_map(params![thread_id], MessageRow::from_row)?;
        match rows.next() {
            Some(Ok(row)) => Ok(Some(row)),
            Some(Err(e)) => Err(DatabaseError::Sqlite(e)),
            None => Ok(None),
        }
    })
}

/// All messages in a thread, oldest first.
pub fn list_thread(db: &Database, thread_id: &str) -> Result<Vec<MessageRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt =
            conn.prepare("SELECT * FROM messages WHERE thread_id = ?1 ORDER BY received_at ASC")?;
        let rows: Vec<MessageRow> = stmt
            .query_map(params![thread_id], MessageRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Sender outcomes since the given timestamp.
pub fn sender_history(
    db: &Database,
    sender: &str,
    since: &str,
) -> Result<SenderHistory, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT disposition, COUNT(*) FROM messages
             WHERE sender = ?1 AND received_at >= ?2 GROUP BY disposition",
        )?;
        let mut history = SenderHistory::default();
        let rows = stmt.query_map(params![sender, since], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
        })?;
        for row in rows {
            let (disp, count) = row?;
            history.total += count;
            match disp.as_str() {
                disposition::QUARANTINED => history.quarantined += count,
                disposition::BLOCKED => history.blocked += count,
                _ => {}
            }
        }
        Ok(history)
    })
}

/// Moves all messages from one thread to another (thread merge).
pub fn reassign_thread(
    db: &Database,
    from_thread: &str,
    to_thread: &str,
) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE messages SET thread_id = ?2 WHERE thread_id = ?1",
            params![from_thread, to_thread],
        )?;
        Ok(changed as u64)
    })
}
