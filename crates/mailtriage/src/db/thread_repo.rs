//! Conversation-thread repository.

use rusqlite::{params, Row};

use super::{Database, DatabaseError};

#[derive(Debug, Clone)]
pub struct ThreadRow {
    pub id: String,
    pub root_message_id: String,
    pub subject: String,
    pub normalized_subject: String,
    pub participants: Vec<String>,
    pub message_count: u64,
    pub ticket_id: Option<String>,
    pub created_at: String,
    pub last_activity_at: String,
}

impl ThreadRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        let participants_json: String = row.get("participants")?;
        Ok(Self {
            id: row.get("id")?,
            root_message_id: row.get("root_message_id")?,
            subject: row.get("subject")?,
            normalized_subject: row.get("normalized_subject")?,
            participants: serde_json::from_str(&participants_json).unwrap_or_default(),
            message_count: row.get("message_count")?,
            ticket_id: row.get("ticket_id")?,
            created_at: row.get("created_at")?,
            last_activity_at: row.get("last_activity_at")?,
        })
    }
}

pub fn insert(db: &Database, thread: &ThreadRow) -> Result<(), DatabaseError> {
    let participants_json =
        serde_json::to_string(&thread.participants).unwrap_or_else(|_| "[]".into());
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO threads (id, root_message_id, subject, normalized_subject, participants,
             message_count, ticket_id, created_at, last_activity_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                thread.id,
                thread.root_message_id,
                thread.subject,
                thread.normalized_subject,
                participants_json,
                thread.message_count,
                thread.ticket_id,
                thread.created_at,
                thread.last_activity_at,
            ],
        )?;
        Ok(())
    })
}

pub fn find_by_id(db: &Database, id: &str) -> Result<Option<ThreadRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT * FROM threads WHERE id = ?1")?;
        let mut rows = stmt.query_map(params![id], ThreadRow::from_row)?;
        match rows.next() {
            Some(Ok(row)) => Ok(Some(row)),
            Some(Err(e)) => Err(DatabaseError::Sqlite(e)),
            None => Ok(None),
        }
    })
}

/// Most recently active thread with the given normalized subject whose
/// last activity falls inside the merge window.
pub fn find_by_normalized_subject(
    db: &Database,
    normalized_subject: &str,
    since: &str,
) -> Result<Option<ThreadRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM threads WHERE normalized_subject = ?1 AND last_activity_at >= ?2
             ORDER BY last_activity_at DESC LIMIT 1",
        )?;
        let mut rows = stmt.query_map(params![normalized_subject, since], ThreadRow::from_row)?;
        match rows.next() {
            Some(Ok(row)) => Ok(Some(row)),
            Some(Err(e)) => Err(DatabaseError::Sqlite(e)),
            None => Ok(None),
        }
    })
}

/// Registers a new message on a thread: bumps the count, refreshes the
/// activity timestamp and adds the participant if unseen.
pub fn touch(
    db: &Database,
    id: &str,
    participant: &str,
    last_activity_at: &str,
) -> Result<(), DatabaseError> {
    let thread = match find_by_id(db, id)? {
        Some(t) => t,
        None => return Ok(()),
    };

    let mut participants = thread.participants;
    if !participants.iter().any(|p| p == participant) {
        participants.push(participant.to_string());
    }
    let participants_json = serde_json::to_string(&participants).unwrap_or_else(|_| "[]".into());

    db.with_conn(|conn| {
        conn.execute(
            "UPDATE threads SET message_count = message_count + 1, participants = ?2,
             last_activity_at = ?3 WHERE id = ?1",
            params![id, participants_json, last_activity_at],
        )?;
        Ok(())
    })
}

pub fn set_ticket(db: &Database, id: &str, ticket_id: &str) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE threads SET ticket_id = ?2 WHERE id = ?1",
            params![id, ticket_id],
        )?;
        Ok(())
    })
}

/// Folds a source thread's counters into a target and deletes the source.
/// Message reassignment happens separately in the message repo.
pub fn absorb(db: &Database, source_id: &str, target_id: &str) -> Result<(), DatabaseError> {
    let source = find_by_id(db, source_id)?;
    let target = find_by_id(db, target_id)?;
    let (source, target) = match (source, target) {
        (Some(s), Some(t)) => (s, t),
        _ => return Ok(()),
    };

    let mut participants = target.participants;
    for p in source.participants {
        if !participants.contains(&p) {
            participants.push(p);
        }
    }
    let participants_json = serde_json::to_string(&participants).unwrap_or_else(|_| "[]".into());
    let last_activity = if source.last_activity_at > target.last_activity_at {
        source.last_activity_at.clone()
    } else {
        target.last_activity_at.clone()
    };

    db.with_conn(|conn| {
        conn.execute(
            "UPDATE threads SET message_count = message_count + ?2, participants = ?3,
             last_activity_at = ?4 WHERE id = ?1",
            params![
                target_id,
                source.message_count,
                participants_json,
                last_activity
            ],
        )?;
        conn.execute("DELETE FROM threads WHERE id = ?1", params![source_id])?;
        Ok(())
    })
}

/// Deletes threads with no activity since the cutoff. Returns the count.
pub fn delete_inactive_before(db: &Database, cutoff: &str) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let deleted = conn.execute(
            "DELETE FROM threads WHERE last_activity_at < ?1",
            params![cutoff],
        )?;
        Ok(deleted as u64)
    })
}
