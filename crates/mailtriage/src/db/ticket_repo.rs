//! Ticket repository.
//!
//! Ticket numbers are `{PREFIX}-{YEAR}-{NNNN}` where PREFIX is derived
//! from the account name. Number generation and insertion happen inside
//! one transaction so concurrent workers can never produce duplicates.

use rusqlite::{params, Row};

use super::{Database, DatabaseError};

#[derive(Debug, Clone)]
pub struct TicketRow {
    pub id: String,
    pub number: String,
    pub title: String,
    pub description: String,
    pub status: String,
    pub priority: String,
    pub category: Option<String>,
    pub account_id: String,
    pub member_id: Option<String>,
    pub creator: String,
    pub source_message_id: Option<String>,
    /// JSON object of custom fields, including provenance keys.
    pub custom_fields: String,
    pub created_at: String,
    pub updated_at: String,
}

impl TicketRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            number: row.get("number")?,
            title: row.get("title")?,
            description: row.get("description")?,
            status: row.get("status")?,
            priority: row.get("priority")?,
            category: row.get("category")?,
            account_id: row.get("account_id")?,
            member_id: row.get("member_id")?,
            creator: row.get("creator")?,
            source_message_id: row.get("source_message_id")?,
            custom_fields: row.get("custom_fields")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Fields needed to create a ticket; id and number are assigned here.
#[derive(Debug, Clone)]
pub struct NewTicket {
    pub title: String,
    pub description: String,
    pub priority: String,
    pub category: Option<String>,
    pub account_id: String,
    pub account_name: String,
    pub member_id: Option<String>,
    pub creator: String,
    pub source_message_id: Option<String>,
    pub custom_fields: String,
}

/// Derives the ticket-number prefix: first four alphanumeric characters
/// of the account name, uppercased. Falls back to "ACCT" for names with
/// no alphanumeric characters.
pub fn number_prefix(account_name: &str) -> String {
    let prefix: String = account_name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(4)
        .collect::<String>()
        .to_uppercase();
    if prefix.is_empty() {
        "ACCT".to_string()
    } else {
        prefix
    }
}

/// Creates a ticket, assigning the next sequence number for the
/// (account prefix, year) pair. The max-sequence read and the insert run
/// in the same transaction.
pub fn create_with_number(
    db: &Database,
    ticket: &NewTicket,
    year: i32,
    now: &str,
) -> Result<TicketRow, DatabaseError> {
    let prefix = number_prefix(&ticket.account_name);
    let like = format!("{}-{}-%", prefix, year);
    let id = uuid::Uuid::new_v4().to_string();

    db.with_tx(|conn| {
        let max_seq: u32 = conn
            .prepare("SELECT number FROM tickets WHERE number LIKE ?1")?
            .query_map(params![like], |row| row.get::<_, String>(0))?
            .filter_map(|r| r.ok())
            .filter_map(|number| {
                number
                    .rsplit('-')
                    .next()
                    .and_then(|seq| seq.parse::<u32>().ok())
            })
            .max()
            .unwrap_or(0);

        let number = format!("{}-{}-{:04}", prefix, year, max_seq + 1);

        conn.execute(
            "INSERT INTO tickets (id, number, title, description, status, priority, category,
             account_id, member_id, creator, source_message_id, custom_fields, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 'OPEN', ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)",
            params![
                id,
                number,
                ticket.title,
                ticket.description,
                ticket.priority,
                ticket.category,
                ticket.account_id,
                ticket.member_id,
                ticket.creator,
                ticket.source_message_id,
                ticket.custom_fields,
                now,
            ],
        )?;

        let mut stmt = conn.prepare("SELECT * FROM tickets WHERE id = ?1")?;
        let row = stmt.query_row(params![id], TicketRow::from_row)?;
        Ok(row)
    })
}

/// Finds a ticket by its number (exact match).
pub fn find_by_number(db: &Database, number: &str) -> Result<Option<TicketRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT * FROM tickets WHERE number = ?1")?;
        let mut rows = stmt.query_map(params![number], TicketRow::from_row)?;
        match rows.next() {
            Some(Ok(row)) => Ok(Some(row)),
            Some(Err(e)) => Err(DatabaseError::Sqlite(e)),
            None => Ok(None),
        }
    })
}

pub fn find_by_id(db: &Database, id: &str) -> Result<Option<TicketRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT * FROM tickets WHERE id = ?1")?;
        let mut rows = stmt.query_map(params![id], TicketRow::from_row)?;
        match rows.next() {
            Some(Ok(row)) => Ok(Some(row)),
            Some(Err(e)) => Err(DatabaseError::Sqlite(e)),
            None => Ok(None),
        }
    })
}

/// Tickets created for an account since the given timestamp, newest first.
/// Used by duplicate detection.
pub fn find_recent(
    db: &Database,
    account_id: &str,
    since: &str,
) -> Result<Vec<TicketRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM tickets WHERE account_id = ?1 AND created_at >= ?2
             ORDER BY created_at DESC",
        )?;
        let rows: Vec<TicketRow> = stmt
            .query_map(params![account_id, since], TicketRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

pub fn update_status(
    db: &Database,
    id: &str,
    status: &str,
    updated_at: &str,
) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE tickets SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, status, updated_at],
        )?;
        Ok(())
    })
}

/// Appends a comment to a ticket.
pub fn add_comment(
    db: &Database,
    ticket_id: &str,
    author_email: Option<&str>,
    body: &str,
    created_at: &str,
) -> Result<String, DatabaseError> {
    let id = uuid::Uuid::new_v4().to_string();
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO ticket_comments (id, ticket_id, author_email, body, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, ticket_id, author_email, body, created_at],
        )?;
        Ok(())
    })?;
    Ok(id)
}

pub fn count_comments(db: &Database, ticket_id: &str) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM ticket_comments WHERE ticket_id = ?1",
            params![ticket_id],
            |r| r.get(0),
        )?;
        Ok(count)
    })
}
