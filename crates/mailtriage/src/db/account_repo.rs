//! Account, user and membership repository.

use rusqlite::{params, Row};

use super::{Database, DatabaseError};

/// Organizational account that can own tickets.
#[derive(Debug, Clone)]
pub struct AccountRow {
    pub id: String,
    pub name: String,
    /// ORGANIZATION, SUBSIDIARY or INDIVIDUAL.
    pub account_type: String,
    pub parent_id: Option<String>,
    /// Email domains owned by this account.
    pub domains: Vec<String>,
    pub is_active: bool,
    pub created_at: String,
}

impl AccountRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        let domains_json: String = row.get("domains")?;
        Ok(Self {
            id: row.get("id")?,
            name: row.get("name")?,
            account_type: row.get("account_type")?,
            parent_id: row.get("parent_id")?,
            domains: serde_json::from_str(&domains_json).unwrap_or_default(),
            is_active: row.get("is_active")?,
            created_at: row.get("created_at")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct UserRow {
    pub id: String,
    pub email: String,
    pub display_name: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct MembershipRow {
    pub id: String,
    pub account_id: String,
    pub user_id: String,
    pub role: Option<String>,
    pub verified: bool,
    pub created_at: String,
}

/// Inserts a new account.
pub fn insert(db: &Database, account: &AccountRow) -> Result<(), DatabaseError> {
    let domains_json = serde_json::to_string(&account.domains).unwrap_or_else(|_| "[]".into());
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO accounts (id, name, account_type, parent_id, domains, is_active, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                account.id,
                account.name,
                account.account_type,
                account.parent_id,
                domains_json,
                account.is_active,
                account.created_at,
            ],
        )?;
        Ok(())
    })
}

/// Finds an account by its ID.
pub fn find_by_id(db: &Database, id: &str) -> Result<Option<AccountRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT * FROM accounts WHERE id = ?1")?;
        let mut rows = stmt.query_map(params![id], AccountRow::from_row)?;
        match rows.next() {
            Some(Ok(row)) => Ok(Some(row)),
            Some(Err(e)) => Err(DatabaseError::Sqlite(e)),
            None => Ok(None),
        }
    })
}

/// Lists all active accounts. Domain filtering happens in the mapping
/// service, which caches this per domain.
pub fn list_active(db: &Database) -> Result<Vec<AccountRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT * FROM accounts WHERE is_active = 1 ORDER BY name")?;
        let rows: Vec<AccountRow> = stmt
            .query_map([], AccountRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Finds a user by email address.
pub fn find_user_by_email(db: &Database, email: &str) -> Result<Option<UserRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT * FROM users WHERE email = ?1")?;
        let mut rows = stmt.query_map(params![email], |row| {
            Ok(UserRow {
                id: row.get("id")?,
                email: row.get("email")?,
                display_name: row.get("display_name")?,
                created_at: row.get("created_at")?,
            })
        })?;
        match rows.next() {
            Some(Ok(row)) => Ok(Some(row)),
            Some(Err(e)) => Err(DatabaseError::Sqlite(e)),
            None => Ok(None),
        }
    })
}

pub fn insert_user(db: &Database, user: &UserRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO users (id, email, display_name, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![user.id, user.email, user.display_name, user.created_at],
        )?;
        Ok(())
    })
}

/// Finds the membership linking a user to an account.
pub fn find_membership(
    db: &Database,
    account_id: &str,
    user_id: &str,
) -> Result<Option<MembershipRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt =
            conn.prepare("SELECT * FROM memberships WHERE account_id = ?1 AND user_id = ?2")?;
        let mut rows = stmt.query_map(params![account_id, user_id], |row| {
            Ok(MembershipRow {
                id: row.get("id")?,
                account_id: row.get("account_id")?,
                user_id: row.get("user_id")?,
                role: row.get("role")?,
                verified: row.get("verified")?,
                created_at: row.get("created_at")?,
            })
        })?;
        match rows.next() {
            Some(Ok(row)) => Ok(Some(row)),
            Some(Err(e)) => Err(DatabaseError::Sqlite(e)),
            None => Ok(None),
        }
    })
}

pub fn insert_membership(db: &Database, membership: &MembershipRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO memberships (id, account_id, user_id, role, verified, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                membership.id,
                membership.account_id,
                membership.user_id,
                membership.role,
                membership.verified,
                membership.created_at,
            ],
        )?;
        Ok(())
    })
}
