//! Durable job queue repository.
//!
//! The `jobs` table is the source of truth for the processing queue.
//! Claiming is a single conditional UPDATE so concurrent workers can
//! never pick up the same job twice.

use rusqlite::{params, Row};

use super::{Database, DatabaseError};

/// Job lifecycle states.
pub mod status {
    pub const PENDING: &str = "pending";
    pub const PROCESSING: &str = "processing";
    pub const COMPLETED: &str = "completed";
    pub const FAILED: &str = "failed";
    /// Exhausted all attempts; kept for inspection.
    pub const DEAD: &str = "dead";
}

#[derive(Debug, Clone)]
pub struct JobRow {
    pub id: String,
    pub job_type: String,
    pub status: String,
    pub priority: i64,
    pub attempts: u32,
    pub max_attempts: u32,
    pub next_retry_at: Option<String>,
    /// JSON payload, shape depends on `job_type`.
    pub payload: String,
    /// JSON context propagated into audit records.
    pub context: String,
    pub result: Option<String>,
    pub error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            job_type: row.get("job_type")?,
            status: row.get("status")?,
            priority: row.get("priority")?,
            attempts: row.get("attempts")?,
            max_attempts: row.get("max_attempts")?,
            next_retry_at: row.get("next_retry_at")?,
            payload: row.get("payload")?,
            context: row.get("context")?,
            result: row.get("result")?,
            error: row.get("error")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: String,
    pub job_type: String,
    pub priority: i64,
    pub max_attempts: u32,
    pub payload: String,
    pub context: String,
}

pub fn insert(db: &Database, job: &NewJob, now: &str) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO jobs (id, job_type, status, priority, attempts, max_attempts,
             payload, context, created_at, updated_at)
             VALUES (?1, ?2, 'pending', ?3, 0, ?4, ?5, ?6, ?7, ?7)",
            params![
                job.id,
                job.job_type,
                job.priority,
                job.max_attempts,
                job.payload,
                job.context,
                now,
            ],
        )?;
        Ok(())
    })
}

/// Atomically claims the next eligible pending job: highest priority
/// first, then oldest, skipping jobs whose retry time has not arrived.
/// Returns the claimed row with its attempt counter already bumped.
pub fn claim_next(db: &Database, now: &str) -> Result<Option<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "UPDATE jobs SET status = 'processing', attempts = attempts + 1,
                 started_at = ?1, updated_at = ?1
             WHERE id = (
                 SELECT id FROM jobs
                 WHERE status = 'pending'
                   AND (next_retry_at IS NULL OR next_retry_at <= ?1)
                 ORDER BY priority DESC, created_at ASC
                 LIMIT 1
             )
             RETURNING *",
        )?;
        let mut rows = stmt.query_map(params![now], JobRow::from_row)?;
        match rows.next() {
            Some(Ok(row)) => Ok(Some(row)),
            Some(Err(e)) => Err(DatabaseError::Sqlite(e)),
            None => Ok(None),
        }
    })
}

pub fn complete(db: &Database, id: &str, result: &str, now: &str) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE jobs SET status = 'completed', result = ?2, error = NULL,
             completed_at = ?3, updated_at = ?3 WHERE id = ?1",
            params![id, result, now],
        )?;
        Ok(())
    })
}

/// Returns the job to pending with a retry time, recording the error.
pub fn schedule_retry(
    db: &Database,
    id: &str,
    error: &str,
    next_retry_at: &str,
    now: &str,
) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE jobs SET status = 'pending', error = ?2, next_retry_at = ?3,
             started_at = NULL, updated_at = ?4 WHERE id = ?1",
            params![id, error, next_retry_at, now],
        )?;
        Ok(())
    })
}

/// Books a terminal failure: the job is done, with no retry.
pub fn mark_failed(db: &Database, id: &str, error: &str, now: &str) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE jobs SET status = 'failed', error = ?2, completed_at = ?3, updated_at = ?3
             WHERE id = ?1",
            params![id, error, now],
        )?;
        Ok(())
    })
}

/// Marks a job dead after its attempts are exhausted.
pub fn mark_dead(db: &Database, id: &str, error: &str, now: &str) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE jobs SET status = 'dead', error = ?2, completed_at = ?3, updated_at = ?3
             WHERE id = ?1",
            params![id, error, now],
        )?;
        Ok(())
    })
}

pub fn find_by_id(db: &Database, id: &str) -> Result<Option<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT * FROM jobs WHERE id = ?1")?;
        let mut rows = stmt.query_map(params![id], JobRow::from_row)?;
        match rows.next() {
            Some(Ok(row)) => Ok(Some(row)),
            Some(Err(e)) => Err(DatabaseError::Sqlite(e)),
            None => Ok(None),
        }
    })
}

/// Jobs still occupying queue capacity: pending plus processing.
pub fn count_active(db: &Database) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE status IN ('pending', 'processing')",
            [],
            |r| r.get(0),
        )?;
        Ok(count)
    })
}

pub fn count_by_status(db: &Database, status: &str) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE status = ?1",
            params![status],
            |r| r.get(0),
        )?;
        Ok(count)
    })
}

/// Requeues processing jobs whose worker went silent. A job counts as
/// stalled when it started before the cutoff and never finished.
/// Returns the ids of recovered jobs.
pub fn recover_stalled(
    db: &Database,
    started_before: &str,
    now: &str,
) -> Result<Vec<String>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "UPDATE jobs SET status = 'pending', started_at = NULL, updated_at = ?2
             WHERE status = 'processing' AND started_at < ?1
             RETURNING id",
        )?;
        let ids: Vec<String> = stmt
            .query_map(params![started_before, now], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    })
}

/// Deletes terminal jobs older than the cutoff. Returns the count.
pub fn purge_finished_before(db: &Database, cutoff: &str) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let deleted = conn.execute(
            "DELETE FROM jobs WHERE status IN ('completed', 'failed', 'dead')
             AND updated_at < ?1",
            params![cutoff],
        )?;
        Ok(deleted as u64)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Database {
        Database::open_in_memory().expect("Failed to create test database")
    }

    fn sample_job(id: &str, priority: i64) -> NewJob {
        NewJob {
            id: id.to_string(),
            job_type: "PROCESS_EMAIL".to_string(),
            priority,
            max_attempts: 3,
            payload: r#"{"message_id":"m1"}"#.to_string(),
            context: "{}".to_string(),
        }
    }

    #[test]
    fn test_claim_orders_by_priority_then_age() {
        let db = test_db();
        insert(&db, &sample_job("low-old", 0), "2026-03-01T10:00:00Z").unwrap();
        insert(&db, &sample_job("high", 5), "2026-03-01T10:01:00Z").unwrap();
        insert(&db, &sample_job("low-new", 0), "2026-03-01T10:02:00Z").unwrap();

        let now = "2026-03-01T10:05:00Z";
        let first = claim_next(&db, now).unwrap().unwrap();
        let second = claim_next(&db, now).unwrap().unwrap();
        let third = claim_next(&db, now).unwrap().unwrap();

        assert_eq!(first.id, "high");
        assert_eq!(second.id, "low-old");
        assert_eq!(third.id, "low-new");
        assert!(claim_next(&db, now).unwrap().is_none());
    }

    #[test]
    fn test_claim_bumps_attempts_and_marks_processing() {
        let db = test_db();
        insert(&db, &sample_job("j1", 0), "2026-03-01T10:00:00Z").unwrap();

        let claimed = claim_next(&db, "2026-03-01T10:01:00Z").unwrap().unwrap();
        assert_eq!(claimed.status, status::PROCESSING);
        assert_eq!(claimed.attempts, 1);
        assert_eq!(claimed.started_at.as_deref(), Some("2026-03-01T10:01:00Z"));

        // No other worker can claim it again.
        assert!(claim_next(&db, "2026-03-01T10:01:00Z").unwrap().is_none());
    }

    #[test]
    fn test_retry_not_eligible_before_retry_time() {
        let db = test_db();
        insert(&db, &sample_job("j1", 0), "2026-03-01T10:00:00Z").unwrap();
        claim_next(&db, "2026-03-01T10:01:00Z").unwrap().unwrap();
        schedule_retry(
            &db,
            "j1",
            "transient failure",
            "2026-03-01T10:10:00Z",
            "2026-03-01T10:01:30Z",
        )
        .unwrap();

        assert!(claim_next(&db, "2026-03-01T10:05:00Z").unwrap().is_none());

        let retried = claim_next(&db, "2026-03-01T10:10:00Z").unwrap().unwrap();
        assert_eq!(retried.id, "j1");
        assert_eq!(retried.attempts, 2);
        assert_eq!(retried.error.as_deref(), Some("transient failure"));
    }

    #[test]
    fn test_complete_failed_and_dead_are_terminal() {
        let db = test_db();
        insert(&db, &sample_job("ok", 0), "2026-03-01T10:00:00Z").unwrap();
        insert(&db, &sample_job("rejected", 0), "2026-03-01T10:00:01Z").unwrap();
        insert(&db, &sample_job("bad", 0), "2026-03-01T10:00:02Z").unwrap();
        claim_next(&db, "2026-03-01T10:01:00Z").unwrap();
        claim_next(&db, "2026-03-01T10:01:00Z").unwrap();
        claim_next(&db, "2026-03-01T10:01:00Z").unwrap();

        complete(&db, "ok", r#"{"ticket":"ACME-2026-0001"}"#, "2026-03-01T10:02:00Z").unwrap();
        mark_failed(&db, "rejected", "duplicate ticket", "2026-03-01T10:02:00Z").unwrap();
        mark_dead(&db, "bad", "gave up", "2026-03-01T10:02:00Z").unwrap();

        assert!(claim_next(&db, "2026-03-01T11:00:00Z").unwrap().is_none());
        assert_eq!(count_active(&db).unwrap(), 0);
        assert_eq!(count_by_status(&db, status::COMPLETED).unwrap(), 1);
        assert_eq!(count_by_status(&db, status::FAILED).unwrap(), 1);
        assert_eq!(count_by_status(&db, status::DEAD).unwrap(), 1);

        let failed = find_by_id(&db, "rejected").unwrap().unwrap();
        assert_eq!(failed.error.as_deref(), Some("duplicate ticket"));
        assert_eq!(failed.attempts, 1);
    }

    #[test]
    fn test_recover_stalled() {
        let db = test_db();
        insert(&db, &sample_job("stuck", 0), "2026-03-01T10:00:00Z").unwrap();
        insert(&db, &sample_job("fresh", 0), "2026-03-01T10:00:01Z").unwrap();
        claim_next(&db, "2026-03-01T10:01:00Z").unwrap();
        claim_next(&db, "2026-03-01T10:20:00Z").unwrap();

        let recovered = recover_stalled(&db, "2026-03-01T10:15:00Z", "2026-03-01T10:21:00Z").unwrap();
        assert_eq!(recovered, vec!["stuck".to_string()]);

        let job = find_by_id(&db, "stuck").unwrap().unwrap();
        assert_eq!(job.status, status::PENDING);
        assert!(job.started_at.is_none());
    }

    #[test]
    fn test_purge_keeps_active_jobs() {
        let db = test_db();
        insert(&db, &sample_job("done", 0), "2026-01-01T10:00:00Z").unwrap();
        insert(&db, &sample_job("waiting", 0), "2026-01-01T10:00:01Z").unwrap();
        claim_next(&db, "2026-01-01T10:01:00Z").unwrap();
        complete(&db, "done", "{}", "2026-01-01T10:02:00Z").unwrap();

        let purged = purge_finished_before(&db, "2026-02-01T00:00:00Z").unwrap();
        assert_eq!(purged, 1);
        assert!(find_by_id(&db, "done").unwrap().is_none());
        assert!(find_by_id(&db, "waiting").unwrap().is_some());
    }
}
