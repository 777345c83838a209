//! Durable processing queue.
//!
//! Jobs live in the `jobs` table; worker threads claim them through an
//! atomic conditional update, so a job is executed by at most one worker
//! at a time. Retryable failures back off exponentially with jitter
//! until their attempts run out, then stay in the table as `dead` for
//! inspection; terminal failures are booked as `failed` on the spot.
//! A sweeper requeues jobs whose worker died mid-run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Utc;
use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, error, info, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::schema::QueueConfig;
use crate::db::queue_repo::{self, status, JobRow, NewJob};
use crate::db::Database;
use crate::error::QueueError;
use crate::provider::InboundMessage;

/// Completion events buffered before the oldest are dropped.
const EVENT_BUFFER: usize = 1024;

/// Work items the queue carries. The serialized form is the job row's
/// payload; the variant name doubles as the `job_type` column.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum JobPayload {
    /// Run one inbound message through the workflow.
    ProcessEmail {
        provider_id: String,
        message: InboundMessage,
    },
    /// Refresh a provider's expiring credentials.
    RefreshTokens { provider_id: String },
    /// Apply the retention policy.
    Cleanup,
}

impl JobPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            JobPayload::ProcessEmail { .. } => "ProcessEmail",
            JobPayload::RefreshTokens { .. } => "RefreshTokens",
            JobPayload::Cleanup => "Cleanup",
        }
    }
}

/// How a handler run failed. Retryable failures go back through the
/// backoff schedule until their attempts run out; terminal failures
/// (validation errors, business rejections) are booked as failed right
/// away, with no retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobFailure {
    Retryable(String),
    Terminal(String),
}

impl JobFailure {
    pub fn message(&self) -> &str {
        match self {
            JobFailure::Retryable(m) | JobFailure::Terminal(m) => m,
        }
    }
}

/// Executes one claimed job.
pub trait JobHandler: Send + Sync {
    fn handle(&self, payload: &JobPayload, job: &JobRow) -> Result<serde_json::Value, JobFailure>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobEventKind {
    Completed,
    Retrying,
    Failed,
    Dead,
}

/// Emitted after every job execution. Consumed by tests and the manager's
/// health reporting; dropping the receiver is harmless.
#[derive(Debug, Clone)]
pub struct JobEvent {
    pub job_id: String,
    pub job_type: String,
    pub kind: JobEventKind,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub dead: u64,
}

struct QueueInner {
    config: QueueConfig,
    db: Database,
    handler: Arc<dyn JobHandler>,
    running: AtomicBool,
    shutdown: AtomicBool,
    // Wakes idle workers on submission, retry scheduling and shutdown.
    wakeup: (Mutex<()>, Condvar),
    events_tx: Sender<JobEvent>,
}

pub struct EmailProcessingQueue {
    inner: Arc<QueueInner>,
    events_rx: Receiver<JobEvent>,
    worker_count: usize,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl EmailProcessingQueue {
    pub fn new(
        config: &QueueConfig,
        db: Database,
        handler: Arc<dyn JobHandler>,
        worker_count: usize,
    ) -> Self {
        let (events_tx, events_rx) = bounded(EVENT_BUFFER);
        Self {
            inner: Arc::new(QueueInner {
                config: config.clone(),
                db,
                handler,
                running: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
                wakeup: (Mutex::new(()), Condvar::new()),
                events_tx,
            }),
            events_rx,
            worker_count: worker_count.max(1),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Queue with no workers of its own. Jobs accumulate until another
    /// process drains them; used by tests to inspect pending state.
    #[cfg(test)]
    fn without_workers(config: &QueueConfig, db: Database, handler: Arc<dyn JobHandler>) -> Self {
        let mut queue = Self::new(config, db, handler, 1);
        queue.worker_count = 0;
        queue
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Spawns the worker pool and the stalled-job sweeper.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.shutdown.store(false, Ordering::Release);

        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        for n in 0..self.worker_count {
            let inner = Arc::clone(&self.inner);
            workers.push(
                thread::Builder::new()
                    .name(format!("mailtriage-worker-{}", n))
                    .spawn(move || inner.worker_loop())
                    .unwrap_or_else(|e| panic!("Failed to spawn worker thread: {}", e)),
            );
        }
        let inner = Arc::clone(&self.inner);
        workers.push(
            thread::Builder::new()
                .name("mailtriage-sweeper".to_string())
                .spawn(move || inner.sweeper_loop())
                .unwrap_or_else(|e| panic!("Failed to spawn sweeper thread: {}", e)),
        );
        info!("Queue started with {} workers", self.worker_count);
    }

    /// Stops accepting jobs and joins all threads. In-flight jobs finish;
    /// anything pending stays in the table for the next start.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.wakeup.1.notify_all();

        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        for handle in workers.drain(..) {
            if handle.join().is_err() {
                warn!("A queue worker panicked during shutdown");
            }
        }
        info!("Queue stopped");
    }

    /// Submits a job. Fails fast when the queue is stopped or the active
    /// backlog has reached the configured cap.
    pub fn add_job(
        &self,
        payload: &JobPayload,
        priority: i64,
        context: serde_json::Value,
    ) -> Result<String, QueueError> {
        if !self.is_running() {
            return Err(QueueError::NotRunning);
        }
        let active = queue_repo::count_active(&self.inner.db)?;
        if active >= self.inner.config.max_queue_size {
            return Err(QueueError::Full {
                active,
                limit: self.inner.config.max_queue_size,
            });
        }

        let job = NewJob {
            id: uuid::Uuid::new_v4().to_string(),
            job_type: payload.kind().to_string(),
            priority,
            max_attempts: self.inner.config.max_attempts,
            payload: serde_json::to_string(payload)
                .map_err(|e| QueueError::InvalidPayload(e.to_string()))?,
            context: context.to_string(),
        };
        queue_repo::insert(&self.inner.db, &job, &Utc::now().to_rfc3339())?;
        debug!("Enqueued {} job {}", job.job_type, job.id);

        self.inner.wakeup.1.notify_one();
        Ok(job.id)
    }

    pub fn job(&self, id: &str) -> Result<Option<JobRow>, QueueError> {
        Ok(queue_repo::find_by_id(&self.inner.db, id)?)
    }

    pub fn stats(&self) -> Result<QueueStats, QueueError> {
        let db = &self.inner.db;
        Ok(QueueStats {
            pending: queue_repo::count_by_status(db, status::PENDING)?,
            processing: queue_repo::count_by_status(db, status::PROCESSING)?,
            completed: queue_repo::count_by_status(db, status::COMPLETED)?,
            failed: queue_repo::count_by_status(db, status::FAILED)?,
            dead: queue_repo::count_by_status(db, status::DEAD)?,
        })
    }

    /// Deletes terminal jobs last touched before the cutoff.
    pub fn purge_finished_before(&self, cutoff: &str) -> Result<u64, QueueError> {
        Ok(queue_repo::purge_finished_before(&self.inner.db, cutoff)?)
    }

    pub fn events(&self) -> Receiver<JobEvent> {
        self.events_rx.clone()
    }
}

impl QueueInner {
    fn worker_loop(&self) {
        while !self.shutdown.load(Ordering::Acquire) {
            match queue_repo::claim_next(&self.db, &Utc::now().to_rfc3339()) {
                Ok(Some(job)) => self.run_job(job),
                Ok(None) => self.idle_wait(Duration::from_secs(self.config.poll_interval_secs)),
                Err(e) => {
                    error!("Failed to claim a job: {}", e);
                    self.idle_wait(Duration::from_secs(self.config.poll_interval_secs));
                }
            }
        }
    }

    // Sweeps once at startup to reclaim jobs orphaned by a crash, then
    // periodically.
    fn sweeper_loop(&self) {
        let interval = Duration::from_secs(self.config.stalled_check_interval_secs.max(1));
        while !self.shutdown.load(Ordering::Acquire) {
            // A job counts as stalled after twice its allotted runtime.
            let cutoff = Utc::now()
                - chrono::Duration::seconds(2 * self.config.job_timeout_secs.max(1) as i64);
            match queue_repo::recover_stalled(
                &self.db,
                &cutoff.to_rfc3339(),
                &Utc::now().to_rfc3339(),
            ) {
                Ok(ids) if !ids.is_empty() => {
                    warn!("Recovered {} stalled jobs: {:?}", ids.len(), ids);
                    self.wakeup.1.notify_all();
                }
                Ok(_) => {}
                Err(e) => error!("Stalled-job sweep failed: {}", e),
            }
            self.idle_wait(interval);
        }
    }

    fn idle_wait(&self, timeout: Duration) {
        let guard = self.wakeup.0.lock().unwrap_or_else(|e| e.into_inner());
        let _ = self
            .wakeup
            .1
            .wait_timeout(guard, timeout)
            .unwrap_or_else(|e| e.into_inner());
    }

    fn run_job(&self, job: JobRow) {
        let now = || Utc::now().to_rfc3339();

        let payload: JobPayload = match serde_json::from_str(&job.payload) {
            Ok(p) => p,
            Err(e) => {
                // Malformed payloads can never succeed; skip the retries.
                let reason = format!("Invalid payload: {}", e);
                error!("Job {} ({}): {}", job.id, job.job_type, reason);
                if let Err(db_err) = queue_repo::mark_dead(&self.db, &job.id, &reason, &now()) {
                    error!("Failed to mark job {} dead: {}", job.id, db_err);
                }
                self.emit(&job, JobEventKind::Dead, Some(reason));
                return;
            }
        };

        debug!(
            "Running {} job {} (attempt {}/{})",
            job.job_type, job.id, job.attempts, job.max_attempts
        );
        let started = Instant::now();
        let mut outcome = self.handler.handle(&payload, &job);
        let elapsed = started.elapsed();

        // The handler runs on this thread, so overruns are only caught
        // after the fact. A success past the deadline is still a failure:
        // the sweeper may already have requeued the job elsewhere.
        if outcome.is_ok() && elapsed > Duration::from_secs(self.config.job_timeout_secs) {
            outcome = Err(JobFailure::Retryable(format!(
                "Job ran for {}s, past the {}s timeout",
                elapsed.as_secs(),
                self.config.job_timeout_secs
            )));
        }

        match outcome {
            Ok(result) => {
                if let Err(e) = queue_repo::complete(&self.db, &job.id, &result.to_string(), &now())
                {
                    error!("Failed to complete job {}: {}", job.id, e);
                }
                self.emit(&job, JobEventKind::Completed, None);
            }
            Err(JobFailure::Terminal(reason)) => {
                warn!(
                    "Job {} ({}) failed terminally, not retrying: {}",
                    job.id, job.job_type, reason
                );
                if let Err(e) = queue_repo::mark_failed(&self.db, &job.id, &reason, &now()) {
                    error!("Failed to mark job {} failed: {}", job.id, e);
                }
                self.emit(&job, JobEventKind::Failed, Some(reason));
            }
            Err(JobFailure::Retryable(reason)) if job.attempts >= job.max_attempts => {
                warn!(
                    "Job {} ({}) exhausted {} attempts: {}",
                    job.id, job.job_type, job.max_attempts, reason
                );
                if let Err(e) = queue_repo::mark_dead(&self.db, &job.id, &reason, &now()) {
                    error!("Failed to mark job {} dead: {}", job.id, e);
                }
                self.emit(&job, JobEventKind::Dead, Some(reason));
            }
            Err(JobFailure::Retryable(reason)) => {
                let delay = self.retry_delay(job.attempts);
                let next_retry = Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64);
                warn!(
                    "Job {} ({}) failed on attempt {}/{}, retrying at {}: {}",
                    job.id,
                    job.job_type,
                    job.attempts,
                    job.max_attempts,
                    next_retry.to_rfc3339(),
                    reason
                );
                if let Err(e) = queue_repo::schedule_retry(
                    &self.db,
                    &job.id,
                    &reason,
                    &next_retry.to_rfc3339(),
                    &now(),
                ) {
                    error!("Failed to schedule retry for job {}: {}", job.id, e);
                }
                self.emit(&job, JobEventKind::Retrying, Some(reason));
                self.wakeup.1.notify_one();
            }
        }
    }

    /// Exponential backoff from the attempt number, capped, with up to
    /// 30% random jitter so synchronized failures spread out.
    fn retry_delay(&self, attempts: u32) -> Duration {
        let base = self.config.base_retry_delay_secs.max(1);
        let exp = base.saturating_mul(1u64 << (attempts.saturating_sub(1)).min(16));
        let capped = exp.min(self.config.max_retry_delay_secs.max(base));
        let jitter_ms = rand::thread_rng().gen_range(0..=capped.saturating_mul(300));
        Duration::from_secs(capped) + Duration::from_millis(jitter_ms)
    }

    fn emit(&self, job: &JobRow, kind: JobEventKind, error: Option<String>) {
        // Nobody listening, or a full buffer, is fine.
        let _ = self.events_tx.try_send(JobEvent {
            job_id: job.id.clone(),
            job_type: job.job_type.clone(),
            kind,
            error,
        });
    }
}

impl Drop for EmailProcessingQueue {
    fn drop(&mut self) {
        self.stop();
    }
}
