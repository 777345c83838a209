//! Service lifecycle manager.
//!
//! Owns the queue, the workflow and the registered providers. A
//! dedicated scheduler thread hosts a current-thread tokio runtime with
//! interval timers for the provider poll, health check, token refresh
//! and retention cleanup; a broadcast channel lets callers trigger a
//! poll out of schedule and wakes the loop on shutdown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde_json::json;
use tokio::sync::broadcast;

use crate::audit::EmailAuditService;
use crate::config::schema::{Config, ManagerConfig, RetentionConfig};
use crate::db::{queue_repo, Database};
use crate::error::{MailtriageError, Result, WorkflowError};
use crate::provider::EmailProvider;
use crate::queue::{EmailProcessingQueue, JobFailure, JobHandler, JobPayload};
use crate::sanitize;
use crate::workflow::{EmailToTicketWorkflow, PermissionChecker, ProcessingOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl ManagerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ManagerState::Stopped => "STOPPED",
            ManagerState::Starting => "STARTING",
            ManagerState::Running => "RUNNING",
            ManagerState::Stopping => "STOPPING",
            ManagerState::Error => "ERROR",
        }
    }
}

type ProviderMap = Arc<RwLock<HashMap<String, Arc<dyn EmailProvider>>>>;

pub struct EmailServiceManager {
    config: ManagerConfig,
    workflow: Arc<EmailToTicketWorkflow>,
    queue: Arc<EmailProcessingQueue>,
    providers: ProviderMap,
    state: Mutex<ManagerState>,
    shutdown: Arc<AtomicBool>,
    trigger_tx: broadcast::Sender<()>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
    last_poll: Arc<Mutex<Option<DateTime<Utc>>>>,
}

impl EmailServiceManager {
    pub fn new(
        config: &Config,
        db: Database,
        permissions: Arc<dyn PermissionChecker>,
    ) -> Result<Self> {
        let workflow = Arc::new(EmailToTicketWorkflow::new(config, db.clone(), permissions)?);
        let providers: ProviderMap = Arc::new(RwLock::new(HashMap::new()));

        let handler = Arc::new(ManagerJobHandler {
            workflow: Arc::clone(&workflow),
            providers: Arc::clone(&providers),
            audit: EmailAuditService::new(db.clone()),
            retention: config.retention.clone(),
            db: db.clone(),
        });
        let queue = Arc::new(EmailProcessingQueue::new(
            &config.queue,
            db,
            handler,
            config.worker_count,
        ));

        let (trigger_tx, _) = broadcast::channel(16);
        Ok(Self {
            config: config.manager.clone(),
            workflow,
            queue,
            providers,
            state: Mutex::new(ManagerState::Stopped),
            shutdown: Arc::new(AtomicBool::new(false)),
            trigger_tx,
            scheduler: Mutex::new(None),
            last_poll: Arc::new(Mutex::new(None)),
        })
    }

    pub fn state(&self) -> ManagerState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn queue(&self) -> &EmailProcessingQueue {
        &self.queue
    }

    pub fn workflow(&self) -> &EmailToTicketWorkflow {
        &self.workflow
    }

    /// Registers a provider. Providers registered after start are picked
    /// up on the next poll.
    pub fn register_provider(&self, provider: Arc<dyn EmailProvider>) {
        let id = provider.id().to_string();
        self.providers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), provider);
        info!("Registered provider '{}'", id);
    }

    /// Starts the queue, probes every provider and spawns the scheduler.
    /// A provider that fails its probe is logged and left registered; the
    /// poll cycle will retry it.
    pub fn start(&self) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state != ManagerState::Stopped {
                return Ok(());
            }
            *state = ManagerState::Starting;
        }
        self.shutdown.store(false, Ordering::Release);
        self.queue.start();

        for (id, provider) in self
            .providers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
        {
            let probe = provider
                .initialize()
                .and_then(|_| provider.authenticate())
                .and_then(|_| provider.test_connection());
            match probe {
                Ok(()) => info!("Provider '{}' is reachable", id),
                Err(e) => warn!("Provider '{}' failed its startup probe: {}", id, e),
            }
        }

        *self.scheduler.lock().unwrap_or_else(|e| e.into_inner()) =
            Some(self.spawn_scheduler());
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = ManagerState::Running;
        info!("Service manager running");
        Ok(())
    }

    /// Stops the scheduler and the queue, then clears the service caches.
    pub fn stop(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state != ManagerState::Running {
                return;
            }
            *state = ManagerState::Stopping;
        }
        self.shutdown.store(true, Ordering::Release);
        // Wake the select loop so it observes the flag.
        let _ = self.trigger_tx.send(());

        if let Some(handle) = self
            .scheduler
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            if handle.join().is_err() {
                error!("Scheduler thread panicked during shutdown");
            }
        }
        self.queue.stop();

        self.workflow.mapping_service().invalidate_cache();
        self.workflow.threading_service().clear_cache();

        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = ManagerState::Stopped;
        info!("Service manager stopped");
    }

    /// Requests a provider poll outside the regular schedule.
    pub fn trigger_poll(&self) {
        let _ = self.trigger_tx.send(());
    }

    fn spawn_scheduler(&self) -> JoinHandle<()> {
        let ticks = SchedulerTicks {
            config: self.config.clone(),
            queue: Arc::clone(&self.queue),
            providers: Arc::clone(&self.providers),
            last_poll: Arc::clone(&self.last_poll),
        };
        let shutdown = Arc::clone(&self.shutdown);
        let mut trigger_rx = self.trigger_tx.subscribe();

        std::thread::Builder::new()
            .name("mailtriage-scheduler".to_string())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!("Failed to build scheduler runtime: {}", e);
                        return;
                    }
                };

                rt.block_on(async {
                    let mut poll = tokio::time::interval(Duration::from_secs(
                        ticks.config.poll_interval_secs.max(1),
                    ));
                    let mut health = tokio::time::interval(Duration::from_secs(
                        ticks.config.health_check_interval_secs.max(1),
                    ));
                    let mut tokens = tokio::time::interval(Duration::from_secs(
                        ticks.config.token_refresh_interval_secs.max(1),
                    ));
                    let mut cleanup = tokio::time::interval(Duration::from_secs(
                        ticks.config.cleanup_interval_secs.max(1),
                    ));
                    // Skip the immediate first tick of every timer.
                    poll.tick().await;
                    health.tick().await;
                    tokens.tick().await;
                    cleanup.tick().await;

                    loop {
                        if shutdown.load(Ordering::Acquire) {
                            break;
                        }
                        tokio::select! {
                            _ = poll.tick() => ticks.poll_providers(),
                            _ = health.tick() => ticks.health_check(),
                            _ = tokens.tick() => ticks.enqueue_token_refresh(),
                            _ = cleanup.tick() => ticks.enqueue_cleanup(),
                            Ok(()) = trigger_rx.recv() => {
                                if shutdown.load(Ordering::Acquire) {
                                    break;
                                }
                                info!("Manual provider poll triggered");
                                ticks.poll_providers();
                            }
                        }
                    }
                });
            })
            .unwrap_or_else(|e| panic!("Failed to spawn scheduler thread: {}", e))
    }
}

impl Drop for EmailServiceManager {
    fn drop(&mut self) {
        self.stop();
    }
}

/// State shared with the scheduler thread; each method is one tick.
struct SchedulerTicks {
    config: ManagerConfig,
    queue: Arc<EmailProcessingQueue>,
    providers: ProviderMap,
    last_poll: Arc<Mutex<Option<DateTime<Utc>>>>,
}

impl SchedulerTicks {
    /// Fetches new messages from every provider and enqueues one
    /// ProcessEmail job per message. Already-recorded message ids are
    /// filtered by the workflow's idempotency gate, so a crash between
    /// enqueue and mark-as-read only costs a rejected duplicate job.
    fn poll_providers(&self) {
        let since = *self.last_poll.lock().unwrap_or_else(|e| e.into_inner());
        let providers: Vec<Arc<dyn EmailProvider>> = self
            .providers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();

        for provider in providers {
            let span = tracing::info_span!("provider_poll", provider = provider.id());
            let _guard = span.enter();

            let messages = match provider.fetch_messages(since, self.config.fetch_batch_size) {
                Ok(messages) => messages,
                Err(e) => {
                    warn!("Polling provider '{}' failed: {}", provider.id(), e);
                    continue;
                }
            };
            debug!(
                "Provider '{}' returned {} messages",
                provider.id(),
                messages.len()
            );

            for message in messages {
                let message_id = message.message_id.clone();
                let priority = match message.priority_hint {
                    Some(1) => 2,
                    Some(2) => 1,
                    _ => 0,
                };
                let payload = JobPayload::ProcessEmail {
                    provider_id: provider.id().to_string(),
                    message,
                };
                let context = json!({
                    "provider": provider.id(),
                    "message": sanitize::hash_message_id(&message_id),
                });
                match self.queue.add_job(&payload, priority, context) {
                    Ok(job_id) => {
                        debug!(
                            "Enqueued message {} as job {}",
                            sanitize::hash_message_id(&message_id),
                            job_id
                        );
                        if let Err(e) = provider.mark_as_read(&message_id) {
                            warn!(
                                "Failed to mark message {} read on '{}': {}",
                                sanitize::hash_message_id(&message_id),
                                provider.id(),
                                e
                            );
                        }
                    }
                    Err(e) => {
                        // Leave the message unread; the next poll retries it.
                        warn!("Could not enqueue message: {}", e);
                        break;
                    }
                }
            }
        }
        *self.last_poll.lock().unwrap_or_else(|e| e.into_inner()) = Some(Utc::now());
    }

    /// Logs warnings when the backlog or failure rate crosses the
    /// configured thresholds. Observation only.
    fn health_check(&self) {
        match self.queue.stats() {
            Ok(stats) => {
                if stats.pending > self.config.queue_warn_pending {
                    warn!(
                        "Queue backlog is {} pending jobs (threshold {})",
                        stats.pending, self.config.queue_warn_pending
                    );
                }
                let finished = stats.completed + stats.dead;
                if finished > 0 {
                    let rate = stats.completed as f64 / finished as f64;
                    if rate < self.config.min_success_rate {
                        warn!(
                            "Job success rate {:.2} is below the {:.2} threshold",
                            rate, self.config.min_success_rate
                        );
                    }
                }
            }
            Err(e) => warn!("Health check could not read queue stats: {}", e),
        }

        for (id, provider) in self
            .providers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
        {
            if let Err(e) = provider.test_connection() {
                warn!("Provider '{}' failed its health probe: {}", id, e);
            }
        }
    }

    fn enqueue_token_refresh(&self) {
        let ids: Vec<String> = self
            .providers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        for provider_id in ids {
            let payload = JobPayload::RefreshTokens {
                provider_id: provider_id.clone(),
            };
            if let Err(e) = self.queue.add_job(&payload, 1, json!({})) {
                warn!("Could not enqueue token refresh for '{}': {}", provider_id, e);
            }
        }
    }

    fn enqueue_cleanup(&self) {
        if let Err(e) = self.queue.add_job(&JobPayload::Cleanup, -1, json!({})) {
            warn!("Could not enqueue retention cleanup: {}", e);
        }
    }
}

/// Dispatches claimed jobs to the owning service.
struct ManagerJobHandler {
    workflow: Arc<EmailToTicketWorkflow>,
    providers: ProviderMap,
    audit: EmailAuditService,
    retention: RetentionConfig,
    db: Database,
}

impl JobHandler for ManagerJobHandler {
    fn handle(
        &self,
        payload: &JobPayload,
        _job: &crate::db::queue_repo::JobRow,
    ) -> std::result::Result<serde_json::Value, JobFailure> {
        match payload {
            JobPayload::ProcessEmail { message, .. } => {
                let outcome = self
                    .workflow
                    .process_message(message)
                    .map_err(workflow_failure)?;
                // Business rejections are final: retrying the same message
                // would only be rejected again.
                if let ProcessingOutcome::Rejected { reason } = &outcome {
                    return Err(JobFailure::Terminal(format!(
                        "Message rejected: {}",
                        reason.as_str()
                    )));
                }
                Ok(outcome_json(&outcome))
            }
            JobPayload::RefreshTokens { provider_id } => {
                let provider = self
                    .providers
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .get(provider_id)
                    .cloned()
                    .ok_or_else(|| {
                        JobFailure::Terminal(format!("Unknown provider '{}'", provider_id))
                    })?;
                provider
                    .refresh_tokens()
                    .map_err(|e| JobFailure::Retryable(e.to_string()))?;
                Ok(json!({ "provider": provider_id }))
            }
            JobPayload::Cleanup => self
                .run_cleanup()
                .map_err(|e| JobFailure::Retryable(e.to_string())),
        }
    }
}

/// Malformed messages can never process successfully; everything else
/// (database trouble, mostly) is worth another attempt.
fn workflow_failure(e: MailtriageError) -> JobFailure {
    match &e {
        MailtriageError::Workflow(
            WorkflowError::MissingSender | WorkflowError::InvalidSender(_),
        ) => JobFailure::Terminal(e.to_string()),
        _ => JobFailure::Retryable(e.to_string()),
    }
}

impl ManagerJobHandler {
    fn run_cleanup(&self) -> Result<serde_json::Value> {
        let now = Utc::now();
        let audit_cutoff =
            (now - chrono::Duration::days(self.retention.audit_days as i64)).to_rfc3339();
        let thread_cutoff =
            (now - chrono::Duration::days(self.retention.thread_days as i64)).to_rfc3339();
        let job_cutoff =
            (now - chrono::Duration::days(self.retention.job_days as i64)).to_rfc3339();

        let audit_purged = self.audit.purge_older_than(&audit_cutoff)?;
        let threads_purged = self
            .workflow
            .threading_service()
            .purge_inactive_before(&thread_cutoff)?;
        let jobs_purged = queue_repo::purge_finished_before(&self.db, &job_cutoff)?;

        info!(
            "Retention cleanup removed {} audit rows, {} threads, {} jobs",
            audit_purged, threads_purged, jobs_purged
        );
        Ok(json!({
            "audit_purged": audit_purged,
            "threads_purged": threads_purged,
            "jobs_purged": jobs_purged,
        }))
    }
}

fn outcome_json(outcome: &ProcessingOutcome) -> serde_json::Value {
    match outcome {
        ProcessingOutcome::Blocked { score, threats } => json!({
            "outcome": "blocked",
            "score": score,
            "threats": threats,
        }),
        ProcessingOutcome::Rejected { reason } => json!({
            "outcome": "rejected",
            "reason": reason.as_str(),
        }),
        ProcessingOutcome::ReplyAppended {
            ticket_id,
            ticket_number,
        } => json!({
            "outcome": "reply_appended",
            "ticket_id": ticket_id,
            "ticket_number": ticket_number,
        }),
        ProcessingOutcome::TicketCreated {
            ticket_id,
            ticket_number,
            quarantined,
            warnings,
        } => json!({
            "outcome": "ticket_created",
            "ticket_id": ticket_id,
            "ticket_number": ticket_number,
            "quarantined": quarantined,
            "warnings": warnings,
        }),
        ProcessingOutcome::DryRun { would_create_ticket } => json!({
            "outcome": "dry_run",
            "would_create_ticket": would_create_ticket,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::account_repo::{self, AccountRow};
    use crate::db::{message_repo, ticket_repo};
    use crate::provider::{InboundMessage, MockProvider};
    use crate::queue::JobEventKind;
    use crate::workflow::AllowAll;
    use std::time::Instant;

    fn test_config() -> Config {
        let mut config: Config = serde_json::from_str(r#"{"version": "1.0"}"#).unwrap();
        config.worker_count = 2;
        config.queue.poll_interval_secs = 1;
        config.queue.base_retry_delay_secs = 0;
        config
    }

    fn test_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        account_repo::insert(
            &db,
            &AccountRow {
                id: "acme".to_string(),
                name: "Acme Corp".to_string(),
                account_type: "ORGANIZATION".to_string(),
                parent_id: None,
                domains: vec!["acmecorp.com".to_string()],
                is_active: true,
                created_at: "2026-01-01T00:00:00Z".to_string(),
            },
        )
        .unwrap();
        db
    }

    fn inbound(id: &str, subject: &str) -> InboundMessage {
        InboundMessage {
            message_id: id.to_string(),
            sender: "jo@acmecorp.com".to_string(),
            sender_name: Some("Jo Smith".to_string()),
            subject: subject.to_string(),
            text_body: Some("I cannot log in since the update.".to_string()),
            ..Default::default()
        }
    }

    fn wait_for_jobs(manager: &EmailServiceManager, kind: JobEventKind, count: usize) {
        let events = manager.queue().events();
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut seen = 0;
        while seen < count {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .expect("timed out waiting for jobs");
            let event = events.recv_timeout(remaining).expect("event channel closed");
            if event.kind == kind {
                seen += 1;
            }
        }
    }

    fn wait_for_completion(manager: &EmailServiceManager, count: usize) {
        wait_for_jobs(manager, JobEventKind::Completed, count);
    }

    #[test]
    fn test_lifecycle_transitions() {
        let manager =
            EmailServiceManager::new(&test_config(), test_db(), Arc::new(AllowAll)).unwrap();
        assert_eq!(manager.state(), ManagerState::Stopped);

        manager.start().unwrap();
        assert_eq!(manager.state(), ManagerState::Running);
        assert!(manager.queue().is_running());

        // Starting twice is a no-op.
        manager.start().unwrap();
        assert_eq!(manager.state(), ManagerState::Running);

        manager.stop();
        assert_eq!(manager.state(), ManagerState::Stopped);
        assert!(!manager.queue().is_running());
    }

    #[test]
    fn test_failing_provider_does_not_block_start() {
        let manager =
            EmailServiceManager::new(&test_config(), test_db(), Arc::new(AllowAll)).unwrap();
        let provider = Arc::new(MockProvider::new("flaky"));
        provider.set_fail_connection(true);
        manager.register_provider(provider);

        manager.start().unwrap();
        assert_eq!(manager.state(), ManagerState::Running);
        manager.stop();
    }

    #[test]
    fn test_triggered_poll_creates_ticket_and_marks_read() {
        let db = test_db();
        let manager =
            EmailServiceManager::new(&test_config(), db.clone(), Arc::new(AllowAll)).unwrap();
        let provider = Arc::new(MockProvider::new("mock"));
        provider.push_message(inbound("m1", "Login broken"));
        manager.register_provider(provider.clone());

        manager.start().unwrap();
        manager.trigger_poll();
        wait_for_completion(&manager, 1);

        let row = message_repo::find_by_id(&db, "m1").unwrap().unwrap();
        assert_eq!(row.disposition, message_repo::disposition::PROCESSED);
        let ticket = ticket_repo::find_by_id(&db, row.ticket_id.as_deref().unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(ticket.account_id, "acme");
        assert!(provider.is_read("m1"));
        manager.stop();
    }

    #[test]
    fn test_repolled_message_stays_single_ticket() {
        let db = test_db();
        let manager =
            EmailServiceManager::new(&test_config(), db.clone(), Arc::new(AllowAll)).unwrap();
        let provider = Arc::new(MockProvider::new("mock"));
        provider.push_message(inbound("m1", "Login broken"));
        manager.register_provider(provider.clone());

        manager.start().unwrap();
        manager.trigger_poll();
        wait_for_completion(&manager, 1);

        // Simulate a re-delivery racing ahead of mark-as-read. The
        // duplicate is rejected and its job booked as failed, not retried.
        let dup_id = manager
            .queue()
            .add_job(
                &JobPayload::ProcessEmail {
                    provider_id: "mock".to_string(),
                    message: inbound("m1", "Login broken"),
                },
                0,
                json!({}),
            )
            .unwrap();
        wait_for_jobs(&manager, JobEventKind::Failed, 1);

        let job = manager.queue().job(&dup_id).unwrap().unwrap();
        assert_eq!(job.status, queue_repo::status::FAILED);
        assert_eq!(job.attempts, 1);

        let recent = ticket_repo::find_recent(&db, "acme", "2026-01-01T00:00:00Z").unwrap();
        assert_eq!(recent.len(), 1);
        manager.stop();
    }

    #[test]
    fn test_empty_sender_job_fails_without_retry() {
        let manager =
            EmailServiceManager::new(&test_config(), test_db(), Arc::new(AllowAll)).unwrap();
        manager.start().unwrap();

        let mut message = inbound("m-bad", "Hi");
        message.sender = "".to_string();
        let id = manager
            .queue()
            .add_job(
                &JobPayload::ProcessEmail {
                    provider_id: "mock".to_string(),
                    message,
                },
                0,
                json!({}),
            )
            .unwrap();
        wait_for_jobs(&manager, JobEventKind::Failed, 1);

        let job = manager.queue().job(&id).unwrap().unwrap();
        assert_eq!(job.status, queue_repo::status::FAILED);
        // A message with no sender never gets a second attempt.
        assert_eq!(job.attempts, 1);
        assert!(job.next_retry_at.is_none());
        manager.stop();
    }

    #[test]
    fn test_cleanup_job_applies_retention() {
        let db = test_db();
        let manager =
            EmailServiceManager::new(&test_config(), db.clone(), Arc::new(AllowAll)).unwrap();
        manager.start().unwrap();

        manager
            .queue()
            .add_job(&JobPayload::Cleanup, 0, json!({}))
            .unwrap();
        wait_for_completion(&manager, 1);
        manager.stop();
    }

    #[test]
    fn test_token_refresh_job_reaches_provider() {
        let manager =
            EmailServiceManager::new(&test_config(), test_db(), Arc::new(AllowAll)).unwrap();
        let provider = Arc::new(MockProvider::new("mock"));
        manager.register_provider(provider.clone());
        manager.start().unwrap();

        manager
            .queue()
            .add_job(
                &JobPayload::RefreshTokens {
                    provider_id: "mock".to_string(),
                },
                0,
                json!({}),
            )
            .unwrap();
        wait_for_completion(&manager, 1);
        assert_eq!(provider.token_refresh_count(), 1);
        manager.stop();
    }
}
