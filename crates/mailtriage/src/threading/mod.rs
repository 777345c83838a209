//! Conversation threading.
//!
//! Groups messages into threads using RFC headers first, the
//! provider's native conversation id second, and normalized-subject
//! matching within a time window last. Thread rows are cached with a
//! TTL; a merge invalidates both entries.

use chrono::{Duration, Utc};
use log::debug;
use moka::sync::Cache;

use crate::config::schema::ThreadingConfig;
use crate::db::thread_repo::{self, ThreadRow};
use crate::db::{message_repo, Database, DatabaseError};
use crate::provider::InboundMessage;

/// Prefixes stripped repeatedly during subject normalization.
const THREAD_PREFIXES: &[&str] = &["re:", "fwd:", "fw:", "aw:", "antw:", "wg:", "sv:"];

/// Result of attaching one message to a thread.
#[derive(Debug, Clone)]
pub struct ThreadingOutcome {
    pub thread: ThreadRow,
    pub is_new_thread: bool,
    /// Resolved parent within the thread, when one exists.
    pub parent_message_id: Option<String>,
    /// Depth of this message in the reply tree.
    pub depth: u32,
}

pub struct EmailThreadingService {
    config: ThreadingConfig,
    db: Database,
    cache: Cache<String, ThreadRow>,
}

impl EmailThreadingService {
    pub fn new(config: &ThreadingConfig, db: Database) -> Self {
        let cache = Cache::builder()
            .time_to_live(std::time::Duration::from_secs(config.cache_ttl_secs))
            .max_capacity(10_000)
            .build();
        Self {
            config: config.clone(),
            db,
            cache,
        }
    }

    /// Finds or creates the thread for a message and registers the
    /// message on it. The caller persists the message row itself using
    /// the returned parent and depth.
    pub fn thread_message(
        &self,
        message: &InboundMessage,
    ) -> Result<ThreadingOutcome, DatabaseError> {
        let now = Utc::now().to_rfc3339();

        if let Some(thread_id) = self.discover_thread(message)? {
            let thread = match self.cached_thread(&thread_id)? {
                Some(t) => t,
                // Cache pointed at a since-merged thread; recreate below.
                None => return self.create_thread(message, &now),
            };

            let (parent_message_id, depth) = self.resolve_parent(&thread.id, message)?;

            thread_repo::touch(&self.db, &thread.id, &message.sender, &now)?;
            self.cache.invalidate(&thread.id);

            let thread = thread_repo::find_by_id(&self.db, &thread.id)?.unwrap_or(thread);
            self.cache.insert(thread.id.clone(), thread.clone());

            debug!(
                "Message {} joined thread {} (depth {})",
                message.message_id, thread.id, depth
            );
            return Ok(ThreadingOutcome {
                thread,
                is_new_thread: false,
                parent_message_id,
                depth,
            });
        }

        self.create_thread(message, &now)
    }

    /// Merges the source thread into the target: messages reassigned,
    /// counters folded, both cache entries dropped.
    pub fn merge_threads(&self, source_id: &str, target_id: &str) -> Result<(), DatabaseError> {
        message_repo::reassign_thread(&self.db, source_id, target_id)?;
        thread_repo::absorb(&self.db, source_id, target_id)?;
        self.cache.invalidate(source_id);
        self.cache.invalidate(target_id);
        debug!("Merged thread {} into {}", source_id, target_id);
        Ok(())
    }

    /// Deletes threads idle since the cutoff.
    pub fn purge_inactive_before(&self, cutoff: &str) -> Result<u64, DatabaseError> {
        let deleted = thread_repo::delete_inactive_before(&self.db, cutoff)?;
        if deleted > 0 {
            self.cache.invalidate_all();
        }
        Ok(deleted)
    }

    pub fn clear_cache(&self) {
        self.cache.invalidate_all();
    }

    /// Read-only discovery: finds the thread this message would join
    /// without creating or touching anything.
    pub fn resolve_existing(
        &self,
        message: &InboundMessage,
    ) -> Result<Option<ThreadRow>, DatabaseError> {
        match self.discover_thread(message)? {
            Some(thread_id) => self.cached_thread(&thread_id),
            None => Ok(None),
        }
    }

    /// Discovery order: In-Reply-To, References, provider thread id,
    /// normalized subject within the merge window.
    fn discover_thread(&self, message: &InboundMessage) -> Result<Option<String>, DatabaseError> {
        if let Some(in_reply_to) = &message.in_reply_to {
            if let Some(thread_id) = message_repo::find_thread_id(&self.db, in_reply_to)? {
                return Ok(Some(thread_id));
            }
        }

        for reference in &message.references {
            if let Some(thread_id) = message_repo::find_thread_id(&self.db, reference)? {
                return Ok(Some(thread_id));
            }
        }

        if let Some(provider_id) = &message.provider_thread_id {
            if let Some(thread_id) =
                message_repo::find_thread_by_provider_id(&self.db, provider_id)?
            {
                return Ok(Some(thread_id));
            }
        }

        let normalized = normalize_subject(&message.subject);
        if !normalized.is_empty() {
            let since = (Utc::now()
                - Duration::hours(self.config.subject_window_hours as i64))
            .to_rfc3339();
            if let Some(thread) =
                thread_repo::find_by_normalized_subject(&self.db, &normalized, &since)?
            {
                return Ok(Some(thread.id));
            }
        }

        Ok(None)
    }

    /// Parent: In-Reply-To match in-thread, else the last References
    /// entry found in-thread, else the most recent thread message.
    /// Never fails to attach.
    fn resolve_parent(
        &self,
        thread_id: &str,
        message: &InboundMessage,
    ) -> Result<(Option<String>, u32), DatabaseError> {
        let parent = if let Some(in_reply_to) = &message.in_reply_to {
            match message_repo::find_by_id(&self.db, in_reply_to)? {
                Some(m) if m.thread_id.as_deref() == Some(thread_id) => Some(m),
                _ => None,
            }
        } else {
            None
        };

        let parent = match parent {
            Some(p) => Some(p),
            None => {
                let mut found = None;
                for reference in message.references.iter().rev() {
                    if let Some(m) = message_repo::find_by_id(&self.db, reference)? {
                        if m.thread_id.as_deref() == Some(thread_id) {
                            found = Some(m);
                            break;
                        }
                    }
                }
                found
            }
        };

        let parent = match parent {
            Some(p) => Some(p),
            None => message_repo::find_latest_in_thread(&self.db, thread_id)?,
        };

        match parent {
            Some(p) => {
                let depth = (p.depth + 1).min(self.config.max_depth);
                Ok((Some(p.message_id), depth))
            }
            None => Ok((None, 0)),
        }
    }

    fn cached_thread(&self, thread_id: &str) -> Result<Option<ThreadRow>, DatabaseError> {
        if let Some(hit) = self.cache.get(thread_id) {
            return Ok(Some(hit));
        }
        let thread = thread_repo::find_by_id(&self.db, thread_id)?;
        if let Some(t) = &thread {
            self.cache.insert(t.id.clone(), t.clone());
        }
        Ok(thread)
    }

    fn create_thread(
        &self,
        message: &InboundMessage,
        now: &str,
    ) -> Result<ThreadingOutcome, DatabaseError> {
        let thread = ThreadRow {
            id: uuid::Uuid::new_v4().to_string(),
            root_message_id: message.message_id.clone(),
            subject: message.subject.clone(),
            normalized_subject: normalize_subject(&message.subject),
            participants: vec![message.sender.clone()],
            message_count: 1,
            ticket_id: None,
            created_at: now.to_string(),
            last_activity_at: now.to_string(),
        };
        thread_repo::insert(&self.db, &thread)?;
        self.cache.insert(thread.id.clone(), thread.clone());

        debug!(
            "Created thread {} for message {}",
            thread.id, message.message_id
        );
        Ok(ThreadingOutcome {
            thread,
            is_new_thread: true,
            parent_message_id: None,
            depth: 0,
        })
    }

    /// Links a thread to the ticket created from it.
    pub fn link_ticket(&self, thread_id: &str, ticket_id: &str) -> Result<(), DatabaseError> {
        thread_repo::set_ticket(&self.db, thread_id, ticket_id)?;
        self.cache.invalidate(thread_id);
        Ok(())
    }
}

/// Strips repeated reply/forward prefixes, collapses whitespace and
/// case-folds. Idempotent: normalizing twice yields the same string.
pub fn normalize_subject(subject: &str) -> String {
    let mut current = subject.trim().to_lowercase();
    loop {
        let before = current.len();
        for prefix in THREAD_PREFIXES {
            if current.starts_with(prefix) {
                current = current[prefix.len()..].trim_start().to_string();
            }
        }
        if current.len() == before {
            break;
        }
    }
    current.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::message_repo::{disposition, MessageRow};

    fn service() -> (EmailThreadingService, Database) {
        let db = Database::open_in_memory().unwrap();
        (
            EmailThreadingService::new(&ThreadingConfig::default(), db.clone()),
            db,
        )
    }

    fn message(id: &str, subject: &str) -> InboundMessage {
        InboundMessage {
            message_id: id.to_string(),
            sender: "jo@acmecorp.com".to_string(),
            subject: subject.to_string(),
            text_body: Some("body".to_string()),
            ..Default::default()
        }
    }

    fn persist(db: &Database, id: &str, outcome: &ThreadingOutcome) {
        message_repo::insert(
            db,
            &MessageRow {
                message_id: id.to_string(),
                thread_id: Some(outcome.thread.id.clone()),
                parent_message_id: outcome.parent_message_id.clone(),
                depth: outcome.depth,
                provider_thread_id: None,
                sender: "jo@acmecorp.com".to_string(),
                sender_name: None,
                subject: "x".to_string(),
                disposition: disposition::PROCESSED.to_string(),
                ticket_id: None,
                received_at: Utc::now().to_rfc3339(),
            },
        )
        .unwrap();
    }

    #[test]
    fn test_normalize_subject_idempotent() {
        let once = normalize_subject("Re: RE: Fwd:  Login   Broken ");
        assert_eq!(once, "login broken");
        assert_eq!(normalize_subject(&once), once);
    }

    #[test]
    fn test_first_message_creates_thread() {
        let (service, _db) = service();
        let outcome = service.thread_message(&message("m1", "Login broken")).unwrap();
        assert!(outcome.is_new_thread);
        assert_eq!(outcome.depth, 0);
        assert_eq!(outcome.thread.root_message_id, "m1");
        assert_eq!(outcome.thread.normalized_subject, "login broken");
    }

    #[test]
    fn test_in_reply_to_joins_thread() {
        let (service, db) = service();
        let root = service.thread_message(&message("m1", "Login broken")).unwrap();
        persist(&db, "m1", &root);

        let mut reply = message("m2", "Re: Login broken");
        reply.in_reply_to = Some("m1".to_string());
        let outcome = service.thread_message(&reply).unwrap();

        assert!(!outcome.is_new_thread);
        assert_eq!(outcome.thread.id, root.thread.id);
        assert_eq!(outcome.parent_message_id.as_deref(), Some("m1"));
        assert_eq!(outcome.depth, 1);
        assert_eq!(outcome.thread.message_count, 2);
    }

    #[test]
    fn test_references_fallback() {
        let (service, db) = service();
        let root = service.thread_message(&message("m1", "Login broken")).unwrap();
        persist(&db, "m1", &root);

        let mut reply = message("m2", "Unrelated subject line");
        reply.references = vec!["unknown@x".to_string(), "m1".to_string()];
        let outcome = service.thread_message(&reply).unwrap();
        assert_eq!(outcome.thread.id, root.thread.id);
        assert_eq!(outcome.parent_message_id.as_deref(), Some("m1"));
    }

    #[test]
    fn test_provider_thread_id_fallback() {
        let (service, db) = service();
        let root = service.thread_message(&message("m1", "Login broken")).unwrap();
        message_repo::insert(
            &db,
            &MessageRow {
                message_id: "m1".to_string(),
                thread_id: Some(root.thread.id.clone()),
                parent_message_id: None,
                depth: 0,
                provider_thread_id: Some("conv-42".to_string()),
                sender: "jo@acmecorp.com".to_string(),
                sender_name: None,
                subject: "x".to_string(),
                disposition: disposition::PROCESSED.to_string(),
                ticket_id: None,
                received_at: Utc::now().to_rfc3339(),
            },
        )
        .unwrap();

        let mut next = message("m2", "Totally different");
        next.provider_thread_id = Some("conv-42".to_string());
        let outcome = service.thread_message(&next).unwrap();
        assert_eq!(outcome.thread.id, root.thread.id);
    }

    #[test]
    fn test_subject_match_within_window() {
        let (service, db) = service();
        let root = service.thread_message(&message("m1", "Login broken")).unwrap();
        persist(&db, "m1", &root);

        // No headers at all, just the same normalized subject.
        let outcome = service
            .thread_message(&message("m2", "RE: re: login  BROKEN"))
            .unwrap();
        assert!(!outcome.is_new_thread);
        assert_eq!(outcome.thread.id, root.thread.id);
        // Parent falls back to the latest message in the thread.
        assert_eq!(outcome.parent_message_id.as_deref(), Some("m1"));
    }

    #[test]
    fn test_subject_match_requires_exact_equality() {
        let (service, db) = service();
        let root = service.thread_message(&message("m1", "Login broken")).unwrap();
        persist(&db, "m1", &root);

        let outcome = service
            .thread_message(&message("m2", "Login broken again"))
            .unwrap();
        assert!(outcome.is_new_thread);
        assert_ne!(outcome.thread.id, root.thread.id);
    }

    #[test]
    fn test_depth_is_bounded() {
        let config = ThreadingConfig {
            max_depth: 2,
            ..Default::default()
        };
        let db = Database::open_in_memory().unwrap();
        let service = EmailThreadingService::new(&config, db.clone());

        let mut previous = "m0".to_string();
        let root = service.thread_message(&message(&previous, "Deep thread")).unwrap();
        persist(&db, &previous, &root);

        for i in 1..5 {
            let id = format!("m{}", i);
            let mut msg = message(&id, "Re: Deep thread");
            msg.in_reply_to = Some(previous.clone());
            let outcome = service.thread_message(&msg).unwrap();
            assert!(outcome.depth <= 2);
            persist(&db, &id, &outcome);
            previous = id;
        }
    }

    #[test]
    fn test_merge_invalidates_and_reassigns() {
        let (service, db) = service();
        let a = service.thread_message(&message("m1", "Subject A")).unwrap();
        persist(&db, "m1", &a);
        let b = service.thread_message(&message("m2", "Subject B")).unwrap();
        persist(&db, "m2", &b);

        service.merge_threads(&b.thread.id, &a.thread.id).unwrap();

        assert!(thread_repo::find_by_id(&db, &b.thread.id).unwrap().is_none());
        let target = thread_repo::find_by_id(&db, &a.thread.id).unwrap().unwrap();
        assert_eq!(target.message_count, 2);
        assert_eq!(
            message_repo::find_thread_id(&db, "m2").unwrap().as_deref(),
            Some(a.thread.id.as_str())
        );
    }

    #[test]
    fn test_link_ticket() {
        let (service, db) = service();
        let outcome = service.thread_message(&message("m1", "Login broken")).unwrap();
        service.link_ticket(&outcome.thread.id, "t-99").unwrap();

        let thread = thread_repo::find_by_id(&db, &outcome.thread.id).unwrap().unwrap();
        assert_eq!(thread.ticket_id.as_deref(), Some("t-99"));
    }
}
