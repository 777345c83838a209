//! Email-to-ticket orchestration.
//!
//! Sequences the pipeline for one message: idempotency check, security
//! gate, parse, confidence gate, reply handling, account mapping,
//! duplicate detection, permission gate, threading, ticket creation.
//! Ticket creation is the last persistent step so a timed-out job
//! leaves as little partial state as possible.

pub mod similarity;

use std::sync::Arc;

use chrono::{Datelike, Duration, Utc};
use log::{debug, warn};
use serde_json::json;

use crate::audit::{outcome, EmailAuditService};
use crate::config::schema::Config;
use crate::db::message_repo::{self, disposition, MessageRow};
use crate::db::ticket_repo::{self, NewTicket};
use crate::db::Database;
use crate::error::{Result, WorkflowError};
use crate::mapping::{AccountMapping, AccountMappingService};
use crate::parser::{EmailParser, ParsedTicketData};
use crate::provider::InboundMessage;
use crate::security::EmailSecurityService;
use crate::threading::{EmailThreadingService, ThreadingOutcome};

/// Permission lookup consumed by the workflow. The pipeline itself has
/// no notion of roles; the host system decides.
pub trait PermissionChecker: Send + Sync {
    fn has_permission(&self, actor: &str, resource: &str, action: &str, account_id: &str) -> bool;
}

/// Grants everything. Used when no host permission system is wired in.
pub struct AllowAll;

impl PermissionChecker for AllowAll {
    fn has_permission(&self, _: &str, _: &str, _: &str, _: &str) -> bool {
        true
    }
}

/// Why a message did not produce a ticket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectionReason {
    AlreadyProcessed,
    LowConfidence { confidence: u32, minimum: u32 },
    Unmapped,
    Duplicate { ticket_number: String },
    PermissionDenied,
}

impl RejectionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionReason::AlreadyProcessed => "already_processed",
            RejectionReason::LowConfidence { .. } => "low_confidence",
            RejectionReason::Unmapped => "unmapped",
            RejectionReason::Duplicate { .. } => "duplicate",
            RejectionReason::PermissionDenied => "permission_denied",
        }
    }
}

/// Terminal result of processing one message.
#[derive(Debug, Clone)]
pub enum ProcessingOutcome {
    /// Security score met the block threshold; nothing was created.
    Blocked { score: u32, threats: Vec<String> },
    /// A gate rejected the message; nothing was created.
    Rejected { reason: RejectionReason },
    /// The message was a reply to an existing ticket.
    ReplyAppended {
        ticket_id: String,
        ticket_number: String,
    },
    /// A new ticket was created.
    TicketCreated {
        ticket_id: String,
        ticket_number: String,
        quarantined: bool,
        warnings: Vec<String>,
    },
    /// Dry-run mode: all gates passed, nothing persisted.
    DryRun { would_create_ticket: bool },
}

pub struct EmailToTicketWorkflow {
    config: crate::config::schema::WorkflowConfig,
    db: Database,
    parser: EmailParser,
    security: EmailSecurityService,
    mapping: AccountMappingService,
    threading: EmailThreadingService,
    audit: EmailAuditService,
    permissions: Arc<dyn PermissionChecker>,
}

impl EmailToTicketWorkflow {
    pub fn new(
        config: &Config,
        db: Database,
        permissions: Arc<dyn PermissionChecker>,
    ) -> Result<Self> {
        let audit = EmailAuditService::new(db.clone());
        Ok(Self {
            config: config.workflow.clone(),
            parser: EmailParser::new(&config.parser)?,
            security: EmailSecurityService::new(&config.security, db.clone(), audit.clone())?,
            mapping: AccountMappingService::new(&config.mapping, db.clone()),
            threading: EmailThreadingService::new(&config.threading, db.clone()),
            audit,
            db,
            permissions,
        })
    }

    pub fn mapping_service(&self) -> &AccountMappingService {
        &self.mapping
    }

    pub fn threading_service(&self) -> &EmailThreadingService {
        &self.threading
    }

    /// Processes one message end to end.
    pub fn process_message(&self, message: &InboundMessage) -> Result<ProcessingOutcome> {
        if message.sender.trim().is_empty() {
            return Err(WorkflowError::MissingSender.into());
        }
        if !message.sender.contains('@') {
            return Err(WorkflowError::InvalidSender(message.sender.clone()).into());
        }

        let actor = self.config.system_actor.clone();

        // Idempotency: a message id is processed at most once.
        if message_repo::exists(&self.db, &message.message_id)? {
            debug!("Message {} already processed, skipping", message.message_id);
            return Ok(ProcessingOutcome::Rejected {
                reason: RejectionReason::AlreadyProcessed,
            });
        }

        // Security gate runs before any parsing effort.
        let security = self.security.check(message)?;
        if security.score >= self.config.block_threshold {
            if !self.config.dry_run {
                self.record_message(message, None, disposition::BLOCKED, None)?;
            }
            self.audit.log_event(
                "email",
                &message.message_id,
                &actor,
                "blocked",
                outcome::FAILURE,
                json!({ "score": security.score, "threats": security.threats }),
            );
            return Ok(ProcessingOutcome::Blocked {
                score: security.score,
                threats: security.threats,
            });
        }
        let quarantined = security.score >= self.config.quarantine_threshold;
        let mut warnings = security.warnings.clone();

        let parsed = self.parser.parse(message);
        self.audit.log_event(
            "email",
            &message.message_id,
            &actor,
            "parsed",
            outcome::SUCCESS,
            json!({
                "confidence": parsed.confidence,
                "priority": parsed.priority.as_str(),
                "is_reply": parsed.is_reply,
            }),
        );

        if parsed.confidence < self.config.minimum_confidence {
            if !self.config.dry_run {
                self.record_message(message, None, disposition::REJECTED, None)?;
            }
            self.audit.log_event(
                "email",
                &message.message_id,
                &actor,
                "rejected",
                outcome::FAILURE,
                json!({ "reason": "low_confidence", "confidence": parsed.confidence }),
            );
            return Ok(ProcessingOutcome::Rejected {
                reason: RejectionReason::LowConfidence {
                    confidence: parsed.confidence,
                    minimum: self.config.minimum_confidence,
                },
            });
        }

        // Reply to an existing ticket, named by number?
        let mut message = message.clone();
        let mut parsed = parsed;
        if parsed.is_reply {
            if let Some(number) = &parsed.referenced_ticket {
                match ticket_repo::find_by_number(&self.db, number)? {
                    Some(ticket) => {
                        if self.config.dry_run {
                            return Ok(ProcessingOutcome::DryRun {
                                would_create_ticket: false,
                            });
                        }
                        return self.append_reply(&message, &parsed, ticket);
                    }
                    None => {
                        // Referenced ticket is gone: treat the message as
                        // a fresh request, with the stale reference removed.
                        warn!(
                            "Message {} references unknown ticket {}",
                            message.message_id, number
                        );
                        warnings.push(format!("Referenced ticket {} not found", number));
                        message.subject = self.parser.strip_ticket_numbers(&message.subject);
                        if let Some(body) = &message.text_body {
                            message.text_body = Some(self.parser.strip_ticket_numbers(body));
                        }
                        message.in_reply_to = None;
                        message.references.clear();
                        parsed = self.parser.parse(&message);
                    }
                }
            }
        }

        // Reply without a number: resolve through the thread it would
        // join (headers first, then subject matching).
        if parsed.is_reply {
            if let Some(thread) = self.threading.resolve_existing(&message)? {
                if let Some(ticket) = thread
                    .ticket_id
                    .as_deref()
                    .map(|id| ticket_repo::find_by_id(&self.db, id))
                    .transpose()?
                    .flatten()
                {
                    if self.config.dry_run {
                        return Ok(ProcessingOutcome::DryRun {
                            would_create_ticket: false,
                        });
                    }
                    return self.append_reply(&message, &parsed, ticket);
                }
            }
        }

        // Dry-run must leave no rows behind, so mapping runs read-only.
        let mapping = if self.config.dry_run {
            self.mapping.preview(&message)?
        } else {
            self.mapping.map(&message)?
        };
        let mapping = match mapping {
            Some(mapping) => mapping,
            None => {
                if !self.config.dry_run {
                    self.record_message(&message, None, disposition::REJECTED, None)?;
                }
                self.audit.log_event(
                    "email",
                    &message.message_id,
                    &actor,
                    "rejected",
                    outcome::FAILURE,
                    json!({ "reason": "unmapped" }),
                );
                return Ok(ProcessingOutcome::Rejected {
                    reason: RejectionReason::Unmapped,
                });
            }
        };
        self.audit.log_event(
            "email",
            &message.message_id,
            &actor,
            "account_mapped",
            outcome::SUCCESS,
            json!({
                "account_id": mapping.account_id,
                "method": mapping.method.as_str(),
                "confidence": mapping.confidence,
            }),
        );

        if !self.config.allow_duplicates {
            if let Some(number) = self.find_duplicate(&mapping.account_id, &parsed.subject)? {
                if !self.config.dry_run {
                    self.record_message(&message, None, disposition::REJECTED, None)?;
                }
                self.audit.log_event(
                    "email",
                    &message.message_id,
                    &actor,
                    "rejected",
                    outcome::FAILURE,
                    json!({ "reason": "duplicate", "ticket_number": number }),
                );
                return Ok(ProcessingOutcome::Rejected {
                    reason: RejectionReason::Duplicate {
                        ticket_number: number,
                    },
                });
            }
        }

        if !self.config.skip_permission_check
            && !self
                .permissions
                .has_permission(&actor, "ticket", "create", &mapping.account_id)
        {
            self.audit.log_access(
                "account",
                &mapping.account_id,
                &actor,
                "create_ticket",
                outcome::FAILURE,
                json!({ "message_id": message.message_id }),
            );
            if !self.config.dry_run {
                self.record_message(&message, None, disposition::REJECTED, None)?;
            }
            return Ok(ProcessingOutcome::Rejected {
                reason: RejectionReason::PermissionDenied,
            });
        }

        if self.config.dry_run {
            return Ok(ProcessingOutcome::DryRun {
                would_create_ticket: true,
            });
        }

        let threading = self.threading.thread_message(&message)?;
        self.create_ticket(&message, &parsed, &mapping, &threading, quarantined, warnings)
    }

    fn append_reply(
        &self,
        message: &InboundMessage,
        parsed: &ParsedTicketData,
        ticket: ticket_repo::TicketRow,
    ) -> Result<ProcessingOutcome> {
        let now = Utc::now().to_rfc3339();
        let threading = self.threading.thread_message(message)?;

        ticket_repo::add_comment(
            &self.db,
            &ticket.id,
            Some(&message.sender),
            &parsed.description,
            &now,
        )?;

        // A reply reopens finished tickets; open ones just get touched.
        let status = match ticket.status.as_str() {
            "RESOLVED" | "CLOSED" => "OPEN",
            other => other,
        };
        ticket_repo::update_status(&self.db, &ticket.id, status, &now)?;

        self.record_message(
            message,
            Some(&threading),
            disposition::PROCESSED,
            Some(&ticket.id),
        )?;
        if threading.thread.ticket_id.is_none() {
            self.threading.link_ticket(&threading.thread.id, &ticket.id)?;
        }

        self.audit.log_event(
            "ticket",
            &ticket.id,
            &self.config.system_actor,
            "reply_appended",
            outcome::SUCCESS,
            json!({ "message_id": message.message_id, "ticket_number": ticket.number }),
        );

        Ok(ProcessingOutcome::ReplyAppended {
            ticket_id: ticket.id,
            ticket_number: ticket.number,
        })
    }

    /// Recent tickets on the account whose title contains the first 50
    /// characters of the subject, confirmed by exact case-insensitive
    /// equality or similarity above 0.8.
    fn find_duplicate(
        &self,
        account_id: &str,
        subject: &str,
    ) -> Result<Option<String>> {
        let since = (Utc::now() - Duration::hours(self.config.duplicate_window_hours as i64))
            .to_rfc3339();
        let recent = ticket_repo::find_recent(&self.db, account_id, &since)?;

        let needle: String = subject.chars().take(50).collect::<String>().to_lowercase();
        if needle.is_empty() {
            return Ok(None);
        }
        let subject_lower = subject.to_lowercase();

        for ticket in recent {
            let title_lower = ticket.title.to_lowercase();
            if !title_lower.contains(&needle) {
                continue;
            }
            if title_lower == subject_lower || similarity::ratio(&title_lower, &subject_lower) > 0.8
            {
                return Ok(Some(ticket.number));
            }
        }
        Ok(None)
    }

    fn create_ticket(
        &self,
        message: &InboundMessage,
        parsed: &ParsedTicketData,
        mapping: &AccountMapping,
        threading: &ThreadingOutcome,
        quarantined: bool,
        warnings: Vec<String>,
    ) -> Result<ProcessingOutcome> {
        let now = Utc::now();

        let mut custom_fields = serde_json::Map::new();
        for (k, v) in &parsed.custom_fields {
            custom_fields.insert(k.clone(), json!(v));
        }
        custom_fields.insert("source_message_id".into(), json!(message.message_id));
        custom_fields.insert("parsing_confidence".into(), json!(parsed.confidence));
        custom_fields.insert(
            "extraction_method".into(),
            json!(parsed.extraction_method.as_str()),
        );
        custom_fields.insert("mapping_method".into(), json!(mapping.method.as_str()));
        custom_fields.insert("mapping_confidence".into(), json!(mapping.confidence));
        custom_fields.insert("quarantined".into(), json!(quarantined));

        let new_ticket = NewTicket {
            title: parsed.subject.clone(),
            description: parsed.description.clone(),
            priority: parsed.priority.as_str().to_string(),
            category: parsed.category.clone(),
            account_id: mapping.account_id.clone(),
            account_name: mapping.account_name.clone(),
            member_id: mapping.member_id.clone(),
            creator: self.config.system_actor.clone(),
            source_message_id: Some(message.message_id.clone()),
            custom_fields: serde_json::Value::Object(custom_fields).to_string(),
        };

        let ticket = ticket_repo::create_with_number(
            &self.db,
            &new_ticket,
            now.year(),
            &now.to_rfc3339(),
        )?;

        if threading.thread.ticket_id.is_none() {
            self.threading.link_ticket(&threading.thread.id, &ticket.id)?;
        }
        let message_disposition = if quarantined {
            disposition::QUARANTINED
        } else {
            disposition::PROCESSED
        };
        self.record_message(message, Some(threading), message_disposition, Some(&ticket.id))?;

        self.audit.log_event(
            "ticket",
            &ticket.id,
            &self.config.system_actor,
            "ticket_created",
            outcome::SUCCESS,
            json!({
                "ticket_number": ticket.number,
                "message_id": message.message_id,
                "quarantined": quarantined,
            }),
        );

        Ok(ProcessingOutcome::TicketCreated {
            ticket_id: ticket.id,
            ticket_number: ticket.number,
            quarantined,
            warnings,
        })
    }

    fn record_message(
        &self,
        message: &InboundMessage,
        threading: Option<&ThreadingOutcome>,
        disposition: &str,
        ticket_id: Option<&str>,
    ) -> Result<()> {
        let received_at = message
            .received_at
            .map(|d| d.to_rfc3339())
            .unwrap_or_else(|| Utc::now().to_rfc3339());
        message_repo::insert(
            &self.db,
            &MessageRow {
                message_id: message.message_id.clone(),
                thread_id: threading.map(|t| t.thread.id.clone()),
                parent_message_id: threading.and_then(|t| t.parent_message_id.clone()),
                depth: threading.map(|t| t.depth).unwrap_or(0),
                provider_thread_id: message.provider_thread_id.clone(),
                sender: message.sender.to_lowercase(),
                sender_name: message.sender_name.clone(),
                subject: message.subject.clone(),
                disposition: disposition.to_string(),
                ticket_id: ticket_id.map(|t| t.to_string()),
                received_at,
            },
        )?;
        Ok(())
    }
}
