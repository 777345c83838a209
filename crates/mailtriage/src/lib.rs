pub mod audit;
pub mod config;
pub mod db;
pub mod error;
pub mod manager;
pub mod mapping;
pub mod parser;
pub mod provider;
pub mod queue;
pub mod sanitize;
pub mod security;
pub mod threading;
pub mod workflow;

pub use audit::EmailAuditService;
pub use config::{load_config, load_config_from_str, Config};
pub use db::Database;
pub use error::{ConfigError, MailtriageError, QueueError, Result, WorkflowError};
pub use manager::{EmailServiceManager, ManagerState};
pub use mapping::{AccountMapping, AccountMappingService, MappingMethod};
pub use parser::{EmailParser, ParsedTicketData, Priority};
pub use provider::{EmailProvider, InboundMessage, MessageAttachment, MockProvider, ProviderError};
pub use queue::{EmailProcessingQueue, JobEvent, JobEventKind, JobFailure, JobHandler, JobPayload};
pub use security::{EmailSecurityService, RiskLevel, SecurityCheckResult};
pub use threading::{normalize_subject, EmailThreadingService, ThreadingOutcome};
pub use workflow::{
    AllowAll, EmailToTicketWorkflow, PermissionChecker, ProcessingOutcome, RejectionReason,
};
