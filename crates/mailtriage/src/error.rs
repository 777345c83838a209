use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MailtriageError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Provider error: {0}")]
    Provider(#[from] crate::provider::ProviderError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Schema validation failed: {errors}")]
    SchemaValidation { errors: String },

    #[error("Invalid pattern '{name}': {reason}")]
    InvalidPattern { name: String, reason: String },

    #[error("Invalid mapping rule '{id}': {reason}")]
    InvalidRule { id: String, reason: String },
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Queue is full ({active} active jobs, limit {limit})")]
    Full { active: u64, limit: u64 },

    #[error("Queue is not running")]
    NotRunning,

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Invalid job payload: {0}")]
    InvalidPayload(String),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),
}

#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("Message has no sender address")]
    MissingSender,

    #[error("Invalid sender address: {0}")]
    InvalidSender(String),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),
}

pub type Result<T> = std::result::Result<T, MailtriageError>;
