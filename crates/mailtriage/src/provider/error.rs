//! Email provider error types.

use thiserror::Error;

/// Errors that can occur while talking to an email provider.
#[derive(Error, Debug)]
pub enum ProviderError {
    /// Failed to reach the provider.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Authentication failed.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Provider was used before initialize() succeeded.
    #[error("Provider '{0}' is not initialized")]
    NotInitialized(String),

    /// Failed to parse a raw message.
    #[error("Failed to parse email: {0}")]
    ParseError(String),

    /// Requested message does not exist on the provider.
    #[error("Message '{0}' not found")]
    MessageNotFound(String),

    /// Requested attachment does not exist on the message.
    #[error("Attachment '{0}' not found on message '{1}'")]
    AttachmentNotFound(String, String),

    /// Token refresh failed.
    #[error("Token refresh failed: {0}")]
    TokenRefresh(String),

    /// Invalid provider configuration.
    #[error("Invalid provider configuration: {0}")]
    ConfigError(String),

    /// Operation timed out.
    #[error("Operation timed out: {0}")]
    Timeout(String),
}

/// Result type for provider operations.
pub type Result<T> = std::result::Result<T, ProviderError>;
