//! Email provider abstraction.
//!
//! A provider delivers inbound messages in a normalized shape so the
//! rest of the pipeline never touches provider-specific payloads.

pub mod error;
pub mod mock;
pub mod raw;

pub use error::{ProviderError, Result};
pub use mock::MockProvider;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A normalized inbound email message. Serializable so it can travel
/// as a job payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Provider-scoped unique message id (Message-ID header where available).
    pub message_id: String,
    /// Sender email address, lowercased.
    pub sender: String,
    /// Sender display name, if present.
    pub sender_name: Option<String>,
    pub recipients: Vec<String>,
    pub subject: String,
    pub text_body: Option<String>,
    pub html_body: Option<String>,
    /// Selected headers with textual values, lowercased names.
    pub headers: HashMap<String, String>,
    /// In-Reply-To header value, if present.
    pub in_reply_to: Option<String>,
    /// References header values, oldest first.
    pub references: Vec<String>,
    /// Provider-native conversation id, when the provider has one.
    pub provider_thread_id: Option<String>,
    /// X-Priority style hint (1 = highest, 5 = lowest).
    pub priority_hint: Option<u8>,
    pub received_at: Option<chrono::DateTime<chrono::Utc>>,
    pub attachments: Vec<MessageAttachment>,
}

impl InboundMessage {
    /// Preferred body for content analysis: text part, falling back to HTML.
    pub fn body(&self) -> &str {
        self.text_body
            .as_deref()
            .or(self.html_body.as_deref())
            .unwrap_or("")
    }
}

/// An attachment on an inbound message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageAttachment {
    pub filename: String,
    pub mime_type: String,
    pub size: u64,
    pub is_inline: bool,
    pub content: Vec<u8>,
}

/// A source of inbound email. Implementations wrap a concrete mailbox
/// protocol or API; `MockProvider` backs tests.
pub trait EmailProvider: Send + Sync {
    /// Stable identifier used in logs and job context.
    fn id(&self) -> &str;

    /// Prepares the provider for use. Must be called before any fetch.
    fn initialize(&self) -> Result<()>;

    /// (Re)authenticates with the provider.
    fn authenticate(&self) -> Result<()>;

    /// Cheap connectivity probe.
    fn test_connection(&self) -> Result<()>;

    /// Unread messages received since the given time, oldest first.
    fn fetch_messages(
        &self,
        since: Option<chrono::DateTime<chrono::Utc>>,
        limit: usize,
    ) -> Result<Vec<InboundMessage>>;

    /// A single message by id.
    fn fetch_message(&self, message_id: &str) -> Result<InboundMessage>;

    /// Full content of a named attachment.
    fn fetch_attachment(&self, message_id: &str, filename: &str) -> Result<Vec<u8>>;

    /// Marks a message as read so it is not fetched again.
    fn mark_as_read(&self, message_id: &str) -> Result<()>;

    /// Refreshes expiring credentials. Providers without token auth
    /// return Ok(()).
    fn refresh_tokens(&self) -> Result<()> {
        Ok(())
    }
}
