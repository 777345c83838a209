//! In-memory provider for tests and local development.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use super::error::{ProviderError, Result};
use super::{EmailProvider, InboundMessage};

/// An [`EmailProvider`] backed by a fixed set of in-memory messages.
pub struct MockProvider {
    id: String,
    messages: Mutex<Vec<InboundMessage>>,
    read_ids: Mutex<HashSet<String>>,
    initialized: AtomicBool,
    fail_connection: AtomicBool,
    token_refreshes: Mutex<u32>,
}

impl MockProvider {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            messages: Mutex::new(Vec::new()),
            read_ids: Mutex::new(HashSet::new()),
            initialized: AtomicBool::new(false),
            fail_connection: AtomicBool::new(false),
            token_refreshes: Mutex::new(0),
        }
    }

    /// Queues a message for delivery on the next fetch.
    pub fn push_message(&self, message: InboundMessage) {
        self.messages.lock().unwrap().push(message);
    }

    /// Makes connectivity probes fail until cleared.
    pub fn set_fail_connection(&self, fail: bool) {
        self.fail_connection.store(fail, Ordering::SeqCst);
    }

    pub fn is_read(&self, message_id: &str) -> bool {
        self.read_ids.lock().unwrap().contains(message_id)
    }

    pub fn token_refresh_count(&self) -> u32 {
        *self.token_refreshes.lock().unwrap()
    }
}

impl EmailProvider for MockProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn initialize(&self) -> Result<()> {
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn authenticate(&self) -> Result<()> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(ProviderError::NotInitialized(self.id.clone()));
        }
        Ok(())
    }

    fn test_connection(&self) -> Result<()> {
        if self.fail_connection.load(Ordering::SeqCst) {
            return Err(ProviderError::ConnectionFailed("mock outage".to_string()));
        }
        Ok(())
    }

    fn fetch_messages(
        &self,
        since: Option<chrono::DateTime<chrono::Utc>>,
        limit: usize,
    ) -> Result<Vec<InboundMessage>> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(ProviderError::NotInitialized(self.id.clone()));
        }
        let read = self.read_ids.lock().unwrap();
        let messages = self.messages.lock().unwrap();
        Ok(messages
            .iter()
            .filter(|m| !read.contains(&m.message_id))
            .filter(|m| match (since, m.received_at) {
                (Some(since), Some(at)) => at >= since,
                _ => true,
            })
            .take(limit)
            .cloned()
            .collect())
    }

    fn fetch_message(&self, message_id: &str) -> Result<InboundMessage> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .find(|m| m.message_id == message_id)
            .cloned()
            .ok_or_else(|| ProviderError::MessageNotFound(message_id.to_string()))
    }

    fn fetch_attachment(&self, message_id: &str, filename: &str) -> Result<Vec<u8>> {
        let message = self.fetch_message(message_id)?;
        message
            .attachments
            .iter()
            .find(|a| a.filename == filename)
            .map(|a| a.content.clone())
            .ok_or_else(|| {
                ProviderError::AttachmentNotFound(filename.to_string(), message_id.to_string())
            })
    }

    fn mark_as_read(&self, message_id: &str) -> Result<()> {
        self.read_ids.lock().unwrap().insert(message_id.to_string());
        Ok(())
    }

    fn refresh_tokens(&self) -> Result<()> {
        *self.token_refreshes.lock().unwrap() += 1;
        Ok(())
    }
}
