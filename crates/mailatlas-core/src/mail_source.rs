use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::messages::Direction;

/// A raw message as delivered by the mail provider, before persistence.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedMessage {
    pub external_id: String,
    pub thread_id: String,
    pub direction: Direction,
    pub sent_at: DateTime<Utc>,
    pub from_email: String,
    pub from_name: Option<String>,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub subject: Option<String>,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
}

impl FetchedMessage {
    /// Plain-text body, converting from HTML when the provider gave us
    /// nothing else.
    pub fn normalized_body(&self) -> Option<String> {
        if let Some(text) = &self.body_text {
            return Some(text.clone());
        }
        let html = self.body_html.as_deref()?;
        Some(html2text::from_read(html.as_bytes(), 100))
    }
}

#[derive(Debug, Error)]
pub enum MailSourceError {
    #[error("mail source refused account {0}")]
    AuthMissing(String),
    #[error("mail source unavailable: {0}")]
    Unavailable(String),
}

impl MailSourceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, MailSourceError::Unavailable(_))
    }
}

/// Narrow view of the mail provider. Paging is the implementation's problem;
/// callers see complete, timestamp-ordered result sets.
#[async_trait]
pub trait MailSource: Send + Sync {
    /// Messages sent by the account owner since `since`.
    async fn list_sent(
        &self,
        account_email: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<FetchedMessage>, MailSourceError>;

    /// Bidirectional correspondence with `address` since `since`.
    async fn list_with(
        &self,
        account_email: &str,
        address: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<FetchedMessage>, MailSourceError>;
}

/// In-memory mail source for tests and local development. Failures can be
/// scripted to exercise retry paths.
#[derive(Default, Clone)]
pub struct MockMailSource {
    messages: Arc<Mutex<Vec<FetchedMessage>>>,
    failures: Arc<Mutex<VecDeque<MailSourceError>>>,
}

impl MockMailSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_message(&self, message: FetchedMessage) {
        self.messages.lock().expect("lock messages").push(message);
    }

    /// Queue an error to be returned by the next call before any data.
    pub fn push_failure(&self, error: MailSourceError) {
        self.failures.lock().expect("lock failures").push_back(error);
    }

    fn take_failure(&self) -> Option<MailSourceError> {
        self.failures.lock().expect("lock failures").pop_front()
    }

    fn sorted(&self, mut selected: Vec<FetchedMessage>) -> Vec<FetchedMessage> {
        selected.sort_by(|a, b| a.sent_at.cmp(&b.sent_at));
        selected
    }
}

#[async_trait]
impl MailSource for MockMailSource {
    async fn list_sent(
        &self,
        _account_email: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<FetchedMessage>, MailSourceError> {
        if let Some(error) = self.take_failure() {
            return Err(error);
        }
        let selected = self
            .messages
            .lock()
            .expect("lock messages")
            .iter()
            .filter(|m| m.direction == Direction::Outbound && m.sent_at >= since)
            .cloned()
            .collect();
        Ok(self.sorted(selected))
    }

    async fn list_with(
        &self,
        _account_email: &str,
        address: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<FetchedMessage>, MailSourceError> {
        if let Some(error) = self.take_failure() {
            return Err(error);
        }
        let address = address.to_lowercase();
        let selected = self
            .messages
            .lock()
            .expect("lock messages")
            .iter()
            .filter(|m| m.sent_at >= since)
            .filter(|m| {
                m.from_email.to_lowercase() == address
                    || m.to
                        .iter()
                        .chain(&m.cc)
                        .chain(&m.bcc)
                        .any(|addr| addr.to_lowercase() == address)
            })
            .cloned()
            .collect();
        Ok(self.sorted(selected))
    }
}
