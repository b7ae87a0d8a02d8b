use std::sync::Arc;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use futures::StreamExt;
use libsql::params;
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::accounts::Account;
use crate::backoff::MAIL_FETCH;
use crate::config::PipelineConfig;
use crate::contacts::{Contact, ContactError, ContactRepository, TrustTier};
use crate::db::{Database, DbError};
use crate::mail_source::{FetchedMessage, MailSource, MailSourceError};
use crate::messages::{MessageError, MessageRepository, NewMessage};
use crate::threads::{ThreadError, ThreadRepository};

/// Concurrent per-contact fetches.
const CONTACT_FETCH_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct IngestOutcome {
    pub contacts: usize,
    pub fetched_messages: usize,
    pub new_messages: usize,
    pub threads: usize,
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("mail source error: {0}")]
    MailSource(#[from] MailSourceError),
    #[error("contact error: {0}")]
    Contact(#[from] ContactError),
    #[error("message error: {0}")]
    Message(#[from] MessageError),
    #[error("thread error: {0}")]
    Thread(#[from] ThreadError),
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("ingest cancelled")]
    Cancelled,
}

#[derive(Debug, Default)]
struct ContactIngestStats {
    fetched: usize,
    new: usize,
}

/// Fetches bidirectional correspondence for every trusted contact,
/// deduplicates against the store, and regenerates threads.
pub struct MessageIngester {
    db: Database,
    contacts: ContactRepository,
    messages: MessageRepository,
    threads: ThreadRepository,
    mail_source: Arc<dyn MailSource>,
    config: PipelineConfig,
}

impl MessageIngester {
    pub fn new(db: Database, mail_source: Arc<dyn MailSource>, config: PipelineConfig) -> Self {
        Self {
            contacts: ContactRepository::new(db.clone()),
            messages: MessageRepository::new(db.clone()),
            threads: ThreadRepository::new(db.clone()),
            db,
            mail_source,
            config,
        }
    }

    pub async fn run(
        &self,
        account: &Account,
        cancel: &CancellationToken,
        on_progress: impl Fn(f64) + Send + Sync,
    ) -> Result<IngestOutcome, IngestError> {
        let contacts = self
            .contacts
            .list(&account.id, Some(&[TrustTier::Tier1, TrustTier::Tier2]))
            .await?;
        let window_start = Utc::now() - Duration::days(self.config.ingest_window_days as i64);

        let total = contacts.len().max(1);
        let mut outcome = IngestOutcome {
            contacts: contacts.len(),
            ..Default::default()
        };

        let mut stream = futures::stream::iter(
            contacts
                .iter()
                .map(|contact| async move {
                    self.ingest_contact(account, contact, window_start, cancel)
                        .await
                }),
        )
        .buffer_unordered(CONTACT_FETCH_CONCURRENCY);

        let mut done = 0usize;
        while let Some(result) = stream.next().await {
            let stats = result?;
            outcome.fetched_messages += stats.fetched;
            outcome.new_messages += stats.new;
            done += 1;
            // Thread regeneration takes the last slice of the phase.
            on_progress(0.9 * done as f64 / total as f64);
        }
        drop(stream);

        if cancel.is_cancelled() {
            return Err(IngestError::Cancelled);
        }

        outcome.threads = self.threads.rebuild_for_account(&account.id).await?;
        on_progress(1.0);

        info!(
            account_id = %account.id,
            contacts = outcome.contacts,
            fetched = outcome.fetched_messages,
            new = outcome.new_messages,
            threads = outcome.threads,
            "message ingest finished"
        );

        Ok(outcome)
    }

    async fn ingest_contact(
        &self,
        account: &Account,
        contact: &Contact,
        window_start: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<ContactIngestStats, IngestError> {
        if cancel.is_cancelled() {
            return Err(IngestError::Cancelled);
        }

        let cursor = self.get_cursor(&account.id, &contact.email).await?;
        // Resume strictly after the cursor; the message at the cursor
        // timestamp is already stored.
        let since = cursor.map_or(window_start, |at| {
            (at + Duration::milliseconds(1)).max(window_start)
        });

        let fetched = self
            .fetch_with_retry(account, &contact.email, since)
            .await?;

        let mut stats = ContactIngestStats {
            fetched: fetched.len(),
            new: 0,
        };
        let mut max_seen: Option<DateTime<Utc>> = None;

        for message in fetched {
            if cancel.is_cancelled() {
                return Err(IngestError::Cancelled);
            }

            if !self
                .messages
                .exists(&account.id, &message.external_id)
                .await?
            {
                stats.new += 1;
            }
            let body_text = message.normalized_body();
            self.messages
                .upsert(NewMessage {
                    account_id: account.id.clone(),
                    external_id: message.external_id,
                    thread_id: message.thread_id,
                    direction: message.direction,
                    sent_at: message.sent_at,
                    from_email: message.from_email,
                    to: message.to,
                    cc: message.cc,
                    bcc: message.bcc,
                    subject: message.subject,
                    body_text,
                })
                .await?;

            if max_seen.is_none_or(|at| message.sent_at > at) {
                max_seen = Some(message.sent_at);
            }
        }

        if let Some(at) = max_seen {
            self.set_cursor(&account.id, &contact.email, at).await?;
        }

        debug!(
            account_id = %account.id,
            contact = %contact.email,
            fetched = stats.fetched,
            new = stats.new,
            "ingested contact correspondence"
        );

        Ok(stats)
    }

    async fn fetch_with_retry(
        &self,
        account: &Account,
        address: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<FetchedMessage>, IngestError> {
        let mut attempt = 0u32;
        loop {
            match self
                .mail_source
                .list_with(&account.email, address, since)
                .await
            {
                Ok(messages) => return Ok(messages),
                Err(err) if err.is_transient() && !MAIL_FETCH.attempts_exhausted(attempt) => {
                    let delay = MAIL_FETCH.delay_with_jitter(attempt);
                    warn!(
                        account_id = %account.id,
                        contact = %address,
                        attempt,
                        error = %err,
                        "contact fetch failed, retrying in {delay:?}"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn get_cursor(
        &self,
        account_id: &str,
        contact_email: &str,
    ) -> Result<Option<DateTime<Utc>>, IngestError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "SELECT last_fetched_at FROM ingest_cursors WHERE account_id = ?1 AND contact_email = ?2",
                params![account_id, contact_email.to_lowercase()],
            )
            .await?;

        match rows.next().await? {
            Some(row) => {
                let raw: String = row.get(0)?;
                Ok(Some(
                    DateTime::parse_from_rfc3339(&raw)?.with_timezone(&Utc),
                ))
            }
            None => Ok(None),
        }
    }

    async fn set_cursor(
        &self,
        account_id: &str,
        contact_email: &str,
        at: DateTime<Utc>,
    ) -> Result<(), IngestError> {
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let conn = self.db.connection().await?;
        conn.execute(
            "INSERT INTO ingest_cursors (account_id, contact_email, last_fetched_at, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(account_id, contact_email) DO UPDATE SET
                last_fetched_at = MAX(ingest_cursors.last_fetched_at, excluded.last_fetched_at),
                updated_at = excluded.updated_at",
            params![
                account_id,
                contact_email.to_lowercase(),
                at.to_rfc3339_opts(SecondsFormat::Millis, true),
                now
            ],
        )
        .await?;
        Ok(())
    }
}
