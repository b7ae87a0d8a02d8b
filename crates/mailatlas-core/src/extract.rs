use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::accounts::Account;
use crate::backoff::MAIL_FETCH;
use crate::config::PipelineConfig;
use crate::contacts::{ContactError, ContactRepository, DiscoveredContact, TrustTier};
use crate::db::Database;
use crate::mail_source::{FetchedMessage, MailSource, MailSourceError};
use crate::messages::{MessageError, MessageRepository, NewMessage};

/// Contacts are checkpointed to the store after every chunk of this many
/// scanned messages, so a stopped job loses at most one chunk of tallying.
const CHECKPOINT_INTERVAL: usize = 200;

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ExtractOutcome {
    pub scanned_messages: usize,
    pub contacts: usize,
    pub tier1: usize,
    pub tier2: usize,
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("mail source error: {0}")]
    MailSource(#[from] MailSourceError),
    #[error("contact error: {0}")]
    Contact(#[from] ContactError),
    #[error("message error: {0}")]
    Message(#[from] MessageError),
    #[error("extraction cancelled")]
    Cancelled,
}

/// Scans sent mail over the lookback window, tallies addressed recipients,
/// and upserts a contact per distinct address with a trust tier.
pub struct TrustedContactExtractor {
    contacts: ContactRepository,
    messages: MessageRepository,
    mail_source: Arc<dyn MailSource>,
    config: PipelineConfig,
}

#[derive(Debug, Default, Clone)]
struct Tally {
    outbound: i64,
    first_seen_at: Option<DateTime<Utc>>,
    last_seen_at: Option<DateTime<Utc>>,
}

#[async_trait]
impl TrustedContactExtractor {
    pub fn new(db: Database, mail_source: Arc<dyn MailSource>, config: PipelineConfig) -> Self {
        Self {
            contacts: ContactRepository::new(db.clone()),
            messages: MessageRepository::new(db),
            mail_source,
            config,
        }
    }

    pub async fn run(
        &self,
        account: &Account,
        cancel: &CancellationToken,
        on_progress: impl Fn(f64) + Send + Sync,
    ) -> Result<ExtractOutcome, ExtractError> {
        let since = Utc::now() - Duration::days(self.config.lookback_days as i64);
        let sent = self.fetch_sent_with_retry(account, since).await?;
        let repliers = self.messages.inbound_senders(&account.id).await?;

        let mut tallies: BTreeMap<String, Tally> = BTreeMap::new();
        let mut outcome = ExtractOutcome {
            scanned_messages: sent.len(),
            ..Default::default()
        };

        let total = sent.len().max(1);
        let mut processed = 0usize;
        for chunk in sent.chunks(CHECKPOINT_INTERVAL) {
            if cancel.is_cancelled() {
                return Err(ExtractError::Cancelled);
            }

            let mut touched: HashSet<String> = HashSet::new();
            for message in chunk {
                // Persist the scanned message so one-off sends to otherwise
                // untrusted addresses still have evidence in the store.
                let body_text = message.normalized_body();
                self.messages
                    .upsert(NewMessage {
                        account_id: account.id.clone(),
                        external_id: message.external_id.clone(),
                        thread_id: message.thread_id.clone(),
                        direction: message.direction,
                        sent_at: message.sent_at,
                        from_email: message.from_email.clone(),
                        to: message.to.clone(),
                        cc: message.cc.clone(),
                        bcc: message.bcc.clone(),
                        subject: message.subject.clone(),
                        body_text,
                    })
                    .await?;

                for address in recipient_addresses(message) {
                    if address == account.email.to_lowercase() {
                        continue;
                    }
                    let tally = tallies.entry(address.clone()).or_default();
                    tally.outbound += 1;
                    if tally.first_seen_at.is_none_or(|at| message.sent_at < at) {
                        tally.first_seen_at = Some(message.sent_at);
                    }
                    if tally.last_seen_at.is_none_or(|at| message.sent_at > at) {
                        tally.last_seen_at = Some(message.sent_at);
                    }
                    touched.insert(address);
                }
            }

            for address in touched {
                let tally = &tallies[&address];
                let tier = self.tier_for(tally.outbound, repliers.contains(&address));
                self.contacts
                    .upsert_discovered(DiscoveredContact {
                        account_id: account.id.clone(),
                        email: address,
                        display_name: None,
                        outbound_count: tally.outbound,
                        first_seen_at: tally.first_seen_at,
                        last_seen_at: tally.last_seen_at,
                        trust_tier: tier,
                    })
                    .await?;
            }

            processed += chunk.len();
            on_progress(processed as f64 / total as f64);
        }

        outcome.contacts = tallies.len();
        for (address, tally) in &tallies {
            match self.tier_for(tally.outbound, repliers.contains(address)) {
                TrustTier::Tier1 => outcome.tier1 += 1,
                TrustTier::Tier2 => outcome.tier2 += 1,
                TrustTier::Tier3 => {}
            }
        }

        info!(
            account_id = %account.id,
            scanned = outcome.scanned_messages,
            contacts = outcome.contacts,
            tier1 = outcome.tier1,
            tier2 = outcome.tier2,
            "trusted contact extraction finished"
        );

        Ok(outcome)
    }

    fn tier_for(&self, outbound: i64, has_reply: bool) -> TrustTier {
        if outbound >= self.config.tier1_threshold as i64 {
            if has_reply {
                TrustTier::Tier1
            } else {
                TrustTier::Tier2
            }
        } else {
            TrustTier::Tier3
        }
    }

    async fn fetch_sent_with_retry(
        &self,
        account: &Account,
        since: DateTime<Utc>,
    ) -> Result<Vec<FetchedMessage>, ExtractError> {
        let mut attempt = 0u32;
        loop {
            match self.mail_source.list_sent(&account.email, since).await {
                Ok(messages) => return Ok(messages),
                Err(err) if err.is_transient() && !MAIL_FETCH.attempts_exhausted(attempt) => {
                    let delay = MAIL_FETCH.delay_with_jitter(attempt);
                    warn!(
                        account_id = %account.id,
                        attempt,
                        error = %err,
                        "sent-mail fetch failed, retrying in {delay:?}"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

fn recipient_addresses(message: &FetchedMessage) -> Vec<String> {
    message
        .to
        .iter()
        .chain(&message.cc)
        .chain(&message.bcc)
        .map(|addr| addr.to_lowercase())
        .collect()
}
