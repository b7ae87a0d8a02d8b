//! Organizer / skeleton builder.
//!
//! Produces an [`OrganizedSnapshot`] from stored messages and contacts with
//! no LLM involvement: thread grouping, cheap token-overlap topic merging,
//! TF-scored key points, keyword domain tagging, and a content fingerprint.
//! The snapshot is the only thing Phase 2 ever reads.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::accounts::Account;
use crate::config::OrganizerConfig;
use crate::contacts::{Contact, ContactError, ContactRepository};
use crate::db::Database;
use crate::messages::{Message, MessageError, MessageRepository};

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "with", "that", "this", "from", "your", "have", "about", "will",
    "are", "was", "our", "you", "has", "had", "been", "they", "their", "them", "would",
    "could", "should", "what", "when", "where", "which", "who", "how", "all", "any",
    "can", "her", "his", "its", "out", "not", "but", "get", "got", "just", "into",
];

/// A compact, LLM-free summary of one topic of conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicSummary {
    pub topic_id: String,
    pub label: String,
    pub domain: String,
    pub participants: Vec<String>,
    /// Message ids in ascending sent order.
    pub message_refs: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub key_points: Vec<String>,
    /// participant email -> relationship status, for participants that are
    /// known contacts.
    pub participant_statuses: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactDigest {
    pub email: String,
    pub status: String,
    pub engagement_score: f64,
    pub outbound_count: i64,
    pub inbound_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrganizedSnapshot {
    pub id: String,
    pub account_id: String,
    pub generated_at: DateTime<Utc>,
    pub message_count: i64,
    pub max_sent_at: Option<DateTime<Utc>>,
    pub topics: Vec<TopicSummary>,
    pub contacts: Vec<ContactDigest>,
    /// contact email -> topic ids, the inverse of topic participants.
    pub contact_topics: BTreeMap<String, Vec<String>>,
    pub fingerprint: String,
}

impl OrganizedSnapshot {
    /// Every message id referenced by any topic.
    pub fn message_ids(&self) -> BTreeSet<&str> {
        self.topics
            .iter()
            .flat_map(|t| t.message_refs.iter().map(String::as_str))
            .collect()
    }

    pub fn topic(&self, topic_id: &str) -> Option<&TopicSummary> {
        self.topics.iter().find(|t| t.topic_id == topic_id)
    }
}

#[derive(Debug, Error)]
pub enum OrganizerError {
    #[error("message error: {0}")]
    Message(#[from] MessageError),
    #[error("contact error: {0}")]
    Contact(#[from] ContactError),
    #[error("organization cancelled")]
    Cancelled,
}

/// Keyword -> business domain map. Configuration may eventually override
/// this; the defaults cover the common startup vocabulary.
fn domain_keywords() -> &'static [(&'static str, &'static str)] {
    &[
        ("invoice", "finance"),
        ("payment", "finance"),
        ("budget", "finance"),
        ("contract", "legal"),
        ("agreement", "legal"),
        ("counsel", "legal"),
        ("hiring", "people"),
        ("candidate", "people"),
        ("interview", "people"),
        ("recruiter", "people"),
        ("launch", "product"),
        ("roadmap", "product"),
        ("feature", "product"),
        ("release", "product"),
        ("architecture", "engineering"),
        ("deploy", "engineering"),
        ("infra", "engineering"),
        ("migration", "engineering"),
        ("deal", "sales"),
        ("pricing", "sales"),
        ("renewal", "sales"),
        ("partnership", "business-development"),
        ("investor", "fundraising"),
        ("fundraise", "fundraising"),
        ("term", "fundraising"),
        ("pitch", "fundraising"),
        ("diligence", "fundraising"),
    ]
}

pub struct Organizer {
    messages: MessageRepository,
    contacts: ContactRepository,
    config: OrganizerConfig,
}

struct TopicGroup {
    thread_ids: BTreeSet<String>,
    participants: BTreeSet<String>,
    subject_tokens: BTreeSet<String>,
    messages: Vec<Message>,
}

impl Organizer {
    pub fn new(db: Database, config: OrganizerConfig) -> Self {
        Self {
            messages: MessageRepository::new(db.clone()),
            contacts: ContactRepository::new(db),
            config,
        }
    }

    pub async fn run(
        &self,
        account: &Account,
        cancel: &CancellationToken,
        on_progress: impl Fn(f64) + Send + Sync,
    ) -> Result<OrganizedSnapshot, OrganizerError> {
        let messages = self.messages.list_for_account(&account.id, None).await?;
        let contacts = self.contacts.list(&account.id, None).await?;
        on_progress(0.2);

        if cancel.is_cancelled() {
            return Err(OrganizerError::Cancelled);
        }

        let groups = self.group_topics(&messages);
        on_progress(0.6);

        if cancel.is_cancelled() {
            return Err(OrganizerError::Cancelled);
        }

        let snapshot = self.build_snapshot(account, groups, &messages, &contacts);
        on_progress(1.0);

        info!(
            account_id = %account.id,
            topics = snapshot.topics.len(),
            messages = snapshot.message_count,
            fingerprint = %snapshot.fingerprint,
            "organized snapshot built"
        );

        Ok(snapshot)
    }

    /// Group messages by thread, then merge threads that share enough
    /// participants and normalized subject tokens.
    fn group_topics(&self, messages: &[Message]) -> Vec<TopicGroup> {
        let mut by_thread: BTreeMap<String, Vec<Message>> = BTreeMap::new();
        for message in messages {
            by_thread
                .entry(message.thread_id.clone())
                .or_default()
                .push(message.clone());
        }

        let mut groups: Vec<TopicGroup> = Vec::new();
        for (thread_id, thread_messages) in by_thread {
            let mut participants = BTreeSet::new();
            let mut subject_tokens = BTreeSet::new();
            for message in &thread_messages {
                participants.insert(message.from_email.clone());
                for addr in message.to.iter().chain(&message.cc).chain(&message.bcc) {
                    participants.insert(addr.to_lowercase());
                }
                if let Some(subject) = &message.subject {
                    subject_tokens.extend(normalize_tokens(subject));
                }
            }

            let candidate = groups.iter().position(|group| {
                let shared_participants =
                    group.participants.intersection(&participants).count();
                let shared_tokens = group.subject_tokens.intersection(&subject_tokens).count();
                shared_participants >= self.config.topic_merge_min_participants
                    && shared_tokens >= self.config.topic_merge_min_tokens
            });

            match candidate {
                Some(index) => {
                    let group = &mut groups[index];
                    group.thread_ids.insert(thread_id);
                    group.participants.extend(participants);
                    group.subject_tokens.extend(subject_tokens);
                    group.messages.extend(thread_messages);
                }
                None => groups.push(TopicGroup {
                    thread_ids: BTreeSet::from([thread_id]),
                    participants,
                    subject_tokens,
                    messages: thread_messages,
                }),
            }
        }

        for group in &mut groups {
            group.messages.sort_by(|a, b| a.sent_at.cmp(&b.sent_at));
        }
        groups
    }

    fn build_snapshot(
        &self,
        account: &Account,
        groups: Vec<TopicGroup>,
        messages: &[Message],
        contacts: &[Contact],
    ) -> OrganizedSnapshot {
        let status_by_email: BTreeMap<&str, &Contact> = contacts
            .iter()
            .map(|contact| (contact.email.as_str(), contact))
            .collect();

        let mut topics: Vec<TopicSummary> = groups
            .into_iter()
            .map(|group| self.summarize_topic(group, &status_by_email))
            .collect();
        topics.sort_by(|a, b| a.topic_id.cmp(&b.topic_id));

        let mut contact_topics: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for topic in &topics {
            for participant in &topic.participants {
                if status_by_email.contains_key(participant.as_str()) {
                    contact_topics
                        .entry(participant.clone())
                        .or_default()
                        .push(topic.topic_id.clone());
                }
            }
        }

        let max_sent_at = messages.iter().map(|m| m.sent_at).max();
        let fingerprint = fingerprint(&topics, messages.len() as i64, max_sent_at);

        OrganizedSnapshot {
            id: Uuid::new_v4().to_string(),
            account_id: account.id.clone(),
            generated_at: Utc::now(),
            message_count: messages.len() as i64,
            max_sent_at,
            topics,
            contacts: contacts
                .iter()
                .map(|contact| ContactDigest {
                    email: contact.email.clone(),
                    status: contact.status.as_str().to_string(),
                    engagement_score: contact.engagement_score,
                    outbound_count: contact.outbound_count,
                    inbound_count: contact.inbound_count,
                })
                .collect(),
            contact_topics,
            fingerprint,
        }
    }

    fn summarize_topic(
        &self,
        group: TopicGroup,
        status_by_email: &BTreeMap<&str, &Contact>,
    ) -> TopicSummary {
        let label = topic_label(&group);
        let domain = domain_for(&group.subject_tokens);
        let key_points = key_points(&group.messages, self.config.key_point_limit);

        let participant_statuses = group
            .participants
            .iter()
            .filter_map(|email| {
                status_by_email
                    .get(email.as_str())
                    .map(|contact| (email.clone(), contact.status.as_str().to_string()))
            })
            .collect();

        let started_at = group
            .messages
            .first()
            .map(|m| m.sent_at)
            .unwrap_or_else(Utc::now);
        let ended_at = group
            .messages
            .last()
            .map(|m| m.sent_at)
            .unwrap_or(started_at);

        TopicSummary {
            topic_id: topic_id(&group.thread_ids),
            label,
            domain,
            participants: group.participants.into_iter().collect(),
            message_refs: group.messages.iter().map(|m| m.id.clone()).collect(),
            started_at,
            ended_at,
            key_points,
            participant_statuses,
        }
    }
}

/// Stable topic identity: hash of the sorted member thread ids, so the same
/// grouping yields the same id on every run.
fn topic_id(thread_ids: &BTreeSet<String>) -> String {
    let mut hasher = Sha256::new();
    for thread_id in thread_ids {
        hasher.update(thread_id.as_bytes());
        hasher.update([0]);
    }
    let digest = hasher.finalize();
    format!("topic-{:x}", digest)[..18].to_string()
}

fn topic_label(group: &TopicGroup) -> String {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for message in &group.messages {
        if let Some(subject) = &message.subject {
            for token in normalize_tokens(subject) {
                *counts.entry(token).or_default() += 1;
            }
        }
    }

    if counts.is_empty() {
        return "misc".to_string();
    }

    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked
        .into_iter()
        .take(3)
        .map(|(token, _)| token)
        .collect::<Vec<_>>()
        .join(" ")
}

fn domain_for(subject_tokens: &BTreeSet<String>) -> String {
    for (keyword, domain) in domain_keywords() {
        if subject_tokens.contains(*keyword) {
            return domain.to_string();
        }
    }
    "general".to_string()
}

/// Top sentences by term-frequency weight over the topic's own text.
fn key_points(messages: &[Message], limit: usize) -> Vec<String> {
    let mut tf: HashMap<String, f64> = HashMap::new();
    let mut sentences: Vec<String> = Vec::new();

    for message in messages {
        if let Some(subject) = &message.subject {
            sentences.push(subject.trim().to_string());
        }
        if let Some(body) = &message.body_text {
            sentences.extend(
                body.split(['.', '!', '?', '\n'])
                    .map(str::trim)
                    .filter(|s| s.len() >= 20)
                    .map(str::to_string),
            );
        }
    }

    for sentence in &sentences {
        for token in normalize_tokens(sentence) {
            *tf.entry(token).or_default() += 1.0;
        }
    }

    let mut scored: Vec<(f64, String)> = sentences
        .into_iter()
        .map(|sentence| {
            let tokens = normalize_tokens(&sentence);
            let score = if tokens.is_empty() {
                0.0
            } else {
                tokens.iter().map(|t| tf.get(t).copied().unwrap_or(0.0)).sum::<f64>()
                    / (tokens.len() as f64).sqrt()
            };
            (score, sentence)
        })
        .collect();
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

    let mut seen: BTreeSet<String> = BTreeSet::new();
    let mut points = Vec::new();
    for (_, sentence) in scored {
        let mut point = sentence;
        if point.len() > 160 {
            let cut = point
                .char_indices()
                .take_while(|(idx, _)| *idx < 160)
                .last()
                .map(|(idx, ch)| idx + ch.len_utf8())
                .unwrap_or(point.len());
            point.truncate(cut);
        }
        let normalized = point.to_lowercase();
        if seen.insert(normalized) {
            points.push(point);
        }
        if points.len() >= limit {
            break;
        }
    }
    points
}

pub(crate) fn normalize_tokens(text: &str) -> Vec<String> {
    let lowered = text.to_lowercase();
    let stripped = lowered
        .trim_start_matches("re:")
        .trim_start_matches("fwd:")
        .trim_start_matches("fw:");

    stripped
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| token.len() >= 3)
        .filter(|token| !STOPWORDS.contains(token))
        .map(str::to_string)
        .collect()
}

/// Content hash over sorted topic ids, sorted participant sets, message
/// count, and the newest timestamp.
fn fingerprint(topics: &[TopicSummary], message_count: i64, max_sent_at: Option<DateTime<Utc>>) -> String {
    let mut hasher = Sha256::new();
    for topic in topics {
        hasher.update(topic.topic_id.as_bytes());
        hasher.update([0]);
        for participant in &topic.participants {
            hasher.update(participant.as_bytes());
            hasher.update([1]);
        }
    }
    hasher.update(message_count.to_be_bytes());
    if let Some(at) = max_sent_at {
        hasher.update(at.timestamp_millis().to_be_bytes());
    }
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::AccountRepository;
    use crate::contacts::{DiscoveredContact, TrustTier};
    use crate::messages::{Direction, NewMessage};
    use crate::migrations::run_migrations;
    use chrono::Duration;
    use tempfile::TempDir;

    async fn setup() -> (Database, Account, TempDir) {
        let dir = TempDir::new().expect("temp dir");
        let db_path = dir.path().join(format!("db_{}.sqlite", Uuid::new_v4()));
        let db = Database::new(&db_path).await.expect("create db");
        run_migrations(&db).await.expect("migrations");
        let account = AccountRepository::new(db.clone())
            .upsert("owner@example.com", None)
            .await
            .expect("account");
        (db, account, dir)
    }

    async fn seed_message(
        db: &Database,
        account: &Account,
        external_id: &str,
        thread_id: &str,
        direction: Direction,
        peer: &str,
        subject: &str,
        body: &str,
        days_ago: i64,
    ) {
        let (from_email, to) = match direction {
            Direction::Outbound => ("owner@example.com".to_string(), vec![peer.to_string()]),
            Direction::Inbound => (peer.to_string(), vec!["owner@example.com".to_string()]),
        };
        MessageRepository::new(db.clone())
            .upsert(NewMessage {
                account_id: account.id.clone(),
                external_id: external_id.to_string(),
                thread_id: thread_id.to_string(),
                direction,
                sent_at: Utc::now() - Duration::days(days_ago),
                from_email,
                to,
                cc: vec![],
                bcc: vec![],
                subject: Some(subject.to_string()),
                body_text: Some(body.to_string()),
            })
            .await
            .expect("seed message");
    }

    async fn seed_contact(db: &Database, account: &Account, email: &str) {
        ContactRepository::new(db.clone())
            .upsert_discovered(DiscoveredContact {
                account_id: account.id.clone(),
                email: email.to_string(),
                display_name: None,
                outbound_count: 1,
                first_seen_at: None,
                last_seen_at: None,
                trust_tier: TrustTier::Tier1,
            })
            .await
            .expect("contact");
    }

    fn organizer(db: &Database) -> Organizer {
        Organizer::new(db.clone(), OrganizerConfig::default())
    }

    #[tokio::test]
    async fn threads_with_shared_participants_and_tokens_merge() {
        let (db, account, _dir) = setup().await;
        seed_contact(&db, &account, "alice@x.com").await;

        seed_message(
            &db, &account, "m1", "t1", Direction::Outbound, "alice@x.com",
            "Series A fundraise timeline", "Draft timeline attached for the fundraise", 20,
        )
        .await;
        seed_message(
            &db, &account, "m2", "t2", Direction::Inbound, "alice@x.com",
            "Re: fundraise timeline update", "Investor feedback on the fundraise timeline", 10,
        )
        .await;
        seed_message(
            &db, &account, "m3", "t3", Direction::Outbound, "bob@y.com",
            "Office lease renewal", "New lease terms", 5,
        )
        .await;

        let snapshot = organizer(&db)
            .run(&account, &CancellationToken::new(), &|_| {})
            .await
            .expect("organize");

        assert_eq!(snapshot.topics.len(), 2);
        let merged = snapshot
            .topics
            .iter()
            .find(|t| t.message_refs.len() == 2)
            .expect("merged topic");
        assert!(merged.participants.contains(&"alice@x.com".to_string()));
        assert_eq!(merged.domain, "fundraising");
        assert_eq!(
            merged.participant_statuses.get("alice@x.com").map(String::as_str),
            Some("cold")
        );
        assert!(merged.started_at < merged.ended_at);

        // Inverse index covers only known contacts.
        assert!(snapshot.contact_topics.contains_key("alice@x.com"));
        assert!(!snapshot.contact_topics.contains_key("bob@y.com"));
    }

    #[tokio::test]
    async fn fingerprint_is_stable_for_identical_content() {
        let (db, account, _dir) = setup().await;
        seed_message(
            &db, &account, "m1", "t1", Direction::Outbound, "alice@x.com",
            "Budget review", "Numbers for the quarter", 3,
        )
        .await;

        let organizer = organizer(&db);
        let first = organizer
            .run(&account, &CancellationToken::new(), &|_| {})
            .await
            .expect("first");
        let second = organizer
            .run(&account, &CancellationToken::new(), &|_| {})
            .await
            .expect("second");

        assert_eq!(first.fingerprint, second.fingerprint);
        assert_ne!(first.id, second.id, "snapshot ids are unique per build");
        assert_eq!(
            first.topics[0].topic_id, second.topics[0].topic_id,
            "topic ids are content-derived"
        );
    }

    #[tokio::test]
    async fn fingerprint_changes_when_messages_arrive() {
        let (db, account, _dir) = setup().await;
        seed_message(
            &db, &account, "m1", "t1", Direction::Outbound, "alice@x.com",
            "Budget review", "Numbers", 3,
        )
        .await;

        let organizer = organizer(&db);
        let before = organizer
            .run(&account, &CancellationToken::new(), &|_| {})
            .await
            .expect("before");

        seed_message(
            &db, &account, "m2", "t1", Direction::Inbound, "alice@x.com",
            "Re: Budget review", "Looks good", 1,
        )
        .await;
        let after = organizer
            .run(&account, &CancellationToken::new(), &|_| {})
            .await
            .expect("after");

        assert_ne!(before.fingerprint, after.fingerprint);
    }

    #[tokio::test]
    async fn key_points_are_bounded_and_deduplicated() {
        let (db, account, _dir) = setup().await;
        for i in 0..10 {
            seed_message(
                &db, &account, &format!("m{i}"), "t1", Direction::Outbound, "alice@x.com",
                "Launch planning",
                "The launch checklist needs a final review before Friday. Marketing wants the announcement copy early.",
                10 - i,
            )
            .await;
        }

        let snapshot = organizer(&db)
            .run(&account, &CancellationToken::new(), &|_| {})
            .await
            .expect("organize");
        let topic = &snapshot.topics[0];
        assert!(topic.key_points.len() <= OrganizerConfig::default().key_point_limit);
        let unique: BTreeSet<String> = topic
            .key_points
            .iter()
            .map(|p| p.to_lowercase())
            .collect();
        assert_eq!(unique.len(), topic.key_points.len(), "no duplicate key points");
        assert_eq!(topic.domain, "product");
    }

    #[tokio::test]
    async fn subjectless_threads_become_misc() {
        let (db, account, _dir) = setup().await;
        MessageRepository::new(db.clone())
            .upsert(NewMessage {
                account_id: account.id.clone(),
                external_id: "m1".to_string(),
                thread_id: "t1".to_string(),
                direction: Direction::Outbound,
                sent_at: Utc::now(),
                from_email: "owner@example.com".to_string(),
                to: vec!["alice@x.com".to_string()],
                cc: vec![],
                bcc: vec![],
                subject: None,
                body_text: None,
            })
            .await
            .expect("message");

        let snapshot = organizer(&db)
            .run(&account, &CancellationToken::new(), &|_| {})
            .await
            .expect("organize");
        assert_eq!(snapshot.topics[0].label, "misc");
        assert_eq!(snapshot.topics[0].domain, "general");
    }

    #[test]
    fn normalize_tokens_strips_prefixes_and_stopwords() {
        let tokens = normalize_tokens("Re: the Budget review for Q3");
        assert_eq!(tokens, vec!["budget", "review"]);
    }
}
