//! Communication-intelligence analyzer.
//!
//! Classifies the true state of each relationship from the observed message
//! timeline. Raw send frequency lies: ten unanswered messages to a famous
//! investor are an attempt, not a relationship. The classifier is a pure
//! function of the timeline and the previous status, so identical inputs
//! always produce identical output.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::accounts::Account;
use crate::config::AnalyzerConfig;
use crate::contacts::{Contact, ContactError, ContactRepository, RelationshipStatus};
use crate::db::Database;
use crate::enrich::Enricher;
use crate::messages::{Direction, Message, MessageError, MessageRepository};

/// A relationship with at least two replies counts as ongoing while activity
/// is newer than this.
const ONGOING_ACTIVE_DAYS: i64 = 60;

/// Inbound bodies at or above this length count as substantive.
const SUBSTANTIVE_MIN_CHARS: usize = 150;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyQuality {
    Substantive,
    Brief,
    Auto,
    None,
}

impl ReplyQuality {
    pub fn weight(&self) -> f64 {
        match self {
            ReplyQuality::Substantive => 1.0,
            ReplyQuality::Brief => 0.5,
            ReplyQuality::Auto => 0.1,
            ReplyQuality::None => 0.0,
        }
    }
}

/// Per-contact features derived from the timeline.
#[derive(Debug, Clone, PartialEq)]
pub struct ContactFeatures {
    pub outbound_count: i64,
    pub inbound_count: i64,
    pub reply_ratio: f64,
    pub first_outbound_at: Option<DateTime<Utc>>,
    pub first_inbound_at: Option<DateTime<Utc>>,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub median_reply_latency: Option<Duration>,
    pub reply_quality: ReplyQuality,
}

impl ContactFeatures {
    pub fn dormant_gap(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.last_activity_at.map(|at| now - at)
    }
}

#[derive(Debug, Error)]
pub enum AnalyzerError {
    #[error("contact error: {0}")]
    Contact(#[from] ContactError),
    #[error("message error: {0}")]
    Message(#[from] MessageError),
    #[error("analysis cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct AnalyzeOutcome {
    pub classified: usize,
    pub enriched: usize,
    pub enrichment_failures: usize,
}

fn auto_reply_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?i)\b(auto[- ]?reply|automatic reply|out of office|ooo|do[- ]not[- ]reply|no[- ]?reply|vacation respon)",
        )
        .expect("static regex")
    })
}

fn looks_auto_generated(message: &Message) -> bool {
    let pattern = auto_reply_pattern();
    message
        .subject
        .as_deref()
        .is_some_and(|s| pattern.is_match(s))
        || message
            .body_text
            .as_deref()
            .is_some_and(|b| pattern.is_match(b))
        || message.from_email.starts_with("noreply@")
        || message.from_email.starts_with("no-reply@")
}

/// Derive timeline features for one contact. `messages` must be every stored
/// message exchanged with the contact, in ascending sent order.
pub fn derive_features(messages: &[Message]) -> ContactFeatures {
    let mut features = ContactFeatures {
        outbound_count: 0,
        inbound_count: 0,
        reply_ratio: 0.0,
        first_outbound_at: None,
        first_inbound_at: None,
        last_activity_at: None,
        median_reply_latency: None,
        reply_quality: ReplyQuality::None,
    };

    let mut best_quality = ReplyQuality::None;
    for message in messages {
        match message.direction {
            Direction::Outbound => {
                features.outbound_count += 1;
                if features.first_outbound_at.is_none() {
                    features.first_outbound_at = Some(message.sent_at);
                }
            }
            Direction::Inbound => {
                features.inbound_count += 1;
                if features.first_inbound_at.is_none() {
                    features.first_inbound_at = Some(message.sent_at);
                }
                let quality = inbound_quality(message);
                if quality_rank(quality) > quality_rank(best_quality) {
                    best_quality = quality;
                }
            }
        }
        if features.last_activity_at.is_none_or(|at| message.sent_at > at) {
            features.last_activity_at = Some(message.sent_at);
        }
    }

    features.reply_quality = best_quality;
    features.reply_ratio =
        features.inbound_count as f64 / features.outbound_count.max(1) as f64;
    features.median_reply_latency = median_reply_latency(messages);
    features
}

fn inbound_quality(message: &Message) -> ReplyQuality {
    if looks_auto_generated(message) {
        return ReplyQuality::Auto;
    }
    let body_len = message.body_text.as_deref().map_or(0, |b| b.trim().len());
    if body_len >= SUBSTANTIVE_MIN_CHARS {
        ReplyQuality::Substantive
    } else {
        ReplyQuality::Brief
    }
}

fn quality_rank(quality: ReplyQuality) -> u8 {
    match quality {
        ReplyQuality::Substantive => 3,
        ReplyQuality::Brief => 2,
        ReplyQuality::Auto => 1,
        ReplyQuality::None => 0,
    }
}

/// Median latency over matched outbound→inbound pairs within a thread.
fn median_reply_latency(messages: &[Message]) -> Option<Duration> {
    let mut by_thread: BTreeMap<&str, Vec<&Message>> = BTreeMap::new();
    for message in messages {
        by_thread
            .entry(message.thread_id.as_str())
            .or_default()
            .push(message);
    }

    let mut latencies: Vec<Duration> = Vec::new();
    for thread in by_thread.values() {
        let mut pending_outbound: Option<DateTime<Utc>> = None;
        for message in thread {
            match message.direction {
                Direction::Outbound => {
                    // Only the first unanswered outbound starts the clock.
                    if pending_outbound.is_none() {
                        pending_outbound = Some(message.sent_at);
                    }
                }
                Direction::Inbound => {
                    if let Some(sent) = pending_outbound.take() {
                        latencies.push(message.sent_at - sent);
                    }
                }
            }
        }
    }

    if latencies.is_empty() {
        return None;
    }
    latencies.sort();
    Some(latencies[latencies.len() / 2])
}

/// Deterministic status classification.
///
/// Dormancy is evaluated first: a previously live relationship that has been
/// silent past the dormancy threshold is no longer established no matter how
/// good the old replies were. The remaining rows follow in precedence order,
/// ties broken by the earlier row.
pub fn classify(
    features: &ContactFeatures,
    previous_status: RelationshipStatus,
    config: &AnalyzerConfig,
    now: DateTime<Utc>,
) -> RelationshipStatus {
    let gap = features.dormant_gap(now);
    let gap_days = gap.map_or(i64::MAX, |g| g.num_days());

    let previously_live = matches!(
        previous_status,
        RelationshipStatus::Established | RelationshipStatus::Ongoing
    );
    if previously_live && gap_days >= config.dormant_days {
        return RelationshipStatus::Dormant;
    }

    if features.inbound_count >= 1
        && features.reply_quality == ReplyQuality::Substantive
        && features.reply_ratio >= config.established_reply_ratio
    {
        return RelationshipStatus::Established;
    }

    if features.inbound_count >= 2 && gap_days <= ONGOING_ACTIVE_DAYS {
        return RelationshipStatus::Ongoing;
    }

    let unanswered = features.inbound_count == 0
        || matches!(features.reply_quality, ReplyQuality::None | ReplyQuality::Auto);
    if features.outbound_count >= 1 && unanswered && gap_days >= config.attempted_days {
        return RelationshipStatus::Attempted;
    }

    RelationshipStatus::Cold
}

/// Engagement score in [0,1].
///
/// Weighted sum of reply ratio, reply quality, recency, and volume. Recency
/// only counts once the contact has actually replied; unanswered outreach
/// scores on volume alone.
pub fn engagement_score(features: &ContactFeatures, now: DateTime<Utc>) -> f64 {
    let ratio_term = 0.4 * features.reply_ratio.min(1.0);
    let quality_term = 0.3 * features.reply_quality.weight();

    let recency_term = if features.inbound_count > 0 {
        let gap_days = features
            .dormant_gap(now)
            .map_or(f64::MAX, |g| g.num_seconds() as f64 / 86_400.0);
        0.2 * (1.0 - gap_days / 365.0).max(0.0)
    } else {
        0.0
    };

    let volume = (features.outbound_count + features.inbound_count) as f64 / 20.0;
    let volume_term = 0.1 * volume.min(1.0);

    (ratio_term + quality_term + recency_term + volume_term).clamp(0.0, 1.0)
}

/// Runs the classifier over every contact of an account and writes the status
/// and engagement score back. Optionally enriches contacts afterwards.
pub struct CommIntelligenceAnalyzer {
    contacts: ContactRepository,
    messages: MessageRepository,
    enricher: Option<Arc<dyn Enricher>>,
    config: AnalyzerConfig,
}

impl CommIntelligenceAnalyzer {
    pub fn new(db: Database, config: AnalyzerConfig) -> Self {
        Self {
            contacts: ContactRepository::new(db.clone()),
            messages: MessageRepository::new(db),
            enricher: None,
            config,
        }
    }

    pub fn with_enricher(mut self, enricher: Arc<dyn Enricher>) -> Self {
        self.enricher = Some(enricher);
        self
    }

    pub async fn run(
        &self,
        account: &Account,
        cancel: &CancellationToken,
        on_progress: impl Fn(f64) + Send + Sync,
    ) -> Result<AnalyzeOutcome, AnalyzerError> {
        let contacts = self.contacts.list(&account.id, None).await?;
        let now = Utc::now();
        let total = contacts.len().max(1);
        let mut outcome = AnalyzeOutcome::default();

        for (index, contact) in contacts.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(AnalyzerError::Cancelled);
            }

            let timeline = self
                .messages
                .list_for_contact(&account.id, &contact.email, None)
                .await?;
            if timeline.is_empty() {
                continue;
            }

            let features = derive_features(&timeline);
            let status = classify(&features, contact.status, &self.config, now);
            let score = engagement_score(&features, now);

            let updated = self
                .contacts
                .update_classification(
                    &account.id,
                    &contact.email,
                    status,
                    score,
                    features.outbound_count,
                    features.inbound_count,
                    features.last_activity_at,
                )
                .await?;
            outcome.classified += 1;

            debug!(
                contact = %contact.email,
                status = status.as_str(),
                score,
                "classified contact"
            );

            self.enrich_contact(account, &updated, &mut outcome).await?;
            on_progress((index + 1) as f64 / total as f64);
        }

        info!(
            account_id = %account.id,
            classified = outcome.classified,
            enriched = outcome.enriched,
            "communication intelligence finished"
        );

        Ok(outcome)
    }

    async fn enrich_contact(
        &self,
        account: &Account,
        contact: &Contact,
        outcome: &mut AnalyzeOutcome,
    ) -> Result<(), AnalyzerError> {
        let Some(enricher) = &self.enricher else {
            return Ok(());
        };
        // Skip contacts that already carry a successful enrichment.
        if contact.enrichment.is_some() {
            return Ok(());
        }

        match enricher.enrich(contact).await {
            Ok(record) => {
                self.contacts
                    .set_enrichment(&account.id, &contact.email, Some(&record), "ok")
                    .await?;
                outcome.enriched += 1;
            }
            Err(err) => {
                warn!(contact = %contact.email, error = %err, "enrichment failed");
                self.contacts
                    .set_enrichment(&account.id, &contact.email, None, "failed")
                    .await?;
                outcome.enrichment_failures += 1;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::AccountRepository;
    use crate::contacts::{DiscoveredContact, TrustTier};
    use crate::enrich::{FailingEnricher, StaticEnricher};
    use crate::messages::NewMessage;
    use crate::migrations::run_migrations;
    use serde_json::json;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn message(
        direction: Direction,
        peer: &str,
        thread: &str,
        sent_at: DateTime<Utc>,
        body: &str,
    ) -> Message {
        let (from_email, to) = match direction {
            Direction::Outbound => ("owner@example.com".to_string(), vec![peer.to_string()]),
            Direction::Inbound => (peer.to_string(), vec!["owner@example.com".to_string()]),
        };
        Message {
            id: Uuid::new_v4().to_string(),
            account_id: "acct".to_string(),
            external_id: Uuid::new_v4().to_string(),
            thread_id: thread.to_string(),
            direction,
            sent_at,
            from_email,
            to,
            cc: vec![],
            bcc: vec![],
            subject: Some("Partnership".to_string()),
            body_text: Some(body.to_string()),
            created_at: sent_at,
            updated_at: sent_at,
        }
    }

    fn long_body() -> String {
        "We looked carefully at the numbers you sent over and the team agrees \
         this is worth pursuing. Let me propose a structure for the next call \
         and loop in our counsel so we can move quickly on diligence."
            .to_string()
    }

    #[test]
    fn attempted_vc_scores_low_and_classifies_attempted() {
        let now = Utc::now();
        let timeline = vec![message(
            Direction::Outbound,
            "x@vc.com",
            "t1",
            now - Duration::days(30),
            &"pitch ".repeat(80),
        )];

        let features = derive_features(&timeline);
        assert_eq!(features.outbound_count, 1);
        assert_eq!(features.inbound_count, 0);
        assert_eq!(features.reply_quality, ReplyQuality::None);

        let status = classify(&features, RelationshipStatus::Cold, &AnalyzerConfig::default(), now);
        assert_eq!(status, RelationshipStatus::Attempted);

        let score = engagement_score(&features, now);
        assert!(score <= 0.15, "one-sided outreach must score low, got {score}");
    }

    #[test]
    fn established_partner_classifies_established_with_high_score() {
        let now = Utc::now();
        let mut timeline = Vec::new();
        // 10 outbound, 8 substantive inbound over 90 days, latest 5 days ago.
        for i in 0..10 {
            let sent = now - Duration::days(90 - i * 9);
            timeline.push(message(
                Direction::Outbound,
                "partner@co.com",
                &format!("t{i}"),
                sent,
                "checking in on the contract",
            ));
            if i < 8 {
                timeline.push(message(
                    Direction::Inbound,
                    "partner@co.com",
                    &format!("t{i}"),
                    sent + Duration::hours(6),
                    &long_body(),
                ));
            }
        }
        timeline.sort_by_key(|m| m.sent_at);

        let features = derive_features(&timeline);
        assert_eq!(features.outbound_count, 10);
        assert_eq!(features.inbound_count, 8);
        assert_eq!(features.reply_quality, ReplyQuality::Substantive);
        let latency = features.median_reply_latency.expect("latency");
        assert!(latency < Duration::hours(24));

        let status = classify(&features, RelationshipStatus::Cold, &AnalyzerConfig::default(), now);
        assert_eq!(status, RelationshipStatus::Established);

        let score = engagement_score(&features, now);
        assert!(score >= 0.7, "established partner should score high, got {score}");
    }

    #[test]
    fn previously_ongoing_relationship_goes_dormant() {
        let now = Utc::now();
        let mut timeline = Vec::new();
        for i in 0..10 {
            let sent = now - Duration::days(340 - i * 10);
            timeline.push(message(
                Direction::Outbound,
                "old@friend.com",
                "t1",
                sent,
                "quick question",
            ));
            timeline.push(message(
                Direction::Inbound,
                "old@friend.com",
                "t1",
                sent + Duration::hours(2),
                &long_body(),
            ));
        }
        // Last activity 250 days ago.
        let features = derive_features(&timeline);
        assert!(features.dormant_gap(now).expect("gap") >= Duration::days(249));

        let status = classify(
            &features,
            RelationshipStatus::Ongoing,
            &AnalyzerConfig::default(),
            now,
        );
        assert_eq!(status, RelationshipStatus::Dormant);
    }

    #[test]
    fn fresh_outreach_stays_cold_until_attempted_window() {
        let now = Utc::now();
        let timeline = vec![message(
            Direction::Outbound,
            "new@lead.com",
            "t1",
            now - Duration::days(3),
            "intro",
        )];
        let features = derive_features(&timeline);
        let status = classify(&features, RelationshipStatus::Cold, &AnalyzerConfig::default(), now);
        assert_eq!(status, RelationshipStatus::Cold);
    }

    #[test]
    fn auto_replies_do_not_establish_a_relationship() {
        let now = Utc::now();
        let timeline = vec![
            message(
                Direction::Outbound,
                "exec@big.com",
                "t1",
                now - Duration::days(20),
                "proposal attached",
            ),
            message(
                Direction::Inbound,
                "exec@big.com",
                "t1",
                now - Duration::days(20) + Duration::minutes(1),
                "Automatic reply: Out of office until further notice. For urgent matters contact my assistant.",
            ),
        ];
        let features = derive_features(&timeline);
        assert_eq!(features.reply_quality, ReplyQuality::Auto);

        let status = classify(&features, RelationshipStatus::Cold, &AnalyzerConfig::default(), now);
        assert_eq!(status, RelationshipStatus::Attempted);
    }

    #[test]
    fn ongoing_requires_recent_activity() {
        let now = Utc::now();
        let timeline = vec![
            message(
                Direction::Outbound,
                "peer@co.com",
                "t1",
                now - Duration::days(50),
                "thoughts?",
            ),
            message(
                Direction::Inbound,
                "peer@co.com",
                "t1",
                now - Duration::days(49),
                "ok",
            ),
            message(
                Direction::Inbound,
                "peer@co.com",
                "t2",
                now - Duration::days(30),
                "ping",
            ),
        ];
        let features = derive_features(&timeline);
        assert_eq!(features.reply_quality, ReplyQuality::Brief);

        let status = classify(&features, RelationshipStatus::Cold, &AnalyzerConfig::default(), now);
        assert_eq!(status, RelationshipStatus::Ongoing);
    }

    #[test]
    fn classification_is_deterministic() {
        let now = Utc::now();
        let timeline = vec![
            message(
                Direction::Outbound,
                "a@b.com",
                "t1",
                now - Duration::days(10),
                "hello",
            ),
            message(
                Direction::Inbound,
                "a@b.com",
                "t1",
                now - Duration::days(9),
                &long_body(),
            ),
        ];
        let first = derive_features(&timeline);
        let second = derive_features(&timeline);
        assert_eq!(first, second);
        assert_eq!(
            engagement_score(&first, now),
            engagement_score(&second, now)
        );
    }

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

    async fn seed_contact_with_exchange(db: &Database, account: &Account, email: &str) {
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

        let repo = MessageRepository::new(db.clone());
        let now = Utc::now();
        repo.upsert(NewMessage {
            account_id: account.id.clone(),
            external_id: format!("{email}-out"),
            thread_id: format!("{email}-t"),
            direction: Direction::Outbound,
            sent_at: now - Duration::days(4),
            from_email: "owner@example.com".to_string(),
            to: vec![email.to_string()],
            cc: vec![],
            bcc: vec![],
            subject: Some("Plan".to_string()),
            body_text: Some("Draft attached".to_string()),
        })
        .await
        .expect("outbound");
        repo.upsert(NewMessage {
            account_id: account.id.clone(),
            external_id: format!("{email}-in"),
            thread_id: format!("{email}-t"),
            direction: Direction::Inbound,
            sent_at: now - Duration::days(3),
            from_email: email.to_string(),
            to: vec!["owner@example.com".to_string()],
            cc: vec![],
            bcc: vec![],
            subject: Some("Re: Plan".to_string()),
            body_text: Some(long_body()),
        })
        .await
        .expect("inbound");
    }

    #[tokio::test]
    async fn run_writes_status_and_score_back() {
        let (db, account, _dir) = setup().await;
        seed_contact_with_exchange(&db, &account, "alice@x.com").await;

        let analyzer = CommIntelligenceAnalyzer::new(db.clone(), AnalyzerConfig::default());
        let outcome = analyzer
            .run(&account, &CancellationToken::new(), &|_| {})
            .await
            .expect("analyze");
        assert_eq!(outcome.classified, 1);

        let contact = ContactRepository::new(db.clone())
            .get(&account.id, "alice@x.com")
            .await
            .expect("contact");
        assert_eq!(contact.status, RelationshipStatus::Established);
        assert!(contact.engagement_score > 0.5);
        assert_eq!(contact.inbound_count, 1);
    }

    #[tokio::test]
    async fn enrichment_failure_is_nonfatal() {
        let (db, account, _dir) = setup().await;
        seed_contact_with_exchange(&db, &account, "alice@x.com").await;

        let analyzer = CommIntelligenceAnalyzer::new(db.clone(), AnalyzerConfig::default())
            .with_enricher(Arc::new(FailingEnricher));
        let outcome = analyzer
            .run(&account, &CancellationToken::new(), &|_| {})
            .await
            .expect("analyze completes despite enrichment failure");
        assert_eq!(outcome.enrichment_failures, 1);

        let contact = ContactRepository::new(db.clone())
            .get(&account.id, "alice@x.com")
            .await
            .expect("contact");
        assert_eq!(contact.enrichment_status.as_deref(), Some("failed"));
    }

    #[tokio::test]
    async fn enrichment_success_is_recorded() {
        let (db, account, _dir) = setup().await;
        seed_contact_with_exchange(&db, &account, "alice@x.com").await;

        let analyzer = CommIntelligenceAnalyzer::new(db.clone(), AnalyzerConfig::default())
            .with_enricher(Arc::new(StaticEnricher(json!({"company": "Acme"}))));
        let outcome = analyzer
            .run(&account, &CancellationToken::new(), &|_| {})
            .await
            .expect("analyze");
        assert_eq!(outcome.enriched, 1);

        let contact = ContactRepository::new(db.clone())
            .get(&account.id, "alice@x.com")
            .await
            .expect("contact");
        assert_eq!(contact.enrichment_status.as_deref(), Some("ok"));
        assert_eq!(contact.enrichment.expect("record")["company"], "Acme");
    }
}
