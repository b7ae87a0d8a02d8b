//! Prompt construction for the analyst pool. Prompt text and output schema
//! live together so an analyst's contract is defined in one place.

use schemars::schema_for;

use super::{AnalystKind, AnalystResponse};
use crate::organizer::{OrganizedSnapshot, TopicSummary};

/// Rough token estimate used for truncation. Four characters per token is
/// the usual planning figure for English prose.
const CHARS_PER_TOKEN: usize = 4;

pub const REASK_PROMPT: &str = "Your previous response was not valid JSON conforming to the schema. \
     Return ONLY the JSON object, with no prose, no markdown fences, and no commentary.";

pub struct PromptBuilder {
    max_input_tokens: usize,
}

impl PromptBuilder {
    pub fn new(max_input_tokens: usize) -> Self {
        Self { max_input_tokens }
    }

    pub fn system_prompt(&self, kind: AnalystKind) -> String {
        let (role, categories) = role_and_categories(kind);
        let schema = schema_for!(AnalystResponse);
        let schema_json =
            serde_json::to_string_pretty(&schema).unwrap_or_else(|_| "{}".to_string());

        format!(
            "You are the {kind} analyst for a strategic-intelligence system. {role}\n\n\
             You will receive an organized summary of a user's correspondence: topics with \
             participants, relationship statuses, key points, and message ids. You never see \
             raw email.\n\n\
             Respond with findings in these categories: {categories}.\n\
             Every finding must carry a confidence between 0 and 1 and, where possible, the \
             message ids from the summary that support it as evidence. Attach each finding to \
             the topic id it belongs to, or omit topic_id for cross-topic findings.\n\n\
             Return ONLY a JSON object conforming to this schema:\n{schema_json}"
        )
    }

    /// Render the snapshot for the model, dropping the oldest topics first
    /// when the budget is exceeded.
    pub fn user_prompt(&self, snapshot: &OrganizedSnapshot) -> String {
        let budget_chars = self.max_input_tokens.saturating_mul(CHARS_PER_TOKEN);

        let mut header = String::new();
        header.push_str(&format!(
            "Correspondence snapshot ({} messages, generated {})\n\nContacts:\n",
            snapshot.message_count,
            snapshot.generated_at.format("%Y-%m-%d")
        ));
        for contact in &snapshot.contacts {
            header.push_str(&format!(
                "- {} [{}] engagement {:.2}, {} out / {} in\n",
                contact.email,
                contact.status,
                contact.engagement_score,
                contact.outbound_count,
                contact.inbound_count
            ));
        }
        header.push_str("\nTopics (newest first):\n");

        let mut topics: Vec<&TopicSummary> = snapshot.topics.iter().collect();
        topics.sort_by(|a, b| b.ended_at.cmp(&a.ended_at));

        let mut body = String::new();
        let mut dropped = 0usize;
        for topic in &topics {
            let rendered = render_topic(topic);
            if header.len() + body.len() + rendered.len() > budget_chars {
                dropped += 1;
                continue;
            }
            body.push_str(&rendered);
        }
        if dropped > 0 {
            body.push_str(&format!("\n({dropped} older topic(s) omitted for length)\n"));
        }

        header.push_str(&body);
        header
    }
}

fn render_topic(topic: &TopicSummary) -> String {
    let mut out = format!(
        "\n## {} (topic {}, domain {})\n{} – {}\nParticipants: {}\n",
        topic.label,
        topic.topic_id,
        topic.domain,
        topic.started_at.format("%Y-%m-%d"),
        topic.ended_at.format("%Y-%m-%d"),
        topic
            .participants
            .iter()
            .map(|p| match topic.participant_statuses.get(p) {
                Some(status) => format!("{p} ({status})"),
                None => p.clone(),
            })
            .collect::<Vec<_>>()
            .join(", ")
    );
    if !topic.key_points.is_empty() {
        out.push_str("Key points:\n");
        for point in &topic.key_points {
            out.push_str(&format!("- {point}\n"));
        }
    }
    out.push_str(&format!(
        "Message ids: {}\n",
        topic.message_refs.join(", ")
    ));
    out
}

fn role_and_categories(kind: AnalystKind) -> (&'static str, &'static str) {
    match kind {
        AnalystKind::BusinessStrategy => (
            "Identify strategic decisions in play, market positioning, concrete risks, and \
             opportunities worth pursuing.",
            "strategic-decision, positioning, risk, opportunity",
        ),
        AnalystKind::RelationshipDynamics => (
            "Map who influences whom, how communication actually flows, which collaborations \
             are healthy, and which outreach has gone unanswered.",
            "influence, communication-pattern, collaboration-health, attempted",
        ),
        AnalystKind::TechnicalEvolution => (
            "Track technical decisions, the direction the architecture is moving, and \
             tooling or platform shifts.",
            "technical-decision, architecture-direction, tooling",
        ),
        AnalystKind::MarketIntelligence => (
            "Surface market signals, competitive moves, and timing considerations visible \
             in the correspondence.",
            "market-signal, competitive-move, timing",
        ),
        AnalystKind::Predictive => (
            "Extrapolate from observed patterns: likely outcomes, upcoming decision points, \
             and trends worth watching.",
            "forecast, decision-point, trend",
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use std::collections::BTreeMap;

    fn topic(id: &str, label: &str, days_ago: i64, refs: &[&str]) -> TopicSummary {
        TopicSummary {
            topic_id: id.to_string(),
            label: label.to_string(),
            domain: "general".to_string(),
            participants: vec!["alice@x.com".to_string()],
            message_refs: refs.iter().map(|r| r.to_string()).collect(),
            started_at: Utc::now() - Duration::days(days_ago + 1),
            ended_at: Utc::now() - Duration::days(days_ago),
            key_points: vec!["Decided to move forward".to_string()],
            participant_statuses: BTreeMap::from([(
                "alice@x.com".to_string(),
                "established".to_string(),
            )]),
        }
    }

    fn snapshot(topics: Vec<TopicSummary>) -> OrganizedSnapshot {
        OrganizedSnapshot {
            id: "snap".to_string(),
            account_id: "acct".to_string(),
            generated_at: Utc::now(),
            message_count: 5,
            max_sent_at: None,
            topics,
            contacts: vec![],
            contact_topics: BTreeMap::new(),
            fingerprint: "fp".to_string(),
        }
    }

    #[test]
    fn system_prompt_names_kind_categories_and_schema() {
        let builder = PromptBuilder::new(32_000);
        let prompt = builder.system_prompt(AnalystKind::BusinessStrategy);
        assert!(prompt.contains("business-strategy analyst"));
        assert!(prompt.contains("strategic-decision"));
        assert!(prompt.contains("\"findings\""), "schema is embedded");
    }

    #[test]
    fn user_prompt_includes_topics_and_message_ids() {
        let builder = PromptBuilder::new(32_000);
        let prompt = builder.user_prompt(&snapshot(vec![topic("t1", "Budget", 2, &["m1", "m2"])]));
        assert!(prompt.contains("Budget"));
        assert!(prompt.contains("m1, m2"));
        assert!(prompt.contains("alice@x.com (established)"));
    }

    #[test]
    fn truncation_drops_oldest_topics_first() {
        // A budget that fits roughly one topic.
        let builder = PromptBuilder::new(80);
        let newest = topic("t-new", "Newest conversation", 1, &["m1"]);
        let oldest = topic("t-old", "Oldest conversation", 300, &["m9"]);
        let prompt = builder.user_prompt(&snapshot(vec![oldest, newest]));

        assert!(prompt.contains("t-new"), "newest topic survives truncation");
        assert!(!prompt.contains("t-old"), "oldest topic dropped");
        assert!(prompt.contains("omitted for length"));
    }
}
