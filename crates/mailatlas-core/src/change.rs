use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::config::RebuildConfig;
use crate::organizer::OrganizedSnapshot;

/// Whether Phase 2 must run for a freshly organized snapshot, and why. The
/// reason string is recorded on the job so rebuild economics stay auditable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebuildDecision {
    pub rebuild: bool,
    pub reason: String,
}

impl RebuildDecision {
    fn rebuild(reason: impl Into<String>) -> Self {
        Self {
            rebuild: true,
            reason: reason.into(),
        }
    }

    fn reuse(reason: impl Into<String>) -> Self {
        Self {
            rebuild: false,
            reason: reason.into(),
        }
    }
}

pub struct ChangeDetector {
    config: RebuildConfig,
}

impl ChangeDetector {
    pub fn new(config: RebuildConfig) -> Self {
        Self { config }
    }

    /// `previous` is the snapshot behind the latest published tree, or `None`
    /// when no tree exists yet.
    pub fn decide(
        &self,
        current: &OrganizedSnapshot,
        previous: Option<&OrganizedSnapshot>,
        force: bool,
    ) -> RebuildDecision {
        if force {
            return RebuildDecision::rebuild("rebuild forced by caller");
        }

        let Some(previous) = previous else {
            return RebuildDecision::rebuild("no prior knowledge tree");
        };

        if current.fingerprint == previous.fingerprint {
            return RebuildDecision::reuse("snapshot fingerprint unchanged, tree reused");
        }

        let new_messages = (current.message_count - previous.message_count).max(0);
        let pct = if previous.message_count > 0 {
            new_messages as f64 * 100.0 / previous.message_count as f64
        } else if current.message_count > 0 {
            100.0
        } else {
            0.0
        };
        if pct >= self.config.min_new_messages_pct {
            return RebuildDecision::rebuild(format!(
                "{new_messages} new messages ({pct:.1}% growth)"
            ));
        }

        let current_topics: BTreeSet<&str> =
            current.topics.iter().map(|t| t.topic_id.as_str()).collect();
        let previous_topics: BTreeSet<&str> =
            previous.topics.iter().map(|t| t.topic_id.as_str()).collect();
        let added = current_topics.difference(&previous_topics).count();
        if added >= 1 {
            return RebuildDecision::rebuild(format!("{added} new topic(s) discovered"));
        }

        RebuildDecision::reuse(format!(
            "change below threshold ({pct:.1}% new messages, no new topics), tree reused"
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::organizer::TopicSummary;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn snapshot(message_count: i64, topic_ids: &[&str], fingerprint: &str) -> OrganizedSnapshot {
        OrganizedSnapshot {
            id: uuid::Uuid::new_v4().to_string(),
            account_id: "acct".to_string(),
            generated_at: Utc::now(),
            message_count,
            max_sent_at: None,
            topics: topic_ids
                .iter()
                .map(|id| TopicSummary {
                    topic_id: id.to_string(),
                    label: "label".to_string(),
                    domain: "general".to_string(),
                    participants: vec![],
                    message_refs: vec![],
                    started_at: Utc::now(),
                    ended_at: Utc::now(),
                    key_points: vec![],
                    participant_statuses: BTreeMap::new(),
                })
                .collect(),
            contacts: vec![],
            contact_topics: BTreeMap::new(),
            fingerprint: fingerprint.to_string(),
        }
    }

    fn detector() -> ChangeDetector {
        ChangeDetector::new(RebuildConfig::default())
    }

    #[test]
    fn first_run_always_rebuilds() {
        let current = snapshot(10, &["t1"], "fp");
        let decision = detector().decide(&current, None, false);
        assert!(decision.rebuild);
        assert!(decision.reason.contains("no prior"));
    }

    #[test]
    fn force_overrides_everything() {
        let current = snapshot(10, &["t1"], "fp");
        let previous = snapshot(10, &["t1"], "fp");
        let decision = detector().decide(&current, Some(&previous), true);
        assert!(decision.rebuild);
        assert!(decision.reason.contains("forced"));
    }

    #[test]
    fn identical_fingerprint_reuses() {
        let current = snapshot(10, &["t1"], "fp");
        let previous = snapshot(10, &["t1"], "fp");
        let decision = detector().decide(&current, Some(&previous), false);
        assert!(!decision.rebuild);
        assert!(decision.reason.contains("reused"));
    }

    #[test]
    fn five_percent_growth_triggers_rebuild() {
        let previous = snapshot(100, &["t1"], "fp-a");
        let current = snapshot(105, &["t1"], "fp-b");
        let decision = detector().decide(&current, Some(&previous), false);
        assert!(decision.rebuild);
        assert!(decision.reason.contains("5 new messages"));
    }

    #[test]
    fn small_growth_without_new_topics_reuses() {
        let previous = snapshot(100, &["t1"], "fp-a");
        let current = snapshot(102, &["t1"], "fp-b");
        let decision = detector().decide(&current, Some(&previous), false);
        assert!(!decision.rebuild);
    }

    #[test]
    fn new_topic_triggers_rebuild_even_with_small_growth() {
        let previous = snapshot(100, &["t1"], "fp-a");
        let current = snapshot(101, &["t1", "t2"], "fp-b");
        let decision = detector().decide(&current, Some(&previous), false);
        assert!(decision.rebuild);
        assert!(decision.reason.contains("new topic"));
    }
}
