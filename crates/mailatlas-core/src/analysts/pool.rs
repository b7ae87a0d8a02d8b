use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::prompts::{PromptBuilder, REASK_PROMPT};
use super::{AnalystKind, AnalystResponse, Finding, RawFinding};
use crate::backoff::LLM_TRANSPORT;
use crate::config::{LlmConfig, PoolConfig};
use crate::llm::{ChatMessage, ChatRole, CompletionRequest, LLMClient, LLMError};
use crate::organizer::OrganizedSnapshot;
use crate::rate_limit::TokenBucket;

/// Total time one analyst may spend parked on rate limits.
const MAX_RATE_LIMIT_WAIT: Duration = Duration::from_secs(300);

/// Wait when the provider rate-limits without a suggested interval.
const DEFAULT_RATE_LIMIT_WAIT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct AnalystFailure {
    pub kind: AnalystKind,
    pub error: String,
}

#[derive(Debug, Default)]
pub struct PoolOutcome {
    /// All validated findings, sorted by analyst kind for reproducible
    /// downstream merging.
    pub findings: Vec<Finding>,
    pub failures: Vec<AnalystFailure>,
    pub cancelled: bool,
}

enum AnalystRun {
    Findings(Vec<Finding>),
    Failed(String),
    Cancelled,
}

/// Fans the five analysts out over one snapshot, bounded by the pool size
/// and a per-kind token bucket. Individual analyst failures never fail the
/// pool; cancellation stops in-flight analysts at their next suspension
/// point.
pub struct AnalystPool {
    llm: Arc<dyn LLMClient>,
    prompts: PromptBuilder,
    buckets: HashMap<AnalystKind, TokenBucket>,
    pool: PoolConfig,
    llm_config: LlmConfig,
}

impl AnalystPool {
    pub fn new(llm: Arc<dyn LLMClient>, pool: PoolConfig, llm_config: LlmConfig) -> Self {
        let buckets = AnalystKind::ALL
            .iter()
            .map(|kind| (*kind, TokenBucket::new(pool.rate_per_min, pool.burst)))
            .collect();
        Self {
            llm,
            prompts: PromptBuilder::new(llm_config.max_input_tokens),
            buckets,
            pool,
            llm_config,
        }
    }

    pub async fn run(
        &self,
        snapshot: &OrganizedSnapshot,
        cancel: &CancellationToken,
        on_progress: &(dyn Fn(f64) + Send + Sync),
    ) -> PoolOutcome {
        let known_ids: BTreeSet<String> = snapshot
            .message_ids()
            .into_iter()
            .map(str::to_string)
            .collect();
        let known_topics: BTreeSet<&str> = snapshot
            .topics
            .iter()
            .map(|t| t.topic_id.as_str())
            .collect();

        let total = AnalystKind::ALL.len();
        let mut outcome = PoolOutcome::default();

        let mut stream = futures::stream::iter(
            AnalystKind::ALL
                .map(|kind| async move { (kind, self.run_analyst(kind, snapshot, cancel).await) }),
        )
        .buffer_unordered(self.pool.size.max(1));

        let mut done = 0usize;
        while let Some((kind, run)) = stream.next().await {
            match run {
                AnalystRun::Findings(findings) => {
                    info!(analyst = %kind, count = findings.len(), "analyst finished");
                    outcome.findings.extend(findings);
                }
                AnalystRun::Failed(error) => {
                    warn!(analyst = %kind, error = %error, "analyst failed");
                    outcome.failures.push(AnalystFailure { kind, error });
                }
                AnalystRun::Cancelled => {
                    outcome.cancelled = true;
                }
            }
            done += 1;
            on_progress(done as f64 / total as f64);
        }
        drop(stream);

        // Validate against the snapshot: evidence must resolve to snapshot
        // message refs, topics to snapshot topics, confidence to [0,1].
        for finding in &mut outcome.findings {
            finding.confidence = finding.confidence.clamp(0.0, 1.0);
            finding.evidence.retain(|id| known_ids.contains(id));
            if let Some(topic_id) = &finding.topic_id {
                if !known_topics.contains(topic_id.as_str()) {
                    finding.topic_id = None;
                }
            }
        }

        outcome.findings.sort_by(|a, b| {
            a.analyst
                .cmp(&b.analyst)
                .then_with(|| a.category.cmp(&b.category))
                .then_with(|| a.content.cmp(&b.content))
        });
        outcome.failures.sort_by(|a, b| a.kind.cmp(&b.kind));
        outcome
    }

    async fn run_analyst(
        &self,
        kind: AnalystKind,
        snapshot: &OrganizedSnapshot,
        cancel: &CancellationToken,
    ) -> AnalystRun {
        let system = self.prompts.system_prompt(kind);
        let user = self.prompts.user_prompt(snapshot);
        let request = CompletionRequest::system_and_user(
            system,
            user,
            self.llm_config.temperature,
            self.llm_config.max_output_tokens,
        );

        let bucket = &self.buckets[&kind];
        let mut attempt = 0u32;
        let mut rate_limited_for = Duration::ZERO;
        let mut reasked = false;
        let mut current = request.clone();

        loop {
            if cancel.is_cancelled() {
                return AnalystRun::Cancelled;
            }

            tokio::select! {
                _ = cancel.cancelled() => return AnalystRun::Cancelled,
                _ = bucket.acquire() => {}
            }

            let response = tokio::select! {
                _ = cancel.cancelled() => return AnalystRun::Cancelled,
                result = self.llm.complete(current.clone(), kind.as_str()) => result,
            };

            match response {
                Ok(completion) => match parse_findings(kind, &completion.content) {
                    Ok(findings) => return AnalystRun::Findings(findings),
                    Err(parse_err) if !reasked => {
                        warn!(analyst = %kind, error = %parse_err, "schema mismatch, re-asking");
                        reasked = true;
                        current = with_reask(&request, &completion.content);
                    }
                    Err(parse_err) => {
                        // Second schema failure: empty finding set, not fatal.
                        warn!(analyst = %kind, error = %parse_err, "schema mismatch after re-ask, dropping output");
                        return AnalystRun::Failed(format!("invalid response schema: {parse_err}"));
                    }
                },
                Err(LLMError::RateLimited(info)) => {
                    let wait = info
                        .retry_after_ms
                        .map(Duration::from_millis)
                        .unwrap_or(DEFAULT_RATE_LIMIT_WAIT);
                    rate_limited_for += wait;
                    if rate_limited_for > MAX_RATE_LIMIT_WAIT {
                        return AnalystRun::Failed("rate limited past the cumulative wait cap".into());
                    }
                    // Parked, not counted as an attempt.
                    tokio::select! {
                        _ = cancel.cancelled() => return AnalystRun::Cancelled,
                        _ = sleep(wait) => {}
                    }
                }
                Err(err) if err.is_retryable_transport() && attempt + 1 < self.pool.retry_max => {
                    let delay = LLM_TRANSPORT.delay_with_jitter(attempt);
                    warn!(analyst = %kind, attempt, error = %err, "transport error, retrying in {delay:?}");
                    attempt += 1;
                    tokio::select! {
                        _ = cancel.cancelled() => return AnalystRun::Cancelled,
                        _ = sleep(delay) => {}
                    }
                }
                Err(err) => return AnalystRun::Failed(err.to_string()),
            }
        }
    }
}

fn with_reask(original: &CompletionRequest, bad_response: &str) -> CompletionRequest {
    let mut request = original.clone();
    request.messages.push(ChatMessage {
        role: ChatRole::Assistant,
        content: bad_response.to_string(),
    });
    request.messages.push(ChatMessage {
        role: ChatRole::User,
        content: REASK_PROMPT.to_string(),
    });
    request
}

fn parse_findings(kind: AnalystKind, content: &str) -> Result<Vec<Finding>, serde_json::Error> {
    let stripped = strip_code_fences(content);
    let response: AnalystResponse = serde_json::from_str(stripped)?;
    Ok(response
        .findings
        .into_iter()
        .map(|raw| to_finding(kind, raw))
        .collect())
}

fn to_finding(kind: AnalystKind, raw: RawFinding) -> Finding {
    Finding {
        analyst: kind,
        category: raw.category,
        content: raw.content,
        confidence: raw.confidence,
        evidence: raw.evidence,
        topic_id: raw.topic_id,
    }
}

/// Models occasionally wrap JSON in markdown fences despite instructions.
fn strip_code_fences(content: &str) -> &str {
    let trimmed = content.trim();
    let without_open = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    without_open.strip_suffix("```").unwrap_or(without_open).trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLLMClient;
    use crate::organizer::TopicSummary;
    use chrono::Utc;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn snapshot() -> OrganizedSnapshot {
        OrganizedSnapshot {
            id: "snap".to_string(),
            account_id: "acct".to_string(),
            generated_at: Utc::now(),
            message_count: 2,
            max_sent_at: None,
            topics: vec![TopicSummary {
                topic_id: "t1".to_string(),
                label: "budget".to_string(),
                domain: "finance".to_string(),
                participants: vec!["alice@x.com".to_string()],
                message_refs: vec!["m1".to_string(), "m2".to_string()],
                started_at: Utc::now(),
                ended_at: Utc::now(),
                key_points: vec![],
                participant_statuses: BTreeMap::new(),
            }],
            contacts: vec![],
            contact_topics: BTreeMap::new(),
            fingerprint: "fp".to_string(),
        }
    }

    fn valid_payload(category: &str) -> String {
        json!({
            "findings": [{
                "category": category,
                "content": "Budget pressure is concentrated in one vendor relationship.",
                "confidence": 0.8,
                "evidence": ["m1", "bogus-id"],
                "topic_id": "t1"
            }]
        })
        .to_string()
    }

    fn pool(llm: &MockLLMClient) -> AnalystPool {
        AnalystPool::new(
            Arc::new(llm.clone()),
            PoolConfig::default(),
            LlmConfig::default(),
        )
    }

    #[tokio::test]
    async fn all_analysts_contribute_sorted_findings() {
        let llm = MockLLMClient::new();
        for kind in AnalystKind::ALL {
            llm.enqueue_text_for(kind.as_str(), valid_payload("signal"));
        }

        let outcome = pool(&llm)
            .run(&snapshot(), &CancellationToken::new(), &|_| {})
            .await;

        assert!(outcome.failures.is_empty());
        assert!(!outcome.cancelled);
        assert_eq!(outcome.findings.len(), 5);

        let kinds: Vec<AnalystKind> = outcome.findings.iter().map(|f| f.analyst).collect();
        let mut sorted = kinds.clone();
        sorted.sort();
        assert_eq!(kinds, sorted, "findings are merged in analyst order");

        // Unknown evidence ids are dropped, known ones kept.
        for finding in &outcome.findings {
            assert_eq!(finding.evidence, vec!["m1".to_string()]);
            assert_eq!(finding.topic_id.as_deref(), Some("t1"));
        }
    }

    #[tokio::test]
    async fn schema_mismatch_is_reasked_once() {
        let llm = MockLLMClient::new();
        for kind in AnalystKind::ALL {
            if kind == AnalystKind::Predictive {
                llm.enqueue_text_for(kind.as_str(), "I think the findings are...");
                llm.enqueue_text_for(kind.as_str(), valid_payload("forecast"));
            } else {
                llm.enqueue_text_for(kind.as_str(), valid_payload("signal"));
            }
        }

        let outcome = pool(&llm)
            .run(&snapshot(), &CancellationToken::new(), &|_| {})
            .await;
        assert_eq!(outcome.findings.len(), 5);
        assert!(outcome.failures.is_empty());
        assert_eq!(llm.call_count(), 6, "one extra call for the re-ask");

        let reask = llm
            .recorded_requests()
            .iter()
            .flat_map(|r| r.messages.clone())
            .any(|m| m.content.contains("not valid JSON"));
        assert!(reask, "re-ask reminder was sent");
    }

    #[tokio::test]
    async fn persistent_schema_failure_yields_empty_nonfatal_set() {
        let llm = MockLLMClient::new();
        for kind in AnalystKind::ALL {
            if kind == AnalystKind::Predictive {
                llm.enqueue_text_for(kind.as_str(), "not json");
                llm.enqueue_text_for(kind.as_str(), "still not json");
            } else {
                llm.enqueue_text_for(kind.as_str(), valid_payload("signal"));
            }
        }

        let outcome = pool(&llm)
            .run(&snapshot(), &CancellationToken::new(), &|_| {})
            .await;
        assert_eq!(outcome.findings.len(), 4, "predictive contributes nothing");
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].kind, AnalystKind::Predictive);
        assert!(outcome.failures[0].error.contains("schema"));
    }

    #[tokio::test(start_paused = true)]
    async fn transport_errors_are_retried_then_recorded() {
        let llm = MockLLMClient::new();
        for kind in AnalystKind::ALL {
            if kind == AnalystKind::TechnicalEvolution {
                for _ in 0..3 {
                    llm.enqueue_for(kind.as_str(), Err(LLMError::Timeout));
                }
            } else {
                llm.enqueue_text_for(kind.as_str(), valid_payload("signal"));
            }
        }

        let outcome = pool(&llm)
            .run(&snapshot(), &CancellationToken::new(), &|_| {})
            .await;
        assert_eq!(outcome.findings.len(), 4);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].kind, AnalystKind::TechnicalEvolution);
        assert!(!outcome.cancelled);
        assert_eq!(llm.call_count(), 7, "three attempts for the failing analyst");
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limits_park_without_consuming_attempts() {
        let llm = MockLLMClient::new();
        for kind in AnalystKind::ALL {
            if kind == AnalystKind::BusinessStrategy {
                llm.enqueue_for(
                    kind.as_str(),
                    Err(LLMError::RateLimited(crate::llm::RateLimitInfo::new(Some(
                        1500,
                    )))),
                );
                llm.enqueue_text_for(kind.as_str(), valid_payload("risk"));
            } else {
                llm.enqueue_text_for(kind.as_str(), valid_payload("signal"));
            }
        }

        let outcome = pool(&llm)
            .run(&snapshot(), &CancellationToken::new(), &|_| {})
            .await;
        assert_eq!(outcome.findings.len(), 5);
        assert!(outcome.failures.is_empty());
    }

    #[tokio::test]
    async fn cancellation_is_reported() {
        let llm = MockLLMClient::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = pool(&llm).run(&snapshot(), &cancel, &|_| {}).await;
        assert!(outcome.cancelled);
        assert!(outcome.findings.is_empty());
        assert_eq!(llm.call_count(), 0, "no provider calls after cancellation");
    }

    #[tokio::test]
    async fn out_of_range_confidence_is_clamped() {
        let llm = MockLLMClient::new();
        for kind in AnalystKind::ALL {
            llm.enqueue_text_for(
                kind.as_str(),
                json!({
                    "findings": [{
                        "category": "signal",
                        "content": format!("Overconfident output from {kind:?}"),
                        "confidence": 1.7,
                    }]
                })
                .to_string(),
            );
        }

        let outcome = pool(&llm)
            .run(&snapshot(), &CancellationToken::new(), &|_| {})
            .await;
        assert!(outcome.findings.iter().all(|f| f.confidence <= 1.0));
    }

    #[test]
    fn code_fences_are_stripped() {
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("{\"a\":1}"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```\n{}\n```"), "{}");
    }
}
