//! Synthesizer: folds analyst finding sets into one hierarchical knowledge
//! tree. The tree is an arena of nodes plus an edge list keyed by finding
//! id, never a pointer graph, so cross-domain links cannot form ownership
//! cycles.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::analysts::{AnalystKind, Finding};
use crate::organizer::{OrganizedSnapshot, normalize_tokens};

/// Topic node that collects findings not attached to any snapshot topic.
pub const CROSS_TOPIC: &str = "__cross_topic__";

/// Jaccard similarity at or above which two findings are considered the
/// same insight and merged.
const DEDUP_JACCARD: f64 = 0.85;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeFinding {
    pub finding_id: String,
    pub category: String,
    pub content: String,
    pub confidence: f64,
    pub evidence: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalystNode {
    pub analyst: AnalystKind,
    pub findings: Vec<TreeFinding>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicNode {
    pub topic_id: String,
    pub label: String,
    pub analysts: Vec<AnalystNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainNode {
    pub domain: String,
    pub topics: Vec<TopicNode>,
}

/// Edge between two findings that share evidence, by finding id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossDomainEdge {
    pub from_finding: String,
    pub to_finding: String,
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeContent {
    pub domains: Vec<DomainNode>,
    pub edges: Vec<CrossDomainEdge>,
    /// Analyst kinds that contributed at least one finding.
    pub analyst_kinds: Vec<AnalystKind>,
}

/// Pure fold of analyst findings over a snapshot. Input order does not
/// matter; output is fully deterministic.
pub fn synthesize(snapshot: &OrganizedSnapshot, findings: &[Finding]) -> TreeContent {
    let mut sorted: Vec<&Finding> = findings.iter().collect();
    sorted.sort_by(|a, b| {
        a.analyst
            .cmp(&b.analyst)
            .then_with(|| a.category.cmp(&b.category))
            .then_with(|| a.content.cmp(&b.content))
    });

    // domain -> topic -> analyst -> merged findings
    let mut arena: BTreeMap<String, BTreeMap<String, BTreeMap<AnalystKind, Vec<MergedFinding>>>> =
        BTreeMap::new();

    for finding in sorted {
        let (domain, topic_id) = place(snapshot, finding);
        let bucket = arena
            .entry(domain)
            .or_default()
            .entry(topic_id)
            .or_default()
            .entry(finding.analyst)
            .or_default();
        merge_into(bucket, finding);
    }

    let mut next_id = 0usize;
    let mut domains = Vec::new();
    let mut all: Vec<(String, BTreeSet<String>)> = Vec::new();
    let mut kinds: BTreeSet<AnalystKind> = BTreeSet::new();

    for (domain, topics) in arena {
        let mut topic_nodes = Vec::new();
        for (topic_id, analysts) in topics {
            let mut analyst_nodes = Vec::new();
            for (analyst, merged) in analysts {
                kinds.insert(analyst);
                let mut tree_findings: Vec<TreeFinding> = merged
                    .into_iter()
                    .map(|m| {
                        let finding_id = format!("f-{next_id:04}");
                        next_id += 1;
                        all.push((finding_id.clone(), m.evidence.iter().cloned().collect()));
                        TreeFinding {
                            finding_id,
                            category: m.category,
                            content: m.content,
                            confidence: m.confidence,
                            evidence: m.evidence,
                        }
                    })
                    .collect();
                tree_findings.sort_by(|a, b| {
                    rank(b).partial_cmp(&rank(a)).unwrap_or(std::cmp::Ordering::Equal)
                });
                analyst_nodes.push(AnalystNode {
                    analyst,
                    findings: tree_findings,
                });
            }
            let label = snapshot
                .topic(&topic_id)
                .map(|t| t.label.clone())
                .unwrap_or_else(|| "cross-topic".to_string());
            topic_nodes.push(TopicNode {
                topic_id,
                label,
                analysts: analyst_nodes,
            });
        }
        domains.push(DomainNode {
            domain,
            topics: topic_nodes,
        });
    }

    TreeContent {
        domains,
        edges: shared_evidence_edges(&all),
        analyst_kinds: kinds.into_iter().collect(),
    }
}

/// Ranking weight within a parent node.
fn rank(finding: &TreeFinding) -> f64 {
    finding.confidence * (1.0 + (1.0 + finding.evidence.len() as f64).ln())
}

fn place(snapshot: &OrganizedSnapshot, finding: &Finding) -> (String, String) {
    match finding
        .topic_id
        .as_deref()
        .and_then(|id| snapshot.topic(id))
    {
        Some(topic) => (topic.domain.clone(), topic.topic_id.clone()),
        None => ("general".to_string(), CROSS_TOPIC.to_string()),
    }
}

#[derive(Debug, Clone)]
struct MergedFinding {
    category: String,
    content: String,
    confidence: f64,
    evidence: Vec<String>,
    tokens: BTreeSet<String>,
}

/// Merge a finding into the bucket, collapsing near-duplicates. Merged
/// confidence is the probability that at least one source is right:
/// `1 - prod(1 - c_i)`. Evidence lists are unioned.
fn merge_into(bucket: &mut Vec<MergedFinding>, finding: &Finding) {
    let tokens = normalized_token_set(&finding.content);

    for existing in bucket.iter_mut() {
        if jaccard(&existing.tokens, &tokens) >= DEDUP_JACCARD {
            existing.confidence =
                1.0 - (1.0 - existing.confidence) * (1.0 - finding.confidence);
            let mut evidence: BTreeSet<String> =
                existing.evidence.iter().cloned().collect();
            evidence.extend(finding.evidence.iter().cloned());
            existing.evidence = evidence.into_iter().collect();
            existing.tokens.extend(tokens);
            return;
        }
    }

    bucket.push(MergedFinding {
        category: finding.category.clone(),
        content: finding.content.clone(),
        confidence: finding.confidence,
        evidence: {
            let set: BTreeSet<String> = finding.evidence.iter().cloned().collect();
            set.into_iter().collect()
        },
        tokens,
    });
}

fn normalized_token_set(content: &str) -> BTreeSet<String> {
    normalize_tokens(content).into_iter().map(stem).collect()
}

/// Cheap suffix-stripping stemmer, enough to make "decisions" and
/// "decision" collide.
fn stem(token: String) -> String {
    for suffix in ["ing", "edly", "ed", "es", "s", "ly"] {
        if let Some(stripped) = token.strip_suffix(suffix) {
            if stripped.len() >= 3 {
                return stripped.to_string();
            }
        }
    }
    token
}

fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    intersection / union
}

/// Edges between findings sharing at least two evidence message ids.
fn shared_evidence_edges(findings: &[(String, BTreeSet<String>)]) -> Vec<CrossDomainEdge> {
    let mut edges = Vec::new();
    for (i, (id_a, ev_a)) in findings.iter().enumerate() {
        for (id_b, ev_b) in findings.iter().skip(i + 1) {
            let shared = ev_a.intersection(ev_b).count();
            if shared >= 2 {
                let denom = ev_a.len().min(ev_b.len()) as f64;
                edges.push(CrossDomainEdge {
                    from_finding: id_a.clone(),
                    to_finding: id_b.clone(),
                    weight: shared as f64 / denom,
                });
            }
        }
    }
    edges
}
