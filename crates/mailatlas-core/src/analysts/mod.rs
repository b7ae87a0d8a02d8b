//! The analyst pool: five specialized LLM roles that consume the organized
//! snapshot in parallel and return typed findings. Analysts never see raw
//! mail.

pub mod pool;
pub mod prompts;

pub use pool::{AnalystFailure, AnalystPool, PoolOutcome};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// The closed set of analyst roles. The names are part of the contract:
/// findings, prompts, and the audit log all key on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AnalystKind {
    BusinessStrategy,
    MarketIntelligence,
    Predictive,
    RelationshipDynamics,
    TechnicalEvolution,
}

impl AnalystKind {
    pub const ALL: [AnalystKind; 5] = [
        AnalystKind::BusinessStrategy,
        AnalystKind::MarketIntelligence,
        AnalystKind::Predictive,
        AnalystKind::RelationshipDynamics,
        AnalystKind::TechnicalEvolution,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AnalystKind::BusinessStrategy => "business-strategy",
            AnalystKind::MarketIntelligence => "market-intelligence",
            AnalystKind::Predictive => "predictive",
            AnalystKind::RelationshipDynamics => "relationship-dynamics",
            AnalystKind::TechnicalEvolution => "technical-evolution",
        }
    }
}

impl std::fmt::Display for AnalystKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One validated finding produced by an analyst over a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub analyst: AnalystKind,
    pub category: String,
    pub content: String,
    /// Confidence in [0,1].
    pub confidence: f64,
    /// Message ids from the source snapshot backing this finding.
    pub evidence: Vec<String>,
    /// Topic the finding attaches to; `None` means cross-topic.
    pub topic_id: Option<String>,
}

/// Wire shape the analysts are asked to return. Kept separate from
/// [`Finding`] so the LLM contract can evolve without touching the tree.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct AnalystResponse {
    pub findings: Vec<RawFinding>,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct RawFinding {
    /// One of the categories listed in the analyst prompt.
    pub category: String,
    /// The finding itself, one to three sentences.
    pub content: String,
    /// Confidence between 0 and 1.
    pub confidence: f64,
    /// Message ids from the snapshot supporting the finding.
    #[serde(default)]
    pub evidence: Vec<String>,
    /// Topic id from the snapshot this finding belongs to, if any.
    #[serde(default)]
    pub topic_id: Option<String>,
}
