pub mod accounts;
pub mod analysts;
pub mod analyzer;
pub mod backoff;
pub mod change;
pub mod config;
pub mod contacts;
pub mod db;
pub mod enrich;
pub mod events;
pub mod extract;
pub mod ingest;
pub mod llm;
pub mod mail_source;
pub mod messages;
pub mod migrations;
pub mod organizer;
pub mod pipeline;
pub mod rate_limit;
pub mod snapshots;
pub mod supervisor;
pub mod synthesizer;
pub mod telemetry;
pub mod threads;
pub mod trees;

pub use accounts::{Account, AccountError, AccountRepository};
pub use analysts::{AnalystFailure, AnalystKind, AnalystPool, Finding, PoolOutcome};
pub use analyzer::{
    CommIntelligenceAnalyzer, ContactFeatures, ReplyQuality, classify, derive_features,
    engagement_score,
};
pub use change::{ChangeDetector, RebuildDecision};
pub use config::{Config, ConfigError};
pub use contacts::{
    Contact, ContactError, ContactRepository, DiscoveredContact, RelationshipStatus, TrustTier,
};
pub use db::Database;
pub use enrich::{EnrichError, Enricher};
pub use events::{Event, EventSink, NoopEventSink, RecordingEventSink};
pub use extract::{ExtractOutcome, TrustedContactExtractor};
pub use ingest::{IngestOutcome, MessageIngester};
pub use llm::{
    ChatMessage, ChatRole, CompletionRequest, CompletionResponse, GenaiLLMClient, LLMClient,
    LLMError, LlmCallRepository, MockLLMClient, RateLimitInfo,
};
pub use mail_source::{FetchedMessage, MailSource, MailSourceError, MockMailSource};
pub use messages::{Direction, Message, MessageError, MessageRepository, NewMessage};
pub use organizer::{ContactDigest, OrganizedSnapshot, Organizer, TopicSummary};
pub use pipeline::{PipelineContext, PipelineExecutor, PipelineSettings};
pub use snapshots::{SnapshotError, SnapshotRepository};
pub use supervisor::{
    ErrorKind, JobExecutor, JobHandle, JobKind, JobPayload, JobState, JobStatus, JobStore,
    JobSupervisor, Phase, PipelineJob, ResumeInfo, SupervisorConfig, SupervisorError,
    run_supervisor,
};
pub use synthesizer::{CrossDomainEdge, DomainNode, TreeContent, synthesize};
pub use telemetry::{TelemetryError, TelemetryGuard, init_logging, init_telemetry};
pub use threads::{Thread, ThreadError, ThreadRepository};
pub use trees::{KnowledgeTree, TreeError, TreeRepository};
