//! The pipeline executor: drives Phase 1 (extract → ingest → classify →
//! organize) and Phase 2 (analyst pool → synthesize) inside a supervised
//! job. Phase 2 never touches raw mail; it sees only the organized
//! snapshot.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::time::timeout;
use tracing::{info, warn};

use crate::accounts::{Account, AccountError, AccountRepository};
use crate::analysts::AnalystPool;
use crate::analyzer::{AnalyzerError, CommIntelligenceAnalyzer};
use crate::change::{ChangeDetector, RebuildDecision};
use crate::config::{
    AnalyzerConfig, Config, JobConfig, LlmConfig, OrganizerConfig, PipelineConfig, PoolConfig,
    RebuildConfig,
};
use crate::db::Database;
use crate::enrich::Enricher;
use crate::events::{Event, EventSink};
use crate::extract::{ExtractError, TrustedContactExtractor};
use crate::ingest::{IngestError, MessageIngester};
use crate::llm::LLMClient;
use crate::mail_source::{MailSource, MailSourceError};
use crate::organizer::{OrganizedSnapshot, Organizer, OrganizerError};
use crate::snapshots::SnapshotRepository;
use crate::supervisor::{
    ErrorKind, JobExecutor, JobFailure, JobHandle, JobKind, JobPayload, JobSuccess, Phase,
    PipelineJob, ResumeInfo,
};
use crate::synthesizer::synthesize;
use crate::trees::TreeRepository;

/// Everything the pipeline reads from configuration, separated from the
/// service-level sections so tests can build it with plain defaults.
#[derive(Debug, Clone, Default)]
pub struct PipelineSettings {
    pub pipeline: PipelineConfig,
    pub analyzer: AnalyzerConfig,
    pub organizer: OrganizerConfig,
    pub rebuild: RebuildConfig,
    pub pool: PoolConfig,
    pub llm: LlmConfig,
    pub job: JobConfig,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            pipeline: config.pipeline.clone(),
            analyzer: config.analyzer.clone(),
            organizer: config.organizer.clone(),
            rebuild: config.rebuild.clone(),
            pool: config.pool.clone(),
            llm: config.llm.clone(),
            job: config.job.clone(),
        }
    }
}

/// Dependency-injected collaborators. There is no process-global state;
/// every component receives what it needs from here.
pub struct PipelineContext {
    pub db: Database,
    pub mail_source: Arc<dyn MailSource>,
    pub llm: Arc<dyn LLMClient>,
    pub enricher: Option<Arc<dyn Enricher>>,
    pub events: Arc<dyn EventSink>,
    pub settings: PipelineSettings,
}

pub struct PipelineExecutor {
    ctx: PipelineContext,
}

impl PipelineExecutor {
    pub fn new(ctx: PipelineContext) -> Self {
        Self { ctx }
    }

    fn snapshots(&self) -> SnapshotRepository {
        SnapshotRepository::new(self.ctx.db.clone(), self.ctx.settings.rebuild.retain_snapshots)
    }
}

#[async_trait]
impl JobExecutor for PipelineExecutor {
    async fn execute(
        &self,
        job: PipelineJob,
        handle: Arc<JobHandle>,
    ) -> Result<JobSuccess, JobFailure> {
        let account = AccountRepository::new(self.ctx.db.clone())
            .get_by_id(&job.payload.account_id)
            .await
            .map_err(|err| match err {
                AccountError::NotFound(id) => JobFailure::Failed {
                    kind: ErrorKind::InvalidInput,
                    message: format!("unknown account: {id}"),
                    partial: None,
                },
                other => internal(other.to_string(), None),
            })?;

        let mut run = PipelineRun {
            executor: self,
            account,
            payload: job.payload.clone(),
            handle,
            partial: serde_json::Map::new(),
        };

        match job.kind {
            JobKind::Pipeline => run.full_pipeline().await,
            JobKind::Extract => run.extract_only().await,
            JobKind::Ingest => run.ingest_only().await,
            JobKind::Analyze => run.analyze_only().await,
            JobKind::Organize => run.organize_only().await,
            JobKind::BuildTree => run.build_tree_only().await,
        }
    }
}

struct PipelineRun<'a> {
    executor: &'a PipelineExecutor,
    account: Account,
    payload: JobPayload,
    handle: Arc<JobHandle>,
    partial: serde_json::Map<String, Value>,
}

impl PipelineRun<'_> {
    fn ctx(&self) -> &PipelineContext {
        &self.executor.ctx
    }

    fn partial_value(&self) -> Option<Value> {
        if self.partial.is_empty() {
            None
        } else {
            Some(Value::Object(self.partial.clone()))
        }
    }

    fn cancelled_at(&self, phase: Phase) -> JobFailure {
        JobFailure::Cancelled {
            resume: ResumeInfo {
                can_resume: true,
                next_step: Some(phase.as_str().to_string()),
                reason: Some("stopped by request".to_string()),
                progress_checkpoint: Some(phase.pipeline_span().0),
            },
            partial: self.partial_value(),
        }
    }

    fn phase_timeout(&self, phase: Phase) -> JobFailure {
        JobFailure::Failed {
            kind: ErrorKind::PhaseTimeout,
            message: format!("phase {} exceeded its deadline", phase.as_str()),
            partial: self.partial_value(),
        }
    }

    /// Whether `phase` precedes the requested resume point and can be
    /// skipped. Earlier phases are safe to skip because their outputs are
    /// already persisted and idempotent.
    fn skip_for_resume(&self, phase: Phase) -> bool {
        let Some(resume_from) = self.payload.resume_from else {
            return false;
        };
        phase_index(phase) < phase_index(resume_from)
    }

    async fn full_pipeline(&mut self) -> Result<JobSuccess, JobFailure> {
        self.run_extract(Phase::ContactExtraction).await?;
        self.run_ingest(Phase::MessageIngest).await?;
        self.run_analyze(Phase::CommIntelligence).await?;
        let snapshot = self.run_organize(Phase::Organize).await?;

        let decision = self.decide_rebuild(&snapshot).await?;
        self.partial
            .insert("rebuild_decision".to_string(), json!(decision));
        if !decision.rebuild {
            info!(account_id = %self.account.id, reason = %decision.reason, "phase 2 skipped");
            return Ok(JobSuccess {
                message: format!("phase 2 skipped: {}", decision.reason),
                result: self.partial_value(),
            });
        }

        self.run_phase2(&snapshot, &decision).await
    }

    async fn extract_only(&mut self) -> Result<JobSuccess, JobFailure> {
        let outcome = self.run_extract(Phase::ContactExtraction).await?;
        Ok(JobSuccess {
            message: format!(
                "extracted {} contacts from {} sent messages",
                outcome.contacts, outcome.scanned_messages
            ),
            result: self.partial_value(),
        })
    }

    async fn ingest_only(&mut self) -> Result<JobSuccess, JobFailure> {
        let outcome = self.run_ingest(Phase::MessageIngest).await?;
        Ok(JobSuccess {
            message: format!(
                "ingested {} new messages across {} contacts",
                outcome.new_messages, outcome.contacts
            ),
            result: self.partial_value(),
        })
    }

    async fn analyze_only(&mut self) -> Result<JobSuccess, JobFailure> {
        let outcome = self.run_analyze(Phase::CommIntelligence).await?;
        Ok(JobSuccess {
            message: format!("classified {} contacts", outcome.classified),
            result: self.partial_value(),
        })
    }

    async fn organize_only(&mut self) -> Result<JobSuccess, JobFailure> {
        let snapshot = self.run_organize(Phase::Organize).await?;
        Ok(JobSuccess {
            message: format!(
                "organized {} messages into {} topics",
                snapshot.message_count,
                snapshot.topics.len()
            ),
            result: self.partial_value(),
        })
    }

    async fn build_tree_only(&mut self) -> Result<JobSuccess, JobFailure> {
        let snapshot = self.run_organize(Phase::Organize).await?;
        let decision = self.decide_rebuild(&snapshot).await?;
        if !decision.rebuild {
            return Ok(JobSuccess {
                message: format!("phase 2 skipped: {}", decision.reason),
                result: self.partial_value(),
            });
        }
        self.run_phase2(&snapshot, &decision).await
    }

    async fn run_extract(
        &mut self,
        phase: Phase,
    ) -> Result<crate::extract::ExtractOutcome, JobFailure> {
        if self.skip_for_resume(phase) {
            return Ok(Default::default());
        }
        self.handle.enter_phase(phase).await;

        let extractor = TrustedContactExtractor::new(
            self.ctx().db.clone(),
            self.ctx().mail_source.clone(),
            self.ctx().settings.pipeline.clone(),
        );
        let handle = self.handle.clone();
        let progress = move |fraction: f64| {
            let handle = handle.clone();
            tokio::spawn(async move { handle.report(phase, fraction).await });
        };

        let deadline = Duration::from_secs(self.ctx().settings.job.extract_timeout_mins * 60);
        let result = timeout(
            deadline,
            extractor.run(&self.account, self.handle.cancel_token(), &progress),
        )
        .await
        .map_err(|_| self.phase_timeout(phase))?;

        match result {
            Ok(outcome) => {
                self.partial.insert("extract".to_string(), json!(outcome));
                self.handle.report(phase, 1.0).await;
                Ok(outcome)
            }
            Err(ExtractError::Cancelled) => Err(self.cancelled_at(phase)),
            Err(ExtractError::MailSource(err)) => Err(self.mail_failure(err)),
            Err(err) => Err(internal(err.to_string(), self.partial_value())),
        }
    }

    async fn run_ingest(
        &mut self,
        phase: Phase,
    ) -> Result<crate::ingest::IngestOutcome, JobFailure> {
        if self.skip_for_resume(phase) {
            return Ok(Default::default());
        }
        self.handle.enter_phase(phase).await;

        let ingester = MessageIngester::new(
            self.ctx().db.clone(),
            self.ctx().mail_source.clone(),
            self.ctx().settings.pipeline.clone(),
        );
        let handle = self.handle.clone();
        let progress = move |fraction: f64| {
            let handle = handle.clone();
            tokio::spawn(async move { handle.report(phase, fraction).await });
        };

        let deadline = Duration::from_secs(self.ctx().settings.job.ingest_timeout_mins * 60);
        let result = timeout(
            deadline,
            ingester.run(&self.account, self.handle.cancel_token(), &progress),
        )
        .await
        .map_err(|_| self.phase_timeout(phase))?;

        match result {
            Ok(outcome) => {
                self.partial.insert("ingest".to_string(), json!(outcome));
                self.handle.report(phase, 1.0).await;
                Ok(outcome)
            }
            Err(IngestError::Cancelled) => Err(self.cancelled_at(phase)),
            Err(IngestError::MailSource(err)) => Err(self.mail_failure(err)),
            Err(err) => Err(internal(err.to_string(), self.partial_value())),
        }
    }

    async fn run_analyze(
        &mut self,
        phase: Phase,
    ) -> Result<crate::analyzer::AnalyzeOutcome, JobFailure> {
        if self.skip_for_resume(phase) {
            return Ok(Default::default());
        }
        self.handle.enter_phase(phase).await;

        let mut analyzer = CommIntelligenceAnalyzer::new(
            self.ctx().db.clone(),
            self.ctx().settings.analyzer.clone(),
        );
        if let Some(enricher) = &self.ctx().enricher {
            analyzer = analyzer.with_enricher(enricher.clone());
        }

        let handle = self.handle.clone();
        let progress = move |fraction: f64| {
            let handle = handle.clone();
            tokio::spawn(async move { handle.report(phase, fraction).await });
        };

        let result = analyzer
            .run(&self.account, self.handle.cancel_token(), &progress)
            .await;

        match result {
            Ok(outcome) => {
                self.partial.insert("analyze".to_string(), json!(outcome));
                self.handle.report(phase, 1.0).await;
                Ok(outcome)
            }
            Err(AnalyzerError::Cancelled) => Err(self.cancelled_at(phase)),
            Err(err) => Err(internal(err.to_string(), self.partial_value())),
        }
    }

    /// Organize and persist the snapshot. When nothing changed since the
    /// newest stored snapshot the stored one is reused, so an unchanged
    /// mailbox causes no new writes.
    async fn run_organize(&mut self, phase: Phase) -> Result<OrganizedSnapshot, JobFailure> {
        // Organization is deterministic over the store, so a resumed job can
        // always rebuild it. Only rebuilds beyond the resume point skip it.
        self.handle.enter_phase(phase).await;

        let organizer = Organizer::new(
            self.ctx().db.clone(),
            self.ctx().settings.organizer.clone(),
        );
        let handle = self.handle.clone();
        let progress = move |fraction: f64| {
            let handle = handle.clone();
            tokio::spawn(async move { handle.report(phase, fraction).await });
        };

        let built = organizer
            .run(&self.account, self.handle.cancel_token(), &progress)
            .await
            .map_err(|err| match err {
                OrganizerError::Cancelled => self.cancelled_at(phase),
                other => internal(other.to_string(), self.partial_value()),
            })?;

        let snapshots = self.executor.snapshots();
        let latest = snapshots
            .get_latest(&self.account.id)
            .await
            .map_err(|err| internal(err.to_string(), self.partial_value()))?;

        let snapshot = match latest {
            Some(stored) if stored.fingerprint == built.fingerprint => stored,
            _ => {
                snapshots
                    .put(&built)
                    .await
                    .map_err(|err| internal(err.to_string(), self.partial_value()))?;
                built
            }
        };

        self.partial.insert(
            "organize".to_string(),
            json!({
                "snapshot_id": snapshot.id,
                "topics": snapshot.topics.len(),
                "messages": snapshot.message_count,
                "fingerprint": snapshot.fingerprint,
            }),
        );
        self.handle.report(phase, 1.0).await;
        Ok(snapshot)
    }

    async fn decide_rebuild(
        &mut self,
        snapshot: &OrganizedSnapshot,
    ) -> Result<RebuildDecision, JobFailure> {
        let trees = TreeRepository::new(self.ctx().db.clone());
        let latest_tree = trees
            .get_latest(&self.account.id)
            .await
            .map_err(|err| internal(err.to_string(), self.partial_value()))?;

        let previous_snapshot = match &latest_tree {
            Some(tree) => self
                .executor
                .snapshots()
                .get(&tree.source_snapshot_id)
                .await
                .ok(),
            None => None,
        };

        let detector = ChangeDetector::new(self.ctx().settings.rebuild.clone());
        Ok(detector.decide(snapshot, previous_snapshot.as_ref(), self.payload.force))
    }

    async fn run_phase2(
        &mut self,
        snapshot: &OrganizedSnapshot,
        decision: &RebuildDecision,
    ) -> Result<JobSuccess, JobFailure> {
        // Analyst pool.
        let phase = Phase::AnalystPool;
        self.handle.enter_phase(phase).await;

        let pool = AnalystPool::new(
            self.ctx().llm.clone(),
            self.ctx().settings.pool.clone(),
            self.ctx().settings.llm.clone(),
        );
        let handle = self.handle.clone();
        let progress = move |fraction: f64| {
            let handle = handle.clone();
            tokio::spawn(async move { handle.report(phase, fraction).await });
        };

        let deadline = Duration::from_secs(self.ctx().settings.job.pool_timeout_mins * 60);
        let outcome = timeout(
            deadline,
            pool.run(snapshot, self.handle.cancel_token(), &progress),
        )
        .await
        .map_err(|_| self.phase_timeout(phase))?;

        self.partial.insert(
            "analyst_pool".to_string(),
            json!({
                "findings": outcome.findings.len(),
                "failures": outcome.failures,
            }),
        );

        if outcome.cancelled {
            return Err(self.cancelled_at(phase));
        }

        // Synthesize and publish.
        let phase = Phase::Synthesize;
        self.handle.enter_phase(phase).await;
        if self.handle.is_cancelled() {
            return Err(self.cancelled_at(phase));
        }

        let content = synthesize(snapshot, &outcome.findings);
        let tree = TreeRepository::new(self.ctx().db.clone())
            .put(&self.account.id, &snapshot.id, &content)
            .await
            // Synthesizer/persist errors are fatal: a broken tree must never
            // be published.
            .map_err(|err| internal(format!("tree publish failed: {err}"), self.partial_value()))?;

        self.ctx()
            .events
            .publish(Event::TreeUpdated {
                account_id: self.account.id.clone(),
                tree_id: tree.id.clone(),
                version: tree.version,
            })
            .await;

        self.handle.report(phase, 1.0).await;
        self.partial.insert(
            "tree".to_string(),
            json!({"tree_id": tree.id, "version": tree.version}),
        );

        let mut message = format!(
            "knowledge tree v{} published ({} findings, {} analysts; {})",
            tree.version,
            outcome.findings.len(),
            content.analyst_kinds.len(),
            decision.reason
        );
        if !outcome.failures.is_empty() {
            let failed: Vec<String> = outcome
                .failures
                .iter()
                .map(|f| format!("{}: {}", f.kind, f.error))
                .collect();
            message.push_str(&format!("; failed analysts: {}", failed.join(", ")));
            warn!(account_id = %self.account.id, failures = failed.len(), "tree published with analyst failures");
        }

        Ok(JobSuccess {
            message,
            result: self.partial_value(),
        })
    }

    fn mail_failure(&self, err: MailSourceError) -> JobFailure {
        let kind = match &err {
            MailSourceError::AuthMissing(_) => ErrorKind::AuthMissing,
            MailSourceError::Unavailable(_) => ErrorKind::MailSourceUnavailable,
        };
        JobFailure::Failed {
            kind,
            message: err.to_string(),
            partial: self.partial_value(),
        }
    }
}

fn internal(message: String, partial: Option<Value>) -> JobFailure {
    JobFailure::Failed {
        kind: ErrorKind::Internal,
        message,
        partial,
    }
}

fn phase_index(phase: Phase) -> usize {
    match phase {
        Phase::ContactExtraction => 0,
        Phase::MessageIngest => 1,
        Phase::CommIntelligence => 2,
        Phase::Organize => 3,
        Phase::AnalystPool => 4,
        Phase::Synthesize => 5,
    }
}
