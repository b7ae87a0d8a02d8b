//! Job supervisor: every core invocation runs inside a persisted job with a
//! strict state machine, monotonic progress, cooperative cancellation, and
//! resume information for stopped runs.
//!
//! Legal transitions:
//!
//! ```text
//! pending → running → completed
//!                  ↘ failed
//!                  ↘ stopping → stopped
//! ```
//!
//! Terminal states are immutable; the store enforces transitions with
//! conditional updates rather than read-modify-write.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use futures::FutureExt;
use libsql::{Row, params};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::db::{Database, DbError};
use crate::events::{Event, EventSink};

const JOB_COLUMNS: &str = "id, account_id, kind, payload_json, state, progress, phase, message, error_kind, partial_result_json, resume_json, created_at, updated_at, started_at, finished_at";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Stopping,
    Stopped,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Stopping => "stopping",
            JobState::Stopped => "stopped",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    fn from_str(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(JobState::Pending),
            "running" => Some(JobState::Running),
            "stopping" => Some(JobState::Stopping),
            "stopped" => Some(JobState::Stopped),
            "completed" => Some(JobState::Completed),
            "failed" => Some(JobState::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Stopped | JobState::Completed | JobState::Failed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Pipeline,
    Extract,
    Ingest,
    Analyze,
    Organize,
    BuildTree,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Pipeline => "pipeline",
            JobKind::Extract => "extract",
            JobKind::Ingest => "ingest",
            JobKind::Analyze => "analyze",
            JobKind::Organize => "organize",
            JobKind::BuildTree => "build_tree",
        }
    }

    fn from_str(value: &str) -> Option<Self> {
        match value {
            "pipeline" => Some(JobKind::Pipeline),
            "extract" => Some(JobKind::Extract),
            "ingest" => Some(JobKind::Ingest),
            "analyze" => Some(JobKind::Analyze),
            "organize" => Some(JobKind::Organize),
            "build_tree" => Some(JobKind::BuildTree),
            _ => None,
        }
    }
}

/// Fixed phase vocabulary with the pipeline progress span each phase owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    ContactExtraction,
    MessageIngest,
    CommIntelligence,
    Organize,
    AnalystPool,
    Synthesize,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::ContactExtraction => "contact_extraction",
            Phase::MessageIngest => "message_ingest",
            Phase::CommIntelligence => "comm_intelligence",
            Phase::Organize => "organize",
            Phase::AnalystPool => "analyst_pool",
            Phase::Synthesize => "synthesize",
        }
    }

    /// Progress span within a full pipeline run.
    pub fn pipeline_span(&self) -> (i64, i64) {
        match self {
            Phase::ContactExtraction => (0, 15),
            Phase::MessageIngest => (15, 40),
            Phase::CommIntelligence => (40, 50),
            Phase::Organize => (50, 60),
            Phase::AnalystPool => (60, 90),
            Phase::Synthesize => (90, 100),
        }
    }
}

/// Error taxonomy surfaced on failed jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AuthMissing,
    MailSourceUnavailable,
    StoreConflict,
    LlmTransport,
    LlmSchema,
    LlmRateLimited,
    PhaseTimeout,
    Cancelled,
    InvalidInput,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::AuthMissing => "auth_missing",
            ErrorKind::MailSourceUnavailable => "mail_source_unavailable",
            ErrorKind::StoreConflict => "store_conflict",
            ErrorKind::LlmTransport => "llm_transport",
            ErrorKind::LlmSchema => "llm_schema",
            ErrorKind::LlmRateLimited => "llm_rate_limited",
            ErrorKind::PhaseTimeout => "phase_timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::Internal => "internal",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeInfo {
    pub can_resume: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_step: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress_checkpoint: Option<i64>,
}

/// Payload every job carries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobPayload {
    pub account_id: String,
    #[serde(default)]
    pub force: bool,
    /// Phase to resume from, set when this job continues a stopped one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_from: Option<Phase>,
}

#[derive(Debug, Clone)]
pub struct PipelineJob {
    pub id: String,
    pub account_id: String,
    pub kind: JobKind,
    pub payload: JobPayload,
    pub state: JobState,
    pub progress: i64,
    pub phase: Option<String>,
    pub message: Option<String>,
    pub error_kind: Option<String>,
    pub partial_result: Option<Value>,
    pub resume: Option<ResumeInfo>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// The read-only status surface consumed by the HTTP layer.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub job_id: String,
    pub state: JobState,
    pub progress: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partial_result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_info: Option<ResumeInfo>,
}

impl PipelineJob {
    pub fn status(&self) -> JobStatus {
        JobStatus {
            job_id: self.id.clone(),
            state: self.state,
            progress: self.progress,
            phase: self.phase.clone(),
            message: self.message.clone(),
            error: self.error_kind.clone(),
            partial_result: self.partial_result.clone(),
            resume_info: self.resume.clone(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("invalid stored value {0}")]
    InvalidValue(String),
    #[error("job not found: {0}")]
    JobNotFound(String),
    #[error("illegal transition for job {job_id}: {from} → {to}")]
    IllegalTransition {
        job_id: String,
        from: &'static str,
        to: &'static str,
    },
    #[error("job {0} cannot be resumed")]
    NotResumable(String),
}

#[derive(Clone)]
pub struct JobStore {
    db: Database,
}

impl JobStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn create(
        &self,
        kind: JobKind,
        payload: JobPayload,
    ) -> Result<PipelineJob, SupervisorError> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = now_rfc3339();
        let payload_json = serde_json::to_string(&payload)?;

        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "INSERT INTO pipeline_jobs (id, account_id, kind, payload_json, state, progress, phase, message, error_kind, partial_result_json, resume_json, created_at, updated_at, started_at, finished_at)
                     VALUES (?1, ?2, ?3, ?4, 'pending', 0, NULL, NULL, NULL, NULL, NULL, ?5, ?5, NULL, NULL)
                     RETURNING {JOB_COLUMNS}"
                ),
                params![id, payload.account_id.clone(), kind.as_str(), payload_json, now],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_job(row),
            None => unreachable!("INSERT ... RETURNING always yields a row"),
        }
    }

    /// Claim the oldest pending job, moving it to running. Concurrent
    /// claimers are serialized by the store; only one wins each job.
    pub async fn claim_next(&self) -> Result<Option<PipelineJob>, SupervisorError> {
        let now = now_rfc3339();
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "UPDATE pipeline_jobs
                     SET state = 'running', started_at = ?1, updated_at = ?1
                     WHERE id = (
                         SELECT id FROM pipeline_jobs
                         WHERE state = 'pending'
                         ORDER BY created_at
                         LIMIT 1
                     )
                     RETURNING {JOB_COLUMNS}"
                ),
                params![now],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(row_to_job(row)?)),
            None => Ok(None),
        }
    }

    pub async fn get(&self, job_id: &str) -> Result<PipelineJob, SupervisorError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM pipeline_jobs WHERE id = ?1"),
                params![job_id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_job(row),
            None => Err(SupervisorError::JobNotFound(job_id.to_string())),
        }
    }

    /// Progress is monotonic: the store keeps the maximum of the stored and
    /// reported values, so late or out-of-order reports can never move the
    /// bar backwards.
    pub async fn update_progress(
        &self,
        job_id: &str,
        progress: i64,
        phase: Option<Phase>,
    ) -> Result<(), SupervisorError> {
        let now = now_rfc3339();
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "UPDATE pipeline_jobs
                 SET progress = MAX(progress, ?2), phase = COALESCE(?3, phase), updated_at = ?4
                 WHERE id = ?1 AND state IN ('running', 'stopping')
                 RETURNING id",
                params![
                    job_id,
                    progress.clamp(0, 100),
                    phase.map(|p| p.as_str()),
                    now
                ],
            )
            .await?;

        if rows.next().await?.is_none() {
            return self.illegal(job_id, "running").await;
        }
        Ok(())
    }

    pub async fn set_message(&self, job_id: &str, message: &str) -> Result<(), SupervisorError> {
        let now = now_rfc3339();
        let conn = self.db.connection().await?;
        conn.execute(
            "UPDATE pipeline_jobs SET message = ?2, updated_at = ?3
             WHERE id = ?1 AND state IN ('running', 'stopping')",
            params![job_id, message, now],
        )
        .await?;
        Ok(())
    }

    /// running → stopping. Returns false when the job was not running (for
    /// example already terminal).
    pub async fn request_stop(&self, job_id: &str) -> Result<bool, SupervisorError> {
        let now = now_rfc3339();
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "UPDATE pipeline_jobs SET state = 'stopping', updated_at = ?2
                 WHERE id = ?1 AND state = 'running'
                 RETURNING id",
                params![job_id, now],
            )
            .await?;
        Ok(rows.next().await?.is_some())
    }

    /// running → completed.
    pub async fn complete(
        &self,
        job_id: &str,
        message: &str,
        result: Option<&Value>,
    ) -> Result<(), SupervisorError> {
        let now = now_rfc3339();
        let result_json = result.map(serde_json::to_string).transpose()?;
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "UPDATE pipeline_jobs
                 SET state = 'completed', progress = 100, message = ?2,
                     partial_result_json = ?3, finished_at = ?4, updated_at = ?4
                 WHERE id = ?1 AND state = 'running'
                 RETURNING id",
                params![job_id, message, result_json, now],
            )
            .await?;
        if rows.next().await?.is_none() {
            return self.illegal(job_id, "completed").await;
        }
        Ok(())
    }

    /// running → failed. Partial results survive for inspection.
    pub async fn fail(
        &self,
        job_id: &str,
        error_kind: ErrorKind,
        message: &str,
        partial: Option<&Value>,
    ) -> Result<(), SupervisorError> {
        let now = now_rfc3339();
        let partial_json = partial.map(serde_json::to_string).transpose()?;
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "UPDATE pipeline_jobs
                 SET state = 'failed', error_kind = ?2, message = ?3,
                     partial_result_json = ?4, finished_at = ?5, updated_at = ?5
                 WHERE id = ?1 AND state = 'running'
                 RETURNING id",
                params![job_id, error_kind.as_str(), message, partial_json, now],
            )
            .await?;
        if rows.next().await?.is_none() {
            return self.illegal(job_id, "failed").await;
        }
        Ok(())
    }

    /// stopping → stopped, flushing resume info and any partial result.
    pub async fn mark_stopped(
        &self,
        job_id: &str,
        resume: &ResumeInfo,
        partial: Option<&Value>,
        message: &str,
    ) -> Result<(), SupervisorError> {
        let now = now_rfc3339();
        let resume_json = serde_json::to_string(resume)?;
        let partial_json = partial.map(serde_json::to_string).transpose()?;
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "UPDATE pipeline_jobs
                 SET state = 'stopped', error_kind = 'cancelled', message = ?2,
                     resume_json = ?3, partial_result_json = COALESCE(?4, partial_result_json),
                     finished_at = ?5, updated_at = ?5
                 WHERE id = ?1 AND state = 'stopping'
                 RETURNING id",
                params![job_id, message, resume_json, partial_json, now],
            )
            .await?;
        if rows.next().await?.is_none() {
            return self.illegal(job_id, "stopped").await;
        }
        Ok(())
    }

    async fn illegal(&self, job_id: &str, to: &'static str) -> Result<(), SupervisorError> {
        match self.get(job_id).await {
            Ok(job) => Err(SupervisorError::IllegalTransition {
                job_id: job_id.to_string(),
                from: job.state.as_str(),
                to,
            }),
            Err(err) => Err(err),
        }
    }
}

fn row_to_job(row: Row) -> Result<PipelineJob, SupervisorError> {
    let kind_str: String = row.get(2)?;
    let payload_json: String = row.get(3)?;
    let state_str: String = row.get(4)?;
    let partial_json: Option<String> = row.get(9)?;
    let resume_json: Option<String> = row.get(10)?;
    let created_at: String = row.get(11)?;
    let updated_at: String = row.get(12)?;
    let started_at: Option<String> = row.get(13)?;
    let finished_at: Option<String> = row.get(14)?;

    let kind = JobKind::from_str(&kind_str).ok_or(SupervisorError::InvalidValue(kind_str))?;
    let state = JobState::from_str(&state_str).ok_or(SupervisorError::InvalidValue(state_str))?;

    Ok(PipelineJob {
        id: row.get(0)?,
        account_id: row.get(1)?,
        kind,
        payload: serde_json::from_str(&payload_json)?,
        state,
        progress: row.get(5)?,
        phase: row.get(6)?,
        message: row.get(7)?,
        error_kind: row.get(8)?,
        partial_result: partial_json
            .map(|raw| serde_json::from_str(&raw))
            .transpose()?,
        resume: resume_json
            .map(|raw| serde_json::from_str(&raw))
            .transpose()?,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
        started_at: started_at.as_deref().map(parse_ts).transpose()?,
        finished_at: finished_at.as_deref().map(parse_ts).transpose()?,
    })
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    Ok(DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc))
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Handle given to the executor for one job: phase/progress reporting and
/// the cancellation signal. Progress writes are monotonic and clamped to the
/// phase's span.
pub struct JobHandle {
    store: JobStore,
    job_id: String,
    kind: JobKind,
    cancel: CancellationToken,
    last_progress: AtomicI64,
}

impl JobHandle {
    pub fn new(store: JobStore, job_id: String, kind: JobKind, cancel: CancellationToken) -> Self {
        Self {
            store,
            job_id,
            kind,
            cancel,
            last_progress: AtomicI64::new(0),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn span(&self, phase: Phase) -> (i64, i64) {
        if self.kind == JobKind::Pipeline {
            phase.pipeline_span()
        } else {
            (0, 100)
        }
    }

    /// Report fractional progress within the phase. Best effort: store
    /// failures are logged, never propagated into the pipeline.
    pub async fn report(&self, phase: Phase, fraction: f64) {
        let (start, end) = self.span(phase);
        let progress = start + ((end - start) as f64 * fraction.clamp(0.0, 1.0)).round() as i64;
        let previous = self.last_progress.fetch_max(progress, Ordering::SeqCst);
        let progress = progress.max(previous);

        if let Err(err) = self
            .store
            .update_progress(&self.job_id, progress, Some(phase))
            .await
        {
            warn!(job_id = %self.job_id, error = %err, "progress update failed");
        }
    }

    pub async fn enter_phase(&self, phase: Phase) {
        info!(job_id = %self.job_id, phase = phase.as_str(), "entering phase");
        self.report(phase, 0.0).await;
    }
}

/// What the executor hands back to the supervisor.
pub struct JobSuccess {
    pub message: String,
    pub result: Option<Value>,
}

pub enum JobFailure {
    Failed {
        kind: ErrorKind,
        message: String,
        partial: Option<Value>,
    },
    Cancelled {
        resume: ResumeInfo,
        partial: Option<Value>,
    },
}

#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, job: PipelineJob, handle: Arc<JobHandle>)
    -> Result<JobSuccess, JobFailure>;
}

#[derive(Clone, Copy)]
pub struct SupervisorConfig {
    pub poll_interval: Duration,
    /// Maximum time to wait for in-flight jobs during graceful shutdown.
    pub drain_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

/// Registers, runs, stops, and resumes jobs. One supervisor runs per
/// process; the HTTP layer holds it behind an `Arc` and only ever calls the
/// read/submit/stop surface.
pub struct JobSupervisor {
    store: JobStore,
    events: Arc<dyn EventSink>,
    cancels: Mutex<HashMap<String, CancellationToken>>,
}

impl JobSupervisor {
    pub fn new(store: JobStore, events: Arc<dyn EventSink>) -> Self {
        Self {
            store,
            events,
            cancels: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// Register a new job; the supervisor loop will pick it up.
    pub async fn submit(
        &self,
        kind: JobKind,
        payload: JobPayload,
    ) -> Result<PipelineJob, SupervisorError> {
        let job = self.store.create(kind, payload).await?;
        self.publish_transition(&job.id, &job.account_id, JobState::Pending)
            .await;
        Ok(job)
    }

    pub async fn status(&self, job_id: &str) -> Result<JobStatus, SupervisorError> {
        Ok(self.store.get(job_id).await?.status())
    }

    /// Request a cooperative stop: flips running → stopping and signals the
    /// in-flight work. Workers exit at their next suspension point.
    pub async fn stop(&self, job_id: &str) -> Result<bool, SupervisorError> {
        let flipped = self.store.request_stop(job_id).await?;
        if flipped {
            if let Some(token) = self.cancels.lock().await.get(job_id) {
                token.cancel();
            }
            let job = self.store.get(job_id).await?;
            self.publish_transition(job_id, &job.account_id, JobState::Stopping)
                .await;
        }
        Ok(flipped)
    }

    /// Continue a stopped job by submitting a new one that starts at the
    /// recorded checkpoint. Terminal jobs are immutable, so resumption is a
    /// fresh job, not a rewind.
    pub async fn resume(&self, job_id: &str) -> Result<PipelineJob, SupervisorError> {
        let job = self.store.get(job_id).await?;
        let resume = job
            .resume
            .as_ref()
            .filter(|resume| job.state == JobState::Stopped && resume.can_resume)
            .ok_or_else(|| SupervisorError::NotResumable(job_id.to_string()))?;

        let resume_from = resume
            .next_step
            .as_deref()
            .and_then(phase_from_str);

        let mut payload = job.payload.clone();
        payload.resume_from = resume_from;
        self.submit(job.kind, payload).await
    }

    async fn publish_transition(&self, job_id: &str, account_id: &str, state: JobState) {
        self.events
            .publish(Event::JobTransition {
                job_id: job_id.to_string(),
                account_id: account_id.to_string(),
                state,
            })
            .await;
    }
}

fn phase_from_str(value: &str) -> Option<Phase> {
    match value {
        "contact_extraction" => Some(Phase::ContactExtraction),
        "message_ingest" => Some(Phase::MessageIngest),
        "comm_intelligence" => Some(Phase::CommIntelligence),
        "organize" => Some(Phase::Organize),
        "analyst_pool" => Some(Phase::AnalystPool),
        "synthesize" => Some(Phase::Synthesize),
        _ => None,
    }
}

/// Claim-and-run loop, one job at a time per worker. Graceful shutdown
/// stops claiming and drains in-flight work; once the drain timeout expires
/// a hard shutdown abandons whatever is still running.
pub async fn run_supervisor<E: JobExecutor + 'static>(
    supervisor: Arc<JobSupervisor>,
    executor: Arc<E>,
    config: SupervisorConfig,
    shutdown: CancellationToken,
) {
    let hard_shutdown = CancellationToken::new();

    // Drain watcher: once graceful shutdown starts, in-flight work gets
    // drain_timeout to finish before the hard shutdown fires.
    let drain_handle = {
        let shutdown = shutdown.clone();
        let hard_shutdown = hard_shutdown.clone();
        let drain_timeout = config.drain_timeout;
        tokio::spawn(async move {
            shutdown.cancelled().await;
            info!("graceful shutdown initiated, waiting for in-flight jobs");
            sleep(drain_timeout).await;
            warn!("drain timeout exceeded, initiating hard shutdown");
            hard_shutdown.cancel();
        })
    };

    loop {
        if shutdown.is_cancelled() {
            break;
        }

        match supervisor.store.claim_next().await {
            Ok(Some(job)) => {
                handle_job(&supervisor, executor.clone(), job, &shutdown, &hard_shutdown).await;
            }
            Ok(None) => {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = sleep(config.poll_interval) => {}
                }
            }
            Err(err) => {
                error!(error = %err, "failed to claim next job");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = sleep(config.poll_interval) => {}
                }
            }
        }
    }

    drain_handle.abort();
    info!("supervisor loop shut down");
}

async fn handle_job<E: JobExecutor>(
    supervisor: &Arc<JobSupervisor>,
    executor: Arc<E>,
    job: PipelineJob,
    shutdown: &CancellationToken,
    hard_shutdown: &CancellationToken,
) {
    info!(job_id = %job.id, kind = job.kind.as_str(), account_id = %job.account_id, "job started");
    supervisor
        .publish_transition(&job.id, &job.account_id, JobState::Running)
        .await;

    let cancel = CancellationToken::new();
    supervisor
        .cancels
        .lock()
        .await
        .insert(job.id.clone(), cancel.clone());

    // Process shutdown also stops the job cooperatively, through the same
    // stopping → stopped path a caller-initiated stop takes.
    let shutdown_watch = {
        let supervisor = supervisor.clone();
        let job_id = job.id.clone();
        let shutdown = shutdown.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    let _ = supervisor.stop(&job_id).await;
                    cancel.cancel();
                }
                _ = cancel.cancelled() => {}
            }
        })
    };

    let handle = Arc::new(JobHandle::new(
        supervisor.store.clone(),
        job.id.clone(),
        job.kind,
        cancel.clone(),
    ));

    // A hung executor that never reaches a suspension-point check must not
    // pin the process open past the drain window; on hard shutdown the job
    // is abandoned mid-state and finalization is skipped.
    let result = tokio::select! {
        _ = hard_shutdown.cancelled() => {
            warn!(job_id = %job.id, "hard shutdown: abandoning in-flight job");
            cancel.cancel();
            let _ = shutdown_watch.await;
            supervisor.cancels.lock().await.remove(&job.id);
            return;
        }
        result = AssertUnwindSafe(executor.execute(job.clone(), handle)).catch_unwind() => result,
    };

    let outcome = match result {
        Ok(outcome) => outcome,
        Err(panic) => {
            let message = if let Some(msg) = panic.downcast_ref::<&str>() {
                msg.to_string()
            } else if let Some(msg) = panic.downcast_ref::<String>() {
                msg.clone()
            } else {
                "job panicked".to_string()
            };
            warn!(job_id = %job.id, "job panicked: {message}");
            Err(JobFailure::Failed {
                kind: ErrorKind::Internal,
                message,
                partial: None,
            })
        }
    };

    if let Err(err) = finalize_job(supervisor, &job, outcome).await {
        error!(job_id = %job.id, error = %err, "failed to persist job outcome");
    }

    cancel.cancel();
    let _ = shutdown_watch.await;
    supervisor.cancels.lock().await.remove(&job.id);
}

async fn finalize_job(
    supervisor: &Arc<JobSupervisor>,
    job: &PipelineJob,
    outcome: Result<JobSuccess, JobFailure>,
) -> Result<(), SupervisorError> {
    let current = supervisor.store.get(&job.id).await?;

    let final_state = match outcome {
        Ok(success) => {
            if current.state == JobState::Stopping {
                // The work finished before it noticed the stop request; the
                // result is complete, but the legal exit from stopping is
                // stopped.
                let resume = ResumeInfo {
                    can_resume: false,
                    reason: Some("job finished before stop took effect".to_string()),
                    ..Default::default()
                };
                supervisor
                    .store
                    .mark_stopped(&job.id, &resume, success.result.as_ref(), &success.message)
                    .await?;
                JobState::Stopped
            } else {
                supervisor
                    .store
                    .complete(&job.id, &success.message, success.result.as_ref())
                    .await?;
                JobState::Completed
            }
        }
        Err(JobFailure::Cancelled { resume, partial }) => {
            if current.state == JobState::Running {
                // Shutdown-initiated cancellation may not have flipped the
                // state yet.
                supervisor.store.request_stop(&job.id).await?;
            }
            supervisor
                .store
                .mark_stopped(&job.id, &resume, partial.as_ref(), "job stopped")
                .await?;
            JobState::Stopped
        }
        Err(JobFailure::Failed {
            kind,
            message,
            partial,
        }) => {
            if current.state == JobState::Stopping {
                let resume = ResumeInfo {
                    can_resume: false,
                    reason: Some(format!("failed while stopping: {message}")),
                    ..Default::default()
                };
                supervisor
                    .store
                    .mark_stopped(&job.id, &resume, partial.as_ref(), &message)
                    .await?;
                JobState::Stopped
            } else {
                supervisor
                    .store
                    .fail(&job.id, kind, &message, partial.as_ref())
                    .await?;
                JobState::Failed
            }
        }
    };

    info!(job_id = %job.id, state = final_state.as_str(), "job finished");
    supervisor
        .publish_transition(&job.id, &job.account_id, final_state)
        .await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoopEventSink;
    use crate::migrations::run_migrations;
    use tempfile::TempDir;
    use tokio::time::timeout;

    async fn setup() -> (Arc<JobSupervisor>, TempDir) {
        let dir = TempDir::new().expect("temp dir");
        let db_path = dir
            .path()
            .join(format!("db_{}.sqlite", uuid::Uuid::new_v4()));
        let db = Database::new(&db_path).await.expect("create db");
        run_migrations(&db).await.expect("migrations");
        let supervisor = Arc::new(JobSupervisor::new(
            JobStore::new(db),
            Arc::new(NoopEventSink),
        ));
        (supervisor, dir)
    }

    fn payload() -> JobPayload {
        JobPayload {
            account_id: "acct".to_string(),
            force: false,
            resume_from: None,
        }
    }

    fn fast_config() -> SupervisorConfig {
        SupervisorConfig {
            poll_interval: Duration::from_millis(5),
            drain_timeout: Duration::from_secs(5),
        }
    }

    struct OkExecutor;

    #[async_trait]
    impl JobExecutor for OkExecutor {
        async fn execute(
            &self,
            _job: PipelineJob,
            handle: Arc<JobHandle>,
        ) -> Result<JobSuccess, JobFailure> {
            handle.report(Phase::ContactExtraction, 1.0).await;
            Ok(JobSuccess {
                message: "done".to_string(),
                result: None,
            })
        }
    }

    async fn wait_for_state(
        supervisor: &JobSupervisor,
        job_id: &str,
        state: JobState,
    ) -> PipelineJob {
        timeout(Duration::from_secs(5), async {
            loop {
                let job = supervisor.store.get(job_id).await.expect("get job");
                if job.state == state {
                    return job;
                }
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("job should reach expected state")
    }

    #[tokio::test]
    async fn pending_job_runs_to_completion() {
        let (supervisor, _dir) = setup().await;
        let job = supervisor
            .submit(JobKind::Pipeline, payload())
            .await
            .expect("submit");
        assert_eq!(job.state, JobState::Pending);

        let shutdown = CancellationToken::new();
        let loop_handle = tokio::spawn(run_supervisor(
            supervisor.clone(),
            Arc::new(OkExecutor),
            fast_config(),
            shutdown.clone(),
        ));

        let finished = wait_for_state(&supervisor, &job.id, JobState::Completed).await;
        assert_eq!(finished.progress, 100);
        assert_eq!(finished.message.as_deref(), Some("done"));

        shutdown.cancel();
        let _ = loop_handle.await;
    }

    struct FailingExecutor;

    #[async_trait]
    impl JobExecutor for FailingExecutor {
        async fn execute(
            &self,
            _job: PipelineJob,
            _handle: Arc<JobHandle>,
        ) -> Result<JobSuccess, JobFailure> {
            Err(JobFailure::Failed {
                kind: ErrorKind::MailSourceUnavailable,
                message: "mail source down".to_string(),
                partial: None,
            })
        }
    }

    #[tokio::test]
    async fn failure_records_error_kind() {
        let (supervisor, _dir) = setup().await;
        let job = supervisor
            .submit(JobKind::Extract, payload())
            .await
            .expect("submit");

        let shutdown = CancellationToken::new();
        let loop_handle = tokio::spawn(run_supervisor(
            supervisor.clone(),
            Arc::new(FailingExecutor),
            fast_config(),
            shutdown.clone(),
        ));

        let finished = wait_for_state(&supervisor, &job.id, JobState::Failed).await;
        assert_eq!(finished.error_kind.as_deref(), Some("mail_source_unavailable"));
        assert_eq!(finished.message.as_deref(), Some("mail source down"));

        shutdown.cancel();
        let _ = loop_handle.await;
    }

    struct BlockingExecutor;

    #[async_trait]
    impl JobExecutor for BlockingExecutor {
        async fn execute(
            &self,
            _job: PipelineJob,
            handle: Arc<JobHandle>,
        ) -> Result<JobSuccess, JobFailure> {
            handle.cancel_token().cancelled().await;
            Err(JobFailure::Cancelled {
                resume: ResumeInfo {
                    can_resume: true,
                    next_step: Some("analyst_pool".to_string()),
                    reason: None,
                    progress_checkpoint: Some(60),
                },
                partial: None,
            })
        }
    }

    #[tokio::test]
    async fn stop_produces_stopped_with_resume_info() {
        let (supervisor, _dir) = setup().await;
        let job = supervisor
            .submit(JobKind::Pipeline, payload())
            .await
            .expect("submit");

        let shutdown = CancellationToken::new();
        let loop_handle = tokio::spawn(run_supervisor(
            supervisor.clone(),
            Arc::new(BlockingExecutor),
            fast_config(),
            shutdown.clone(),
        ));

        wait_for_state(&supervisor, &job.id, JobState::Running).await;
        assert!(supervisor.stop(&job.id).await.expect("stop"));

        let stopped = wait_for_state(&supervisor, &job.id, JobState::Stopped).await;
        let resume = stopped.resume.expect("resume info");
        assert!(resume.can_resume);
        assert_eq!(resume.next_step.as_deref(), Some("analyst_pool"));
        assert_eq!(stopped.error_kind.as_deref(), Some("cancelled"));

        // Terminal states are immutable: a second stop is a no-op.
        assert!(!supervisor.stop(&job.id).await.expect("second stop"));

        // Resumption creates a fresh job carrying the checkpoint.
        let resumed = supervisor.resume(&job.id).await.expect("resume");
        assert_ne!(resumed.id, job.id);
        assert_eq!(resumed.payload.resume_from, Some(Phase::AnalystPool));

        shutdown.cancel();
        let _ = loop_handle.await;
    }

    #[tokio::test]
    async fn completed_job_is_not_resumable() {
        let (supervisor, _dir) = setup().await;
        let job = supervisor
            .submit(JobKind::Pipeline, payload())
            .await
            .expect("submit");

        let shutdown = CancellationToken::new();
        let loop_handle = tokio::spawn(run_supervisor(
            supervisor.clone(),
            Arc::new(OkExecutor),
            fast_config(),
            shutdown.clone(),
        ));
        wait_for_state(&supervisor, &job.id, JobState::Completed).await;
        shutdown.cancel();
        let _ = loop_handle.await;

        let err = supervisor.resume(&job.id).await.expect_err("not resumable");
        assert!(matches!(err, SupervisorError::NotResumable(_)));
    }

    struct SlowExecutor {
        delay: Duration,
    }

    #[async_trait]
    impl JobExecutor for SlowExecutor {
        async fn execute(
            &self,
            _job: PipelineJob,
            _handle: Arc<JobHandle>,
        ) -> Result<JobSuccess, JobFailure> {
            sleep(self.delay).await;
            Ok(JobSuccess {
                message: "done".to_string(),
                result: None,
            })
        }
    }

    #[tokio::test]
    async fn graceful_shutdown_drains_in_flight_job() {
        let (supervisor, _dir) = setup().await;
        let job = supervisor
            .submit(JobKind::Pipeline, payload())
            .await
            .expect("submit");

        let mut config = fast_config();
        config.drain_timeout = Duration::from_secs(5);

        let shutdown = CancellationToken::new();
        let loop_handle = tokio::spawn(run_supervisor(
            supervisor.clone(),
            Arc::new(SlowExecutor {
                delay: Duration::from_millis(100),
            }),
            config,
            shutdown.clone(),
        ));

        wait_for_state(&supervisor, &job.id, JobState::Running).await;
        shutdown.cancel();

        timeout(Duration::from_secs(2), loop_handle)
            .await
            .expect("loop should exit after the job drains")
            .expect("join");

        // Shutdown requested a stop first, so the drained job exits through
        // stopping → stopped with its result intact.
        let finished = supervisor.store.get(&job.id).await.expect("get");
        assert_eq!(finished.state, JobState::Stopped);
        assert_eq!(finished.message.as_deref(), Some("done"));
    }

    struct StuckExecutor;

    #[async_trait]
    impl JobExecutor for StuckExecutor {
        async fn execute(
            &self,
            _job: PipelineJob,
            _handle: Arc<JobHandle>,
        ) -> Result<JobSuccess, JobFailure> {
            // Deliberately ignores the cancellation token.
            sleep(Duration::from_secs(3600)).await;
            Ok(JobSuccess {
                message: "unreachable".to_string(),
                result: None,
            })
        }
    }

    #[tokio::test]
    async fn supervisor_exits_after_drain_timeout() {
        let (supervisor, _dir) = setup().await;
        let job = supervisor
            .submit(JobKind::Pipeline, payload())
            .await
            .expect("submit");

        let mut config = fast_config();
        config.drain_timeout = Duration::from_millis(50);

        let shutdown = CancellationToken::new();
        let loop_handle = tokio::spawn(run_supervisor(
            supervisor.clone(),
            Arc::new(StuckExecutor),
            config,
            shutdown.clone(),
        ));

        wait_for_state(&supervisor, &job.id, JobState::Running).await;
        shutdown.cancel();

        // The stuck executor never observes the stop; the hard shutdown must
        // force the loop out shortly after the drain window.
        timeout(Duration::from_secs(2), loop_handle)
            .await
            .expect("loop should exit after drain timeout")
            .expect("join");

        // Finalization was abandoned, so the job is left where the stop
        // request put it.
        let abandoned = supervisor.store.get(&job.id).await.expect("get");
        assert_eq!(
            abandoned.state,
            JobState::Stopping,
            "abandoned job stays mid-state"
        );
    }

    #[tokio::test]
    async fn progress_is_monotonic() {
        let (supervisor, _dir) = setup().await;
        let store = supervisor.store();
        let job = store
            .create(JobKind::Pipeline, payload())
            .await
            .expect("create");
        store.claim_next().await.expect("claim");

        store
            .update_progress(&job.id, 40, Some(Phase::CommIntelligence))
            .await
            .expect("forward");
        store
            .update_progress(&job.id, 20, Some(Phase::MessageIngest))
            .await
            .expect("stale report");

        let current = store.get(&job.id).await.expect("get");
        assert_eq!(current.progress, 40, "stale lower progress is ignored");
    }

    #[tokio::test]
    async fn terminal_states_reject_updates() {
        let (supervisor, _dir) = setup().await;
        let store = supervisor.store();
        let job = store
            .create(JobKind::Pipeline, payload())
            .await
            .expect("create");
        store.claim_next().await.expect("claim");
        store.complete(&job.id, "done", None).await.expect("complete");

        let err = store
            .update_progress(&job.id, 50, None)
            .await
            .expect_err("terminal");
        assert!(matches!(err, SupervisorError::IllegalTransition { .. }));

        let err = store
            .fail(&job.id, ErrorKind::Internal, "late failure", None)
            .await
            .expect_err("terminal");
        assert!(matches!(err, SupervisorError::IllegalTransition { .. }));
    }

    #[tokio::test]
    async fn concurrent_claims_take_distinct_jobs() {
        let (supervisor, _dir) = setup().await;
        let store = supervisor.store();
        store
            .create(JobKind::Pipeline, payload())
            .await
            .expect("create");

        let a = store.claim_next().await.expect("claim a");
        let b = store.claim_next().await.expect("claim b");
        assert!(a.is_some());
        assert!(b.is_none(), "single pending job claimed once");
    }
}
