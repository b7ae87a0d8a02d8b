use std::collections::BTreeMap;
use std::collections::BTreeSet;

use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Row, params};
use thiserror::Error;
use uuid::Uuid;

use crate::db::{Database, DbError};
use crate::messages::{Message, MessageError, MessageRepository};

const THREAD_COLUMNS: &str = "id, account_id, provider_thread_id, subject, participants_json, message_count, first_message_at, last_message_at, created_at, updated_at";

/// A conversation derived from stored messages. Threads are regenerated from
/// the message table, so out-of-order arrivals converge on the same rows.
#[derive(Debug, Clone, PartialEq)]
pub struct Thread {
    pub id: String,
    pub account_id: String,
    pub provider_thread_id: String,
    pub subject: Option<String>,
    pub participants: Vec<String>,
    pub message_count: i64,
    pub first_message_at: Option<DateTime<Utc>>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum ThreadError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("message error: {0}")]
    Message(#[from] MessageError),
    #[error("thread not found: {0}")]
    NotFound(String),
}

#[derive(Clone)]
pub struct ThreadRepository {
    db: Database,
}

impl ThreadRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Regenerate every thread for the account from the messages table.
    pub async fn rebuild_for_account(&self, account_id: &str) -> Result<usize, ThreadError> {
        let messages = MessageRepository::new(self.db.clone())
            .list_for_account(account_id, None)
            .await?;

        let mut grouped: BTreeMap<String, Vec<&Message>> = BTreeMap::new();
        for message in &messages {
            grouped
                .entry(message.thread_id.clone())
                .or_default()
                .push(message);
        }

        let count = grouped.len();
        for (provider_thread_id, thread_messages) in grouped {
            let mut participants: BTreeSet<String> = BTreeSet::new();
            let mut first_at: Option<DateTime<Utc>> = None;
            let mut last_at: Option<DateTime<Utc>> = None;
            let mut subject: Option<String> = None;

            for message in &thread_messages {
                participants.insert(message.from_email.clone());
                for addr in message.to.iter().chain(&message.cc).chain(&message.bcc) {
                    participants.insert(addr.to_lowercase());
                }
                if first_at.is_none_or(|at| message.sent_at < at) {
                    first_at = Some(message.sent_at);
                    subject = message.subject.clone().or(subject.take());
                }
                if last_at.is_none_or(|at| message.sent_at > at) {
                    last_at = Some(message.sent_at);
                }
            }

            self.upsert(
                account_id,
                &provider_thread_id,
                subject,
                participants.into_iter().collect(),
                thread_messages.len() as i64,
                first_at,
                last_at,
            )
            .await?;
        }

        Ok(count)
    }

    #[allow(clippy::too_many_arguments)]
    async fn upsert(
        &self,
        account_id: &str,
        provider_thread_id: &str,
        subject: Option<String>,
        participants: Vec<String>,
        message_count: i64,
        first_message_at: Option<DateTime<Utc>>,
        last_message_at: Option<DateTime<Utc>>,
    ) -> Result<Thread, ThreadError> {
        let id = Uuid::new_v4().to_string();
        let now = now_rfc3339();
        let participants_json = serde_json::to_string(&participants)?;

        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "INSERT INTO threads (id, account_id, provider_thread_id, subject, participants_json, message_count, first_message_at, last_message_at, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
                     ON CONFLICT(account_id, provider_thread_id) DO UPDATE SET
                        subject = excluded.subject,
                        participants_json = excluded.participants_json,
                        message_count = excluded.message_count,
                        first_message_at = excluded.first_message_at,
                        last_message_at = excluded.last_message_at,
                        updated_at = excluded.updated_at
                     RETURNING {THREAD_COLUMNS}"
                ),
                params![
                    id,
                    account_id,
                    provider_thread_id,
                    subject,
                    participants_json,
                    message_count,
                    first_message_at.map(to_rfc3339),
                    last_message_at.map(to_rfc3339),
                    now
                ],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_thread(row),
            None => Err(ThreadError::NotFound(provider_thread_id.to_string())),
        }
    }

    pub async fn list(&self, account_id: &str) -> Result<Vec<Thread>, ThreadError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {THREAD_COLUMNS} FROM threads
                     WHERE account_id = ?1
                     ORDER BY last_message_at DESC"
                ),
                params![account_id],
            )
            .await?;

        let mut threads = Vec::new();
        while let Some(row) = rows.next().await? {
            threads.push(row_to_thread(row)?);
        }
        Ok(threads)
    }
}

fn row_to_thread(row: Row) -> Result<Thread, ThreadError> {
    let participants_json: String = row.get(4)?;
    let first_message_at: Option<String> = row.get(6)?;
    let last_message_at: Option<String> = row.get(7)?;
    let created_at: String = row.get(8)?;
    let updated_at: String = row.get(9)?;

    Ok(Thread {
        id: row.get(0)?,
        account_id: row.get(1)?,
        provider_thread_id: row.get(2)?,
        subject: row.get(3)?,
        participants: serde_json::from_str(&participants_json)?,
        message_count: row.get(5)?,
        first_message_at: parse_optional(first_message_at)?,
        last_message_at: parse_optional(last_message_at)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
        updated_at: DateTime::parse_from_rfc3339(&updated_at)?.with_timezone(&Utc),
    })
}

fn parse_optional(raw: Option<String>) -> Result<Option<DateTime<Utc>>, chrono::ParseError> {
    raw.map(|value| DateTime::parse_from_rfc3339(&value).map(|dt| dt.with_timezone(&Utc)))
        .transpose()
}

fn to_rfc3339(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn now_rfc3339() -> String {
    to_rfc3339(Utc::now())
}
