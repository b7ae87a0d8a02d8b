use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Row, params};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::db::{Database, DbError};

const MESSAGE_COLUMNS: &str = "id, account_id, external_id, thread_id, direction, sent_at, from_email, to_json, cc_json, bcc_json, subject, body_text, created_at, updated_at";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }

    fn from_str(value: &str) -> Option<Self> {
        match value {
            "inbound" => Some(Direction::Inbound),
            "outbound" => Some(Direction::Outbound),
            _ => None,
        }
    }
}

/// A normalized mail message. Immutable once upserted; re-upserting the same
/// `(account_id, external_id)` replaces the row wholesale.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: String,
    pub account_id: String,
    pub external_id: String,
    pub thread_id: String,
    pub direction: Direction,
    pub sent_at: DateTime<Utc>,
    pub from_email: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub subject: Option<String>,
    pub body_text: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Message {
    /// All counterpart addresses of this message, lowercased: the sender for
    /// inbound mail, every addressed recipient for outbound mail.
    pub fn counterparts(&self) -> Vec<String> {
        match self.direction {
            Direction::Inbound => vec![self.from_email.to_lowercase()],
            Direction::Outbound => self
                .to
                .iter()
                .chain(self.cc.iter())
                .chain(self.bcc.iter())
                .map(|addr| addr.to_lowercase())
                .collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub account_id: String,
    pub external_id: String,
    pub thread_id: String,
    pub direction: Direction,
    pub sent_at: DateTime<Utc>,
    pub from_email: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub subject: Option<String>,
    pub body_text: Option<String>,
}

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("invalid direction value {0}")]
    InvalidDirection(String),
    #[error("message not found: {0}")]
    NotFound(String),
}

#[derive(Clone)]
pub struct MessageRepository {
    db: Database,
}

impl MessageRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn upsert(&self, new_msg: NewMessage) -> Result<Message, MessageError> {
        let NewMessage {
            account_id,
            external_id,
            thread_id,
            direction,
            sent_at,
            from_email,
            to,
            cc,
            bcc,
            subject,
            body_text,
        } = new_msg;

        let id = Uuid::new_v4().to_string();
        let now = now_rfc3339();

        let to_json = serde_json::to_string(&normalize_addresses(&to))?;
        let cc_json = serde_json::to_string(&normalize_addresses(&cc))?;
        let bcc_json = serde_json::to_string(&normalize_addresses(&bcc))?;
        let external_id_for_error = external_id.clone();

        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "INSERT INTO messages (
                        id, account_id, external_id, thread_id, direction, sent_at, from_email, to_json, cc_json, bcc_json, subject, body_text, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13)
                     ON CONFLICT(account_id, external_id) DO UPDATE SET
                        thread_id = excluded.thread_id,
                        direction = excluded.direction,
                        sent_at = excluded.sent_at,
                        from_email = excluded.from_email,
                        to_json = excluded.to_json,
                        cc_json = excluded.cc_json,
                        bcc_json = excluded.bcc_json,
                        subject = excluded.subject,
                        body_text = excluded.body_text,
                        updated_at = excluded.updated_at
                     RETURNING {MESSAGE_COLUMNS}"
                ),
                params![
                    id,
                    account_id,
                    external_id,
                    thread_id,
                    direction.as_str(),
                    to_rfc3339(sent_at),
                    from_email.to_lowercase(),
                    to_json,
                    cc_json,
                    bcc_json,
                    subject,
                    body_text,
                    now
                ],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_message(row),
            None => Err(MessageError::NotFound(external_id_for_error)),
        }
    }

    pub async fn exists(
        &self,
        account_id: &str,
        external_id: &str,
    ) -> Result<bool, MessageError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "SELECT 1 FROM messages WHERE account_id = ?1 AND external_id = ?2 LIMIT 1",
                params![account_id, external_id],
            )
            .await?;

        Ok(rows.next().await?.is_some())
    }

    /// Every message exchanged with `address`, ascending by sent time.
    pub async fn list_for_contact(
        &self,
        account_id: &str,
        address: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>, MessageError> {
        let address = address.to_lowercase();
        let pattern = format!("%\"{address}\"%");
        let since_str = since.map(to_rfc3339).unwrap_or_default();

        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE account_id = ?1
                       AND (from_email = ?2 OR to_json LIKE ?3 OR cc_json LIKE ?3 OR bcc_json LIKE ?3)
                       AND (?4 = '' OR sent_at >= ?4)
                     ORDER BY sent_at ASC"
                ),
                params![account_id, address, pattern, since_str],
            )
            .await?;

        collect_messages(&mut rows).await
    }

    /// All messages for the account, ascending by sent time.
    pub async fn list_for_account(
        &self,
        account_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>, MessageError> {
        let since_str = since.map(to_rfc3339).unwrap_or_default();

        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE account_id = ?1 AND (?2 = '' OR sent_at >= ?2)
                     ORDER BY sent_at ASC"
                ),
                params![account_id, since_str],
            )
            .await?;

        collect_messages(&mut rows).await
    }

    /// Outbound messages in the lookback window, ascending by sent time.
    pub async fn list_sent(
        &self,
        account_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Message>, MessageError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE account_id = ?1 AND direction = 'outbound' AND sent_at >= ?2
                     ORDER BY sent_at ASC"
                ),
                params![account_id, to_rfc3339(since)],
            )
            .await?;

        collect_messages(&mut rows).await
    }

    /// Distinct lowercased sender addresses of inbound mail. Used to decide
    /// whether a contact has ever replied.
    pub async fn inbound_senders(
        &self,
        account_id: &str,
    ) -> Result<std::collections::HashSet<String>, MessageError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "SELECT DISTINCT from_email FROM messages WHERE account_id = ?1 AND direction = 'inbound'",
                params![account_id],
            )
            .await?;

        let mut senders = std::collections::HashSet::new();
        while let Some(row) = rows.next().await? {
            let sender: String = row.get(0)?;
            senders.insert(sender);
        }
        Ok(senders)
    }

    pub async fn count_for_account(&self, account_id: &str) -> Result<i64, MessageError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM messages WHERE account_id = ?1",
                params![account_id],
            )
            .await?;
        let count = match rows.next().await? {
            Some(row) => row.get(0)?,
            None => 0,
        };
        Ok(count)
    }
}

async fn collect_messages(rows: &mut libsql::Rows) -> Result<Vec<Message>, MessageError> {
    let mut messages = Vec::new();
    while let Some(row) = rows.next().await? {
        messages.push(row_to_message(row)?);
    }
    Ok(messages)
}

fn normalize_addresses(addresses: &[String]) -> Vec<String> {
    addresses.iter().map(|addr| addr.to_lowercase()).collect()
}

fn row_to_message(row: Row) -> Result<Message, MessageError> {
    let direction_str: String = row.get(4)?;
    let sent_at: String = row.get(5)?;
    let to_json: String = row.get(7)?;
    let cc_json: String = row.get(8)?;
    let bcc_json: String = row.get(9)?;
    let created_at: String = row.get(12)?;
    let updated_at: String = row.get(13)?;

    let direction = Direction::from_str(&direction_str)
        .ok_or(MessageError::InvalidDirection(direction_str))?;

    Ok(Message {
        id: row.get(0)?,
        account_id: row.get(1)?,
        external_id: row.get(2)?,
        thread_id: row.get(3)?,
        direction,
        sent_at: DateTime::parse_from_rfc3339(&sent_at)?.with_timezone(&Utc),
        from_email: row.get(6)?,
        to: serde_json::from_str(&to_json)?,
        cc: serde_json::from_str(&cc_json)?,
        bcc: serde_json::from_str(&bcc_json)?,
        subject: row.get(10)?,
        body_text: row.get(11)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
        updated_at: DateTime::parse_from_rfc3339(&updated_at)?.with_timezone(&Utc),
    })
}

fn to_rfc3339(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn now_rfc3339() -> String {
    to_rfc3339(Utc::now())
}
