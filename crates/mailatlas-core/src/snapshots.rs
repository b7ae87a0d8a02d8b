use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Row, params};
use thiserror::Error;

use crate::db::{Database, DbError};
use crate::organizer::OrganizedSnapshot;

const SNAPSHOT_COLUMNS: &str = "id, account_id, generated_at, message_count, fingerprint, snapshot_json, created_at";

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("snapshot not found: {0}")]
    NotFound(String),
}

/// Persists organized snapshots wholesale as JSON. The store retains the
/// newest `retain` snapshots per account; older ones are pruned unless a
/// knowledge tree still references them.
#[derive(Clone)]
pub struct SnapshotRepository {
    db: Database,
    retain: usize,
}

impl SnapshotRepository {
    pub fn new(db: Database, retain: usize) -> Self {
        Self { db, retain }
    }

    pub async fn put(&self, snapshot: &OrganizedSnapshot) -> Result<(), SnapshotError> {
        let snapshot_json = serde_json::to_string(snapshot)?;
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);

        let conn = self.db.connection().await?;
        conn.execute(
            "INSERT INTO snapshots (id, account_id, generated_at, message_count, fingerprint, snapshot_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                snapshot.id.clone(),
                snapshot.account_id.clone(),
                snapshot
                    .generated_at
                    .to_rfc3339_opts(SecondsFormat::Millis, true),
                snapshot.message_count,
                snapshot.fingerprint.clone(),
                snapshot_json,
                now
            ],
        )
        .await?;

        self.prune(&snapshot.account_id).await?;
        Ok(())
    }

    async fn prune(&self, account_id: &str) -> Result<(), SnapshotError> {
        let conn = self.db.connection().await?;
        conn.execute(
            "DELETE FROM snapshots
             WHERE account_id = ?1
               AND id NOT IN (
                   SELECT id FROM snapshots WHERE account_id = ?1
                   ORDER BY generated_at DESC LIMIT ?2
               )
               AND id NOT IN (SELECT source_snapshot_id FROM knowledge_trees)",
            params![account_id, self.retain as i64],
        )
        .await?;
        Ok(())
    }

    pub async fn get(&self, snapshot_id: &str) -> Result<OrganizedSnapshot, SnapshotError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {SNAPSHOT_COLUMNS} FROM snapshots WHERE id = ?1"),
                params![snapshot_id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_snapshot(row),
            None => Err(SnapshotError::NotFound(snapshot_id.to_string())),
        }
    }

    pub async fn get_latest(
        &self,
        account_id: &str,
    ) -> Result<Option<OrganizedSnapshot>, SnapshotError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {SNAPSHOT_COLUMNS} FROM snapshots
                     WHERE account_id = ?1
                     ORDER BY generated_at DESC
                     LIMIT 1"
                ),
                params![account_id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(row_to_snapshot(row)?)),
            None => Ok(None),
        }
    }

    pub async fn count(&self, account_id: &str) -> Result<i64, SnapshotError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM snapshots WHERE account_id = ?1",
                params![account_id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(row.get(0)?),
            None => Ok(0),
        }
    }
}

fn row_to_snapshot(row: Row) -> Result<OrganizedSnapshot, SnapshotError> {
    let snapshot_json: String = row.get(5)?;
    Ok(serde_json::from_str(&snapshot_json)?)
}
