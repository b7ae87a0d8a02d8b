use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Row, params};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::db::{Database, DbError};
use crate::synthesizer::TreeContent;

const TREE_COLUMNS: &str = "id, account_id, source_snapshot_id, version, generated_at, tree_json, created_at";

/// The published artifact: a versioned tree of findings referencing exactly
/// one organized snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeTree {
    pub id: String,
    pub account_id: String,
    pub source_snapshot_id: String,
    pub version: i64,
    pub generated_at: DateTime<Utc>,
    pub content: TreeContent,
}

#[derive(Debug, Error)]
pub enum TreeError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("source snapshot missing: {0}")]
    SnapshotMissing(String),
    #[error("tree not found for account {0}")]
    NotFound(String),
}

#[derive(Clone)]
pub struct TreeRepository {
    db: Database,
}

impl TreeRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Publish a new tree atomically: the source snapshot is verified and the
    /// version allocated inside one transaction, so a tree can never appear
    /// without its snapshot.
    pub async fn put(
        &self,
        account_id: &str,
        source_snapshot_id: &str,
        content: &TreeContent,
    ) -> Result<KnowledgeTree, TreeError> {
        let id = Uuid::new_v4().to_string();
        let generated_at = Utc::now();
        let tree_json = serde_json::to_string(content)?;
        let now = to_rfc3339(generated_at);

        let conn = self.db.connection().await?;
        let tx = conn.transaction().await?;

        let mut rows = tx
            .query(
                "SELECT 1 FROM snapshots WHERE id = ?1 AND account_id = ?2",
                params![source_snapshot_id, account_id],
            )
            .await?;
        if rows.next().await?.is_none() {
            return Err(TreeError::SnapshotMissing(source_snapshot_id.to_string()));
        }

        let mut rows = tx
            .query(
                "SELECT COALESCE(MAX(version), 0) FROM knowledge_trees WHERE account_id = ?1",
                params![account_id],
            )
            .await?;
        let version: i64 = match rows.next().await? {
            Some(row) => row.get::<i64>(0)? + 1,
            None => 1,
        };

        tx.execute(
            "INSERT INTO knowledge_trees (id, account_id, source_snapshot_id, version, generated_at, tree_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?5)",
            params![
                id.clone(),
                account_id,
                source_snapshot_id,
                version,
                now,
                tree_json
            ],
        )
        .await?;
        tx.commit().await?;

        Ok(KnowledgeTree {
            id,
            account_id: account_id.to_string(),
            source_snapshot_id: source_snapshot_id.to_string(),
            version,
            generated_at,
            content: content.clone(),
        })
    }

    pub async fn get_latest(&self, account_id: &str) -> Result<Option<KnowledgeTree>, TreeError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {TREE_COLUMNS} FROM knowledge_trees
                     WHERE account_id = ?1
                     ORDER BY version DESC
                     LIMIT 1"
                ),
                params![account_id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(row_to_tree(row)?)),
            None => Ok(None),
        }
    }

    pub async fn count(&self, account_id: &str) -> Result<i64, TreeError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM knowledge_trees WHERE account_id = ?1",
                params![account_id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(row.get(0)?),
            None => Ok(0),
        }
    }
}

fn row_to_tree(row: Row) -> Result<KnowledgeTree, TreeError> {
    let generated_at: String = row.get(4)?;
    let tree_json: String = row.get(5)?;

    Ok(KnowledgeTree {
        id: row.get(0)?,
        account_id: row.get(1)?,
        source_snapshot_id: row.get(2)?,
        version: row.get(3)?,
        generated_at: DateTime::parse_from_rfc3339(&generated_at)?.with_timezone(&Utc),
        content: serde_json::from_str(&tree_json)?,
    })
}

fn to_rfc3339(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::AccountRepository;
    use crate::migrations::run_migrations;
    use crate::organizer::OrganizedSnapshot;
    use crate::snapshots::SnapshotRepository;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    async fn setup() -> (Database, String, TempDir) {
        let dir = TempDir::new().expect("temp dir");
        let db_path = dir.path().join(format!("db_{}.sqlite", Uuid::new_v4()));
        let db = Database::new(&db_path).await.expect("create db");
        run_migrations(&db).await.expect("migrations");
        let account = AccountRepository::new(db.clone())
            .upsert("owner@example.com", None)
            .await
            .expect("account");
        (db, account.id, dir)
    }

    fn empty_content() -> TreeContent {
        TreeContent {
            domains: vec![],
            edges: vec![],
            analyst_kinds: vec![],
        }
    }

    async fn seed_snapshot(db: &Database, account_id: &str) -> String {
        let snapshot = OrganizedSnapshot {
            id: Uuid::new_v4().to_string(),
            account_id: account_id.to_string(),
            generated_at: Utc::now(),
            message_count: 1,
            max_sent_at: None,
            topics: vec![],
            contacts: vec![],
            contact_topics: BTreeMap::new(),
            fingerprint: "fp".to_string(),
        };
        SnapshotRepository::new(db.clone(), 5)
            .put(&snapshot)
            .await
            .expect("snapshot");
        snapshot.id
    }

    #[tokio::test]
    async fn put_assigns_incrementing_versions() {
        let (db, account_id, _dir) = setup().await;
        let snapshot_id = seed_snapshot(&db, &account_id).await;
        let repo = TreeRepository::new(db);

        let first = repo
            .put(&account_id, &snapshot_id, &empty_content())
            .await
            .expect("first tree");
        let second = repo
            .put(&account_id, &snapshot_id, &empty_content())
            .await
            .expect("second tree");

        assert_eq!(first.version, 1);
        assert_eq!(second.version, 2);

        let latest = repo
            .get_latest(&account_id)
            .await
            .expect("latest")
            .expect("tree");
        assert_eq!(latest.id, second.id);
        assert_eq!(latest.source_snapshot_id, snapshot_id);
    }

    #[tokio::test]
    async fn put_refuses_missing_snapshot() {
        let (db, account_id, _dir) = setup().await;
        let repo = TreeRepository::new(db);

        let err = repo
            .put(&account_id, "no-such-snapshot", &empty_content())
            .await
            .expect_err("should fail");
        assert!(matches!(err, TreeError::SnapshotMissing(_)));
        assert_eq!(repo.count(&account_id).await.expect("count"), 0);
    }

    #[tokio::test]
    async fn get_latest_is_none_without_trees() {
        let (db, account_id, _dir) = setup().await;
        let repo = TreeRepository::new(db);
        assert!(repo.get_latest(&account_id).await.expect("latest").is_none());
    }
}
