use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Row, params};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::db::{Database, DbError};

const LLM_CALL_COLUMNS: &str = "id, feature, model, request_json, response_json, input_tokens, output_tokens, latency_ms, error, created_at";

/// Audit record of one provider round trip.
#[derive(Debug, Clone)]
pub struct LlmCall {
    pub id: String,
    pub feature: String,
    pub model: String,
    pub request_json: Value,
    pub response_json: Option<Value>,
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewLlmCall {
    pub feature: String,
    pub model: String,
    pub request_json: Value,
    pub response_json: Option<Value>,
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
}

#[derive(Debug, Error)]
pub enum LlmCallError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
}

#[derive(Clone)]
pub struct LlmCallRepository {
    db: Database,
}

impl LlmCallRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn create(&self, new_call: NewLlmCall) -> Result<LlmCall, LlmCallError> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let request_json = serde_json::to_string(&new_call.request_json)?;
        let response_json = new_call
            .response_json
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "INSERT INTO llm_calls (id, feature, model, request_json, response_json, input_tokens, output_tokens, latency_ms, error, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                     RETURNING {LLM_CALL_COLUMNS}"
                ),
                params![
                    id,
                    new_call.feature,
                    new_call.model,
                    request_json,
                    response_json,
                    new_call.input_tokens.map(|v| v as i64),
                    new_call.output_tokens.map(|v| v as i64),
                    new_call.latency_ms.map(|v| v as i64),
                    new_call.error,
                    now
                ],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_call(row),
            None => unreachable!("INSERT ... RETURNING always yields a row"),
        }
    }

    pub async fn list(
        &self,
        feature: Option<&str>,
        limit: Option<u32>,
    ) -> Result<Vec<LlmCall>, LlmCallError> {
        let limit = limit.unwrap_or(50) as i64;
        let feature_value = feature.unwrap_or_default();

        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {LLM_CALL_COLUMNS} FROM llm_calls
                     WHERE (?1 = '' OR feature = ?1)
                     ORDER BY created_at DESC
                     LIMIT ?2"
                ),
                params![feature_value, limit],
            )
            .await?;

        let mut calls = Vec::new();
        while let Some(row) = rows.next().await? {
            calls.push(row_to_call(row)?);
        }
        Ok(calls)
    }
}

fn row_to_call(row: Row) -> Result<LlmCall, LlmCallError> {
    let request_json: String = row.get(3)?;
    let response_json: Option<String> = row.get(4)?;
    let input_tokens: Option<i64> = row.get(5)?;
    let output_tokens: Option<i64> = row.get(6)?;
    let latency_ms: Option<i64> = row.get(7)?;
    let created_at: String = row.get(9)?;

    Ok(LlmCall {
        id: row.get(0)?,
        feature: row.get(1)?,
        model: row.get(2)?,
        request_json: serde_json::from_str(&request_json)?,
        response_json: response_json
            .map(|raw| serde_json::from_str(&raw))
            .transpose()?,
        input_tokens: input_tokens.map(|v| v as u32),
        output_tokens: output_tokens.map(|v| v as u32),
        latency_ms: latency_ms.map(|v| v as u64),
        error: row.get(8)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations::run_migrations;
    use serde_json::json;
    use tempfile::TempDir;

    async fn setup() -> (LlmCallRepository, TempDir) {
        let dir = TempDir::new().expect("temp dir");
        let db_path = dir.path().join(format!("db_{}.sqlite", Uuid::new_v4()));
        let db = Database::new(&db_path).await.expect("create db");
        run_migrations(&db).await.expect("migrations");
        (LlmCallRepository::new(db), dir)
    }

    #[tokio::test]
    async fn create_and_list_by_feature() {
        let (repo, _dir) = setup().await;

        repo.create(NewLlmCall {
            feature: "business-strategy".into(),
            model: "openai::gpt-4o-mini".into(),
            request_json: json!({"messages": []}),
            response_json: Some(json!({"content": "ok"})),
            input_tokens: Some(100),
            output_tokens: Some(20),
            latency_ms: Some(420),
            error: None,
        })
        .await
        .expect("create");
        repo.create(NewLlmCall {
            feature: "predictive".into(),
            model: "openai::gpt-4o-mini".into(),
            request_json: json!({}),
            response_json: None,
            input_tokens: None,
            output_tokens: None,
            latency_ms: Some(11),
            error: Some("timeout".into()),
        })
        .await
        .expect("create 2");

        let strategy = repo
            .list(Some("business-strategy"), None)
            .await
            .expect("list");
        assert_eq!(strategy.len(), 1);
        assert_eq!(strategy[0].input_tokens, Some(100));
        assert!(strategy[0].error.is_none());

        let all = repo.list(None, Some(10)).await.expect("list all");
        assert_eq!(all.len(), 2);
    }
}
