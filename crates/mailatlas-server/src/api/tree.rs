use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::get,
};
use mailatlas_core::{KnowledgeTree, TreeRepository};
use tracing::error;

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/{account_id}", get(latest_tree))
}

async fn latest_tree(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
) -> Result<Json<KnowledgeTree>, (StatusCode, String)> {
    let tree = TreeRepository::new(state.db.clone())
        .get_latest(&account_id)
        .await
        .map_err(|err| {
            error!(error = %err, "tree lookup failed");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        })?;

    match tree {
        Some(tree) => Ok(Json(tree)),
        None => Err((
            StatusCode::NOT_FOUND,
            format!("no knowledge tree for account {account_id}"),
        )),
    }
}
