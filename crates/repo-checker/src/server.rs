use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Router};

use crate::checker::RepoChecker;

pub fn router(checker: Arc<RepoChecker>) -> Router {
    Router::new().route("/", get(latest_revision)).with_state(checker)
}

/// `200 <hash>` once a refresh has succeeded, `404` before that.
async fn latest_revision(State(checker): State<Arc<RepoChecker>>) -> (StatusCode, String) {
    let revision = checker.current_revision();
    if revision.is_empty() {
        return (StatusCode::NOT_FOUND, "revision not found".into());
    }
    (StatusCode::OK, revision)
}
