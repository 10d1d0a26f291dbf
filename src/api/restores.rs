use crate::ingest::StudyStorage;
use crate::AppState;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};

pub fn routes() -> Router<AppState> {
	Router::new().route("/restores", get(restores))
}

/// Nearline studies that were requested for restore.
async fn restores(State(state): State<AppState>) -> Json<Vec<StudyStorage>> {
	Json(state.allocator.restore_requests().await)
}
