use crate::ingest::workqueue::WorkItemSummary;
use crate::AppState;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};

pub fn routes() -> Router<AppState> {
	Router::new().route("/workqueue", get(pending))
}

async fn pending(State(state): State<AppState>) -> Json<Vec<WorkItemSummary>> {
	Json(state.work_queue.pending())
}
