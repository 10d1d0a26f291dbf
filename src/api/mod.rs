use crate::AppState;
use axum::Router;

mod home;
mod partitions;
mod restores;
mod workqueue;

pub fn routes() -> Router<AppState> {
	Router::new()
		.merge(home::routes())
		.merge(partitions::routes())
		.merge(restores::routes())
		.merge(workqueue::routes())
}
