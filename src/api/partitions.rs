use crate::backend::dimse::listener::ListenerStatus;
use crate::ingest::{Partition, RemoteDevice};
use crate::AppState;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

pub fn routes() -> Router<AppState> {
	Router::new().route("/partitions", get(partitions))
}

#[derive(Debug, Serialize)]
struct PartitionView {
	#[serde(flatten)]
	partition: Partition,
	/// Absent if the partition is disabled or its endpoint failed to bind.
	listener: Option<ListenerStatus>,
	devices: Vec<RemoteDevice>,
}

async fn partitions(State(state): State<AppState>) -> Json<Vec<PartitionView>> {
	let listeners = state.listeners.status();
	let devices = state.devices.devices();

	let views = state
		.partitions
		.all()
		.iter()
		.map(|partition| PartitionView {
			listener: listeners
				.iter()
				.find(|listener| listener.aet == partition.aet)
				.cloned(),
			devices: devices
				.iter()
				.filter(|device| device.partition == partition.aet)
				.cloned()
				.collect(),
			partition: partition.clone(),
		})
		.collect();

	Json(views)
}
