pub(crate) mod api;
pub(crate) mod backend;
pub(crate) mod config;
pub(crate) mod ingest;
pub(crate) mod types;

use crate::backend::dimse::listener::{EndpointOptions, ListenerRegistry};
use crate::backend::dimse::response::ResponseDispatcher;
use crate::backend::dimse::service::ServiceRegistry;
use crate::config::{AppConfig, HttpServerConfig};
use crate::ingest::{
	notify, ChannelNotifier, Collaborators, ConfiguredPartitions, FilesystemAllocator,
	InMemoryDeviceRegistry, InMemoryWorkQueue, PartitionDirectory, ReceiveHandler, RemoteDevice,
};
use axum::extract::Request;
use axum::response::Response;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace;
use tracing::{error, info, level_filters::LevelFilter, warn, Level};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// The implementation class UID written to the file meta group of staged instances.
/// The UID is a randomly generated UUID represented as a single integer value under the 2.25 root.
pub const IMPLEMENTATION_CLASS_UID: &str = "2.25.207441585426113917406725938460366131983";

/// The implementation version name.
/// It consists of the string "DICOM-INGEST" followed by the crate version.
pub const IMPLEMENTATION_VERSION_NAME: &str = concat!("DICOM-INGEST ", env!("CARGO_PKG_VERSION"));

fn init_logger(level: tracing::Level) {
	tracing_subscriber::registry()
		.with(
			tracing_subscriber::fmt::layer()
				.compact()
				.with_ansi(true)
				.with_file(false)
				.with_line_number(false)
				.with_target(false),
		)
		.with(
			EnvFilter::builder()
				.with_default_directive(LevelFilter::from_level(level).into())
				.from_env_lossy(),
		)
		.with(sentry::integrations::tracing::layer())
		.init();
}

/// State of the admin HTTP surface.
#[derive(Clone)]
pub struct AppState {
	pub partitions: Arc<ConfiguredPartitions>,
	pub devices: Arc<InMemoryDeviceRegistry>,
	pub work_queue: Arc<InMemoryWorkQueue>,
	pub allocator: Arc<FilesystemAllocator>,
	pub listeners: Arc<ListenerRegistry>,
}

fn init_sentry(config: &AppConfig) -> sentry::ClientInitGuard {
	let guard = sentry::init((
		// An empty string will disable Sentry
		config.telemetry.sentry.as_deref().unwrap_or_default(),
		sentry::ClientOptions {
			release: sentry::release_name!(),
			traces_sample_rate: 1.0,
			..Default::default()
		},
	));

	if let Some(dsn) = &config.telemetry.sentry {
		info!(dsn, "Enabled Sentry for tracing and error tracking");
	};

	guard
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
	let config = AppConfig::new()?;
	init_logger(config.telemetry.level());

	// Manually create the Tokio runtime because the Sentry client needs to be created *before* the
	// Tokio runtime, which prevents us from using the #[tokio::main] macro.
	// See https://docs.sentry.io/platforms/rust/#async-main-function
	let _sentry = init_sentry(&config);

	tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()?
		.block_on(async move {
			if let Err(error) = run(config).await {
				error!("Failed to start application due to error: {error:#}");
			}
		});
	Ok(())
}

async fn run(config: AppConfig) -> anyhow::Result<()> {
	let partitions = Arc::new(ConfiguredPartitions::new(&config.partitions));
	let devices = Arc::new(InMemoryDeviceRegistry::default());
	for device in &config.devices {
		if partitions.find_by_aet(&device.partition).is_none() {
			warn!(
				aet = device.aet,
				"Configured device refers to unknown partition {}",
				device.partition
			);
		}
		devices.insert(RemoteDevice::from(device));
	}
	let work_queue = Arc::new(InMemoryWorkQueue::default());
	let allocator = Arc::new(FilesystemAllocator::new(
		&config.filesystems,
		&config.storage,
	));
	if config.filesystems.iter().all(|filesystem| !filesystem.writable) {
		warn!("No writable filesystem is configured, every C-STORE will fail");
	}

	let (notifications, study_process_messages) =
		tokio::sync::mpsc::channel(config.store.notification_capacity.max(1));
	tokio::spawn(notify::drain(study_process_messages, Arc::clone(&work_queue)));

	let handler = ReceiveHandler::new(
		Collaborators {
			partitions: partitions.clone(),
			devices: devices.clone(),
			allocator: allocator.clone(),
			work_queue: work_queue.clone(),
			studies: work_queue.clone(),
			notifier: Arc::new(ChannelNotifier::new(notifications)),
		},
		config.store.correlation_token.clone(),
	);

	let listeners = Arc::new(ListenerRegistry::default());
	let endpoint_options = EndpointOptions {
		services: ServiceRegistry::storage(handler),
		dispatcher: ResponseDispatcher::new(
			Duration::from_millis(config.store.response_delay),
			config.store.response_workers,
		),
		message_timeout: Duration::from_secs(config.store.message_timeout),
	};
	let started = listeners
		.start(partitions.enabled(), &endpoint_options)
		.await;
	if started == 0 {
		warn!("No partition endpoint is running");
	}

	let result = if config.http.enabled {
		serve_http(
			&config.http,
			AppState {
				partitions,
				devices,
				work_queue,
				allocator,
				listeners: Arc::clone(&listeners),
			},
		)
		.await
	} else {
		shutdown_signal().await;
		Ok(())
	};

	listeners.shutdown();
	result
}

async fn serve_http(config: &HttpServerConfig, app_state: AppState) -> anyhow::Result<()> {
	let app = api::routes()
		.layer(axum::middleware::from_fn(add_common_headers))
		.layer(
			tower_http::trace::TraceLayer::new_for_http()
				.make_span_with(trace::DefaultMakeSpan::new().level(Level::INFO))
				.on_request(trace::DefaultOnRequest::new().level(Level::INFO))
				.on_response(trace::DefaultOnResponse::new().level(Level::INFO)),
		)
		.layer(TimeoutLayer::new(Duration::from_secs(config.request_timeout)))
		.with_state(app_state);

	let addr = SocketAddr::from((config.interface, config.port));
	let listener = TcpListener::bind(addr).await?;

	info!("Started admin server on http://{addr}");
	if config.graceful_shutdown {
		axum::serve(listener, app)
			.with_graceful_shutdown(shutdown_signal())
			.await?;
	} else {
		axum::serve(listener, app).await?;
	}

	Ok(())
}

async fn shutdown_signal() {
	let ctrl_c = async {
		if let Err(err) = signal::ctrl_c().await {
			error!("Failed to listen for ctrl-c: {err}");
			std::future::pending::<()>().await;
		}
	};

	#[cfg(unix)]
	let terminate = async {
		match signal::unix::signal(signal::unix::SignalKind::terminate()) {
			Ok(mut terminate) => {
				terminate.recv().await;
			}
			Err(err) => {
				error!("Failed to listen for SIGTERM: {err}");
				std::future::pending::<()>().await;
			}
		}
	};

	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		() = ctrl_c => {},
		() = terminate => {},
	}
	info!("Shutting down");
}

async fn add_common_headers(req: Request, next: axum::middleware::Next) -> Response {
	let mut response = next.run(req).await;
	let server_name = concat!("dicom-ingest/", env!("CARGO_PKG_VERSION"));
	let headers = response.headers_mut();
	headers.insert("Server", axum::http::HeaderValue::from_static(server_name));
	response
}
