use crate::ingest::DuplicatePolicy;
use crate::types::AE;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
	pub telemetry: TelemetryConfig,
	pub http: HttpServerConfig,
	pub store: StoreConfig,
	pub storage: StorageConfig,
	#[serde(default)]
	pub filesystems: Vec<FilesystemConfig>,
	#[serde(default)]
	pub partitions: Vec<PartitionConfig>,
	/// Remote devices known ahead of their first association.
	#[serde(default)]
	pub devices: Vec<DeviceConfig>,
}

impl AppConfig {
	/// Loads the layered configuration: embedded defaults, then an optional `config.toml` in the
	/// working directory, then environment variables prefixed with `DICOM_INGEST`.
	pub fn new() -> Result<Self, config::ConfigError> {
		use config::Config;
		let s = Config::builder()
			.add_source(config::File::from_str(
				include_str!("defaults.toml"),
				config::FileFormat::Toml,
			))
			.add_source(config::File::with_name("config.toml").required(false))
			.add_source(
				config::Environment::with_prefix("DICOM_INGEST")
					.prefix_separator("_")
					.separator("__"),
			)
			.build()?;

		s.try_deserialize()
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
	// Also configurable via RUST_LOG and DICOM_INGEST_TELEMETRY__LEVEL
	pub level: String,
	/// Sentry DSN. Sentry stays disabled if unset.
	pub sentry: Option<String>,
}

impl TelemetryConfig {
	pub fn level(&self) -> tracing::Level {
		self.level.parse().unwrap_or(tracing::Level::INFO)
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpServerConfig {
	#[serde(default = "HttpServerConfig::default_enabled")]
	pub enabled: bool,
	pub interface: IpAddr,
	pub port: u16,
	/// Request timeout in seconds
	pub request_timeout: u64,
	pub graceful_shutdown: bool,
}

impl HttpServerConfig {
	const fn default_enabled() -> bool {
		true
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
	/// Artificial delay in milliseconds before a C-STORE-RSP is written.
	pub response_delay: u64,
	/// Maximum number of delayed responses waiting for transmission at once.
	pub response_workers: usize,
	/// Timeout in seconds for writing a response.
	pub message_timeout: u64,
	pub correlation_token: String,
	/// Capacity of the study process message channel. Messages beyond it are dropped.
	pub notification_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
	pub restore_nearline: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilesystemTier {
	Online,
	Nearline,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FilesystemConfig {
	pub path: PathBuf,
	pub tier: FilesystemTier,
	pub writable: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PartitionConfig {
	/// The application entity title peers must call to reach this partition.
	pub aet: AE,
	#[serde(default = "PartitionConfig::default_interface")]
	pub interface: IpAddr,
	pub port: u16,
	#[serde(default = "PartitionConfig::default_enabled")]
	pub enabled: bool,
	pub duplicate_policy: DuplicatePolicy,
	/// Folder below each filesystem root that holds the studies of this partition.
	/// Defaults to the AE title.
	pub folder: Option<String>,
	/// Register calling AE titles on first contact instead of refusing them.
	#[serde(default = "PartitionConfig::default_enabled")]
	pub accept_unknown_devices: bool,
	/// Only negotiate transfer syntaxes that do not need a codec.
	#[serde(default)]
	pub uncompressed: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
	pub aet: AE,
	/// AE title of the partition the device sends to.
	pub partition: AE,
	pub host: String,
	pub port: u16,
}

impl PartitionConfig {
	const fn default_interface() -> IpAddr {
		IpAddr::V4(Ipv4Addr::UNSPECIFIED)
	}

	const fn default_enabled() -> bool {
		true
	}
}
