use crate::config::PartitionConfig;
use crate::ingest::{Partition, RemoteDevice};
use crate::types::AE;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use tracing::{info, warn};

/// Lookup of the configured partitions.
pub trait PartitionDirectory: Send + Sync {
	fn find_by_aet(&self, aet: &str) -> Option<Partition>;

	fn enabled(&self) -> Vec<Partition>;
}

/// Partitions loaded once from the configuration.
#[derive(Debug, Clone, Default)]
pub struct ConfiguredPartitions {
	partitions: Vec<Partition>,
}

impl ConfiguredPartitions {
	pub fn new(configs: &[PartitionConfig]) -> Self {
		let mut partitions: Vec<Partition> = Vec::with_capacity(configs.len());
		for config in configs {
			if partitions.iter().any(|p| p.aet == config.aet) {
				warn!(aet = config.aet, "Ignoring partition with duplicate AE title");
				continue;
			}
			partitions.push(Partition::from(config));
		}
		Self { partitions }
	}

	pub fn all(&self) -> &[Partition] {
		&self.partitions
	}
}

impl PartitionDirectory for ConfiguredPartitions {
	fn find_by_aet(&self, aet: &str) -> Option<Partition> {
		let aet = aet.trim();
		self.partitions.iter().find(|p| p.aet == aet).cloned()
	}

	fn enabled(&self) -> Vec<Partition> {
		self.partitions.iter().filter(|p| p.enabled).cloned().collect()
	}
}

/// Known remote devices.
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
	/// Returns the device registered for `aet` on `partition`, registering it first if the
	/// partition accepts unknown devices. `None` means the sender must be refused.
	async fn lookup_or_register(
		&self,
		partition: &Partition,
		aet: &str,
		host: &str,
		port: u16,
	) -> Option<RemoteDevice>;
}

#[derive(Debug, Default)]
pub struct InMemoryDeviceRegistry {
	devices: RwLock<HashMap<(AE, AE), RemoteDevice>>,
}

impl InMemoryDeviceRegistry {
	/// Pre-registers a device, e.g. one that is configured statically.
	pub fn insert(&self, device: RemoteDevice) {
		self.devices
			.write()
			.unwrap_or_else(PoisonError::into_inner)
			.insert((device.partition.clone(), device.aet.clone()), device);
	}

	pub fn devices(&self) -> Vec<RemoteDevice> {
		self.devices
			.read()
			.unwrap_or_else(PoisonError::into_inner)
			.values()
			.cloned()
			.collect()
	}
}

#[async_trait]
impl DeviceRegistry for InMemoryDeviceRegistry {
	async fn lookup_or_register(
		&self,
		partition: &Partition,
		aet: &str,
		host: &str,
		port: u16,
	) -> Option<RemoteDevice> {
		let key = (partition.aet.clone(), AE::from(aet.trim()));
		if let Some(device) = self
			.devices
			.read()
			.unwrap_or_else(PoisonError::into_inner)
			.get(&key)
		{
			return Some(device.clone());
		}

		if !partition.accept_unknown_devices {
			warn!(
				calling_aet = aet,
				partition = partition.aet,
				"Refusing unknown device"
			);
			return None;
		}

		let mut devices = self.devices.write().unwrap_or_else(PoisonError::into_inner);
		let device = devices.entry(key).or_insert_with_key(|(partition, aet)| {
			info!(
				calling_aet = aet,
				partition, host, port, "Registered new remote device"
			);
			RemoteDevice {
				aet: aet.clone(),
				partition: partition.clone(),
				host: host.to_owned(),
				port,
			}
		});
		Some(device.clone())
	}
}
