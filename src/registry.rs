use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use log::info;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::{DevicesConfig, ServiceSettings};
use crate::manager::FirmwareManager;
use crate::release::ReleaseClient;

/// Device-type name to manager, built once at startup.
pub struct ManagerRegistry {
    managers: BTreeMap<String, Arc<FirmwareManager>>,
    wake_interval: Duration,
}

impl ManagerRegistry {
    pub async fn build(config: &DevicesConfig, settings: &ServiceSettings) -> Self {
        let release = ReleaseClient::new(settings.api_base.clone());
        let mut managers = BTreeMap::new();
        for device in &config.devices {
            let manager =
                FirmwareManager::new(device.clone(), settings, release.clone()).await;
            managers.insert(device.name.clone(), Arc::new(manager));
        }
        info!("registry: {} device type(s) configured", managers.len());
        Self {
            managers,
            wake_interval: settings.wake_interval,
        }
    }

    pub fn get(&self, device_type: &str) -> Option<&Arc<FirmwareManager>> {
        self.managers.get(device_type)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.managers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.managers.len()
    }

    /// Start one background checker per manager; all stop when `stop` flips to true.
    pub fn spawn_checkers(&self, stop: &watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        self.managers
            .values()
            .map(|manager| manager.spawn_periodic_checker(self.wake_interval, stop.clone()))
            .collect()
    }
}
