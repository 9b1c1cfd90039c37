use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::{DeviceConfig, ServiceSettings};
use crate::error::FirmwareError;
use crate::policy;
use crate::release::ReleaseClient;
use crate::storage::CacheStore;
use crate::util::{format_size, now_rfc3339, now_secs, stop_requested};

pub mod models;

use models::{CachedFirmwareMetadata, Decision, ReleaseInfo, StatusReport};

#[derive(Debug, Default)]
struct ManagerState {
    last_check: i64,
    current_version: Option<String>,
    in_progress: bool,
}

/// Clears the in-progress flag on every exit path of a download.
struct DownloadGuard<'a> {
    state: &'a Mutex<ManagerState>,
}

impl Drop for DownloadGuard<'_> {
    fn drop(&mut self) {
        lock(self.state).in_progress = false;
    }
}

fn lock(state: &Mutex<ManagerState>) -> MutexGuard<'_, ManagerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Keeps one device type's cached firmware in sync with its upstream release.
pub struct FirmwareManager {
    device: DeviceConfig,
    store: CacheStore,
    release: ReleaseClient,
    check_interval: Duration,
    state: Mutex<ManagerState>,
    // serializes read-modify-write cycles on the sidecar record
    metadata_lock: tokio::sync::Mutex<()>,
}

impl FirmwareManager {
    pub async fn new(
        device: DeviceConfig,
        settings: &ServiceSettings,
        release: ReleaseClient,
    ) -> Self {
        let store = CacheStore::new(&settings.data_dir.join(&device.name), &device.asset);
        let metadata = store.load_metadata().await;
        let state = ManagerState {
            last_check: metadata.as_ref().map_or(0, |m| m.last_check),
            current_version: metadata.map(|m| m.version),
            in_progress: false,
        };
        info!(
            "manager[{}]: tracking {} asset {} (cached version {:?})",
            device.name,
            device.repository(),
            device.asset,
            state.current_version
        );
        debug!(
            "manager[{}]: artifact {}, metadata {}",
            device.name,
            store.artifact_path().display(),
            store.metadata_path().display()
        );
        Self {
            device,
            store,
            release,
            check_interval: settings.check_interval,
            state: Mutex::new(state),
            metadata_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.device.name
    }

    pub fn device(&self) -> &DeviceConfig {
        &self.device
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub fn current_version(&self) -> Option<String> {
        lock(&self.state).current_version.clone()
    }

    pub fn is_in_progress(&self) -> bool {
        lock(&self.state).in_progress
    }

    /// Assemble local cache facts and the current update decision.
    pub async fn get_status(&self) -> StatusReport {
        let decision = self.check_for_update(false).await;
        let artifact = self.store.artifact_info().await;
        let metadata = match artifact {
            Some(_) => self.store.load_metadata().await,
            None => None,
        };
        let (last_check, current_version, is_checking) = {
            let state = lock(&self.state);
            (
                state.last_check,
                state.current_version.clone(),
                state.in_progress,
            )
        };
        let release = decision.release_info.as_ref();

        StatusReport {
            device_type: self.device.name.clone(),
            repository: self.device.repository(),
            asset: self.device.asset.clone(),
            local_exists: artifact.is_some(),
            current_version,
            file_size: artifact.map(|a| a.size),
            file_modified: artifact.and_then(|a| a.modified),
            sha256: metadata.as_ref().map(|m| m.sha256.clone()),
            download_date: metadata.map(|m| m.download_date),
            last_check,
            is_checking,
            needs_update: decision.needs_update,
            reason: decision.reason.clone(),
            latest_version: release.map(|r| r.version.clone()),
            release_notes: release.map(|r| r.release_notes.clone()),
            prerelease: release.map(|r| r.prerelease),
        }
    }

    /// Decide whether the cache needs refreshing; `force` ignores the throttle window.
    pub async fn check_for_update(&self, force: bool) -> Decision {
        let (last_check, current_version) = {
            let mut state = lock(&self.state);
            if force {
                state.last_check = 0;
            }
            (state.last_check, state.current_version.clone())
        };
        let local_exists = self.store.artifact_info().await.is_some();
        let now = now_secs();

        let mut queried = false;
        let decision = policy::decide(
            now,
            last_check,
            self.check_interval,
            local_exists,
            current_version.as_deref(),
            || {
                queried = true;
                lock(&self.state).last_check = now;
                self.release
                    .fetch_latest(&self.device.owner, &self.device.repo, &self.device.asset)
            },
        )
        .await;

        if queried {
            self.persist_last_check(now).await;
            info!(
                "manager[{}]: check complete, needs_update={} ({})",
                self.device.name, decision.needs_update, decision.reason
            );
        } else {
            debug!("manager[{}]: check throttled", self.device.name);
        }
        decision
    }

    /// Download `release` (or the latest release) and swap it into the cache.
    ///
    /// # Errors
    /// `AlreadyInProgress` if another download holds the flag; otherwise the
    /// fetch, transfer or verification failure. The existing cache is left
    /// untouched on error.
    pub async fn download_latest(
        &self,
        release: Option<ReleaseInfo>,
    ) -> Result<String, FirmwareError> {
        let _guard = self.begin_download()?;
        match self.download_inner(release).await {
            Ok(message) => {
                info!("manager[{}]: {message}", self.device.name);
                Ok(message)
            }
            Err(err) => {
                error!("manager[{}]: download failed: {err}", self.device.name);
                Err(err)
            }
        }
    }

    fn begin_download(&self) -> Result<DownloadGuard<'_>, FirmwareError> {
        let mut state = lock(&self.state);
        if state.in_progress {
            return Err(FirmwareError::AlreadyInProgress);
        }
        state.in_progress = true;
        Ok(DownloadGuard { state: &self.state })
    }

    async fn download_inner(&self, release: Option<ReleaseInfo>) -> Result<String, FirmwareError> {
        let release = match release {
            Some(release) => release,
            None => {
                self.release
                    .fetch_latest(&self.device.owner, &self.device.repo, &self.device.asset)
                    .await?
            }
        };
        info!(
            "manager[{}]: downloading {} ({})",
            self.device.name,
            release.version,
            format_size(release.size)
        );

        let response = self.release.open_download(&release.download_url).await?;
        let sha256 = self
            .store
            .replace_artifact(response.bytes_stream(), release.size)
            .await?;

        let now = now_secs();
        let metadata = CachedFirmwareMetadata {
            version: release.version.clone(),
            download_date: now_rfc3339(),
            last_check: now,
            size: release.size,
            sha256,
            release_notes: release.release_notes.clone(),
            prerelease: release.prerelease,
        };
        {
            let _metadata = self.metadata_lock.lock().await;
            self.store.save_metadata(&metadata).await;
        }
        {
            let mut state = lock(&self.state);
            state.current_version = Some(release.version.clone());
            state.last_check = now;
        }

        Ok(format!(
            "downloaded {} firmware {} ({} bytes)",
            self.device.name, release.version, release.size
        ))
    }

    async fn persist_last_check(&self, now: i64) {
        let _metadata = self.metadata_lock.lock().await;
        let Some(mut metadata) = self.store.load_metadata().await else {
            return;
        };
        if metadata.last_check < now {
            metadata.last_check = now;
            self.store.save_metadata(&metadata).await;
        }
    }

    /// Spawn the background loop on the current runtime.
    pub fn spawn_periodic_checker(
        self: &Arc<Self>,
        wake_interval: Duration,
        stop: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.run_periodic_checker(wake_interval, stop).await })
    }

    /// Check (and download when needed) every `wake_interval` until `stop` is raised.
    pub async fn run_periodic_checker(
        &self,
        wake_interval: Duration,
        mut stop: watch::Receiver<bool>,
    ) {
        info!(
            "checker[{}]: started, waking every {}s",
            self.device.name,
            wake_interval.as_secs()
        );
        while !stop_requested(&stop) {
            self.run_scheduled_check().await;
            tokio::select! {
                _ = tokio::time::sleep(wake_interval) => {}
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("checker[{}]: stopped", self.device.name);
    }

    async fn run_scheduled_check(&self) {
        let decision = self.check_for_update(false).await;
        let Decision {
            needs_update: true,
            release_info: Some(release),
            ..
        } = decision
        else {
            return;
        };
        match self.download_latest(Some(release)).await {
            Ok(_) => {}
            Err(FirmwareError::AlreadyInProgress) => {
                debug!(
                    "checker[{}]: download already running, skipping",
                    self.device.name
                );
            }
            Err(err) if err.is_transient() => {
                warn!(
                    "checker[{}]: will retry on next wake: {err}",
                    self.device.name
                );
            }
            Err(err) => {
                warn!("checker[{}]: {err}", self.device.name);
            }
        }
    }
}
