use serde::{Deserialize, Serialize};

/// Latest published release as reported upstream, for one asset.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseInfo {
    pub version: String,
    pub published_at: String,
    pub download_url: String,
    pub size: u64,
    pub release_notes: String,
    pub prerelease: bool,
}

/// Sidecar record describing the cached artifact on disk.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedFirmwareMetadata {
    pub version: String,
    pub download_date: String,
    pub last_check: i64,
    pub size: u64,
    pub sha256: String,
    #[serde(default)]
    pub release_notes: String,
    #[serde(default)]
    pub prerelease: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub needs_update: bool,
    pub reason: String,
    pub release_info: Option<ReleaseInfo>,
}

impl Decision {
    pub fn skip(reason: impl Into<String>) -> Self {
        Self {
            needs_update: false,
            reason: reason.into(),
            release_info: None,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct StatusReport {
    pub device_type: String,
    pub repository: String,
    pub asset: String,
    pub local_exists: bool,
    pub current_version: Option<String>,
    pub file_size: Option<u64>,
    pub file_modified: Option<i64>,
    pub sha256: Option<String>,
    pub download_date: Option<String>,
    pub last_check: i64,
    pub is_checking: bool,
    pub needs_update: bool,
    pub reason: String,
    pub latest_version: Option<String>,
    pub release_notes: Option<String>,
    pub prerelease: Option<bool>,
}
