use std::time::Duration;

use log::{debug, warn};
use reqwest::{Client, Response};
use serde::Deserialize;

use crate::config::is_placeholder;
use crate::error::FirmwareError;
use crate::manager::models::ReleaseInfo;

pub const QUERY_TIMEOUT: Duration = Duration::from_secs(15);
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);
const USER_AGENT: &str = concat!("firmware-hub/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Deserialize)]
struct GithubRelease {
    tag_name: String,
    #[serde(default)]
    published_at: Option<String>,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    prerelease: bool,
    #[serde(default)]
    assets: Vec<GithubAsset>,
}

#[derive(Debug, Clone, Deserialize)]
struct GithubAsset {
    name: String,
    browser_download_url: String,
    #[serde(default)]
    size: u64,
}

/// Read-only client for the upstream release API.
#[derive(Clone)]
pub struct ReleaseClient {
    client: Client,
    api_base: String,
}

impl ReleaseClient {
    pub fn new(api_base: impl Into<String>) -> Self {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_else(|err| {
                warn!("release: falling back to default HTTP client configuration ({err})");
                Client::new()
            });
        Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_owned(),
        }
    }

    /// Query the latest release of `owner/repo` and pick out `asset_name`.
    ///
    /// # Errors
    /// `Config` for placeholder repositories, `Network` for transport or status
    /// failures, `AssetNotFound` when the release lacks the asset.
    pub async fn fetch_latest(
        &self,
        owner: &str,
        repo: &str,
        asset_name: &str,
    ) -> Result<ReleaseInfo, FirmwareError> {
        if is_placeholder(owner) || is_placeholder(repo) {
            return Err(FirmwareError::Config(format!(
                "upstream repository is not configured ({owner}/{repo})"
            )));
        }

        let url = format!("{}/repos/{owner}/{repo}/releases/latest", self.api_base);
        debug!("release: querying {url}");
        let response = self
            .client
            .get(&url)
            .header("Accept", "application/vnd.github+json")
            .timeout(QUERY_TIMEOUT)
            .send()
            .await
            .map_err(|err| network_error("release query", &err))?;

        if !response.status().is_success() {
            return Err(FirmwareError::Network(format!(
                "release API returned status {} for {owner}/{repo}",
                response.status()
            )));
        }

        let release: GithubRelease = response
            .json()
            .await
            .map_err(|err| network_error("release body", &err))?;

        let asset = release
            .assets
            .iter()
            .find(|asset| asset.name == asset_name)
            .ok_or_else(|| FirmwareError::AssetNotFound {
                asset: asset_name.to_owned(),
                tag: release.tag_name.clone(),
            })?;

        Ok(ReleaseInfo {
            version: release.tag_name.clone(),
            published_at: release.published_at.clone().unwrap_or_default(),
            download_url: asset.browser_download_url.clone(),
            size: asset.size,
            release_notes: release.body.clone().unwrap_or_default(),
            prerelease: release.prerelease,
        })
    }

    /// Start streaming the asset at `url`.
    pub async fn open_download(&self, url: &str) -> Result<Response, FirmwareError> {
        let response = self
            .client
            .get(url)
            .timeout(DOWNLOAD_TIMEOUT)
            .send()
            .await
            .map_err(|err| network_error("download request", &err))?;
        if !response.status().is_success() {
            return Err(FirmwareError::Network(format!(
                "download returned status {} for {url}",
                response.status()
            )));
        }
        Ok(response)
    }
}

fn network_error(stage: &str, err: &reqwest::Error) -> FirmwareError {
    if err.is_timeout() {
        FirmwareError::Network(format!("{stage} timed out: {err}"))
    } else {
        FirmwareError::Network(format!("{stage} failed: {err}"))
    }
}
