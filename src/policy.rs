use std::future::Future;
use std::time::Duration;

use crate::error::FirmwareError;
use crate::manager::models::{Decision, ReleaseInfo};

pub const RECENTLY_CHECKED: &str = "recently checked";

/// True while the last check is still inside the throttle window.
pub fn recently_checked(now: i64, last_check: i64, check_interval: Duration) -> bool {
    let interval = i64::try_from(check_interval.as_secs()).unwrap_or(i64::MAX);
    now.saturating_sub(last_check) < interval
}

/// Compare the local cache against a freshly fetched release.
pub fn evaluate(
    local_exists: bool,
    local_version: Option<&str>,
    fetched: Result<ReleaseInfo, FirmwareError>,
) -> Decision {
    let release = match fetched {
        Ok(release) => release,
        Err(err) => return Decision::skip(err.to_string()),
    };

    let (needs_update, reason) = if !local_exists {
        (true, "no local firmware found".to_owned())
    } else {
        match local_version {
            None => (true, "unknown local version".to_owned()),
            // plain string comparison, a re-tag of identical content still counts as new
            Some(local) if local != release.version => (
                true,
                format!("new version available: {} (current: {local})", release.version),
            ),
            Some(_) => (false, "up to date".to_owned()),
        }
    };

    Decision {
        needs_update,
        reason,
        release_info: Some(release),
    }
}

/// Full decision: throttle first, and only call `fetch` when the window has passed.
pub async fn decide<F, Fut>(
    now: i64,
    last_check: i64,
    check_interval: Duration,
    local_exists: bool,
    local_version: Option<&str>,
    fetch: F,
) -> Decision
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<ReleaseInfo, FirmwareError>>,
{
    if recently_checked(now, last_check, check_interval) {
        return Decision::skip(RECENTLY_CHECKED);
    }
    evaluate(local_exists, local_version, fetch().await)
}
