use thiserror::Error;

/// Failure kinds surfaced by the firmware synchronization pipeline.
#[derive(Debug, Error)]
pub enum FirmwareError {
    /// Repository settings are missing or still hold placeholder values.
    #[error("configuration error: {0}")]
    Config(String),

    /// Transport failure, timeout or non-success status from upstream.
    #[error("network error: {0}")]
    Network(String),

    #[error("asset '{asset}' not found in release {tag}")]
    AssetNotFound { asset: String, tag: String },

    #[error("download incomplete: received {actual} of {expected} bytes")]
    IncompleteDownload { actual: u64, expected: u64 },

    #[error("a download is already in progress")]
    AlreadyInProgress,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl FirmwareError {
    /// Transient failures go away on the next scheduled or manual attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FirmwareError::Network(_)
                | FirmwareError::IncompleteDownload { .. }
                | FirmwareError::AlreadyInProgress
                | FirmwareError::Io(_)
        )
    }
}
