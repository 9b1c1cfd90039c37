use std::fmt::Display;
use std::path::{Path, PathBuf};

use futures_util::{Stream, StreamExt};
use log::{debug, warn};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::FirmwareError;
use crate::manager::models::CachedFirmwareMetadata;

pub const METADATA_FILE: &str = "metadata.json";
const TEMP_SUFFIX: &str = "part";

/// Snapshot of the artifact file as seen on disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArtifactInfo {
    pub size: u64,
    pub modified: Option<i64>,
}

/// One device type's cached artifact plus its sidecar metadata record.
#[derive(Clone, Debug)]
pub struct CacheStore {
    artifact_path: PathBuf,
    metadata_path: PathBuf,
}

impl CacheStore {
    pub fn new(dir: &Path, asset: &str) -> Self {
        Self {
            artifact_path: dir.join(asset),
            metadata_path: dir.join(METADATA_FILE),
        }
    }

    pub fn artifact_path(&self) -> &Path {
        &self.artifact_path
    }

    pub fn metadata_path(&self) -> &Path {
        &self.metadata_path
    }

    /// Size and mtime of the artifact, or `None` if it is absent right now.
    pub async fn artifact_info(&self) -> Option<ArtifactInfo> {
        let meta = fs::metadata(&self.artifact_path).await.ok()?;
        if !meta.is_file() {
            return None;
        }
        let modified = meta
            .modified()
            .ok()
            .and_then(|time| time.duration_since(std::time::UNIX_EPOCH).ok())
            .and_then(|elapsed| i64::try_from(elapsed.as_secs()).ok());
        Some(ArtifactInfo {
            size: meta.len(),
            modified,
        })
    }

    pub async fn load_metadata(&self) -> Option<CachedFirmwareMetadata> {
        load_metadata(&self.metadata_path).await
    }

    pub async fn save_metadata(&self, metadata: &CachedFirmwareMetadata) {
        save_metadata(&self.metadata_path, metadata).await;
    }

    pub async fn replace_artifact<S, B, E>(
        &self,
        source: S,
        expected_size: u64,
    ) -> Result<String, FirmwareError>
    where
        S: Stream<Item = Result<B, E>>,
        B: AsRef<[u8]>,
        E: Display,
    {
        atomic_replace(&self.artifact_path, source, expected_size).await
    }
}

/// Read the sidecar record; absence or corruption both mean "no prior cache".
pub async fn load_metadata(path: &Path) -> Option<CachedFirmwareMetadata> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
        Err(err) => {
            warn!("cache: failed to read {}: {err}", path.display());
            return None;
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(metadata) => Some(metadata),
        Err(err) => {
            warn!("cache: ignoring unparsable {}: {err}", path.display());
            None
        }
    }
}

/// Persist the sidecar record. Failures are logged; a later download rewrites it.
pub async fn save_metadata(path: &Path, metadata: &CachedFirmwareMetadata) {
    if let Err(err) = try_save_metadata(path, metadata).await {
        warn!("cache: failed to write {}: {err}", path.display());
    }
}

async fn try_save_metadata(
    path: &Path,
    metadata: &CachedFirmwareMetadata,
) -> Result<(), FirmwareError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let bytes = serde_json::to_vec_pretty(metadata).map_err(std::io::Error::other)?;
    // same temp-then-rename protocol as the artifact, readers never see a partial record
    let temp = temp_path(path);
    if let Err(err) = write_and_rename(&temp, path, &bytes).await {
        discard(&temp).await;
        return Err(err.into());
    }
    Ok(())
}

async fn write_and_rename(temp: &Path, target: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(temp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(temp, target).await
}

/// Temp file used while streaming a replacement for `target`.
pub fn temp_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".");
    name.push(TEMP_SUFFIX);
    target.with_file_name(name)
}

/// Stream `source` next to `target`, verify its length, then rename it into place.
///
/// Returns the lowercase hex SHA-256 of the new artifact. On any failure the
/// temp file is removed and `target` is left as it was.
pub async fn atomic_replace<S, B, E>(
    target: &Path,
    source: S,
    expected_size: u64,
) -> Result<String, FirmwareError>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: Display,
{
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).await?;
    }
    let temp = temp_path(target);

    let hash = match write_verified(&temp, source, expected_size).await {
        Ok(hash) => hash,
        Err(err) => {
            discard(&temp).await;
            return Err(err);
        }
    };

    // rename replaces an existing target in one step on every supported platform
    if let Err(err) = fs::rename(&temp, target).await {
        discard(&temp).await;
        return Err(err.into());
    }
    debug!("cache: replaced {} ({hash})", target.display());
    Ok(hash)
}

async fn write_verified<S, B, E>(
    temp: &Path,
    source: S,
    expected_size: u64,
) -> Result<String, FirmwareError>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: Display,
{
    let mut source = std::pin::pin!(source);
    let mut file = fs::File::create(temp).await?;
    let mut hasher = Sha256::new();
    let mut written: u64 = 0;

    while let Some(chunk) = source.next().await {
        let chunk = chunk.map_err(|e| FirmwareError::Network(format!("stream error: {e}")))?;
        let bytes = chunk.as_ref();
        file.write_all(bytes).await?;
        hasher.update(bytes);
        written += bytes.len() as u64;
        if written > expected_size {
            return Err(FirmwareError::IncompleteDownload {
                actual: written,
                expected: expected_size,
            });
        }
    }
    file.flush().await?;
    file.sync_all().await?;
    drop(file);

    if written != expected_size {
        return Err(FirmwareError::IncompleteDownload {
            actual: written,
            expected: expected_size,
        });
    }
    Ok(format!("{:x}", hasher.finalize()))
}

async fn discard(temp: &Path) {
    match fs::remove_file(temp).await {
        Ok(()) => debug!("cache: removed temp file {}", temp.display()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!("cache: failed to remove temp file {}: {err}", temp.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use std::io;
    use tempfile::TempDir;

    fn chunks(parts: Vec<Vec<u8>>) -> impl Stream<Item = Result<Vec<u8>, io::Error>> + Unpin {
        stream::iter(parts.into_iter().map(Ok))
    }

    fn sample_metadata() -> CachedFirmwareMetadata {
        CachedFirmwareMetadata {
            version: "v1.0.0".into(),
            download_date: "2026-01-01T00:00:00+00:00".into(),
            last_check: 1_700_000_000,
            size: 4,
            sha256: "ab".repeat(32),
            release_notes: String::new(),
            prerelease: false,
        }
    }

    #[tokio::test]
    async fn replaces_artifact_and_returns_sha256() {
        let dir = TempDir::new().expect("tempdir");
        let target = dir.path().join("fw.bin");
        std::fs::write(&target, b"old").expect("seed");

        let hash = atomic_replace(&target, chunks(vec![b"ab".to_vec(), b"c".to_vec()]), 3)
            .await
            .expect("replace");

        assert_eq!(std::fs::read(&target).expect("read"), b"abc");
        assert_eq!(
            hash,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert!(!temp_path(&target).exists());
    }

    #[tokio::test]
    async fn short_stream_keeps_previous_artifact() {
        let dir = TempDir::new().expect("tempdir");
        let target = dir.path().join("fw.bin");
        std::fs::write(&target, b"previous firmware").expect("seed");

        let err = atomic_replace(&target, chunks(vec![vec![0u8; 10]]), 1024)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            FirmwareError::IncompleteDownload {
                actual: 10,
                expected: 1024
            }
        ));
        assert_eq!(std::fs::read(&target).expect("read"), b"previous firmware");
        assert!(!temp_path(&target).exists());
    }

    #[tokio::test]
    async fn stream_error_removes_temp_file() {
        let dir = TempDir::new().expect("tempdir");
        let target = dir.path().join("nested").join("fw.bin");
        let source = stream::iter(vec![
            Ok(b"partial".to_vec()),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
        ]);

        let err = atomic_replace(&target, source, 7).await.unwrap_err();

        assert!(matches!(err, FirmwareError::Network(_)));
        assert!(!target.exists());
        assert!(!temp_path(&target).exists());
    }

    #[tokio::test]
    async fn interrupted_write_never_touches_target() {
        let dir = TempDir::new().expect("tempdir");
        let target = dir.path().join("fw.bin");
        std::fs::write(&target, b"v1-full-image").expect("seed");
        // leftover from a process that died between temp write and rename
        std::fs::write(temp_path(&target), b"v2-fu").expect("orphan");

        assert_eq!(std::fs::read(&target).expect("read"), b"v1-full-image");

        atomic_replace(&target, chunks(vec![b"v2-full-image".to_vec()]), 13)
            .await
            .expect("replace");
        assert_eq!(std::fs::read(&target).expect("read"), b"v2-full-image");
    }

    #[tokio::test]
    async fn oversized_stream_stops_early_and_keeps_previous_artifact() {
        let dir = TempDir::new().expect("tempdir");
        let target = dir.path().join("fw.bin");
        std::fs::write(&target, b"previous firmware").expect("seed");
        let source = chunks(vec![vec![1u8; 8], vec![2u8; 8], vec![3u8; 8]]);

        let err = atomic_replace(&target, source, 10).await.unwrap_err();

        assert!(matches!(
            err,
            FirmwareError::IncompleteDownload {
                actual: 16,
                expected: 10
            }
        ));
        assert_eq!(std::fs::read(&target).expect("read"), b"previous firmware");
        assert!(!temp_path(&target).exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_reader_never_sees_partial_metadata() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join(METADATA_FILE);
        let mut metadata = sample_metadata();
        metadata.release_notes = "changelog line\n".repeat(12_000);
        save_metadata(&path, &metadata).await;

        let writer_path = path.clone();
        let writer = tokio::spawn(async move {
            for round in 0..200 {
                metadata.last_check = 1_700_000_000 + round;
                save_metadata(&writer_path, &metadata).await;
            }
        });

        let mut misses = 0;
        while !writer.is_finished() {
            if load_metadata(&path).await.is_none() {
                misses += 1;
            }
        }
        writer.await.expect("writer task");

        assert_eq!(misses, 0);
        assert!(!temp_path(&path).exists());
        assert_eq!(
            load_metadata(&path).await.map(|m| m.last_check),
            Some(1_700_000_199)
        );
    }

    #[tokio::test]
    async fn unwritable_metadata_path_is_not_fatal() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join(METADATA_FILE);
        std::fs::create_dir_all(&path).expect("directory in the way");

        save_metadata(&path, &sample_metadata()).await;

        assert!(path.is_dir());
        assert!(!temp_path(&path).exists());
    }

    #[tokio::test]
    async fn metadata_roundtrip_and_missing_file() {
        let dir = TempDir::new().expect("tempdir");
        let store = CacheStore::new(&dir.path().join("esp32"), "fw.bin");
        assert!(store.load_metadata().await.is_none());

        let metadata = sample_metadata();
        store.save_metadata(&metadata).await;
        assert_eq!(store.load_metadata().await, Some(metadata));
    }

    #[tokio::test]
    async fn corrupt_metadata_reads_as_absent() {
        let dir = TempDir::new().expect("tempdir");
        let store = CacheStore::new(dir.path(), "fw.bin");
        std::fs::write(store.metadata_path(), b"{not json").expect("seed");
        assert!(store.load_metadata().await.is_none());
    }

    #[tokio::test]
    async fn artifact_info_tracks_file_presence() {
        let dir = TempDir::new().expect("tempdir");
        let store = CacheStore::new(dir.path(), "fw.bin");
        assert!(store.artifact_info().await.is_none());

        std::fs::write(store.artifact_path(), vec![1u8; 64]).expect("seed");
        let info = store.artifact_info().await.expect("present");
        assert_eq!(info.size, 64);
        assert!(info.modified.is_some());
    }

    #[test]
    fn temp_file_sits_next_to_target() {
        let target = Path::new("/data/esp32/fw.bin");
        assert_eq!(temp_path(target), Path::new("/data/esp32/fw.bin.part"));
    }
}
