//! Atomic JSON snapshots.

use crate::error::MemoryError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use tracing::error;

/// Write `value` as JSON to a temporary sibling, then rename it over `path`.
pub(crate) async fn write_json_atomic<T: Serialize>(
    path: &Path,
    value: &T,
) -> Result<(), MemoryError> {
    let json = serde_json::to_vec_pretty(value)?;
    let tmp_path = path.with_extension("json.tmp");

    tokio::fs::write(&tmp_path, json).await.map_err(|e| {
        error!(path = ?tmp_path, error = %e, "Failed to write snapshot to temporary file");
        MemoryError::Storage(format!("Failed to write {}: {}", tmp_path.display(), e))
    })?;

    tokio::fs::rename(&tmp_path, path).await.map_err(|e| {
        error!(from = ?tmp_path, to = ?path, error = %e, "Failed to atomically rename snapshot");
        MemoryError::Storage(format!(
            "Failed to rename {} to {}: {}",
            tmp_path.display(),
            path.display(),
            e
        ))
    })
}

/// Read a JSON snapshot, or `T::default()` if the file does not exist.
pub(crate) async fn read_json_or_default<T: DeserializeOwned + Default>(
    path: &Path,
) -> Result<T, MemoryError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(e.into()),
    }
}
