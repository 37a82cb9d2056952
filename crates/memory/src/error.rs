//! Memory subsystem errors.

use conclave_common::ConclaveError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("Vector backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Storage failure: {0}")]
    Storage(String),

    #[error("Entry already exists: {0}")]
    AlreadyExists(String),

    #[error("Embedding failed: {0}")]
    Embedding(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<MemoryError> for ConclaveError {
    fn from(err: MemoryError) -> Self {
        match err {
            MemoryError::BackendUnavailable(_) | MemoryError::Embedding(_) => {
                ConclaveError::MemoryBackendUnavailable(err.to_string())
            }
            other => ConclaveError::MemoryStorage(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conclave_common::ErrorKind;

    #[test]
    fn test_conversion_preserves_kind() {
        let backend: ConclaveError = MemoryError::BackendUnavailable("down".into()).into();
        assert_eq!(backend.kind(), ErrorKind::MemoryBackendUnavailable);

        let storage: ConclaveError = MemoryError::Storage("disk full".into()).into();
        assert_eq!(storage.kind(), ErrorKind::MemoryStorageError);

        let dup: ConclaveError = MemoryError::AlreadyExists("kn_1".into()).into();
        assert_eq!(dup.kind(), ErrorKind::MemoryStorageError);
    }
}
