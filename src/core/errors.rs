use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrainError {
    #[error("{op} failed for tag {tag:?}: {source}")]
    Storage {
        op: &'static str,
        tag: String,
        #[source]
        source: StorageError,
    },
    #[error("operation canceled")]
    Canceled,
    #[error("bad config: {0}")]
    Config(String),
    #[error("bad secret: {0}")]
    Secret(String),
}

impl BrainError {
    pub fn storage<E: Into<StorageError>>(op: &'static str, tag: &str, err: E) -> Self {
        BrainError::Storage {
            op,
            tag: tag.to_string(),
            source: err.into(),
        }
    }

    pub fn config<E: std::fmt::Display>(err: E) -> Self {
        BrainError::Config(err.to_string())
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, BrainError::Canceled)
    }
}

/// Failures raised by a storage backend's I/O layer.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("kv store: {0}")]
    Kv(#[from] sled::Error),
    #[error("sql store: {0}")]
    Sql(#[from] sqlx::Error),
    #[error("record codec: {0}")]
    Codec(#[from] bincode::Error),
    #[error("blocking task: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_error_names_operation_and_tag() {
        let err = BrainError::storage("forget", "chan", StorageError::Corrupt("short key".into()));
        let msg = err.to_string();
        assert!(msg.contains("forget"));
        assert!(msg.contains("\"chan\""));
        assert!(!err.is_canceled());
    }

    #[test]
    fn canceled_is_distinct() {
        assert!(BrainError::Canceled.is_canceled());
        assert!(!BrainError::config("order").is_canceled());
    }
}
