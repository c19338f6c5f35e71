use std::path::PathBuf;

use crate::chat::ProviderError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Redb(#[from] redb::Error),

    #[error("database open error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("database storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("database transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("database table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("database commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("data directory does not exist and could not be created: {0}")]
    DataDir(PathBuf),

    #[error("embedding model error: {0}")]
    Model(String),

    /// A persisted matrix, table or manifest entry is missing or
    /// inconsistent. Fatal at engine startup.
    #[error("artifact unavailable ({artifact}): {reason}")]
    ArtifactUnavailable { artifact: String, reason: String },

    /// The extraction provider reported rate or resource exhaustion.
    /// Never retried; callers should surface it as "retry later".
    #[error("{provider} quota exhausted, retry later: {detail}")]
    QuotaExceeded {
        provider: &'static str,
        detail: String,
    },

    #[error("extraction provider error: {0}")]
    Provider(#[from] ProviderError),
}

impl Error {
    pub(crate) fn artifact(
        artifact: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::ArtifactUnavailable {
            artifact: artifact.into(),
            reason: reason.into(),
        }
    }

    /// Returns `true` when the failure is a provider quota condition that
    /// the caller should report as "retry later".
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, Self::QuotaExceeded { .. })
    }
}
