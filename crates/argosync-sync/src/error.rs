use std::path::PathBuf;

use argosync_core::DecodeError;
use argosync_storage::{RetryError, StoreError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("listing dac {dac} failed: {source}")]
    Listing {
        dac: String,
        #[source]
        source: RetryError,
    },
    #[error(transparent)]
    Fetch(#[from] RetryError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("catalog write failed: {0}")]
    CatalogWrite(#[source] StoreError),
    #[error("writing converted table {path} failed: {error:#}")]
    TableWrite { path: PathBuf, error: anyhow::Error },
    #[error("conversion task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("run aborted after an earlier fatal error")]
    Aborted,
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

impl SyncError {
    /// Fatal errors stop every further commit in the run.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::Listing { .. }
                | SyncError::Store(StoreError::Corruption { .. })
                | SyncError::CatalogWrite(_)
                | SyncError::TableWrite { .. }
                | SyncError::Aborted
        )
    }
}
