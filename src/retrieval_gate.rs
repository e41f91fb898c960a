use crate::identity::CallerContext;
use crate::record_store::RecordStore;
use crate::storage_backend::{content_type_for, StorageBackend, StorageError};
use std::sync::Arc;
use thiserror::Error;
use tracing::{instrument, warn};
use uuid::Uuid;

/// Errors from the protected read path.
///
/// Authorization failures are reported distinctly from missing records,
/// and traversal attempts never echo the resolved path back to the caller.
#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("photo not found")]
    NotFound,
    #[error("caller is not authorized to access the original")]
    Forbidden,
    #[error("stored locator is not resolvable")]
    Traversal,
    #[error(transparent)]
    Storage(StorageError),
    #[error("failed to look up photo record: {0}")]
    Store(#[source] anyhow::Error),
}

/// Resolved original artifact ready for download.
#[derive(Debug)]
pub struct OriginalDownload {
    pub bytes: Vec<u8>,
    pub filename: String,
    pub content_type: String,
}

/// Read path for original artifacts.
///
/// Only an administrator or the record's owner may dereference the
/// original locator; everyone else gets an authorization error, never a
/// byte stream.
pub struct RetrievalGate {
    store: Arc<dyn RecordStore>,
    storage: Arc<dyn StorageBackend>,
}

impl RetrievalGate {
    pub fn new(store: Arc<dyn RecordStore>, storage: Arc<dyn StorageBackend>) -> Self {
        Self { store, storage }
    }

    /// Resolve the original artifact for an authorized caller.
    #[instrument(skip(self, caller), fields(photo_id = %photo_id, caller_slug = %caller.slug))]
    pub async fn original(
        &self,
        photo_id: Uuid,
        caller: &CallerContext,
    ) -> Result<OriginalDownload, RetrievalError> {
        let record = self
            .store
            .find_by_id(photo_id)
            .await
            .map_err(RetrievalError::Store)?
            .ok_or(RetrievalError::NotFound)?;

        if !caller.can_access(record.owner_id) {
            return Err(RetrievalError::Forbidden);
        }

        // Legacy records predate original retention
        let locator = record
            .original_locator
            .as_deref()
            .ok_or(RetrievalError::NotFound)?;

        let bytes = self.storage.retrieve(locator).await.map_err(|e| match e {
            StorageError::PathTraversal | StorageError::InvalidLocator => {
                warn!(photo_id = %photo_id, "Rejected original locator that escapes storage");
                RetrievalError::Traversal
            }
            StorageError::NotFound => RetrievalError::NotFound,
            other => RetrievalError::Storage(other),
        })?;

        let filename = locator
            .rsplit('/')
            .next()
            .unwrap_or("original")
            .to_string();
        let extension = filename.rsplit('.').next().unwrap_or("").to_string();

        Ok(OriginalDownload {
            bytes,
            filename,
            content_type: content_type_for(&extension),
        })
    }
}
