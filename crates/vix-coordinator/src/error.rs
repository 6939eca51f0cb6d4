use thiserror::Error;
use vix_blob_store::BlobStoreError;
use vix_core::types::{TaskMetaCodecError, TaskState, UniqueId};
use vix_registry::RegistryError;

#[derive(Debug, Error)]
pub enum CoordError {
    #[error("task {0} already exists")]
    TaskExists(UniqueId),
    #[error("task {0} not found")]
    TaskNotFound(UniqueId),
    #[error("index files of task {id} are not ready (state {state:?})")]
    NotFinished { id: UniqueId, state: TaskState },
    #[error("metadata conflict on task {0}")]
    Conflict(UniqueId),
    #[error("add queue enqueue timeout")]
    EnqueueTimeout,
    #[error("admission canceled: {0}")]
    Canceled(String),
    #[error("coordinator is not healthy: {0}")]
    Unhealthy(String),
    #[error("worker rpc failed: {0}")]
    Transport(String),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Blob(#[from] BlobStoreError),
    #[error(transparent)]
    Codec(#[from] TaskMetaCodecError),
}
