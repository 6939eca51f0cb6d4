use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Globally unique id issued by the allocator (index builds, nodes, self id).
pub type UniqueId = i64;

/// `NodeId` 0 means "unassigned".
pub const UNASSIGNED_NODE: UniqueId = 0;

/// Service-discovery role of the coordinator singleton.
pub const INDEX_COORD_ROLE: &str = "vix-coordinator";

/// Service-discovery role of the worker daemons.
pub const INDEX_NODE_ROLE: &str = "vixd-node";

/// Lifecycle state of one index-build task.
///
/// `None` is the zero value only before creation; a persisted record is never
/// in `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum TaskState {
    #[default]
    None,
    Unissued,
    InProgress,
    Finished,
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Finished | TaskState::Failed)
    }
}

/// One `key=value` index parameter (type params and index params share the shape).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyValuePair {
    pub key: String,
    pub value: String,
}

/// Client-facing build request. Immutable once a task record is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRequest {
    pub index_id: UniqueId,
    pub index_name: String,
    pub data_paths: Vec<String>,
    pub type_params: Vec<KeyValuePair>,
    pub index_params: Vec<KeyValuePair>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BuildRequestError {
    #[error("index_name must be non-empty")]
    EmptyIndexName,
    #[error("data_paths must be non-empty")]
    EmptyDataPaths,
    #[error("data_paths[{0}] must be non-empty")]
    EmptyDataPath(usize),
}

impl BuildRequest {
    pub fn validate(&self) -> Result<(), BuildRequestError> {
        if self.index_name.trim().is_empty() {
            return Err(BuildRequestError::EmptyIndexName);
        }
        if self.data_paths.is_empty() {
            return Err(BuildRequestError::EmptyDataPaths);
        }
        for (i, p) in self.data_paths.iter().enumerate() {
            if p.trim().is_empty() {
                return Err(BuildRequestError::EmptyDataPath(i));
            }
        }
        Ok(())
    }

    /// Canonical admission-time fingerprint. Two requests with the same
    /// fingerprint name the same index over the same source data and must map
    /// to the same `IndexBuildID`.
    pub fn fingerprint(&self) -> Fingerprint {
        let mut data_paths = self.data_paths.clone();
        data_paths.sort();
        let mut type_params = self.type_params.clone();
        type_params.sort();
        let mut index_params = self.index_params.clone();
        index_params.sort();
        Fingerprint {
            index_id: self.index_id,
            data_paths,
            type_params,
            index_params,
        }
    }
}

/// Canonicalized `(IndexID, sorted(DataPaths), TypeParams, IndexParams)` tuple.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub index_id: UniqueId,
    pub data_paths: Vec<String>,
    pub type_params: Vec<KeyValuePair>,
    pub index_params: Vec<KeyValuePair>,
}

/// The durable task record, keyed by `IndexBuildID` in the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMeta {
    pub index_build_id: UniqueId,
    pub req: BuildRequest,
    pub state: TaskState,
    /// Retry generation; bumped on every (re)assignment, never decremented.
    pub version: i64,
    /// Worker currently holding the task; `UNASSIGNED_NODE` when unassigned.
    pub node_id: UniqueId,
    pub mark_deleted: bool,
    pub recycled: bool,
    /// Blob keys written by the worker; set only with `State=Finished`.
    pub index_file_paths: Vec<String>,
    pub fail_reason: String,
}

#[derive(Debug, Error)]
pub enum TaskMetaCodecError {
    #[error("task meta encode failed: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("task meta decode failed: {0}")]
    Decode(#[source] serde_json::Error),
}

impl TaskMeta {
    pub fn new(index_build_id: UniqueId, req: BuildRequest) -> Self {
        Self {
            index_build_id,
            req,
            state: TaskState::Unissued,
            version: 0,
            node_id: UNASSIGNED_NODE,
            mark_deleted: false,
            recycled: false,
            index_file_paths: Vec::new(),
            fail_reason: String::new(),
        }
    }

    pub fn encode(&self) -> Result<String, TaskMetaCodecError> {
        serde_json::to_string(self).map_err(TaskMetaCodecError::Encode)
    }

    pub fn decode(raw: &str) -> Result<Self, TaskMetaCodecError> {
        serde_json::from_str(raw).map_err(TaskMetaCodecError::Decode)
    }
}
