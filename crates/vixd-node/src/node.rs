use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;

use vix_blob_store::BlobStore;
use vix_core::types::{TaskMeta, TaskState, UniqueId, INDEX_NODE_ROLE};
use vix_observe::metrics::{Counter, Gauge};
use vix_observe::metricsinfo::{construct_component_name, BaseComponentInfos, IndexNodeInfos};
use vix_proto::v1::{CreateIndexRequest, ErrorCode, StateCode, Status};
use vix_registry::{CasResult, MetaKv};

const COMMIT_ATTEMPTS: usize = 5;
const COMMIT_RETRY_DELAY: Duration = Duration::from_millis(50);

#[derive(Debug, Default)]
pub struct NodeMetrics {
    pub builds_started_total: Counter,
    pub builds_finished_total: Counter,
    pub builds_failed_total: Counter,
    pub commits_abandoned_total: Counter,
    pub active_builds: Gauge,
}

/// One stateless worker: accepts one assigned build at a time, writes index
/// blobs under `{IndexBuildID}/{Version}/` and commits the result straight
/// to the registry. The coordinator never hears about completion over RPC;
/// it observes the registry.
pub struct IndexNode {
    server_id: UniqueId,
    state_code: AtomicI32,
    kv: Arc<dyn MetaKv>,
    blob: Arc<dyn BlobStore>,
    build_slot: Arc<Semaphore>,
    metrics: NodeMetrics,
}

impl IndexNode {
    pub fn new(server_id: UniqueId, kv: Arc<dyn MetaKv>, blob: Arc<dyn BlobStore>) -> Self {
        Self {
            server_id,
            state_code: AtomicI32::new(StateCode::Healthy as i32),
            kv,
            blob,
            build_slot: Arc::new(Semaphore::new(1)),
            metrics: NodeMetrics::default(),
        }
    }

    pub fn server_id(&self) -> UniqueId {
        self.server_id
    }

    pub fn metrics(&self) -> &NodeMetrics {
        &self.metrics
    }

    pub fn state(&self) -> StateCode {
        StateCode::try_from(self.state_code.load(Ordering::Acquire))
            .unwrap_or(StateCode::Abnormal)
    }

    pub fn set_state(&self, code: StateCode) {
        self.state_code.store(code as i32, Ordering::Release);
    }

    pub fn is_healthy(&self) -> bool {
        self.state() == StateCode::Healthy
    }

    /// RPC entry: validates the assignment and queues the build. The RPC
    /// returns as soon as the build is accepted; the result is committed to
    /// the registry, not returned here.
    pub fn create_index(self: &Arc<Self>, req: CreateIndexRequest) -> Status {
        if !self.is_healthy() {
            return failure(format!(
                "worker {} is not healthy (state {:?})",
                self.server_id,
                self.state()
            ));
        }
        if req.index_build_id <= 0 {
            return failure("index_build_id must be positive");
        }
        if req.version < 1 {
            return failure("version must be at least 1");
        }
        if req.meta_path.trim().is_empty() {
            return failure("meta_path must be non-empty");
        }
        if req.data_paths.is_empty() {
            return failure("data_paths must be non-empty");
        }

        tracing::info!(
            target: "vix_proof",
            event = "build_accepted",
            index_build_id = req.index_build_id,
            node_id = self.server_id,
            version = req.version,
            "build accepted"
        );

        let node = self.clone();
        tokio::spawn(async move {
            let Ok(_permit) = node.build_slot.clone().acquire_owned().await else {
                return;
            };
            node.metrics.active_builds.set(1);
            node.run_build(req).await;
            node.metrics.active_builds.set(0);
        });
        success()
    }

    async fn run_build(&self, req: CreateIndexRequest) {
        self.metrics.builds_started_total.inc();
        tracing::info!(
            target: "vix_proof",
            event = "build_started",
            index_build_id = req.index_build_id,
            node_id = self.server_id,
            version = req.version,
            "build started"
        );

        match self.build_segments(&req).await {
            Ok(paths) => {
                self.metrics.builds_finished_total.inc();
                self.commit(&req, TaskState::Finished, paths, String::new())
                    .await;
            }
            Err(reason) => {
                self.metrics.builds_failed_total.inc();
                tracing::warn!(index_build_id = req.index_build_id, reason = %reason,
                    "build failed");
                self.commit(&req, TaskState::Failed, Vec::new(), reason)
                    .await;
            }
        }
    }

    /// The build action proper: one sealed segment per source path, keyed
    /// `{IndexBuildID}/{Version}/{index_name}_{i}`.
    async fn build_segments(&self, req: &CreateIndexRequest) -> Result<Vec<String>, String> {
        let mut paths = Vec::with_capacity(req.data_paths.len());
        for (i, data_path) in req.data_paths.iter().enumerate() {
            let source = self
                .blob
                .get(data_path)
                .await
                .map_err(|e| format!("reading source {data_path:?}: {e}"))?;
            let segment = seal_segment(&source);
            let key = format!(
                "{}/{}_{i}",
                vix_core::keys::index_file_version_prefix(req.index_build_id, req.version),
                req.index_name
            );
            self.blob
                .put(&key, &segment)
                .await
                .map_err(|e| format!("writing segment {key:?}: {e}"))?;
            paths.push(key);
        }
        Ok(paths)
    }

    /// Commits the result against exactly the assigned version: the record
    /// is re-read and the write CAS'd on its revision, so a commit racing a
    /// reassignment (or a coordinator write) retries, and a commit for a
    /// version that has moved on is abandoned.
    async fn commit(
        &self,
        req: &CreateIndexRequest,
        state: TaskState,
        index_file_paths: Vec<String>,
        fail_reason: String,
    ) {
        for _ in 0..COMMIT_ATTEMPTS {
            let pair = match self.kv.get(&req.meta_path).await {
                Ok(Some(pair)) => pair,
                Ok(None) => {
                    self.abandon(req, "record gone");
                    return;
                }
                Err(err) => {
                    tracing::warn!(index_build_id = req.index_build_id, error = %err,
                        "reading record for commit failed");
                    tokio::time::sleep(COMMIT_RETRY_DELAY).await;
                    continue;
                }
            };

            let mut meta = match TaskMeta::decode(&pair.value) {
                Ok(meta) => meta,
                Err(err) => {
                    tracing::warn!(index_build_id = req.index_build_id, error = %err,
                        "undecodable record");
                    self.abandon(req, "undecodable record");
                    return;
                }
            };
            if meta.version != req.version {
                self.abandon(req, "version moved on");
                return;
            }

            meta.state = state;
            meta.node_id = self.server_id;
            meta.index_file_paths = index_file_paths.clone();
            meta.fail_reason = fail_reason.clone();
            let value = match meta.encode() {
                Ok(value) => value,
                Err(err) => {
                    tracing::warn!(index_build_id = req.index_build_id, error = %err,
                        "encoding commit failed");
                    self.abandon(req, "encoding failed");
                    return;
                }
            };

            match self
                .kv
                .compare_and_swap(&req.meta_path, pair.mod_revision, &value)
                .await
            {
                Ok(CasResult::Ok { .. }) => {
                    tracing::info!(
                        target: "vix_proof",
                        event = "build_committed",
                        index_build_id = req.index_build_id,
                        node_id = self.server_id,
                        version = req.version,
                        state = ?state,
                        "build committed"
                    );
                    return;
                }
                Ok(CasResult::Conflict { .. }) => {
                    // Someone wrote in between; re-read and re-check version.
                    continue;
                }
                Err(err) => {
                    tracing::warn!(index_build_id = req.index_build_id, error = %err,
                        "commit CAS failed");
                    tokio::time::sleep(COMMIT_RETRY_DELAY).await;
                }
            }
        }
        self.abandon(req, "commit attempts exhausted");
    }

    fn abandon(&self, req: &CreateIndexRequest, reason: &str) {
        self.metrics.commits_abandoned_total.inc();
        tracing::info!(
            target: "vix_proof",
            event = "commit_abandoned",
            index_build_id = req.index_build_id,
            node_id = self.server_id,
            version = req.version,
            reason,
            "commit abandoned"
        );
    }

    /// Per-node `system_info` document.
    pub fn system_info(&self) -> IndexNodeInfos {
        IndexNodeInfos {
            base: BaseComponentInfos {
                name: construct_component_name(INDEX_NODE_ROLE, self.server_id),
                ..Default::default()
            },
        }
    }
}

fn success() -> Status {
    Status {
        error_code: ErrorCode::Success as i32,
        reason: String::new(),
    }
}

fn failure(reason: impl Into<String>) -> Status {
    Status {
        error_code: ErrorCode::BuildIndexError as i32,
        reason: reason.into(),
    }
}

const SEGMENT_MAGIC: &[u8] = b"VIXSEG1\n";

/// Seals one source blob into an index segment.
fn seal_segment(source: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(SEGMENT_MAGIC.len() + 8 + source.len());
    out.extend_from_slice(SEGMENT_MAGIC);
    out.extend_from_slice(&(source.len() as u64).to_le_bytes());
    out.extend_from_slice(source);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use vix_blob_store::fs::FsBlobStore;
    use vix_core::keys::index_meta_key;
    use vix_core::types::BuildRequest;
    use vix_registry::mem::MemRegistry;

    fn temp_root(test_name: &str) -> std::path::PathBuf {
        let mut root = std::env::temp_dir();
        root.push(format!(
            "vixd-node-{}-{}-{}",
            test_name,
            std::process::id(),
            vix_observe::time::unix_time_ms()
        ));
        std::fs::create_dir_all(&root).unwrap();
        root
    }

    fn build_req(id: i64, version: i64, data_paths: &[&str]) -> CreateIndexRequest {
        CreateIndexRequest {
            index_build_id: id,
            index_name: "ivf".to_string(),
            index_id: 7,
            version,
            meta_path: index_meta_key(id),
            data_paths: data_paths.iter().map(|s| s.to_string()).collect(),
            type_params: Vec::new(),
            index_params: Vec::new(),
        }
    }

    async fn seed_record(kv: &MemRegistry, id: i64, version: i64) {
        let mut meta = TaskMeta::new(
            id,
            BuildRequest {
                index_id: 7,
                index_name: "ivf".to_string(),
                data_paths: vec!["/a".to_string()],
                type_params: Vec::new(),
                index_params: Vec::new(),
            },
        );
        meta.version = version;
        kv.put(&index_meta_key(id), &meta.encode().unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn build_commits_finished_with_paths() {
        let root = temp_root("finish");
        let kv = MemRegistry::new();
        let blob = FsBlobStore::new(root.clone());
        blob.put("raw/part0", b"vectors-0").await.unwrap();
        blob.put("raw/part1", b"vectors-1").await.unwrap();
        seed_record(&kv, 100, 1).await;

        let node = IndexNode::new(9, Arc::new(kv.clone()), Arc::new(blob.clone()));
        node.run_build(build_req(100, 1, &["raw/part0", "raw/part1"]))
            .await;

        let pair = kv.get(&index_meta_key(100)).await.unwrap().unwrap();
        let meta = TaskMeta::decode(&pair.value).unwrap();
        assert_eq!(meta.state, TaskState::Finished);
        assert_eq!(meta.node_id, 9);
        assert_eq!(
            meta.index_file_paths,
            vec!["100/1/ivf_0".to_string(), "100/1/ivf_1".to_string()]
        );

        let segment = blob.get("100/1/ivf_0").await.unwrap();
        assert!(segment.starts_with(SEGMENT_MAGIC));

        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn missing_source_commits_failed() {
        let root = temp_root("fail");
        let kv = MemRegistry::new();
        let blob = FsBlobStore::new(root.clone());
        seed_record(&kv, 101, 1).await;

        let node = IndexNode::new(9, Arc::new(kv.clone()), Arc::new(blob));
        node.run_build(build_req(101, 1, &["raw/missing"])).await;

        let pair = kv.get(&index_meta_key(101)).await.unwrap().unwrap();
        let meta = TaskMeta::decode(&pair.value).unwrap();
        assert_eq!(meta.state, TaskState::Failed);
        assert!(meta.fail_reason.contains("raw/missing"));
        assert!(meta.index_file_paths.is_empty());

        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn stale_version_commit_is_abandoned() {
        let root = temp_root("stale");
        let kv = MemRegistry::new();
        let blob = FsBlobStore::new(root.clone());
        blob.put("raw/part0", b"vectors-0").await.unwrap();
        // The record has been reassigned to version 2 behind this worker.
        seed_record(&kv, 102, 2).await;

        let node = IndexNode::new(9, Arc::new(kv.clone()), Arc::new(blob));
        node.run_build(build_req(102, 1, &["raw/part0"])).await;

        let pair = kv.get(&index_meta_key(102)).await.unwrap().unwrap();
        let meta = TaskMeta::decode(&pair.value).unwrap();
        assert_eq!(meta.state, TaskState::Unissued);
        assert_eq!(meta.version, 2);
        assert_eq!(node.metrics().commits_abandoned_total.get(), 1);

        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn create_index_validates_request() {
        let kv = MemRegistry::new();
        let blob = FsBlobStore::new(temp_root("validate"));
        let node = Arc::new(IndexNode::new(9, Arc::new(kv), Arc::new(blob)));

        let status = node.create_index(build_req(0, 1, &["raw/p"]));
        assert_ne!(status.error_code(), ErrorCode::Success);

        let status = node.create_index(build_req(100, 0, &["raw/p"]));
        assert_ne!(status.error_code(), ErrorCode::Success);

        let status = node.create_index(build_req(100, 1, &[]));
        assert_ne!(status.error_code(), ErrorCode::Success);
    }
}
