use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;

use vix_blob_store::{BlobStore, BlobStoreError};
use vix_core::keys::{
    index_file_prefix, index_file_version_prefix, index_meta_key, parse_index_meta_key,
    INDEXES_PREFIX,
};
use vix_core::types::{BuildRequest, UniqueId, INDEX_COORD_ROLE, INDEX_NODE_ROLE};
use vix_observe::metrics::Counter;
use vix_proto::v1::index_node_client::IndexNodeClient;
use vix_proto::v1::{CreateIndexRequest, ErrorCode, StateCode};
use vix_registry::allocator::GlobalIdAllocator;
use vix_registry::{
    parse_session_key, retry_do, session_prefix, MetaKv, Session, SessionGuard, WatchEvent,
};
use vix_wire::ToWire;

use crate::error::CoordError;
use crate::meta_table::MetaTable;
use crate::node_manager::NodeManager;
use crate::sched::TaskScheduler;
use crate::{
    ASSIGN_TASK_INTERVAL, DURATION_INTERVAL, INIT_RETRY_ATTEMPTS, REQ_TIMEOUT_INTERVAL,
    TASK_LIMIT, TS_UPDATE_INTERVAL,
};

const WATCH_RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct CoordConfig {
    /// Registry path prefix for allocator state.
    pub kv_root_path: String,
    /// Address registered in service discovery.
    pub advertise_addr: String,
    /// Bound of the admission queue.
    pub add_queue_capacity: usize,
}

impl Default for CoordConfig {
    fn default() -> Self {
        Self {
            kv_root_path: "vix-kv".to_string(),
            advertise_addr: "127.0.0.1:50051".to_string(),
            add_queue_capacity: 1024,
        }
    }
}

#[derive(Debug, Default)]
pub struct CoordMetrics {
    pub build_requests_total: Counter,
    pub dedup_hits_total: Counter,
    pub tasks_assigned_total: Counter,
    pub assign_failures_total: Counter,
    pub tasks_completed_total: Counter,
    pub tasks_recycled_total: Counter,
}

/// The coordinator singleton: owns the task metadata, the worker pool and
/// the periodic loops that drive assignment and reclamation.
pub struct IndexCoord {
    id: UniqueId,
    state_code: AtomicI32,
    kv: Arc<dyn MetaKv>,
    blob: Arc<dyn BlobStore>,
    meta_table: Arc<MetaTable>,
    node_manager: Arc<NodeManager>,
    sched: Arc<TaskScheduler>,
    id_allocator: Arc<GlobalIdAllocator>,
    cancel: CancellationToken,
    meta_watch_revision: i64,
    node_watch_revision: i64,
    advertise_addr: String,
    metrics: CoordMetrics,
    session: Mutex<Option<SessionGuard>>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl IndexCoord {
    /// Brings the coordinator up against an already-opened registry and blob
    /// store: bulk-loads metadata (bounded retry), seeds the worker pool from
    /// discovery and task stats, initializes the id allocator, allocates the
    /// self id and registers the coordinator session.
    ///
    /// A failure here is fatal; the coordinator never reports `Healthy`.
    pub async fn init(
        kv: Arc<dyn MetaKv>,
        blob: Arc<dyn BlobStore>,
        config: CoordConfig,
    ) -> Result<Arc<Self>, CoordError> {
        // Snapshot before the bulk load so the meta watch replays anything
        // that lands mid-load; stale revisions are absorbed by the cache.
        let meta_watch_revision = kv.current_revision().await?;

        let meta_table = {
            let kv = kv.clone();
            retry_do(INIT_RETRY_ATTEMPTS, Duration::from_millis(100), move || {
                let kv = kv.clone();
                async move { MetaTable::new(kv).await }
            })
            .await?
        };
        let meta_table = Arc::new(meta_table);

        let node_manager = Arc::new(NodeManager::new());
        let (sessions, node_watch_revision) = kv.list_sessions(INDEX_NODE_ROLE).await?;
        for session in &sessions {
            if let Err(err) = node_manager.add_node(session.server_id, &session.address) {
                tracing::warn!(node_id = session.server_id, error = %err, "initial worker add failed");
            }
        }
        tracing::info!(workers = sessions.len(), "worker sessions discovered");

        // Seed the selection heap so recovery does not overload workers that
        // are already busy.
        for (node_id, count) in meta_table.get_node_task_stats() {
            node_manager.update_priority(node_id, count);
        }

        let id_allocator = Arc::new(GlobalIdAllocator::new(
            kv.clone(),
            format!("{}/index_gid", config.kv_root_path),
        ));
        id_allocator.initialize().await?;
        let id = id_allocator.alloc_one().await?;

        let session = kv
            .register_session(
                INDEX_COORD_ROLE,
                &Session {
                    server_id: id,
                    address: config.advertise_addr.clone(),
                },
            )
            .await?;

        let cancel = CancellationToken::new();
        let sched = Arc::new(TaskScheduler::new(
            meta_table.clone(),
            config.add_queue_capacity,
            cancel.clone(),
        ));

        let coord = Arc::new(Self {
            id,
            state_code: AtomicI32::new(StateCode::Healthy as i32),
            kv,
            blob,
            meta_table,
            node_manager,
            sched,
            id_allocator,
            cancel,
            meta_watch_revision,
            node_watch_revision,
            advertise_addr: config.advertise_addr,
            metrics: CoordMetrics::default(),
            session: Mutex::new(Some(session)),
            loops: Mutex::new(Vec::new()),
        });
        tracing::info!(node_id = coord.id, "coordinator initialized");
        Ok(coord)
    }

    /// Spawns the long-lived loops: allocator heartbeat, assignment, node
    /// watch, meta watch, recycle, and the admission consumer.
    pub fn start(self: &Arc<Self>) {
        let mut handles = Vec::new();

        handles.push(self.spawn_ticker_loop("ts_loop", TS_UPDATE_INTERVAL, |coord| async move {
            if let Err(err) = coord.id_allocator.update_id().await {
                tracing::warn!(error = %err, "id allocator heartbeat failed");
            }
        }));
        handles.push(self.spawn_ticker_loop(
            "assign_task_loop",
            ASSIGN_TASK_INTERVAL,
            |coord| async move { coord.assign_tick().await },
        ));
        handles.push(self.spawn_ticker_loop(
            "recycle_unused_index_files",
            DURATION_INTERVAL,
            |coord| async move { coord.recycle_tick().await },
        ));

        handles.push(self.spawn_watch_loop(
            "watch_meta_loop",
            format!("{INDEXES_PREFIX}/"),
            self.meta_watch_revision,
            |coord, event| async move { coord.handle_meta_event(event).await },
        ));
        handles.push(self.spawn_watch_loop(
            "watch_node_loop",
            session_prefix(INDEX_NODE_ROLE),
            self.node_watch_revision,
            |coord, event| async move { coord.handle_node_event(event) },
        ));

        handles.push(self.sched.start());

        self.loops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(handles);
        tracing::info!(node_id = self.id, "coordinator started");
    }

    /// Cancels every loop and in-flight admission and revokes the session.
    pub async fn stop(&self) {
        self.set_state(StateCode::Abnormal);
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = self
            .loops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in handles {
            let _ = handle.await;
        }
        drop(
            self.session
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        tracing::info!(node_id = self.id, "coordinator stopped");
    }

    fn spawn_ticker_loop<F, Fut>(
        self: &Arc<Self>,
        name: &'static str,
        interval: Duration,
        tick: F,
    ) -> JoinHandle<()>
    where
        F: Fn(Arc<IndexCoord>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let coord = self.clone();
        tokio::spawn(async move {
            let cancel = coord.cancel.clone();
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            tracing::debug!(loop_name = name, "loop started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!(loop_name = name, "loop stopped");
                        return;
                    }
                    _ = ticker.tick() => tick(coord.clone()).await,
                }
            }
        })
    }

    fn spawn_watch_loop<F, Fut>(
        self: &Arc<Self>,
        name: &'static str,
        prefix: String,
        start_revision: i64,
        handle: F,
    ) -> JoinHandle<()>
    where
        F: Fn(Arc<IndexCoord>, WatchEvent) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let coord = self.clone();
        tokio::spawn(async move {
            let cancel = coord.cancel.clone();
            let mut revision = start_revision;
            tracing::debug!(loop_name = name, revision, "watch loop started");
            loop {
                let mut stream = match coord.kv.watch_prefix(&prefix, revision).await {
                    Ok(stream) => stream,
                    Err(err) => {
                        tracing::warn!(loop_name = name, error = %err, "watch subscribe failed");
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = tokio::time::sleep(WATCH_RESUBSCRIBE_DELAY) => continue,
                        }
                    }
                };
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            tracing::debug!(loop_name = name, "watch loop stopped");
                            return;
                        }
                        event = stream.recv() => match event {
                            Some(event) => {
                                revision = revision.max(event.revision());
                                handle(coord.clone(), event).await;
                            }
                            None => {
                                tracing::warn!(loop_name = name, revision, "watch stream closed; resubscribing");
                                break;
                            }
                        }
                    }
                }
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(WATCH_RESUBSCRIBE_DELAY) => {}
                }
            }
        })
    }

    // ── Admission (C4 entry point) ──────────────────────────────────

    /// Admits a build request: dedup by fingerprint, allocate an id, queue
    /// the admission and wait for its record to be persisted. Returns the
    /// build id and whether it was deduplicated onto an existing task.
    pub async fn build_index(&self, req: BuildRequest) -> Result<(UniqueId, bool), CoordError> {
        self.metrics.build_requests_total.inc();
        if let Some(existing) = self.meta_table.has_same_request(&req) {
            self.metrics.dedup_hits_total.inc();
            tracing::debug!(
                index_build_id = existing,
                index_id = req.index_id,
                "request matches existing task"
            );
            return Ok((existing, true));
        }

        let id = self.id_allocator.alloc_one().await?;
        let admitted = tokio::time::timeout(REQ_TIMEOUT_INTERVAL, async {
            let rx = self.sched.enqueue(id, req).await;
            match rx.await {
                Ok(result) => result,
                Err(_) => Err(CoordError::Canceled("admission dropped".to_string())),
            }
        })
        .await
        .map_err(|_| CoordError::EnqueueTimeout)??;

        tracing::info!(
            target: "vix_proof",
            event = "task_admitted",
            index_build_id = admitted,
            "build request admitted"
        );
        Ok((admitted, false))
    }

    /// Marks every task of the index deleted and cancels still-queued
    /// admissions for it.
    pub async fn drop_index(&self, index_id: UniqueId) -> Result<(), CoordError> {
        self.meta_table.mark_index_as_deleted(index_id).await?;

        let sched = self.sched.clone();
        let meta_table = self.meta_table.clone();
        tokio::spawn(async move {
            for id in sched.queue().remove_enqueued_tasks_for_index(index_id) {
                if let Err(err) = meta_table.delete_index(id).await {
                    tracing::warn!(index_build_id = id, error = %err,
                        "cleanup of canceled admission failed");
                }
            }
        });

        tracing::info!(index_id, "index dropped");
        Ok(())
    }

    // ── Assignment (C5) ─────────────────────────────────────────────

    /// One assignment pass: snapshot live workers, pick up unassigned and
    /// orphaned tasks in ascending version order, bump each version and
    /// dispatch to the least-loaded worker.
    pub async fn assign_tick(&self) {
        let (sessions, _) = match self.kv.list_sessions(INDEX_NODE_ROLE).await {
            Ok(out) => out,
            Err(err) => {
                tracing::warn!(error = %err, "listing worker sessions failed");
                return;
            }
        };
        if self.node_manager.node_count() == 0 {
            tracing::debug!("no workers available this tick");
            return;
        }
        let live: Vec<UniqueId> = sessions.iter().map(|s| s.server_id).collect();

        let mut metas = self.meta_table.get_unassigned_tasks(&live);
        // Fewer failed attempts go first.
        metas.sort_by_key(|m| m.version);
        if metas.is_empty() {
            return;
        }
        tracing::debug!(unassigned = metas.len(), live = live.len(), "assignment pass");

        for meta in metas.into_iter().take(TASK_LIMIT) {
            let id = meta.index_build_id;
            let version = match self.meta_table.update_version(id).await {
                Ok(version) => version,
                Err(err) => {
                    tracing::debug!(index_build_id = id, error = %err,
                        "version bump deferred to next tick");
                    continue;
                }
            };

            let Some((node_id, mut client)) = self.node_manager.peek_client() else {
                tracing::debug!("no worker to assign to");
                break;
            };

            let req = CreateIndexRequest {
                index_build_id: id,
                index_name: meta.req.index_name.clone(),
                index_id: meta.req.index_id,
                version,
                meta_path: index_meta_key(id),
                data_paths: meta.req.data_paths.clone(),
                type_params: meta.req.type_params.iter().map(|p| p.to_wire()).collect(),
                index_params: meta.req.index_params.iter().map(|p| p.to_wire()).collect(),
            };

            // A failed dispatch leaves the task unassigned for the next tick;
            // the version is never rolled back.
            if !self.assign_task(&mut client, req).await {
                self.metrics.assign_failures_total.inc();
                continue;
            }

            if let Err(err) = self.meta_table.build_index(id, node_id).await {
                tracing::warn!(index_build_id = id, node_id, error = %err,
                    "recording assignment failed");
            }
            self.node_manager.inc_priority(node_id, 1);
            self.metrics.tasks_assigned_total.inc();
            tracing::info!(
                target: "vix_proof",
                event = "task_assigned",
                index_build_id = id,
                node_id,
                version,
                "task assigned"
            );
        }
    }

    async fn assign_task(
        &self,
        client: &mut IndexNodeClient<Channel>,
        req: CreateIndexRequest,
    ) -> bool {
        let id = req.index_build_id;
        match tokio::time::timeout(REQ_TIMEOUT_INTERVAL, client.create_index(req)).await {
            Ok(Ok(resp)) => {
                let status = resp.into_inner();
                if status.error_code() != ErrorCode::Success {
                    tracing::warn!(index_build_id = id, reason = %status.reason,
                        "worker rejected CreateIndex");
                    return false;
                }
                true
            }
            Ok(Err(status)) => {
                tracing::warn!(index_build_id = id, error = %status, "CreateIndex failed");
                false
            }
            Err(_) => {
                tracing::warn!(index_build_id = id, "CreateIndex timed out");
                false
            }
        }
    }

    // ── Watch handlers (C6, C1) ─────────────────────────────────────

    /// Meta watch: absorb the new revision; a completion transition
    /// decrements the committing worker's load exactly once.
    pub async fn handle_meta_event(&self, event: WatchEvent) {
        match event {
            WatchEvent::Put(kv) => {
                let Some(id) = parse_index_meta_key(&kv.key) else {
                    return;
                };
                match self
                    .meta_table
                    .load_meta_from_registry(id, kv.mod_revision)
                    .await
                {
                    Ok(Some(node_id)) => {
                        self.metrics.tasks_completed_total.inc();
                        self.node_manager.inc_priority(node_id, -1);
                        tracing::info!(
                            target: "vix_proof",
                            event = "task_completed",
                            index_build_id = id,
                            node_id,
                            "worker committed task"
                        );
                    }
                    Ok(None) => {}
                    Err(err) => {
                        tracing::warn!(index_build_id = id, error = %err, "meta reload failed");
                    }
                }
            }
            WatchEvent::Delete { key, .. } => {
                tracing::debug!(key = %key, "task record deleted");
            }
        }
    }

    /// Node watch: session add/del drives the worker pool.
    pub fn handle_node_event(&self, event: WatchEvent) {
        match event {
            WatchEvent::Put(kv) => match serde_json::from_str::<Session>(&kv.value) {
                Ok(session) => {
                    if let Err(err) =
                        self.node_manager.add_node(session.server_id, &session.address)
                    {
                        tracing::error!(node_id = session.server_id, error = %err,
                            "adding worker failed");
                    }
                }
                Err(err) => {
                    tracing::warn!(key = %kv.key, error = %err, "undecodable worker session");
                }
            },
            WatchEvent::Delete { key, .. } => {
                if let Some(server_id) = parse_session_key(INDEX_NODE_ROLE, &key) {
                    self.node_manager.remove_node(server_id);
                }
            }
        }
    }

    // ── Recycle (C7) ────────────────────────────────────────────────

    /// One reclamation pass. Dropped records lose their whole blob prefix
    /// and then their metadata; finished multi-version records lose the
    /// blobs of every version but the last. Metadata advances only after
    /// the blob delete succeeded, so unrecycled work shrinks monotonically.
    pub async fn recycle_tick(&self) {
        let metas = self.meta_table.get_unused_index_files(TASK_LIMIT);
        if metas.is_empty() {
            return;
        }
        tracing::debug!(tasks = metas.len(), "recycle pass");

        for meta in metas {
            let id = meta.index_build_id;
            if meta.mark_deleted {
                let prefix = format!("{}/", index_file_prefix(id));
                match self.blob.remove_with_prefix(&prefix).await {
                    Ok(()) | Err(BlobStoreError::NotFound(_)) => {
                        if let Err(err) = self.meta_table.delete_index(id).await {
                            tracing::warn!(index_build_id = id, error = %err,
                                "deleting recycled record failed");
                            continue;
                        }
                        self.metrics.tasks_recycled_total.inc();
                        tracing::info!(
                            target: "vix_proof",
                            event = "task_recycled",
                            index_build_id = id,
                            "dropped index reclaimed"
                        );
                    }
                    Err(err) => {
                        tracing::warn!(index_build_id = id, error = %err,
                            "blob reclaim failed; retrying next tick");
                    }
                }
            } else {
                let mut all_removed = true;
                for version in 1..meta.version {
                    let prefix = format!("{}/", index_file_version_prefix(id, version));
                    match self.blob.remove_with_prefix(&prefix).await {
                        Ok(()) | Err(BlobStoreError::NotFound(_)) => {}
                        Err(err) => {
                            all_removed = false;
                            tracing::warn!(index_build_id = id, version, error = %err,
                                "stale version reclaim failed; retrying next tick");
                        }
                    }
                }
                if all_removed {
                    if let Err(err) = self.meta_table.update_recycle_state(id).await {
                        tracing::warn!(index_build_id = id, error = %err,
                            "recording recycle state failed");
                        continue;
                    }
                    tracing::info!(
                        target: "vix_proof",
                        event = "stale_versions_recycled",
                        index_build_id = id,
                        version = meta.version,
                        "older index versions reclaimed"
                    );
                }
            }
        }
    }

    // ── Accessors ───────────────────────────────────────────────────

    pub fn id(&self) -> UniqueId {
        self.id
    }

    pub fn advertise_addr(&self) -> &str {
        &self.advertise_addr
    }

    pub fn meta_table(&self) -> &Arc<MetaTable> {
        &self.meta_table
    }

    pub fn node_manager(&self) -> &Arc<NodeManager> {
        &self.node_manager
    }

    pub fn sched(&self) -> &Arc<TaskScheduler> {
        &self.sched
    }

    pub fn metrics(&self) -> &CoordMetrics {
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
}
