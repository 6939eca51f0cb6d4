use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use vix_core::keys::{index_meta_key, INDEXES_PREFIX};
use vix_core::types::{BuildRequest, TaskMeta, TaskState, UniqueId, UNASSIGNED_NODE};
use vix_registry::{CasResult, MetaKv};

use crate::error::CoordError;

const CAS_ATTEMPTS: usize = 3;

/// One cached record plus the registry revision it was read/written at.
#[derive(Debug, Clone)]
pub struct MetaEntry {
    pub meta: TaskMeta,
    pub revision: i64,
}

#[derive(Debug, Clone)]
struct CacheSlot {
    meta: TaskMeta,
    revision: i64,
    /// Whether this record's terminal transition was already handed to the
    /// load accountant. Guarantees the per-completion decrement fires once
    /// no matter which path (watch or write-retry refresh) absorbed the
    /// worker's commit.
    completion_reported: bool,
}

impl CacheSlot {
    fn entry(&self) -> MetaEntry {
        MetaEntry {
            meta: self.meta.clone(),
            revision: self.revision,
        }
    }
}

/// The canonical task map: a write-through cache over the registry.
///
/// Reads serve from the cache; every write is a CAS against the record's
/// registry revision, and the cache only ever moves forward in revision, so
/// the write path and the watch path can race without regressing state.
pub struct MetaTable {
    kv: Arc<dyn MetaKv>,
    cache: Mutex<HashMap<UniqueId, CacheSlot>>,
}

impl MetaTable {
    /// Bulk-loads every task record from the registry.
    pub async fn new(kv: Arc<dyn MetaKv>) -> Result<Self, CoordError> {
        let table = Self {
            kv,
            cache: Mutex::new(HashMap::new()),
        };
        table.reload_all().await?;
        Ok(table)
    }

    async fn reload_all(&self) -> Result<(), CoordError> {
        let pairs = self
            .kv
            .load_with_prefix(&format!("{INDEXES_PREFIX}/"))
            .await?;
        let mut loaded = HashMap::with_capacity(pairs.len());
        for pair in pairs {
            let meta = TaskMeta::decode(&pair.value)?;
            // A record that is already terminal at startup carries no load;
            // its completion must not be reported again.
            let completion_reported = meta.state.is_terminal();
            loaded.insert(
                meta.index_build_id,
                CacheSlot {
                    meta,
                    revision: pair.mod_revision,
                    completion_reported,
                },
            );
        }
        let count = loaded.len();
        *self.lock() = loaded;
        tracing::info!(tasks = count, "task metadata loaded from registry");
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<UniqueId, CacheSlot>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the cached entry iff `entry` is newer, carrying the
    /// completion-reported flag across.
    fn store(&self, entry: MetaEntry) {
        let mut cache = self.lock();
        match cache.get_mut(&entry.meta.index_build_id) {
            Some(existing) if existing.revision >= entry.revision => {}
            Some(existing) => {
                existing.meta = entry.meta;
                existing.revision = entry.revision;
            }
            None => {
                cache.insert(
                    entry.meta.index_build_id,
                    CacheSlot {
                        meta: entry.meta,
                        revision: entry.revision,
                        completion_reported: false,
                    },
                );
            }
        }
    }

    pub fn get(&self, index_build_id: UniqueId) -> Option<MetaEntry> {
        self.lock().get(&index_build_id).map(CacheSlot::entry)
    }

    /// Admission-time deduplication: an existing not-deleted record with the
    /// same request fingerprint wins. Records already dropped are ignored, so
    /// a re-create after drop-before-recycle gets a fresh id.
    pub fn has_same_request(&self, req: &BuildRequest) -> Option<UniqueId> {
        let fingerprint = req.fingerprint();
        let cache = self.lock();
        cache
            .values()
            .filter(|e| !e.meta.mark_deleted)
            .find(|e| e.meta.req.fingerprint() == fingerprint)
            .map(|e| e.meta.index_build_id)
    }

    /// Persists a brand-new record (`Unissued`, version 0). Fails if the id
    /// already exists in the registry.
    pub async fn add_task(&self, meta: TaskMeta) -> Result<(), CoordError> {
        let id = meta.index_build_id;
        let key = index_meta_key(id);
        let value = meta.encode()?;
        match self.kv.compare_and_swap(&key, 0, &value).await? {
            CasResult::Ok { revision } => {
                self.store(MetaEntry { meta, revision });
                Ok(())
            }
            CasResult::Conflict { .. } => Err(CoordError::TaskExists(id)),
        }
    }

    /// CAS-mutates one record, refreshing from the registry between attempts.
    async fn update_meta<F>(&self, id: UniqueId, mutate: F) -> Result<MetaEntry, CoordError>
    where
        F: Fn(&mut TaskMeta),
    {
        for _ in 0..CAS_ATTEMPTS {
            let entry = match self.get(id) {
                Some(entry) => entry,
                None => match self.refresh(id).await? {
                    Some(entry) => entry,
                    None => return Err(CoordError::TaskNotFound(id)),
                },
            };
            let mut meta = entry.meta.clone();
            mutate(&mut meta);
            if meta == entry.meta {
                // Nothing to write (e.g. the guard refused to regress a
                // terminal record); don't churn the revision.
                return Ok(entry);
            }
            let value = meta.encode()?;
            let key = index_meta_key(id);
            match self.kv.compare_and_swap(&key, entry.revision, &value).await? {
                CasResult::Ok { revision } => {
                    let updated = MetaEntry { meta, revision };
                    self.store(updated.clone());
                    return Ok(updated);
                }
                CasResult::Conflict { .. } => {
                    self.refresh(id).await?;
                }
            }
        }
        Err(CoordError::Conflict(id))
    }

    /// Re-reads one record from the registry into the cache. Returns the
    /// fresh entry, or `None` (and drops the cached copy) when the record is
    /// gone.
    async fn refresh(&self, id: UniqueId) -> Result<Option<MetaEntry>, CoordError> {
        match self.kv.get(&index_meta_key(id)).await? {
            Some(pair) => {
                let meta = TaskMeta::decode(&pair.value)?;
                let entry = MetaEntry {
                    meta,
                    revision: pair.mod_revision,
                };
                self.store(entry.clone());
                Ok(Some(entry))
            }
            None => {
                self.lock().remove(&id);
                Ok(None)
            }
        }
    }

    /// Bumps the retry generation. Returns the new version.
    pub async fn update_version(&self, id: UniqueId) -> Result<i64, CoordError> {
        let entry = self
            .update_meta(id, |meta| {
                meta.version += 1;
            })
            .await?;
        Ok(entry.meta.version)
    }

    /// Records a successful dispatch: the task is now in flight on `node_id`.
    /// A worker commit that already landed (the worker can finish before this
    /// write) is never regressed.
    pub async fn build_index(&self, id: UniqueId, node_id: UniqueId) -> Result<(), CoordError> {
        self.update_meta(id, |meta| {
            if !meta.state.is_terminal() {
                meta.state = TaskState::InProgress;
                meta.node_id = node_id;
            }
        })
        .await?;
        Ok(())
    }

    /// Marks every task of the index as deleted. The records stay until the
    /// recycle loop reclaims their blobs.
    pub async fn mark_index_as_deleted(&self, index_id: UniqueId) -> Result<(), CoordError> {
        let ids: Vec<UniqueId> = {
            let cache = self.lock();
            cache
                .values()
                .filter(|e| e.meta.req.index_id == index_id && !e.meta.mark_deleted)
                .map(|e| e.meta.index_build_id)
                .collect()
        };
        for id in ids {
            match self
                .update_meta(id, |meta| {
                    meta.mark_deleted = true;
                })
                .await
            {
                Ok(_) => {}
                // Deleted out from under us; nothing left to mark.
                Err(CoordError::TaskNotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Flags the obsolete-version blobs of a record as reclaimed.
    pub async fn update_recycle_state(&self, id: UniqueId) -> Result<(), CoordError> {
        self.update_meta(id, |meta| {
            meta.recycled = true;
        })
        .await?;
        Ok(())
    }

    /// Removes the record from cache and registry.
    pub async fn delete_index(&self, id: UniqueId) -> Result<(), CoordError> {
        self.lock().remove(&id);
        self.kv.delete(&index_meta_key(id)).await?;
        Ok(())
    }

    /// Current state per id; an unknown id reports `TaskState::None`.
    pub fn get_index_states(&self, ids: &[UniqueId]) -> Vec<(UniqueId, TaskState, String)> {
        let cache = self.lock();
        ids.iter()
            .map(|id| match cache.get(id) {
                Some(e) => (*id, e.meta.state, e.meta.fail_reason.clone()),
                None => (*id, TaskState::None, String::new()),
            })
            .collect()
    }

    /// Blob keys of a finished build; `NotFinished` otherwise.
    pub fn get_index_file_path_info(&self, id: UniqueId) -> Result<Vec<String>, CoordError> {
        let cache = self.lock();
        let Some(entry) = cache.get(&id) else {
            return Err(CoordError::TaskNotFound(id));
        };
        if entry.meta.state != TaskState::Finished {
            return Err(CoordError::NotFinished {
                id,
                state: entry.meta.state,
            });
        }
        Ok(entry.meta.index_file_paths.clone())
    }

    /// Tasks eligible for (re)assignment: never issued, or in flight on a
    /// worker that is no longer live. Dropped records never re-enter.
    pub fn get_unassigned_tasks(&self, live_node_ids: &[UniqueId]) -> Vec<TaskMeta> {
        let cache = self.lock();
        cache
            .values()
            .filter(|e| !e.meta.mark_deleted)
            .filter(|e| match e.meta.state {
                TaskState::Unissued => true,
                TaskState::InProgress => !live_node_ids.contains(&e.meta.node_id),
                _ => false,
            })
            .map(|e| e.meta.clone())
            .collect()
    }

    /// Up to `limit` records with reclaimable blobs: dropped records (all
    /// files obsolete), or finished records that went through more than one
    /// assignment (older versions obsolete).
    pub fn get_unused_index_files(&self, limit: usize) -> Vec<TaskMeta> {
        let cache = self.lock();
        cache
            .values()
            .filter(|e| {
                e.meta.mark_deleted
                    || (e.meta.state == TaskState::Finished
                        && e.meta.version > 1
                        && !e.meta.recycled)
            })
            .take(limit)
            .map(|e| e.meta.clone())
            .collect()
    }

    /// In-flight task count per worker; seeds the selection heap at startup.
    pub fn get_node_task_stats(&self) -> HashMap<UniqueId, i64> {
        let cache = self.lock();
        let mut stats = HashMap::new();
        for entry in cache.values() {
            if entry.meta.state == TaskState::InProgress
                && entry.meta.node_id != UNASSIGNED_NODE
            {
                *stats.entry(entry.meta.node_id).or_insert(0) += 1;
            }
        }
        stats
    }

    /// Watch-event reload. Returns the committing worker's id when the
    /// record is now terminal and that completion has not been reported yet
    /// (the signal to decrement that worker's load, exactly once — no matter
    /// whether the watch or a write-path refresh absorbed the commit).
    pub async fn load_meta_from_registry(
        &self,
        id: UniqueId,
        event_revision: i64,
    ) -> Result<Option<UniqueId>, CoordError> {
        let needs_refresh = match self.get(id) {
            Some(entry) => entry.revision < event_revision,
            None => true,
        };
        if needs_refresh && self.refresh(id).await?.is_none() {
            return Ok(None);
        }

        let mut cache = self.lock();
        match cache.get_mut(&id) {
            Some(slot) if slot.meta.state.is_terminal() && !slot.completion_reported => {
                slot.completion_reported = true;
                Ok(Some(slot.meta.node_id))
            }
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vix_core::types::KeyValuePair;
    use vix_registry::mem::MemRegistry;

    fn req(index_id: UniqueId, data_paths: &[&str]) -> BuildRequest {
        BuildRequest {
            index_id,
            index_name: "ivf".to_string(),
            data_paths: data_paths.iter().map(|s| s.to_string()).collect(),
            type_params: vec![KeyValuePair {
                key: "dim".to_string(),
                value: "128".to_string(),
            }],
            index_params: Vec::new(),
        }
    }

    async fn table() -> (Arc<dyn MetaKv>, MetaTable) {
        let kv: Arc<dyn MetaKv> = Arc::new(MemRegistry::new());
        let table = MetaTable::new(kv.clone()).await.unwrap();
        (kv, table)
    }

    #[tokio::test]
    async fn add_task_rejects_duplicate_id() {
        let (_kv, table) = table().await;
        table.add_task(TaskMeta::new(1, req(7, &["/a"]))).await.unwrap();
        let err = table
            .add_task(TaskMeta::new(1, req(8, &["/b"])))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordError::TaskExists(1)));
    }

    #[tokio::test]
    async fn has_same_request_matches_fingerprint_not_deleted() {
        let (_kv, table) = table().await;
        table
            .add_task(TaskMeta::new(1, req(7, &["/a", "/b"])))
            .await
            .unwrap();

        // Same fingerprint, different path order.
        assert_eq!(table.has_same_request(&req(7, &["/b", "/a"])), Some(1));
        assert_eq!(table.has_same_request(&req(7, &["/b", "/c"])), None);

        table.mark_index_as_deleted(7).await.unwrap();
        assert_eq!(table.has_same_request(&req(7, &["/a", "/b"])), None);
    }

    #[tokio::test]
    async fn update_version_is_monotonic() {
        let (_kv, table) = table().await;
        table.add_task(TaskMeta::new(1, req(7, &["/a"]))).await.unwrap();

        assert_eq!(table.update_version(1).await.unwrap(), 1);
        assert_eq!(table.update_version(1).await.unwrap(), 2);
        assert_eq!(table.update_version(1).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn update_version_survives_external_cas_bump() {
        let (kv, table) = table().await;
        table.add_task(TaskMeta::new(1, req(7, &["/a"]))).await.unwrap();

        // An external writer (a worker commit) moves the record forward
        // behind the cache's back.
        let pair = kv.get(&index_meta_key(1)).await.unwrap().unwrap();
        let mut meta = TaskMeta::decode(&pair.value).unwrap();
        meta.state = TaskState::InProgress;
        meta.node_id = 5;
        kv.compare_and_swap(&index_meta_key(1), pair.mod_revision, &meta.encode().unwrap())
            .await
            .unwrap();

        // The in-loop refresh retries and still lands the bump.
        assert_eq!(table.update_version(1).await.unwrap(), 1);
        let entry = table.get(1).unwrap();
        assert_eq!(entry.meta.node_id, 5);
        assert_eq!(entry.meta.version, 1);
    }

    #[tokio::test]
    async fn unassigned_covers_unissued_and_orphans() {
        let (_kv, table) = table().await;
        table.add_task(TaskMeta::new(1, req(7, &["/a"]))).await.unwrap();
        table.add_task(TaskMeta::new(2, req(8, &["/b"]))).await.unwrap();
        table.add_task(TaskMeta::new(3, req(9, &["/c"]))).await.unwrap();

        table.build_index(2, 100).await.unwrap();
        table.build_index(3, 200).await.unwrap();

        // Node 100 is live, node 200 is gone: task 3 is an orphan.
        let mut ids: Vec<UniqueId> = table
            .get_unassigned_tasks(&[100])
            .into_iter()
            .map(|m| m.index_build_id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec![1, 3]);

        // A dropped record never re-enters.
        table.mark_index_as_deleted(9).await.unwrap();
        let ids: Vec<UniqueId> = table
            .get_unassigned_tasks(&[100])
            .into_iter()
            .map(|m| m.index_build_id)
            .collect();
        assert_eq!(ids, vec![1]);
    }

    #[tokio::test]
    async fn unused_index_files_selects_deleted_and_stale_versions() {
        let (kv, table) = table().await;
        table.add_task(TaskMeta::new(1, req(7, &["/a"]))).await.unwrap();
        table.add_task(TaskMeta::new(2, req(8, &["/b"]))).await.unwrap();
        table.add_task(TaskMeta::new(3, req(9, &["/c"]))).await.unwrap();

        // Task 1: dropped.
        table.mark_index_as_deleted(7).await.unwrap();

        // Task 2: finished at version 3 (two reassignments).
        table.update_version(2).await.unwrap();
        table.update_version(2).await.unwrap();
        table.update_version(2).await.unwrap();
        let pair = kv.get(&index_meta_key(2)).await.unwrap().unwrap();
        let mut meta = TaskMeta::decode(&pair.value).unwrap();
        meta.state = TaskState::Finished;
        kv.compare_and_swap(&index_meta_key(2), pair.mod_revision, &meta.encode().unwrap())
            .await
            .unwrap();
        table.load_meta_from_registry(2, i64::MAX).await.unwrap();

        // Task 3: still unissued at version 0 — not reclaimable.
        let mut ids: Vec<UniqueId> = table
            .get_unused_index_files(20)
            .into_iter()
            .map(|m| m.index_build_id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec![1, 2]);

        table.update_recycle_state(2).await.unwrap();
        let ids: Vec<UniqueId> = table
            .get_unused_index_files(20)
            .into_iter()
            .map(|m| m.index_build_id)
            .collect();
        assert_eq!(ids, vec![1]);
    }

    #[tokio::test]
    async fn node_task_stats_counts_in_progress() {
        let (_kv, table) = table().await;
        table.add_task(TaskMeta::new(1, req(7, &["/a"]))).await.unwrap();
        table.add_task(TaskMeta::new(2, req(8, &["/b"]))).await.unwrap();
        table.add_task(TaskMeta::new(3, req(9, &["/c"]))).await.unwrap();

        table.build_index(1, 100).await.unwrap();
        table.build_index(2, 100).await.unwrap();
        table.build_index(3, 200).await.unwrap();

        let stats = table.get_node_task_stats();
        assert_eq!(stats.get(&100), Some(&2));
        assert_eq!(stats.get(&200), Some(&1));
    }

    #[tokio::test]
    async fn load_meta_reports_completion_transition_once() {
        let (kv, table) = table().await;
        table.add_task(TaskMeta::new(1, req(7, &["/a"]))).await.unwrap();
        table.update_version(1).await.unwrap();
        table.build_index(1, 100).await.unwrap();

        // Worker commits Finished.
        let pair = kv.get(&index_meta_key(1)).await.unwrap().unwrap();
        let mut meta = TaskMeta::decode(&pair.value).unwrap();
        meta.state = TaskState::Finished;
        meta.index_file_paths = vec!["1/1/ivf_0".to_string()];
        let committed = kv
            .compare_and_swap(&index_meta_key(1), pair.mod_revision, &meta.encode().unwrap())
            .await
            .unwrap();
        let revision = match committed {
            vix_registry::CasResult::Ok { revision } => revision,
            other => panic!("commit failed: {other:?}"),
        };

        // First reload reports the transition with the committing node.
        assert_eq!(
            table.load_meta_from_registry(1, revision).await.unwrap(),
            Some(100)
        );
        // Replay of the same revision is absorbed.
        assert_eq!(table.load_meta_from_registry(1, revision).await.unwrap(), None);

        assert_eq!(
            table.get_index_file_path_info(1).unwrap(),
            vec!["1/1/ivf_0".to_string()]
        );
    }

    #[tokio::test]
    async fn stale_worker_commit_is_rejected_by_cas() {
        let (kv, table) = table().await;
        table.add_task(TaskMeta::new(1, req(7, &["/a"]))).await.unwrap();
        table.update_version(1).await.unwrap();
        table.build_index(1, 100).await.unwrap();

        // Abandoned worker holds the revision from before a reassignment.
        let stale = kv.get(&index_meta_key(1)).await.unwrap().unwrap();

        // Reassignment bumps the record.
        table.update_version(1).await.unwrap();
        table.build_index(1, 200).await.unwrap();

        // The stale commit must conflict and leave the record untouched.
        let mut meta = TaskMeta::decode(&stale.value).unwrap();
        meta.state = TaskState::Finished;
        let out = kv
            .compare_and_swap(&index_meta_key(1), stale.mod_revision, &meta.encode().unwrap())
            .await
            .unwrap();
        assert!(!out.is_ok());

        let entry = table.get(1).unwrap();
        assert_eq!(entry.meta.state, TaskState::InProgress);
        assert_eq!(entry.meta.node_id, 200);
        assert_eq!(entry.meta.version, 2);
    }

    #[tokio::test]
    async fn get_states_reports_none_for_unknown() {
        let (_kv, table) = table().await;
        table.add_task(TaskMeta::new(1, req(7, &["/a"]))).await.unwrap();

        let states = table.get_index_states(&[1, 99]);
        assert_eq!(states[0].1, TaskState::Unissued);
        assert_eq!(states[1].1, TaskState::None);
    }

    #[tokio::test]
    async fn file_paths_require_finished() {
        let (_kv, table) = table().await;
        table.add_task(TaskMeta::new(1, req(7, &["/a"]))).await.unwrap();

        let err = table.get_index_file_path_info(1).unwrap_err();
        assert!(matches!(err, CoordError::NotFinished { id: 1, .. }));
        let err = table.get_index_file_path_info(99).unwrap_err();
        assert!(matches!(err, CoordError::TaskNotFound(99)));
    }

    #[tokio::test]
    async fn delete_index_removes_cache_and_registry() {
        let (kv, table) = table().await;
        table.add_task(TaskMeta::new(1, req(7, &["/a"]))).await.unwrap();

        table.delete_index(1).await.unwrap();
        assert!(table.get(1).is_none());
        assert!(kv.get(&index_meta_key(1)).await.unwrap().is_none());
        assert_eq!(table.get_index_states(&[1])[0].1, TaskState::None);
    }

    #[tokio::test]
    async fn restart_reloads_from_registry() {
        let (kv, table) = table().await;
        table.add_task(TaskMeta::new(1, req(7, &["/a"]))).await.unwrap();
        table.build_index(1, 100).await.unwrap();
        drop(table);

        let reloaded = MetaTable::new(kv).await.unwrap();
        let entry = reloaded.get(1).unwrap();
        assert_eq!(entry.meta.state, TaskState::InProgress);
        assert_eq!(entry.meta.node_id, 100);
    }
}
