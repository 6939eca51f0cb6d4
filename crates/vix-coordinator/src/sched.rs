use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;

use vix_core::types::{BuildRequest, TaskMeta, UniqueId};

use crate::error::CoordError;
use crate::meta_table::MetaTable;

/// One in-flight admission: an allocated id waiting for its record to be
/// persisted. The caller blocks on `done`.
struct Admission {
    index_build_id: UniqueId,
    req: BuildRequest,
    done: oneshot::Sender<Result<UniqueId, CoordError>>,
}

/// Bounded FIFO of in-flight admissions, drained by a single consumer task.
///
/// Producers wait for space (the caller bounds the wait and maps it to
/// `EnqueueTimeout`); dropping an index cancels its still-queued admissions
/// before they ever reach the registry.
pub struct IndexAddQueue {
    inner: Mutex<QueueState>,
    capacity: usize,
    /// Signals the consumer that work arrived.
    work: Notify,
    /// Signals producers that space freed up.
    space: Notify,
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<Admission>,
    closed: bool,
}

impl IndexAddQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueState::default()),
            capacity: capacity.max(1),
            work: Notify::new(),
            space: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().queue.is_empty()
    }

    /// Enqueues an admission, waiting for space indefinitely; the caller is
    /// expected to wrap this in its request timeout.
    async fn enqueue(&self, admission: Admission) {
        let mut admission = Some(admission);
        loop {
            // Arm the space waiter before re-checking so a concurrent pop
            // cannot slip between the check and the await.
            let space = self.space.notified();
            {
                let mut state = self.lock();
                if state.closed {
                    drop(state);
                    if let Some(a) = admission.take() {
                        let _ = a
                            .done
                            .send(Err(CoordError::Canceled("coordinator stopped".to_string())));
                    }
                    // Pass the wake along to any other stranded producer.
                    self.space.notify_one();
                    return;
                }
                if state.queue.len() < self.capacity {
                    if let Some(a) = admission.take() {
                        state.queue.push_back(a);
                    }
                    let room_left = state.queue.len() < self.capacity;
                    drop(state);
                    self.work.notify_one();
                    if room_left {
                        // Chain the wake: a single stored permit may stand
                        // for several freed slots.
                        self.space.notify_one();
                    }
                    return;
                }
            }
            space.await;
        }
    }

    fn pop(&self) -> Option<Admission> {
        let admission = self.lock().queue.pop_front();
        if admission.is_some() {
            self.space.notify_one();
        }
        admission
    }

    /// Cancels still-queued admissions for an index and returns their
    /// already-allocated build ids so the caller can delete any metadata.
    pub fn remove_enqueued_tasks_for_index(&self, index_id: UniqueId) -> Vec<UniqueId> {
        let removed: Vec<Admission> = {
            let mut state = self.lock();
            let mut kept = VecDeque::with_capacity(state.queue.len());
            let mut removed = Vec::new();
            while let Some(admission) = state.queue.pop_front() {
                if admission.req.index_id == index_id {
                    removed.push(admission);
                } else {
                    kept.push_back(admission);
                }
            }
            state.queue = kept;
            removed
        };

        let mut ids = Vec::with_capacity(removed.len());
        for admission in removed {
            ids.push(admission.index_build_id);
            let _ = admission.done.send(Err(CoordError::Canceled(format!(
                "index {index_id} dropped while queued"
            ))));
            self.space.notify_one();
        }
        ids
    }

    fn fail_all(&self, reason: &str) {
        let drained: Vec<Admission> = {
            let mut state = self.lock();
            state.closed = true;
            state.queue.drain(..).collect()
        };
        for admission in drained {
            let _ = admission
                .done
                .send(Err(CoordError::Canceled(reason.to_string())));
        }
        self.space.notify_waiters();
        self.space.notify_one();
    }
}

/// The task scheduler: owns the add queue and the consumer that persists
/// admitted tasks.
pub struct TaskScheduler {
    queue: Arc<IndexAddQueue>,
    meta_table: Arc<MetaTable>,
    cancel: CancellationToken,
}

impl TaskScheduler {
    pub fn new(
        meta_table: Arc<MetaTable>,
        capacity: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            queue: Arc::new(IndexAddQueue::new(capacity)),
            meta_table,
            cancel,
        }
    }

    pub fn queue(&self) -> &IndexAddQueue {
        &self.queue
    }

    /// Enqueues an admission and returns the channel its result arrives on.
    pub async fn enqueue(
        &self,
        index_build_id: UniqueId,
        req: BuildRequest,
    ) -> oneshot::Receiver<Result<UniqueId, CoordError>> {
        let (done, rx) = oneshot::channel();
        self.queue
            .enqueue(Admission {
                index_build_id,
                req,
                done,
            })
            .await;
        rx
    }

    /// Spawns the single consumer draining the queue into the registry.
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        let queue = self.queue.clone();
        let meta_table = self.meta_table.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                while let Some(admission) = queue.pop() {
                    let id = admission.index_build_id;
                    let result = meta_table
                        .add_task(TaskMeta::new(id, admission.req))
                        .await
                        .map(|()| id);
                    if let Err(ref err) = result {
                        tracing::warn!(index_build_id = id, error = %err, "task admission failed");
                    } else {
                        tracing::debug!(index_build_id = id, "task admitted");
                    }
                    let _ = admission.done.send(result);
                }

                tokio::select! {
                    _ = cancel.cancelled() => {
                        queue.fail_all("coordinator stopped");
                        return;
                    }
                    _ = queue.work.notified() => {}
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use vix_core::types::TaskState;
    use vix_registry::mem::MemRegistry;

    fn req(index_id: UniqueId) -> BuildRequest {
        BuildRequest {
            index_id,
            index_name: "ivf".to_string(),
            data_paths: vec!["/a".to_string()],
            type_params: Vec::new(),
            index_params: Vec::new(),
        }
    }

    async fn scheduler() -> (Arc<MetaTable>, TaskScheduler, CancellationToken) {
        let kv: Arc<dyn vix_registry::MetaKv> = Arc::new(MemRegistry::new());
        let meta_table = Arc::new(MetaTable::new(kv).await.unwrap());
        let cancel = CancellationToken::new();
        let sched = TaskScheduler::new(meta_table.clone(), 16, cancel.clone());
        (meta_table, sched, cancel)
    }

    #[tokio::test]
    async fn admission_persists_and_completes() {
        let (meta_table, sched, cancel) = scheduler().await;
        let consumer = sched.start();

        let rx = sched.enqueue(1, req(7)).await;
        assert_eq!(rx.await.unwrap().unwrap(), 1);
        assert_eq!(meta_table.get(1).unwrap().meta.state, TaskState::Unissued);

        cancel.cancel();
        let _ = consumer.await;
    }

    #[tokio::test]
    async fn duplicate_id_surfaces_error() {
        let (_meta_table, sched, cancel) = scheduler().await;
        let consumer = sched.start();

        let rx = sched.enqueue(1, req(7)).await;
        assert!(rx.await.unwrap().is_ok());
        let rx = sched.enqueue(1, req(8)).await;
        assert!(matches!(
            rx.await.unwrap().unwrap_err(),
            CoordError::TaskExists(1)
        ));

        cancel.cancel();
        let _ = consumer.await;
    }

    #[tokio::test]
    async fn drop_cancels_queued_admissions() {
        let (_meta_table, sched, _cancel) = scheduler().await;
        // No consumer running: admissions stay queued.

        let rx7 = sched.enqueue(1, req(7)).await;
        let rx8 = sched.enqueue(2, req(8)).await;
        let rx7b = sched.enqueue(3, req(7)).await;

        let mut removed = sched.queue().remove_enqueued_tasks_for_index(7);
        removed.sort();
        assert_eq!(removed, vec![1, 3]);

        assert!(matches!(
            rx7.await.unwrap().unwrap_err(),
            CoordError::Canceled(_)
        ));
        assert!(matches!(
            rx7b.await.unwrap().unwrap_err(),
            CoordError::Canceled(_)
        ));
        // The unrelated admission is still queued.
        assert_eq!(sched.queue().len(), 1);
        drop(rx8);
    }

    #[tokio::test]
    async fn full_queue_blocks_until_space() {
        let kv: Arc<dyn vix_registry::MetaKv> = Arc::new(MemRegistry::new());
        let meta_table = Arc::new(MetaTable::new(kv).await.unwrap());
        let cancel = CancellationToken::new();
        let sched = Arc::new(TaskScheduler::new(meta_table, 1, cancel.clone()));

        let _rx1 = sched.enqueue(1, req(7)).await;

        // Second enqueue cannot land while the queue is full.
        let sched2 = sched.clone();
        let blocked = tokio::spawn(async move { sched2.enqueue(2, req(8)).await });
        tokio::task::yield_now().await;
        assert!(!blocked.is_finished());

        // Dropping index 7 frees the slot.
        let removed = sched.queue().remove_enqueued_tasks_for_index(7);
        assert_eq!(removed, vec![1]);
        let _rx2 = blocked.await.unwrap();
        assert_eq!(sched.queue().len(), 1);

        cancel.cancel();
    }

    #[tokio::test]
    async fn stop_fails_pending_admissions() {
        let (_meta_table, sched, cancel) = scheduler().await;

        let rx = sched.enqueue(1, req(7)).await;
        // Start the consumer and immediately stop it: cancellation must
        // surface to the caller, not hang it.
        cancel.cancel();
        let consumer = sched.start();
        let result = rx.await.unwrap();
        // Either the consumer drained the queue before observing the
        // cancel (admission succeeded) or it failed the admission.
        if let Err(err) = result {
            assert!(matches!(err, CoordError::Canceled(_)));
        }
        let _ = consumer.await;
    }
}
