//! Lazily started entity workers, one per entity ID.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};
use twin_snapshot::{
    EntityWorker, EventJournal, SnapshotConfig, SnapshotStore, StoreError, WorkerHandle,
};
use twin_types::EntityId;

/// Per-entity slot. Held locked while that entity's worker recovers.
type Slot = Arc<Mutex<Option<WorkerHandle>>>;

/// Owns the handle of every running worker.
///
/// A worker is started on first use. A handle whose worker has stopped is
/// replaced by a freshly recovered worker on the next request. Recovery
/// only blocks requests for the same entity.
pub struct WorkerRegistry<S> {
    store: Arc<S>,
    config: SnapshotConfig,
    workers: Mutex<BTreeMap<EntityId, Slot>>,
}

impl<S> WorkerRegistry<S>
where
    S: SnapshotStore + EventJournal,
{
    /// Create an empty registry over `store`.
    pub fn new(store: Arc<S>, config: SnapshotConfig) -> Self {
        Self {
            store,
            config,
            workers: Mutex::new(BTreeMap::new()),
        }
    }

    /// Handle for `entity_id`, starting (and recovering) its worker if needed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the entity's journal cannot be replayed.
    pub async fn get_or_start(&self, entity_id: EntityId) -> Result<WorkerHandle, StoreError> {
        let slot = {
            let mut workers = self.workers.lock().await;
            if !workers.contains_key(&entity_id) {
                let evicted = evict_stopped(&mut workers);
                if evicted > 0 {
                    debug!(evicted, "Evicted stopped workers");
                }
            }
            Arc::clone(workers.entry(entity_id).or_default())
        };

        let mut current = slot.lock().await;
        if let Some(handle) = current.as_ref() {
            if !handle.is_closed() {
                return Ok(handle.clone());
            }
            debug!(%entity_id, "Worker stopped, restarting");
        }

        let handle =
            EntityWorker::start(entity_id, Arc::clone(&self.store), self.config.clone()).await?;
        *current = Some(handle.clone());
        Ok(handle)
    }

    /// Number of registered entities, including stopped ones not yet evicted.
    pub async fn len(&self) -> usize {
        self.workers.lock().await.len()
    }

    /// Stop every worker and forget its handle.
    pub async fn shutdown_all(&self) {
        let slots = std::mem::take(&mut *self.workers.lock().await);
        let count = slots.len();
        for (entity_id, slot) in slots {
            let Some(handle) = slot.lock().await.take() else {
                continue;
            };
            if handle.shutdown().await.is_err() {
                debug!(%entity_id, "Worker already stopped");
            }
        }
        info!(workers = count, "All entity workers stopped");
    }
}

/// Drop slots whose worker has stopped or never started.
///
/// A slot someone else still holds is in use by a concurrent lookup and is
/// kept, so an entity never ends up with two workers.
fn evict_stopped(workers: &mut BTreeMap<EntityId, Slot>) -> usize {
    let before = workers.len();
    workers.retain(|_, slot| {
        if Arc::strong_count(slot) > 1 {
            return true;
        }
        slot.try_lock().map_or(true, |current| {
            current.as_ref().is_some_and(|handle| !handle.is_closed())
        })
    });
    before.saturating_sub(workers.len())
}
