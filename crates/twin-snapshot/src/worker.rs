//! Tokio runtime for one entity.
//!
//! An [`EntityWorker`] owns the entity state and its
//! [`SnapshotCoordinator`], and processes a single mailbox sequentially.
//! Store calls run as separate tasks whose completions are posted back
//! into the mailbox, so every state transition happens on the worker's
//! own task and never races with another.
//!
//! # Message flow
//!
//! ```text
//! WorkerHandle ──TakeSnapshot/Modify/Status──► mailbox ──► coordinator.handle()
//!                                                 ▲              │ effects
//!      save/delete tasks ──SaveCompleted/──────── │              ▼
//!      timers ────────────SaveTimedOut/Tick────── ┘      spawn store calls,
//!                                                        arm/cancel timers,
//!                                                        reply to requesters
//! ```

use std::ops::ControlFlow;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use twin_types::{Checkpoint, EntityId, SequenceNr, SnapshotTag, Twin, TwinEvent};

use crate::config::SnapshotConfig;
use crate::coordinator::{CoordinatorEvent, DeleteOutcome, Effect, SnapshotCoordinator};
use crate::error::{StoreError, WorkerError};
use crate::recovery;
use crate::request::{RequestContext, SnapshotReply, SnapshotRequest};
use crate::store::{EventJournal, SnapshotStore};
use crate::timer::TimerHandle;

/// Mailbox capacity per entity.
const MAILBOX_CAPACITY: usize = 256;

/// Reply handle carried through the coordinator.
pub type Responder = oneshot::Sender<SnapshotReply>;

/// Point-in-time view of a worker's snapshot state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStatus {
    /// The entity.
    pub entity_id: EntityId,
    /// Last confirmed checkpoint.
    pub checkpoint: Checkpoint,
    /// Sequence number of the last applied event.
    pub sequence_nr: SequenceNr,
    /// No save in flight and the checkpoint covers every event.
    pub up_to_date_and_idle: bool,
    /// A save is in flight.
    pub in_progress: bool,
    /// Requests waiting for the in-flight save.
    pub deferred: usize,
}

#[derive(Debug)]
enum WorkerMessage {
    TakeSnapshot(SnapshotRequest<Responder>),
    Modify {
        event: TwinEvent,
        reply: oneshot::Sender<Result<SequenceNr, WorkerError>>,
    },
    Status(oneshot::Sender<WorkerStatus>),
    StartMaintenance,
    StopMaintenance,
    SaveCompleted {
        sequence_nr: SequenceNr,
        tag: SnapshotTag,
        result: Result<SequenceNr, StoreError>,
    },
    SaveTimedOut {
        sequence_nr: SequenceNr,
    },
    MaintenanceTick,
    DeleteCompleted(DeleteOutcome),
    Shutdown,
}

/// Cloneable handle used to talk to a running [`EntityWorker`].
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    entity_id: EntityId,
    sender: mpsc::Sender<WorkerMessage>,
}

impl WorkerHandle {
    /// The entity this handle addresses.
    pub const fn entity_id(&self) -> EntityId {
        self.entity_id
    }

    /// Whether the worker has stopped.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Request a snapshot and wait for the satisfying sequence number.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Unavailable`] if the save failed or timed out,
    /// or [`WorkerError::Stopped`] if the worker is gone.
    pub async fn take_snapshot(
        &self,
        tag: SnapshotTag,
        context: Option<RequestContext>,
        dry_run: bool,
    ) -> Result<SequenceNr, WorkerError> {
        let (tx, rx) = oneshot::channel();
        let request = SnapshotRequest {
            tag,
            requester: Some(tx),
            context,
            dry_run,
        };
        self.send(WorkerMessage::TakeSnapshot(request)).await?;
        let reply = rx.await.map_err(|_closed| self.stopped())?;
        Ok(reply.outcome?)
    }

    /// Apply `event` to the entity and journal it.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Rejected`] if the twin refuses the event,
    /// [`WorkerError::Journal`] if it could not be persisted, or
    /// [`WorkerError::Stopped`] if the worker is gone.
    pub async fn modify(&self, event: TwinEvent) -> Result<SequenceNr, WorkerError> {
        let (reply, rx) = oneshot::channel();
        self.send(WorkerMessage::Modify { event, reply }).await?;
        rx.await.map_err(|_closed| self.stopped())?
    }

    /// Current snapshot state.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Stopped`] if the worker is gone.
    pub async fn status(&self) -> Result<WorkerStatus, WorkerError> {
        let (tx, rx) = oneshot::channel();
        self.send(WorkerMessage::Status(tx)).await?;
        rx.await.map_err(|_closed| self.stopped())
    }

    /// Resume maintenance snapshots.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Stopped`] if the worker is gone.
    pub async fn start_maintenance(&self) -> Result<(), WorkerError> {
        self.send(WorkerMessage::StartMaintenance).await
    }

    /// Pause maintenance snapshots.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Stopped`] if the worker is gone.
    pub async fn stop_maintenance(&self) -> Result<(), WorkerError> {
        self.send(WorkerMessage::StopMaintenance).await
    }

    /// Ask the worker to stop after the messages already queued.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Stopped`] if the worker is already gone.
    pub async fn shutdown(&self) -> Result<(), WorkerError> {
        self.send(WorkerMessage::Shutdown).await
    }

    async fn send(&self, message: WorkerMessage) -> Result<(), WorkerError> {
        self.sender
            .send(message)
            .await
            .map_err(|_closed| self.stopped())
    }

    const fn stopped(&self) -> WorkerError {
        WorkerError::Stopped {
            entity_id: self.entity_id,
        }
    }
}

/// The task that owns one entity.
pub struct EntityWorker<S> {
    entity_id: EntityId,
    store: Arc<S>,
    twin: Twin,
    coordinator: SnapshotCoordinator<Responder>,
    mailbox: mpsc::Receiver<WorkerMessage>,
    sender: mpsc::WeakSender<WorkerMessage>,
    save_timer: Option<TimerHandle>,
    maintenance_timer: Option<TimerHandle>,
}

impl<S> EntityWorker<S>
where
    S: SnapshotStore + EventJournal,
{
    /// Recover the entity from `store` and spawn its worker task.
    ///
    /// Maintenance snapshots start immediately if an interval is configured.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the journal cannot be replayed.
    pub async fn start(
        entity_id: EntityId,
        store: Arc<S>,
        config: SnapshotConfig,
    ) -> Result<WorkerHandle, StoreError> {
        let load_timeout = config.load_snapshot_timeout();
        let mut coordinator = SnapshotCoordinator::new(entity_id, config);
        let twin = recovery::recover(store.as_ref(), &mut coordinator, load_timeout).await?;

        let (sender, mailbox) = mpsc::channel(MAILBOX_CAPACITY);
        let mut worker = Self {
            entity_id,
            store,
            twin,
            coordinator,
            mailbox,
            sender: sender.downgrade(),
            save_timer: None,
            maintenance_timer: None,
        };

        let effects = worker.coordinator.start_maintenance();
        worker.execute(effects);
        tokio::spawn(worker.run());

        Ok(WorkerHandle { entity_id, sender })
    }

    async fn run(mut self) {
        info!(
            entity_id = %self.entity_id,
            sequence_nr = self.twin.revision,
            checkpoint = self.coordinator.latest_checkpoint_sequence_nr(),
            "Entity worker started"
        );

        while let Some(message) = self.mailbox.recv().await {
            if self.dispatch(message).await.is_break() {
                break;
            }
        }

        let effects = self.coordinator.shutdown();
        self.execute(effects);
        info!(
            entity_id = %self.entity_id,
            sequence_nr = self.twin.revision,
            "Entity worker stopped"
        );
    }

    async fn dispatch(&mut self, message: WorkerMessage) -> ControlFlow<()> {
        let event = match message {
            WorkerMessage::TakeSnapshot(request) => CoordinatorEvent::Requested(request),
            WorkerMessage::MaintenanceTick => CoordinatorEvent::MaintenanceTick,
            WorkerMessage::SaveCompleted {
                sequence_nr,
                tag,
                result,
            } => match result {
                Ok(acknowledged) => CoordinatorEvent::SaveSucceeded {
                    sequence_nr: acknowledged,
                    tag,
                },
                Err(e) => CoordinatorEvent::SaveFailed {
                    sequence_nr,
                    cause: e.to_string(),
                },
            },
            WorkerMessage::SaveTimedOut { sequence_nr } => {
                CoordinatorEvent::SaveTimedOut { sequence_nr }
            }
            WorkerMessage::DeleteCompleted(outcome) => CoordinatorEvent::DeleteOutcome(outcome),
            WorkerMessage::Modify { event, reply } => {
                let result = self.modify(event).await;
                if reply.send(result).is_err() {
                    debug!(entity_id = %self.entity_id, "Modify caller went away");
                }
                return ControlFlow::Continue(());
            }
            WorkerMessage::Status(reply) => {
                if reply.send(self.status()).is_err() {
                    debug!(entity_id = %self.entity_id, "Status caller went away");
                }
                return ControlFlow::Continue(());
            }
            WorkerMessage::StartMaintenance => {
                let effects = self.coordinator.start_maintenance();
                self.execute(effects);
                return ControlFlow::Continue(());
            }
            WorkerMessage::StopMaintenance => {
                let effects = self.coordinator.stop_maintenance();
                self.execute(effects);
                return ControlFlow::Continue(());
            }
            WorkerMessage::Shutdown => return ControlFlow::Break(()),
        };

        let effects = self.coordinator.handle(event, &self.twin);
        self.execute(effects);
        ControlFlow::Continue(())
    }

    async fn modify(&mut self, event: TwinEvent) -> Result<SequenceNr, WorkerError> {
        let mut next = self.twin.clone();
        let sequence_nr = next.apply(&event)?;
        self.store.append(self.entity_id, sequence_nr, &event).await?;
        self.twin = next;
        debug!(entity_id = %self.entity_id, sequence_nr, "Event applied");
        Ok(sequence_nr)
    }

    fn status(&self) -> WorkerStatus {
        WorkerStatus {
            entity_id: self.entity_id,
            checkpoint: self.coordinator.checkpoint(),
            sequence_nr: self.twin.revision,
            up_to_date_and_idle: self.coordinator.is_up_to_date_and_idle(&self.twin),
            in_progress: self.coordinator.is_in_progress(),
            deferred: self.coordinator.deferred_len(),
        }
    }

    // -----------------------------------------------------------------------
    // Effect execution
    // -----------------------------------------------------------------------

    fn execute(&mut self, effects: Vec<Effect<Responder>>) {
        for effect in effects {
            match effect {
                Effect::Save {
                    sequence_nr,
                    tag,
                    payload,
                } => self.spawn_save(sequence_nr, tag, payload),
                Effect::ArmSaveTimeout { sequence_nr, after } => {
                    self.save_timer = Some(TimerHandle::schedule(
                        after,
                        self.sender.clone(),
                        WorkerMessage::SaveTimedOut { sequence_nr },
                    ));
                }
                Effect::CancelSaveTimeout => {
                    if let Some(timer) = self.save_timer.take() {
                        timer.cancel();
                    }
                }
                Effect::DeleteSnapshot { sequence_nr } => self.spawn_delete_snapshot(sequence_nr),
                Effect::DeleteEvents { up_to } => self.spawn_delete_events(up_to),
                Effect::Reply { requester, reply } => {
                    if requester.send(reply).is_err() {
                        debug!(entity_id = %self.entity_id, "Snapshot requester went away");
                    }
                }
                Effect::ArmMaintenance { after } => {
                    self.maintenance_timer = Some(TimerHandle::schedule(
                        after,
                        self.sender.clone(),
                        WorkerMessage::MaintenanceTick,
                    ));
                }
                Effect::CancelMaintenance => {
                    if let Some(timer) = self.maintenance_timer.take() {
                        timer.cancel();
                    }
                }
            }
        }
    }

    fn spawn_save(&self, sequence_nr: SequenceNr, tag: SnapshotTag, payload: serde_json::Value) {
        let Some(sender) = self.sender.upgrade() else {
            warn!(entity_id = %self.entity_id, sequence_nr, "Mailbox closed, dropping save");
            return;
        };
        let store = Arc::clone(&self.store);
        let entity_id = self.entity_id;
        tokio::spawn(async move {
            let result = store
                .save_snapshot(entity_id, sequence_nr, tag, payload)
                .await;
            let message = WorkerMessage::SaveCompleted {
                sequence_nr,
                tag,
                result,
            };
            if sender.send(message).await.is_err() {
                debug!(%entity_id, sequence_nr, "Worker stopped before save completed");
            }
        });
    }

    fn spawn_delete_snapshot(&self, sequence_nr: SequenceNr) {
        let Some(sender) = self.sender.upgrade() else {
            return;
        };
        let store = Arc::clone(&self.store);
        let entity_id = self.entity_id;
        tokio::spawn(async move {
            let outcome = match store.delete_snapshot(entity_id, sequence_nr).await {
                Ok(()) => DeleteOutcome::SnapshotDeleted { sequence_nr },
                Err(e) => DeleteOutcome::SnapshotDeleteFailed {
                    sequence_nr,
                    cause: e.to_string(),
                },
            };
            if sender.send(WorkerMessage::DeleteCompleted(outcome)).await.is_err() {
                debug!(%entity_id, sequence_nr, "Worker stopped before snapshot delete completed");
            }
        });
    }

    fn spawn_delete_events(&self, up_to: SequenceNr) {
        let Some(sender) = self.sender.upgrade() else {
            return;
        };
        let store = Arc::clone(&self.store);
        let entity_id = self.entity_id;
        tokio::spawn(async move {
            let outcome = match store.delete_events(entity_id, up_to).await {
                Ok(()) => DeleteOutcome::EventsDeleted { up_to },
                Err(e) => DeleteOutcome::EventsDeleteFailed {
                    up_to,
                    cause: e.to_string(),
                },
            };
            if sender.send(WorkerMessage::DeleteCompleted(outcome)).await.is_err() {
                debug!(%entity_id, up_to, "Worker stopped before event delete completed");
            }
        });
    }
}
