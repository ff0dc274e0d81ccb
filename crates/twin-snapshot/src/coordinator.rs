//! The snapshot state machine owned by each entity worker.
//!
//! [`SnapshotCoordinator`] is a pure transition function: every input is a
//! [`CoordinatorEvent`], every output is a list of [`Effect`]s that the
//! hosting runtime executes (store calls, timers, replies). The coordinator
//! performs no I/O itself, which keeps it deterministic under test and lets
//! the runtime deliver every asynchronous completion back through the same
//! sequential mailbox.
//!
//! # States
//!
//! ```text
//!            request / tick (needs save)
//!   IDLE  ------------------------------------>  IN_PROGRESS(seq, tag)
//!    ^                                               |
//!    |   success(seq) | failure(seq) | timeout(seq)  |
//!    +-----------------------------------------------+
//! ```
//!
//! While `IN_PROGRESS`, new requests are deferred and replayed in order once
//! the attempt resolves. Completions and timers are only acted on when their
//! sequence number matches the live attempt; anything else is out of order
//! and never touches the checkpoint.

use std::mem;
use std::time::Duration;

use tracing::{debug, error, info, warn};
use twin_types::{
    Checkpoint, EntityId, SequenceNr, SnapshotRecord, SnapshotTag, TaggedSnapshot, Twin,
};

use crate::config::SnapshotConfig;
use crate::deferred::{DeferredRequest, DeferredRequestQueue};
use crate::error::{EntityUnavailable, SnapshotFailure};
use crate::maintenance::{MaintenanceSchedule, MaintenanceScheduler};
use crate::request::{RequestContext, SnapshotReply, SnapshotRequest};
use crate::{recovery, retention};

/// The parts of the entity the coordinator needs to see.
pub trait EntityView {
    /// Sequence number of the last event applied to the entity.
    fn sequence_nr(&self) -> SequenceNr;

    /// Serialize the entity together with `tag` for the snapshot store.
    ///
    /// # Errors
    ///
    /// Returns the serializer error if the entity cannot be encoded.
    fn snapshot_payload(&self, tag: SnapshotTag) -> Result<serde_json::Value, serde_json::Error>;
}

impl EntityView for Twin {
    fn sequence_nr(&self) -> SequenceNr {
        self.revision
    }

    fn snapshot_payload(&self, tag: SnapshotTag) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(TaggedSnapshot::new(self.clone(), tag))
    }
}

/// A save that has been submitted and not yet resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotAttempt<R> {
    /// Sequence number being saved.
    pub sequence_nr: SequenceNr,
    /// Protection status being saved.
    pub tag: SnapshotTag,
    /// Who to answer once the save resolves.
    pub requester: Option<R>,
    /// Caller metadata echoed in the answer.
    pub context: Option<RequestContext>,
}

/// Result of a best-effort delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// A snapshot was deleted.
    SnapshotDeleted {
        /// The deleted snapshot.
        sequence_nr: SequenceNr,
    },
    /// Deleting a snapshot failed.
    SnapshotDeleteFailed {
        /// The snapshot that could not be deleted.
        sequence_nr: SequenceNr,
        /// Cause reported by the store.
        cause: String,
    },
    /// Journal events were deleted.
    EventsDeleted {
        /// Highest deleted sequence number.
        up_to: SequenceNr,
    },
    /// Deleting journal events failed.
    EventsDeleteFailed {
        /// Highest sequence number that was to be deleted.
        up_to: SequenceNr,
        /// Cause reported by the journal.
        cause: String,
    },
}

/// Every input the coordinator reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorEvent<R> {
    /// A snapshot was requested.
    Requested(SnapshotRequest<R>),
    /// The maintenance timer fired.
    MaintenanceTick,
    /// The store acknowledged a save.
    SaveSucceeded {
        /// Acknowledged sequence number.
        sequence_nr: SequenceNr,
        /// Tag the snapshot was saved with.
        tag: SnapshotTag,
    },
    /// The store rejected a save.
    SaveFailed {
        /// Sequence number of the failed save.
        sequence_nr: SequenceNr,
        /// Cause reported by the store.
        cause: String,
    },
    /// The save timeout timer fired.
    SaveTimedOut {
        /// Sequence number the timer was armed for.
        sequence_nr: SequenceNr,
    },
    /// A best-effort delete completed.
    DeleteOutcome(DeleteOutcome),
}

/// Work the hosting runtime must carry out on the coordinator's behalf.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect<R> {
    /// Submit an asynchronous save to the snapshot store.
    Save {
        /// Sequence number to save at.
        sequence_nr: SequenceNr,
        /// Protection status.
        tag: SnapshotTag,
        /// Serialized entity.
        payload: serde_json::Value,
    },
    /// Arm the save timeout; any earlier save timer is replaced.
    ArmSaveTimeout {
        /// Sequence number the timer belongs to.
        sequence_nr: SequenceNr,
        /// Deadline.
        after: Duration,
    },
    /// Cancel the outstanding save timeout.
    CancelSaveTimeout,
    /// Best-effort delete of one snapshot.
    DeleteSnapshot {
        /// Snapshot to delete.
        sequence_nr: SequenceNr,
    },
    /// Best-effort delete of journal events.
    DeleteEvents {
        /// Delete events up to and including this sequence number.
        up_to: SequenceNr,
    },
    /// Answer a requester.
    Reply {
        /// The reply handle from the request.
        requester: R,
        /// The answer.
        reply: SnapshotReply,
    },
    /// Arm the maintenance timer.
    ArmMaintenance {
        /// Delay until the next maintenance tick.
        after: Duration,
    },
    /// Cancel the outstanding maintenance timer.
    CancelMaintenance,
}

/// Snapshot lifecycle state machine for one entity.
#[derive(Debug)]
pub struct SnapshotCoordinator<R> {
    entity_id: EntityId,
    config: SnapshotConfig,
    checkpoint: Checkpoint,
    attempt: Option<SnapshotAttempt<R>>,
    last_known_good: Option<Checkpoint>,
    deferred: DeferredRequestQueue<R>,
    maintenance: MaintenanceScheduler,
}

impl<R> SnapshotCoordinator<R> {
    /// Create an idle coordinator with an empty checkpoint.
    pub const fn new(entity_id: EntityId, config: SnapshotConfig) -> Self {
        let maintenance = MaintenanceScheduler::new(config.snapshot_interval());
        Self {
            entity_id,
            config,
            checkpoint: Checkpoint::EMPTY,
            attempt: None,
            last_known_good: None,
            deferred: DeferredRequestQueue::new(),
            maintenance,
        }
    }

    /// Start from a known checkpoint instead of the empty one.
    #[must_use]
    pub const fn with_checkpoint(mut self, checkpoint: Checkpoint) -> Self {
        self.checkpoint = checkpoint;
        self
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// The entity this coordinator belongs to.
    pub const fn entity_id(&self) -> EntityId {
        self.entity_id
    }

    /// The last confirmed checkpoint.
    pub const fn checkpoint(&self) -> Checkpoint {
        self.checkpoint
    }

    /// Sequence number of the last confirmed checkpoint.
    pub const fn latest_checkpoint_sequence_nr(&self) -> SequenceNr {
        self.checkpoint.sequence_nr
    }

    /// The attempt in flight, if any.
    pub const fn attempt(&self) -> Option<&SnapshotAttempt<R>> {
        self.attempt.as_ref()
    }

    /// Whether a save is in flight.
    pub const fn is_in_progress(&self) -> bool {
        self.attempt.is_some()
    }

    /// True if no save is in flight and the checkpoint covers every event.
    pub fn is_up_to_date_and_idle(&self, entity: &impl EntityView) -> bool {
        self.attempt.is_none() && self.no_change_since_checkpoint(entity)
    }

    /// Number of requests waiting for the current attempt to resolve.
    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    /// The maintenance scheduler state.
    pub const fn maintenance(&self) -> &MaintenanceScheduler {
        &self.maintenance
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    /// Apply one event and return the effects the runtime must execute.
    pub fn handle(&mut self, event: CoordinatorEvent<R>, entity: &impl EntityView) -> Vec<Effect<R>> {
        let mut effects = Vec::new();
        match event {
            CoordinatorEvent::Requested(request) => {
                self.on_request(request, entity, &mut effects);
            }
            CoordinatorEvent::MaintenanceTick => {
                self.maintenance.fired();
                self.on_maintenance_tick(entity, &mut effects);
            }
            CoordinatorEvent::SaveSucceeded { sequence_nr, tag } => {
                self.on_save_succeeded(sequence_nr, tag, entity, &mut effects);
            }
            CoordinatorEvent::SaveFailed { sequence_nr, cause } => {
                self.on_save_failed(
                    sequence_nr,
                    SnapshotFailure::StoreSaveFailure { cause },
                    entity,
                    &mut effects,
                );
            }
            CoordinatorEvent::SaveTimedOut { sequence_nr } => {
                let timeout_ms = self.config.save_snapshot_timeout_ms;
                self.on_save_failed(
                    sequence_nr,
                    SnapshotFailure::StoreSaveTimeout {
                        sequence_nr,
                        timeout_ms,
                    },
                    entity,
                    &mut effects,
                );
            }
            CoordinatorEvent::DeleteOutcome(outcome) => self.on_delete_outcome(&outcome),
        }
        effects
    }

    /// Request a snapshot.
    pub fn request_snapshot(
        &mut self,
        request: SnapshotRequest<R>,
        entity: &impl EntityView,
    ) -> Vec<Effect<R>> {
        self.handle(CoordinatorEvent::Requested(request), entity)
    }

    /// Take a maintenance snapshot if the entity changed.
    pub fn maintenance_tick(&mut self, entity: &impl EntityView) -> Vec<Effect<R>> {
        self.handle(CoordinatorEvent::MaintenanceTick, entity)
    }

    /// The store acknowledged a save.
    pub fn on_save_success(
        &mut self,
        sequence_nr: SequenceNr,
        tag: SnapshotTag,
        entity: &impl EntityView,
    ) -> Vec<Effect<R>> {
        self.handle(CoordinatorEvent::SaveSucceeded { sequence_nr, tag }, entity)
    }

    /// The store rejected a save.
    pub fn on_save_failure(
        &mut self,
        sequence_nr: SequenceNr,
        cause: String,
        entity: &impl EntityView,
    ) -> Vec<Effect<R>> {
        self.handle(CoordinatorEvent::SaveFailed { sequence_nr, cause }, entity)
    }

    /// The save timer for `sequence_nr` fired.
    pub fn on_save_timeout(
        &mut self,
        sequence_nr: SequenceNr,
        entity: &impl EntityView,
    ) -> Vec<Effect<R>> {
        self.handle(CoordinatorEvent::SaveTimedOut { sequence_nr }, entity)
    }

    /// Begin taking maintenance snapshots.
    pub fn start_maintenance(&mut self) -> Vec<Effect<R>> {
        let mut effects = Vec::new();
        let schedule = self.maintenance.start();
        self.apply_schedule(schedule, &mut effects);
        effects
    }

    /// Stop taking maintenance snapshots.
    pub fn stop_maintenance(&mut self) -> Vec<Effect<R>> {
        let mut effects = Vec::new();
        let schedule = self.maintenance.stop();
        self.apply_schedule(schedule, &mut effects);
        effects
    }

    /// Cancel all timers before the worker stops.
    ///
    /// Pending requesters are dropped without a reply.
    pub fn shutdown(&mut self) -> Vec<Effect<R>> {
        self.maintenance.stop();
        self.attempt = None;
        self.last_known_good = None;
        self.deferred = DeferredRequestQueue::new();
        vec![Effect::CancelSaveTimeout, Effect::CancelMaintenance]
    }

    /// Adopt a snapshot offered during startup replay.
    ///
    /// Sets the checkpoint directly; no timer is armed and no I/O happens.
    /// The returned twin has its revision aligned with the offer.
    ///
    /// # Errors
    ///
    /// Returns the deserializer error if the payload is not a tagged twin.
    pub fn recover_from_offer(&mut self, offer: &SnapshotRecord) -> Result<Twin, serde_json::Error> {
        let snapshot = recovery::decode_offer(offer)?;
        let tag = snapshot.tag_or_default();
        let mut twin = snapshot.entity;
        twin.revision = offer.sequence_nr;
        self.checkpoint = Checkpoint::new(offer.sequence_nr, tag);
        debug!(
            entity_id = %self.entity_id,
            sequence_nr = offer.sequence_nr,
            %tag,
            "Recovered checkpoint from snapshot offer"
        );
        Ok(twin)
    }

    // -----------------------------------------------------------------------
    // Handlers
    // -----------------------------------------------------------------------

    fn on_request(
        &mut self,
        request: SnapshotRequest<R>,
        entity: &impl EntityView,
        effects: &mut Vec<Effect<R>>,
    ) {
        debug!(
            entity_id = %self.entity_id,
            tag = %request.tag,
            dry_run = request.dry_run,
            "Received snapshot request"
        );

        if request.dry_run {
            let sequence_nr = self.checkpoint.sequence_nr;
            push_reply(request.requester, request.context, Ok(sequence_nr), effects);
        } else if self.attempt.is_some() {
            self.deferred.enqueue(DeferredRequest::Requested(request));
        } else if request.tag.is_protected()
            && self.checkpoint.is_protected()
            && self.no_change_since_checkpoint(entity)
        {
            let sequence_nr = self.checkpoint.sequence_nr;
            debug!(
                entity_id = %self.entity_id,
                sequence_nr,
                "Protected checkpoint is up to date, reusing it"
            );
            push_reply(request.requester, request.context, Ok(sequence_nr), effects);
        } else {
            self.start_attempt(request.tag, request.requester, request.context, entity, effects);
        }
    }

    fn on_maintenance_tick(&mut self, entity: &impl EntityView, effects: &mut Vec<Effect<R>>) {
        if self.attempt.is_some() {
            debug!(entity_id = %self.entity_id, "Snapshot in progress, deferring maintenance tick");
            self.deferred.enqueue(DeferredRequest::MaintenanceTick);
        } else if self.no_change_since_checkpoint(entity) {
            debug!(
                entity_id = %self.entity_id,
                sequence_nr = self.checkpoint.sequence_nr,
                "Checkpoint is up to date, skipping maintenance snapshot"
            );
            let schedule = self.maintenance.reschedule();
            self.apply_schedule(schedule, effects);
        } else {
            self.start_attempt(SnapshotTag::Unprotected, None, None, entity, effects);
        }
    }

    fn start_attempt(
        &mut self,
        tag: SnapshotTag,
        requester: Option<R>,
        context: Option<RequestContext>,
        entity: &impl EntityView,
        effects: &mut Vec<Effect<R>>,
    ) {
        let sequence_nr = entity.sequence_nr();
        let payload = match entity.snapshot_payload(tag) {
            Ok(payload) => payload,
            Err(e) => {
                error!(
                    entity_id = %self.entity_id,
                    sequence_nr,
                    error = %e,
                    "Failed to serialize entity for snapshot"
                );
                let failure = SnapshotFailure::StoreSaveFailure {
                    cause: format!("serialization failed: {e}"),
                };
                let unavailable = EntityUnavailable::snapshot_failed(self.entity_id, failure);
                push_reply(requester, context, Err(unavailable), effects);
                let schedule = self.maintenance.reschedule();
                self.apply_schedule(schedule, effects);
                return;
            }
        };

        debug!(
            entity_id = %self.entity_id,
            sequence_nr,
            %tag,
            "Attempting to take snapshot"
        );

        self.last_known_good = Some(self.checkpoint);
        self.attempt = Some(SnapshotAttempt {
            sequence_nr,
            tag,
            requester,
            context,
        });
        effects.push(Effect::Save {
            sequence_nr,
            tag,
            payload,
        });
        effects.push(Effect::ArmSaveTimeout {
            sequence_nr,
            after: self.config.save_snapshot_timeout(),
        });
    }

    fn on_save_succeeded(
        &mut self,
        sequence_nr: SequenceNr,
        tag: SnapshotTag,
        entity: &impl EntityView,
        effects: &mut Vec<Effect<R>>,
    ) {
        let Some(attempt) = self.take_matching_attempt(sequence_nr) else {
            warn!(
                entity_id = %self.entity_id,
                sequence_nr,
                checkpoint = self.checkpoint.sequence_nr,
                in_progress = ?self.in_progress_sequence_nr(),
                reason = %SnapshotFailure::OutOfOrderResponse { sequence_nr },
                "Save success arrived out of order; ignoring it and deleting its snapshot"
            );
            if retention::orphan_deletable(sequence_nr, self.checkpoint, &self.config) {
                effects.push(Effect::DeleteSnapshot { sequence_nr });
            }
            return;
        };

        // A late ack from an earlier attempt at the same sequence number can
        // carry a different tag. The live attempt's tag is what was promised.
        if tag != attempt.tag {
            debug!(
                entity_id = %self.entity_id,
                sequence_nr,
                acknowledged_tag = %tag,
                attempt_tag = %attempt.tag,
                "Save acknowledged with a tag from an earlier attempt"
            );
        }
        let previous = self.last_known_good.take().unwrap_or(self.checkpoint);
        let confirmed = Checkpoint::new(sequence_nr, attempt.tag);
        info!(
            entity_id = %self.entity_id,
            sequence_nr,
            tag = %attempt.tag,
            "Snapshot confirmed"
        );

        push_reply(attempt.requester, attempt.context, Ok(sequence_nr), effects);
        effects.push(Effect::CancelSaveTimeout);

        let decision = retention::decide(previous, confirmed, &self.config);
        if let Some(old) = decision.delete_snapshot {
            info!(
                entity_id = %self.entity_id,
                sequence_nr = old,
                tag = %previous.tag,
                "Deleting superseded snapshot"
            );
            effects.push(Effect::DeleteSnapshot { sequence_nr: old });
        }
        if let Some(up_to) = decision.delete_events_up_to {
            debug!(entity_id = %self.entity_id, up_to, "Deleting journal events");
            effects.push(Effect::DeleteEvents { up_to });
        }

        self.checkpoint = confirmed;
        self.finish_attempt(entity, effects);
    }

    fn on_save_failed(
        &mut self,
        sequence_nr: SequenceNr,
        failure: SnapshotFailure,
        entity: &impl EntityView,
        effects: &mut Vec<Effect<R>>,
    ) {
        let Some(attempt) = self.take_matching_attempt(sequence_nr) else {
            warn!(
                entity_id = %self.entity_id,
                sequence_nr,
                checkpoint = self.checkpoint.sequence_nr,
                in_progress = ?self.in_progress_sequence_nr(),
                failure = %failure,
                reason = %SnapshotFailure::OutOfOrderResponse { sequence_nr },
                "Save failure or timeout arrived out of order; ignoring it"
            );
            return;
        };

        match &failure {
            SnapshotFailure::StoreSaveTimeout { .. } => warn!(
                entity_id = %self.entity_id,
                sequence_nr,
                failure = %failure,
                "Snapshot save timed out"
            ),
            _ => error!(
                entity_id = %self.entity_id,
                sequence_nr,
                failure = %failure,
                "Failed to save snapshot"
            ),
        }

        if let Some(last_known_good) = self.last_known_good.take() {
            self.checkpoint = last_known_good;
        }
        let unavailable = EntityUnavailable::snapshot_failed(self.entity_id, failure);
        push_reply(attempt.requester, attempt.context, Err(unavailable), effects);
        effects.push(Effect::CancelSaveTimeout);
        self.finish_attempt(entity, effects);
    }

    fn on_delete_outcome(&self, outcome: &DeleteOutcome) {
        match outcome {
            DeleteOutcome::SnapshotDeleted { sequence_nr } => debug!(
                entity_id = %self.entity_id,
                sequence_nr,
                "Deleted snapshot"
            ),
            DeleteOutcome::EventsDeleted { up_to } => debug!(
                entity_id = %self.entity_id,
                up_to,
                "Deleted journal events"
            ),
            DeleteOutcome::SnapshotDeleteFailed { sequence_nr, cause } => warn!(
                entity_id = %self.entity_id,
                sequence_nr,
                failure = %SnapshotFailure::StoreDeleteFailure { cause: cause.clone() },
                "Failed to delete snapshot"
            ),
            DeleteOutcome::EventsDeleteFailed { up_to, cause } => warn!(
                entity_id = %self.entity_id,
                up_to,
                failure = %SnapshotFailure::StoreDeleteFailure { cause: cause.clone() },
                "Failed to delete journal events"
            ),
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// Back to idle: replay deferred requests, then re-arm maintenance.
    fn finish_attempt(&mut self, entity: &impl EntityView, effects: &mut Vec<Effect<R>>) {
        self.attempt = None;
        self.last_known_good = None;

        let pending = mem::take(&mut self.deferred);
        pending.drain_into(|request| match request {
            DeferredRequest::Requested(request) => self.on_request(request, entity, effects),
            DeferredRequest::MaintenanceTick => self.on_maintenance_tick(entity, effects),
        });

        let schedule = self.maintenance.reschedule();
        self.apply_schedule(schedule, effects);
    }

    fn take_matching_attempt(&mut self, sequence_nr: SequenceNr) -> Option<SnapshotAttempt<R>> {
        if self
            .attempt
            .as_ref()
            .is_some_and(|attempt| attempt.sequence_nr == sequence_nr)
        {
            self.attempt.take()
        } else {
            None
        }
    }

    fn in_progress_sequence_nr(&self) -> Option<SequenceNr> {
        self.attempt.as_ref().map(|attempt| attempt.sequence_nr)
    }

    fn no_change_since_checkpoint(&self, entity: &impl EntityView) -> bool {
        entity.sequence_nr() == self.checkpoint.sequence_nr
    }

    fn apply_schedule(&self, schedule: MaintenanceSchedule, effects: &mut Vec<Effect<R>>) {
        effects.push(Effect::CancelMaintenance);
        match schedule {
            MaintenanceSchedule::Rearm(after) => {
                debug!(
                    entity_id = %self.entity_id,
                    after_ms = after.as_millis(),
                    "Scheduling maintenance snapshot"
                );
                effects.push(Effect::ArmMaintenance { after });
            }
            MaintenanceSchedule::Cancel => {}
        }
    }
}

fn push_reply<R>(
    requester: Option<R>,
    context: Option<RequestContext>,
    outcome: Result<SequenceNr, EntityUnavailable>,
    effects: &mut Vec<Effect<R>>,
) {
    if let Some(requester) = requester {
        effects.push(Effect::Reply {
            requester,
            reply: SnapshotReply { context, outcome },
        });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    type Coordinator = SnapshotCoordinator<u32>;

    fn twin_at(sequence_nr: SequenceNr) -> Twin {
        let mut twin = Twin::new(EntityId::new());
        twin.revision = sequence_nr;
        twin
    }

    fn coordinator_at(checkpoint: Checkpoint) -> Coordinator {
        SnapshotCoordinator::new(EntityId::new(), SnapshotConfig::default())
            .with_checkpoint(checkpoint)
    }

    fn protected(requester: u32) -> SnapshotRequest<u32> {
        SnapshotRequest::protected(requester, None)
    }

    fn saves(effects: &[Effect<u32>]) -> Vec<(SequenceNr, SnapshotTag)> {
        effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::Save {
                    sequence_nr, tag, ..
                } => Some((*sequence_nr, *tag)),
                _ => None,
            })
            .collect()
    }

    fn replies(effects: &[Effect<u32>]) -> Vec<(u32, Result<SequenceNr, EntityUnavailable>)> {
        effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::Reply { requester, reply } => Some((*requester, reply.outcome.clone())),
                _ => None,
            })
            .collect()
    }

    fn snapshot_deletes(effects: &[Effect<u32>]) -> Vec<SequenceNr> {
        effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::DeleteSnapshot { sequence_nr } => Some(*sequence_nr),
                _ => None,
            })
            .collect()
    }

    fn event_deletes(effects: &[Effect<u32>]) -> Vec<SequenceNr> {
        effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::DeleteEvents { up_to } => Some(*up_to),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn protected_request_reuses_up_to_date_protected_checkpoint() {
        let mut coordinator = coordinator_at(Checkpoint::new(5, SnapshotTag::Protected));
        let twin = twin_at(5);

        let effects = coordinator.request_snapshot(protected(1), &twin);

        assert!(saves(&effects).is_empty());
        assert_eq!(replies(&effects), vec![(1, Ok(5))]);
        assert!(!coordinator.is_in_progress());
    }

    #[test]
    fn maintenance_tick_saves_and_retires_previous_checkpoint() {
        let mut coordinator = coordinator_at(Checkpoint::new(5, SnapshotTag::Unprotected));
        let twin = twin_at(7);

        let effects = coordinator.maintenance_tick(&twin);
        assert_eq!(saves(&effects), vec![(7, SnapshotTag::Unprotected)]);
        assert!(effects.contains(&Effect::ArmSaveTimeout {
            sequence_nr: 7,
            after: Duration::from_millis(500),
        }));
        assert!(replies(&effects).is_empty());

        let effects = coordinator.on_save_success(7, SnapshotTag::Unprotected, &twin);
        assert_eq!(
            coordinator.checkpoint(),
            Checkpoint::new(7, SnapshotTag::Unprotected)
        );
        assert_eq!(snapshot_deletes(&effects), vec![5]);
        assert_eq!(event_deletes(&effects), vec![6]);
        assert!(effects.contains(&Effect::CancelSaveTimeout));
        assert!(!coordinator.is_in_progress());
    }

    #[test]
    fn request_during_attempt_is_replayed_against_new_checkpoint() {
        let mut coordinator = coordinator_at(Checkpoint::EMPTY);
        let twin = twin_at(7);

        let effects = coordinator.request_snapshot(protected(1), &twin);
        assert_eq!(saves(&effects), vec![(7, SnapshotTag::Protected)]);

        let effects = coordinator.request_snapshot(protected(2), &twin);
        assert!(effects.is_empty());
        assert_eq!(coordinator.deferred_len(), 1);

        let effects = coordinator.on_save_success(7, SnapshotTag::Protected, &twin);
        assert_eq!(replies(&effects), vec![(1, Ok(7)), (2, Ok(7))]);
        assert!(saves(&effects).is_empty());
        assert_eq!(coordinator.deferred_len(), 0);
        assert_eq!(
            coordinator.checkpoint(),
            Checkpoint::new(7, SnapshotTag::Protected)
        );
    }

    #[test]
    fn replayed_protected_request_after_unprotected_save_starts_new_attempt() {
        let mut coordinator = coordinator_at(Checkpoint::new(5, SnapshotTag::Unprotected));
        let twin = twin_at(7);

        coordinator.maintenance_tick(&twin);
        coordinator.request_snapshot(protected(1), &twin);

        let effects = coordinator.on_save_success(7, SnapshotTag::Unprotected, &twin);
        assert!(replies(&effects).is_empty());
        assert_eq!(saves(&effects), vec![(7, SnapshotTag::Protected)]);
        assert!(coordinator.is_in_progress());

        // Same sequence number as the confirmed checkpoint: never deleted.
        let effects = coordinator.on_save_success(7, SnapshotTag::Protected, &twin);
        assert_eq!(replies(&effects), vec![(1, Ok(7))]);
        assert!(snapshot_deletes(&effects).is_empty());
        assert_eq!(
            coordinator.checkpoint(),
            Checkpoint::new(7, SnapshotTag::Protected)
        );
    }

    #[test]
    fn timeout_rolls_back_and_notifies_requester() {
        let mut coordinator = coordinator_at(Checkpoint::new(5, SnapshotTag::Protected));
        let twin = twin_at(7);

        coordinator.request_snapshot(protected(1), &twin);
        coordinator.request_snapshot(protected(2).dry_run(), &twin);
        coordinator.maintenance_tick(&twin);
        assert_eq!(coordinator.deferred_len(), 1);

        let effects = coordinator.on_save_timeout(7, &twin);
        assert_eq!(
            coordinator.checkpoint(),
            Checkpoint::new(5, SnapshotTag::Protected)
        );

        let replies = replies(&effects);
        assert_eq!(replies[0].0, 1);
        let err = replies[0].1.clone().unwrap_err();
        assert_eq!(err.code(), "snapshot.timeout");
        assert!(matches!(
            err.cause,
            SnapshotFailure::StoreSaveTimeout {
                sequence_nr: 7,
                timeout_ms: 500
            }
        ));

        // The deferred maintenance tick is replayed and retries the save.
        assert_eq!(saves(&effects), vec![(7, SnapshotTag::Unprotected)]);
        assert_eq!(coordinator.deferred_len(), 0);
    }

    #[test]
    fn late_success_after_timeout_is_out_of_order() {
        let mut coordinator = coordinator_at(Checkpoint::new(5, SnapshotTag::Unprotected));
        let twin = twin_at(7);

        coordinator.request_snapshot(protected(1), &twin);
        coordinator.on_save_timeout(7, &twin);
        assert!(!coordinator.is_in_progress());

        let effects = coordinator.on_save_success(7, SnapshotTag::Unprotected, &twin);
        assert_eq!(
            coordinator.checkpoint(),
            Checkpoint::new(5, SnapshotTag::Unprotected)
        );
        assert_eq!(effects, vec![Effect::DeleteSnapshot { sequence_nr: 7 }]);
    }

    #[test]
    fn late_ack_from_earlier_attempt_confirms_live_attempt_tag() {
        let mut coordinator = coordinator_at(Checkpoint::new(5, SnapshotTag::Unprotected));
        let twin = twin_at(7);

        coordinator.maintenance_tick(&twin);
        coordinator.request_snapshot(protected(1), &twin);

        // The unprotected save times out and the protected request retries at 7.
        let effects = coordinator.on_save_timeout(7, &twin);
        assert_eq!(saves(&effects), vec![(7, SnapshotTag::Protected)]);

        // The first attempt's ack lands first and resolves the live attempt.
        let effects = coordinator.on_save_success(7, SnapshotTag::Unprotected, &twin);
        assert_eq!(replies(&effects), vec![(1, Ok(7))]);
        assert_eq!(
            coordinator.checkpoint(),
            Checkpoint::new(7, SnapshotTag::Protected)
        );

        let effects = coordinator.on_save_success(7, SnapshotTag::Protected, &twin);
        assert!(snapshot_deletes(&effects).is_empty());

        let twin = twin_at(9);
        coordinator.maintenance_tick(&twin);
        let effects = coordinator.on_save_success(9, SnapshotTag::Unprotected, &twin);
        assert!(snapshot_deletes(&effects).is_empty());
        assert_eq!(
            coordinator.checkpoint(),
            Checkpoint::new(9, SnapshotTag::Unprotected)
        );
    }

    #[test]
    fn redelivered_success_never_deletes_confirmed_checkpoint() {
        let mut coordinator = coordinator_at(Checkpoint::EMPTY);
        let twin = twin_at(3);

        coordinator.request_snapshot(protected(1), &twin);
        coordinator.on_save_success(3, SnapshotTag::Protected, &twin);

        let effects = coordinator.on_save_success(3, SnapshotTag::Protected, &twin);
        assert!(effects.is_empty());
        assert_eq!(
            coordinator.checkpoint(),
            Checkpoint::new(3, SnapshotTag::Protected)
        );
    }

    #[test]
    fn stale_failure_and_timeout_do_not_touch_checkpoint() {
        let mut coordinator = coordinator_at(Checkpoint::new(2, SnapshotTag::Unprotected));
        let twin = twin_at(4);

        coordinator.request_snapshot(protected(1), &twin);

        assert!(coordinator.on_save_failure(3, "boom".to_owned(), &twin).is_empty());
        assert!(coordinator.on_save_timeout(9, &twin).is_empty());
        assert!(coordinator.is_in_progress());
        assert_eq!(
            coordinator.checkpoint(),
            Checkpoint::new(2, SnapshotTag::Unprotected)
        );
    }

    #[test]
    fn save_failure_replies_unavailable_with_cause() {
        let mut coordinator = coordinator_at(Checkpoint::new(2, SnapshotTag::Unprotected));
        let twin = twin_at(4);

        coordinator.request_snapshot(protected(1), &twin);
        let effects = coordinator.on_save_failure(4, "disk full".to_owned(), &twin);

        let replies = replies(&effects);
        let err = replies[0].1.clone().unwrap_err();
        assert_eq!(err.code(), "entity.unavailable");
        assert!(err.message.contains("disk full"));
        assert_eq!(coordinator.latest_checkpoint_sequence_nr(), 2);
        assert!(!coordinator.is_in_progress());
    }

    #[test]
    fn maintenance_failure_is_not_replied() {
        let mut coordinator = coordinator_at(Checkpoint::EMPTY);
        let twin = twin_at(1);

        coordinator.maintenance_tick(&twin);
        let effects = coordinator.on_save_failure(1, "boom".to_owned(), &twin);
        assert!(replies(&effects).is_empty());
        assert_eq!(coordinator.checkpoint(), Checkpoint::EMPTY);
    }

    #[test]
    fn dry_run_reports_confirmed_checkpoint_without_side_effects() {
        let mut coordinator = coordinator_at(Checkpoint::new(5, SnapshotTag::Unprotected));
        let twin = twin_at(9);

        for _ in 0..3 {
            let effects = coordinator.request_snapshot(protected(1).dry_run(), &twin);
            assert_eq!(replies(&effects), vec![(1, Ok(5))]);
            assert_eq!(effects.len(), 1);
        }

        coordinator.request_snapshot(protected(2), &twin);
        let effects = coordinator.request_snapshot(protected(3).dry_run(), &twin);
        assert_eq!(replies(&effects), vec![(3, Ok(5))]);
        assert_eq!(coordinator.deferred_len(), 0);
        assert_eq!(
            coordinator.checkpoint(),
            Checkpoint::new(5, SnapshotTag::Unprotected)
        );
    }

    #[test]
    fn only_one_attempt_in_flight() {
        let mut coordinator = coordinator_at(Checkpoint::EMPTY);
        let twin = twin_at(4);

        let mut submitted = saves(&coordinator.request_snapshot(protected(1), &twin));
        for requester in 2..6 {
            submitted.extend(saves(&coordinator.request_snapshot(protected(requester), &twin)));
            submitted.extend(saves(&coordinator.maintenance_tick(&twin)));
        }

        assert_eq!(submitted.len(), 1);
        assert_eq!(coordinator.deferred_len(), 8);
    }

    #[test]
    fn repeated_protected_requests_hit_cache_after_first_save() {
        let mut coordinator = coordinator_at(Checkpoint::EMPTY);
        let twin = twin_at(4);

        coordinator.request_snapshot(protected(1), &twin);
        coordinator.on_save_success(4, SnapshotTag::Protected, &twin);

        for requester in 2..5 {
            let effects = coordinator.request_snapshot(protected(requester), &twin);
            assert!(saves(&effects).is_empty());
            assert_eq!(replies(&effects), vec![(requester, Ok(4))]);
        }
    }

    #[test]
    fn unchanged_entity_skips_maintenance_and_rearms() {
        let mut coordinator = coordinator_at(Checkpoint::new(3, SnapshotTag::Unprotected));
        coordinator.start_maintenance();

        let effects = coordinator.maintenance_tick(&twin_at(3));
        assert!(saves(&effects).is_empty());
        assert!(effects.contains(&Effect::ArmMaintenance {
            after: Duration::from_millis(900_000),
        }));
    }

    #[test]
    fn successful_save_rearms_maintenance_only_while_active() {
        let twin = twin_at(2);

        let mut coordinator = coordinator_at(Checkpoint::EMPTY);
        coordinator.request_snapshot(protected(1), &twin);
        let effects = coordinator.on_save_success(2, SnapshotTag::Protected, &twin);
        assert!(!effects.iter().any(|e| matches!(e, Effect::ArmMaintenance { .. })));

        let mut coordinator = coordinator_at(Checkpoint::EMPTY);
        coordinator.start_maintenance();
        coordinator.request_snapshot(protected(1), &twin);
        let effects = coordinator.on_save_success(2, SnapshotTag::Protected, &twin);
        assert!(effects.iter().any(|e| matches!(e, Effect::ArmMaintenance { .. })));
    }

    #[test]
    fn stop_maintenance_cancels_timer() {
        let mut coordinator = coordinator_at(Checkpoint::EMPTY);
        coordinator.start_maintenance();
        let effects = coordinator.stop_maintenance();
        assert_eq!(effects, vec![Effect::CancelMaintenance]);
        assert!(!coordinator.maintenance().is_active());
    }

    #[test]
    fn checkpoint_never_decreases_across_cycles() {
        let mut coordinator = coordinator_at(Checkpoint::EMPTY);
        let mut last = 0;

        for (sequence_nr, succeed) in [(2, true), (4, false), (5, true), (6, false), (8, true)] {
            let twin = twin_at(sequence_nr);
            coordinator.maintenance_tick(&twin);
            if succeed {
                coordinator.on_save_success(sequence_nr, SnapshotTag::Unprotected, &twin);
            } else {
                coordinator.on_save_timeout(sequence_nr, &twin);
            }
            assert!(coordinator.latest_checkpoint_sequence_nr() >= last);
            last = coordinator.latest_checkpoint_sequence_nr();
        }
        assert_eq!(last, 8);
    }

    #[test]
    fn recover_from_offer_sets_checkpoint_and_revision() {
        let mut coordinator = coordinator_at(Checkpoint::EMPTY);
        let twin = twin_at(11);
        let record = SnapshotRecord {
            entity_id: twin.id,
            sequence_nr: 11,
            payload: twin.snapshot_payload(SnapshotTag::Protected).unwrap(),
            created_at: chrono::Utc::now(),
        };

        let recovered = coordinator.recover_from_offer(&record).unwrap();
        assert_eq!(recovered.revision, 11);
        assert_eq!(
            coordinator.checkpoint(),
            Checkpoint::new(11, SnapshotTag::Protected)
        );
        assert!(coordinator.is_up_to_date_and_idle(&recovered));
    }

    #[test]
    fn shutdown_cancels_timers_and_drops_pending() {
        let mut coordinator = coordinator_at(Checkpoint::EMPTY);
        let twin = twin_at(1);
        coordinator.request_snapshot(protected(1), &twin);
        coordinator.request_snapshot(protected(2), &twin);

        let effects = coordinator.shutdown();
        assert_eq!(
            effects,
            vec![Effect::CancelSaveTimeout, Effect::CancelMaintenance]
        );
        assert!(!coordinator.is_in_progress());
        assert_eq!(coordinator.deferred_len(), 0);
    }
}
