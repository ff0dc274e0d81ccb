//! Persistence seams used by the entity worker.
//!
//! Implementations live elsewhere: [`MemoryStore`](crate::memory::MemoryStore)
//! for tests and local runs, and the `PostgreSQL` store in `twin-db`.

use std::future::Future;

use twin_types::{EntityId, JournalEntry, SequenceNr, SnapshotRecord, SnapshotTag, TwinEvent};

use crate::error::StoreError;

/// Durable storage for entity snapshots.
///
/// Saves at an existing `(entity_id, sequence_nr)` overwrite the stored
/// payload, so a retried save is idempotent.
pub trait SnapshotStore: Send + Sync + 'static {
    /// Persist a snapshot and return the acknowledged sequence number.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the snapshot could not be written.
    fn save_snapshot(
        &self,
        entity_id: EntityId,
        sequence_nr: SequenceNr,
        tag: SnapshotTag,
        payload: serde_json::Value,
    ) -> impl Future<Output = Result<SequenceNr, StoreError>> + Send;

    /// Load the newest snapshot at or below `up_to`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store could not be queried.
    fn load_snapshot(
        &self,
        entity_id: EntityId,
        up_to: SequenceNr,
    ) -> impl Future<Output = Result<Option<SnapshotRecord>, StoreError>> + Send;

    /// Delete the snapshot at exactly `sequence_nr`. Deleting a missing
    /// snapshot is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the delete could not be executed.
    fn delete_snapshot(
        &self,
        entity_id: EntityId,
        sequence_nr: SequenceNr,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// Append-only event log per entity.
pub trait EventJournal: Send + Sync + 'static {
    /// Append one event at `sequence_nr`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the event could not be written, including
    /// when an event already exists at that sequence number.
    fn append(
        &self,
        entity_id: EntityId,
        sequence_nr: SequenceNr,
        event: &TwinEvent,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// All events with a sequence number greater than `after`, in order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the journal could not be read.
    fn read_from(
        &self,
        entity_id: EntityId,
        after: SequenceNr,
    ) -> impl Future<Output = Result<Vec<JournalEntry>, StoreError>> + Send;

    /// Delete events up to and including `up_to`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the delete could not be executed.
    fn delete_events(
        &self,
        entity_id: EntityId,
        up_to: SequenceNr,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}
