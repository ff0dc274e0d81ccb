//! [`SnapshotStore`] and [`EventJournal`] backed by `PostgreSQL`.

use twin_snapshot::{EventJournal, SnapshotStore, StoreError};
use twin_types::{EntityId, JournalEntry, SequenceNr, SnapshotRecord, SnapshotTag, TwinEvent};

use crate::event_store::JournalRepo;
use crate::postgres::PostgresPool;
use crate::snapshot_store::{SnapshotRepo, SnapshotRow};

/// Durable store used by entity workers in production.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PostgresPool,
}

impl PgStore {
    /// Wrap a connected pool.
    pub const fn new(pool: PostgresPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    pub const fn pool(&self) -> &PostgresPool {
        &self.pool
    }

    fn snapshots(&self) -> SnapshotRepo<'_> {
        SnapshotRepo::new(self.pool.pool())
    }

    fn journal(&self) -> JournalRepo<'_> {
        JournalRepo::new(self.pool.pool())
    }
}

impl SnapshotStore for PgStore {
    async fn save_snapshot(
        &self,
        entity_id: EntityId,
        sequence_nr: SequenceNr,
        tag: SnapshotTag,
        payload: serde_json::Value,
    ) -> Result<SequenceNr, StoreError> {
        self.snapshots()
            .upsert(entity_id, sequence_nr, tag, &payload)
            .await?;
        Ok(sequence_nr)
    }

    async fn load_snapshot(
        &self,
        entity_id: EntityId,
        up_to: SequenceNr,
    ) -> Result<Option<SnapshotRecord>, StoreError> {
        let row = self.snapshots().latest_up_to(entity_id, up_to).await?;
        Ok(row.map(SnapshotRow::into_record).transpose()?)
    }

    async fn delete_snapshot(
        &self,
        entity_id: EntityId,
        sequence_nr: SequenceNr,
    ) -> Result<(), StoreError> {
        self.snapshots().delete(entity_id, sequence_nr).await?;
        Ok(())
    }
}

impl EventJournal for PgStore {
    async fn append(
        &self,
        entity_id: EntityId,
        sequence_nr: SequenceNr,
        event: &TwinEvent,
    ) -> Result<(), StoreError> {
        Ok(self.journal().append(entity_id, sequence_nr, event).await?)
    }

    async fn read_from(
        &self,
        entity_id: EntityId,
        after: SequenceNr,
    ) -> Result<Vec<JournalEntry>, StoreError> {
        Ok(self.journal().read_from(entity_id, after).await?)
    }

    async fn delete_events(&self, entity_id: EntityId, up_to: SequenceNr) -> Result<(), StoreError> {
        self.journal().delete_up_to(entity_id, up_to).await?;
        Ok(())
    }
}
