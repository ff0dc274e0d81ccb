//! In-process snapshot store and journal.
//!
//! Used by tests and by the engine when no database is configured. Failure
//! and latency can be injected at runtime to exercise the timeout and
//! rollback paths.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use twin_types::{EntityId, JournalEntry, SequenceNr, SnapshotRecord, SnapshotTag, TwinEvent};

use crate::error::StoreError;
use crate::store::{EventJournal, SnapshotStore};

#[derive(Debug, Default)]
struct Inner {
    snapshots: BTreeMap<(EntityId, SequenceNr), (SnapshotTag, SnapshotRecord)>,
    journal: BTreeMap<EntityId, BTreeMap<SequenceNr, JournalEntry>>,
}

/// Snapshot store and event journal backed by in-memory maps.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    fail_saves: AtomicBool,
    fail_deletes: AtomicBool,
    save_delay_ms: AtomicU64,
    load_delay_ms: AtomicU64,
    save_calls: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent save fail (or succeed again).
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::Relaxed);
    }

    /// Make every subsequent delete fail (or succeed again).
    pub fn set_fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::Relaxed);
    }

    /// Delay every subsequent save by `delay` before it is applied.
    pub fn set_save_delay(&self, delay: Duration) {
        let ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.save_delay_ms.store(ms, Ordering::Relaxed);
    }

    /// Delay every subsequent snapshot load by `delay`.
    pub fn set_load_delay(&self, delay: Duration) {
        let ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.load_delay_ms.store(ms, Ordering::Relaxed);
    }

    /// Number of save calls received so far, including failed ones.
    pub fn save_calls(&self) -> u64 {
        self.save_calls.load(Ordering::Relaxed)
    }

    /// Sequence numbers of the stored snapshots for `entity_id`, ascending.
    pub async fn snapshot_sequence_nrs(&self, entity_id: EntityId) -> Vec<SequenceNr> {
        let inner = self.inner.lock().await;
        inner
            .snapshots
            .keys()
            .filter(|(id, _)| *id == entity_id)
            .map(|(_, sequence_nr)| *sequence_nr)
            .collect()
    }

    /// Tag of the stored snapshot at `sequence_nr`, if present.
    pub async fn snapshot_tag(
        &self,
        entity_id: EntityId,
        sequence_nr: SequenceNr,
    ) -> Option<SnapshotTag> {
        let inner = self.inner.lock().await;
        inner
            .snapshots
            .get(&(entity_id, sequence_nr))
            .map(|(tag, _)| *tag)
    }

    /// Sequence numbers of the journal events for `entity_id`, ascending.
    pub async fn journal_sequence_nrs(&self, entity_id: EntityId) -> Vec<SequenceNr> {
        let inner = self.inner.lock().await;
        inner
            .journal
            .get(&entity_id)
            .map(|events| events.keys().copied().collect())
            .unwrap_or_default()
    }

    fn delete_guard(&self) -> Result<(), StoreError> {
        if self.fail_deletes.load(Ordering::Relaxed) {
            Err(StoreError::Unavailable {
                message: "injected delete failure".to_owned(),
            })
        } else {
            Ok(())
        }
    }
}

impl SnapshotStore for MemoryStore {
    async fn save_snapshot(
        &self,
        entity_id: EntityId,
        sequence_nr: SequenceNr,
        tag: SnapshotTag,
        payload: serde_json::Value,
    ) -> Result<SequenceNr, StoreError> {
        self.save_calls.fetch_add(1, Ordering::Relaxed);

        let delay_ms = self.save_delay_ms.load(Ordering::Relaxed);
        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }

        if self.fail_saves.load(Ordering::Relaxed) {
            return Err(StoreError::Backend {
                message: "injected save failure".to_owned(),
            });
        }

        let record = SnapshotRecord {
            entity_id,
            sequence_nr,
            payload,
            created_at: Utc::now(),
        };
        let mut inner = self.inner.lock().await;
        inner.snapshots.insert((entity_id, sequence_nr), (tag, record));
        Ok(sequence_nr)
    }

    async fn load_snapshot(
        &self,
        entity_id: EntityId,
        up_to: SequenceNr,
    ) -> Result<Option<SnapshotRecord>, StoreError> {
        let delay_ms = self.load_delay_ms.load(Ordering::Relaxed);
        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }

        let inner = self.inner.lock().await;
        Ok(inner
            .snapshots
            .range((entity_id, 0)..=(entity_id, up_to))
            .next_back()
            .map(|(_, (_, record))| record.clone()))
    }

    async fn delete_snapshot(
        &self,
        entity_id: EntityId,
        sequence_nr: SequenceNr,
    ) -> Result<(), StoreError> {
        self.delete_guard()?;
        let mut inner = self.inner.lock().await;
        inner.snapshots.remove(&(entity_id, sequence_nr));
        Ok(())
    }
}

impl EventJournal for MemoryStore {
    async fn append(
        &self,
        entity_id: EntityId,
        sequence_nr: SequenceNr,
        event: &TwinEvent,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let events = inner.journal.entry(entity_id).or_default();
        if events.contains_key(&sequence_nr) {
            return Err(StoreError::Backend {
                message: format!("event {sequence_nr} already exists for entity {entity_id}"),
            });
        }
        events.insert(
            sequence_nr,
            JournalEntry {
                entity_id,
                sequence_nr,
                event: event.clone(),
                created_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn read_from(
        &self,
        entity_id: EntityId,
        after: SequenceNr,
    ) -> Result<Vec<JournalEntry>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .journal
            .get(&entity_id)
            .map(|events| {
                events
                    .iter()
                    .filter(|(sequence_nr, _)| **sequence_nr > after)
                    .map(|(_, entry)| entry.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete_events(&self, entity_id: EntityId, up_to: SequenceNr) -> Result<(), StoreError> {
        self.delete_guard()?;
        let mut inner = self.inner.lock().await;
        if let Some(events) = inner.journal.get_mut(&entity_id) {
            events.retain(|sequence_nr, _| *sequence_nr > up_to);
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn load_returns_newest_at_or_below_bound() {
        let store = MemoryStore::new();
        let entity_id = EntityId::new();
        for sequence_nr in [2, 5, 9] {
            store
                .save_snapshot(
                    entity_id,
                    sequence_nr,
                    SnapshotTag::Unprotected,
                    serde_json::json!({ "n": sequence_nr }),
                )
                .await
                .unwrap();
        }

        let loaded = store.load_snapshot(entity_id, 8).await.unwrap().unwrap();
        assert_eq!(loaded.sequence_nr, 5);
        let newest = store
            .load_snapshot(entity_id, SequenceNr::MAX)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(newest.sequence_nr, 9);
        assert!(store.load_snapshot(entity_id, 1).await.unwrap().is_none());
        assert!(
            store
                .load_snapshot(EntityId::new(), SequenceNr::MAX)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn journal_rejects_duplicate_sequence_nr() {
        let store = MemoryStore::new();
        let entity_id = EntityId::new();
        store.append(entity_id, 1, &TwinEvent::Deleted).await.unwrap();
        assert!(store.append(entity_id, 1, &TwinEvent::Deleted).await.is_err());
    }

    #[tokio::test]
    async fn delete_events_keeps_later_entries() {
        let store = MemoryStore::new();
        let entity_id = EntityId::new();
        for sequence_nr in 1..=4 {
            store
                .append(
                    entity_id,
                    sequence_nr,
                    &TwinEvent::AttributeDeleted {
                        key: "k".to_owned(),
                    },
                )
                .await
                .unwrap();
        }

        store.delete_events(entity_id, 2).await.unwrap();
        assert_eq!(store.journal_sequence_nrs(entity_id).await, vec![3, 4]);
        let tail = store.read_from(entity_id, 3).await.unwrap();
        assert_eq!(tail.len(), 1);
    }

    #[tokio::test]
    async fn injected_failures_surface_as_errors() {
        let store = MemoryStore::new();
        let entity_id = EntityId::new();
        store.set_fail_saves(true);
        store.set_fail_deletes(true);

        assert!(
            store
                .save_snapshot(entity_id, 1, SnapshotTag::Protected, serde_json::Value::Null)
                .await
                .is_err()
        );
        assert!(store.delete_snapshot(entity_id, 1).await.is_err());
        assert_eq!(store.save_calls(), 1);
    }
}
