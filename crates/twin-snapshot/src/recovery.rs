//! Startup recovery: newest snapshot plus journal replay.
//!
//! A failed or slow snapshot load is not fatal. The worker falls back to
//! replaying the full journal from an empty twin, which is slower but
//! yields the same state.

use std::time::Duration;

use tracing::{debug, info, warn};
use twin_types::{EntityId, SequenceNr, SnapshotRecord, TaggedSnapshot, Twin};

use crate::coordinator::SnapshotCoordinator;
use crate::error::StoreError;
use crate::store::{EventJournal, SnapshotStore};

/// Load the newest snapshot at or below `up_to`, giving up after `timeout`.
///
/// Store errors and timeouts are logged and reported as `None`.
pub async fn load_checkpoint<S: SnapshotStore>(
    store: &S,
    entity_id: EntityId,
    up_to: SequenceNr,
    timeout: Duration,
) -> Option<SnapshotRecord> {
    match tokio::time::timeout(timeout, store.load_snapshot(entity_id, up_to)).await {
        Ok(Ok(Some(record))) => {
            debug!(
                %entity_id,
                sequence_nr = record.sequence_nr,
                "Loaded snapshot"
            );
            Some(record)
        }
        Ok(Ok(None)) => {
            debug!(%entity_id, sequence_nr = up_to, "No snapshot found");
            None
        }
        Ok(Err(e)) => {
            warn!(
                %entity_id,
                sequence_nr = up_to,
                error = %e,
                "Failed to load snapshot, replaying journal from the start"
            );
            None
        }
        Err(_) => {
            warn!(
                %entity_id,
                sequence_nr = up_to,
                timeout_ms = timeout.as_millis(),
                "Snapshot load timed out, replaying journal from the start"
            );
            None
        }
    }
}

/// Decode the tagged twin carried by a snapshot record.
///
/// # Errors
///
/// Returns the deserializer error if the payload is not a tagged twin.
pub fn decode_offer(record: &SnapshotRecord) -> Result<TaggedSnapshot, serde_json::Error> {
    serde_json::from_value(record.payload.clone())
}

/// Rebuild the twin for `entity_id` and seed `coordinator` with its checkpoint.
///
/// # Errors
///
/// Returns [`StoreError`] if the journal cannot be read or a journal event
/// cannot be applied.
pub async fn recover<S, R>(
    store: &S,
    coordinator: &mut SnapshotCoordinator<R>,
    timeout: Duration,
) -> Result<Twin, StoreError>
where
    S: SnapshotStore + EventJournal,
{
    let entity_id = coordinator.entity_id();

    let mut twin = match load_checkpoint(store, entity_id, SequenceNr::MAX, timeout).await {
        Some(record) => match coordinator.recover_from_offer(&record) {
            Ok(twin) => twin,
            Err(e) => {
                warn!(
                    %entity_id,
                    sequence_nr = record.sequence_nr,
                    error = %e,
                    "Snapshot payload is unreadable, replaying journal from the start"
                );
                Twin::new(entity_id)
            }
        },
        None => Twin::new(entity_id),
    };

    let events = store.read_from(entity_id, twin.revision).await?;
    let replayed = events.len();
    for entry in events {
        let applied = twin.apply(&entry.event).map_err(|e| StoreError::Backend {
            message: format!("journal replay failed at {}: {e}", entry.sequence_nr),
        })?;
        if applied != entry.sequence_nr {
            return Err(StoreError::Backend {
                message: format!(
                    "journal gap for entity {entity_id}: expected {applied}, found {}",
                    entry.sequence_nr
                ),
            });
        }
    }

    info!(
        %entity_id,
        sequence_nr = twin.revision,
        checkpoint = coordinator.latest_checkpoint_sequence_nr(),
        replayed,
        "Entity recovered"
    );
    Ok(twin)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use twin_types::{Checkpoint, SnapshotTag, TwinEvent};

    use super::*;
    use crate::config::SnapshotConfig;
    use crate::coordinator::EntityView;
    use crate::memory::MemoryStore;

    fn modify(key: &str) -> TwinEvent {
        TwinEvent::AttributeModified {
            key: key.to_owned(),
            value: serde_json::json!(key),
        }
    }

    #[tokio::test]
    async fn replays_journal_after_snapshot() {
        let store = MemoryStore::new();
        let entity_id = EntityId::new();

        let mut twin = Twin::new(entity_id);
        for (key, expected) in [("a", 1), ("b", 2), ("c", 3), ("d", 4)] {
            let event = modify(key);
            let sequence_nr = twin.apply(&event).unwrap();
            assert_eq!(sequence_nr, expected);
            store.append(entity_id, sequence_nr, &event).await.unwrap();
            if sequence_nr == 2 {
                let payload = twin.snapshot_payload(SnapshotTag::Protected).unwrap();
                store
                    .save_snapshot(entity_id, 2, SnapshotTag::Protected, payload)
                    .await
                    .unwrap();
            }
        }

        let mut coordinator: SnapshotCoordinator<()> =
            SnapshotCoordinator::new(entity_id, SnapshotConfig::default());
        let recovered = recover(&store, &mut coordinator, Duration::from_secs(3))
            .await
            .unwrap();

        assert_eq!(recovered.revision, 4);
        assert_eq!(recovered.attributes.len(), 4);
        assert_eq!(
            coordinator.checkpoint(),
            Checkpoint::new(2, SnapshotTag::Protected)
        );
    }

    #[tokio::test]
    async fn empty_store_yields_fresh_twin() {
        let store = MemoryStore::new();
        let entity_id = EntityId::new();
        let mut coordinator: SnapshotCoordinator<()> =
            SnapshotCoordinator::new(entity_id, SnapshotConfig::default());

        let twin = recover(&store, &mut coordinator, Duration::from_secs(3))
            .await
            .unwrap();
        assert_eq!(twin.revision, 0);
        assert_eq!(coordinator.checkpoint(), Checkpoint::EMPTY);
    }

    #[tokio::test]
    async fn untagged_offer_defaults_to_unprotected() {
        let entity_id = EntityId::new();
        let record = SnapshotRecord {
            entity_id,
            sequence_nr: 3,
            payload: serde_json::json!({ "entity": Twin::new(entity_id) }),
            created_at: chrono::Utc::now(),
        };

        let offer = decode_offer(&record).unwrap();
        assert_eq!(offer.tag_or_default(), SnapshotTag::Unprotected);
    }
}
