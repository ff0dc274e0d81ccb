//! Journal persistence in the `twin_journal` table.
//!
//! Events are the source of truth for each twin. The primary key on
//! `(entity_id, sequence_nr)` rejects a second write at the same position,
//! which is how concurrent writers for one entity are detected.

use sqlx::PgPool;
use twin_types::{EntityId, JournalEntry, SequenceNr, TwinEvent};
use uuid::Uuid;

use crate::error::DbError;
use crate::snapshot_store::{from_db, to_db};

/// Operations on the `twin_journal` table.
pub struct JournalRepo<'a> {
    pool: &'a PgPool,
}

impl<'a> JournalRepo<'a> {
    /// Create a new journal repository bound to a connection pool.
    pub const fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    /// Append one event.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Serialization`] if the event cannot be encoded, or
    /// [`DbError::Postgres`] if the insert fails (including a duplicate
    /// sequence number).
    pub async fn append(
        &self,
        entity_id: EntityId,
        sequence_nr: SequenceNr,
        event: &TwinEvent,
    ) -> Result<(), DbError> {
        let payload = serde_json::to_value(event)?;
        sqlx::query(
            r"INSERT INTO twin_journal (entity_id, sequence_nr, event)
              VALUES ($1, $2, $3)",
        )
        .bind(entity_id.into_inner())
        .bind(to_db(sequence_nr))
        .bind(payload)
        .execute(self.pool)
        .await?;

        Ok(())
    }

    /// Events strictly after `after`, ordered by sequence number.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the query fails, or
    /// [`DbError::Serialization`] / [`DbError::InvalidRow`] if a row cannot
    /// be decoded.
    pub async fn read_from(
        &self,
        entity_id: EntityId,
        after: SequenceNr,
    ) -> Result<Vec<JournalEntry>, DbError> {
        let rows = sqlx::query_as::<_, JournalRow>(
            r"SELECT entity_id, sequence_nr, event, created_at
              FROM twin_journal
              WHERE entity_id = $1 AND sequence_nr > $2
              ORDER BY sequence_nr",
        )
        .bind(entity_id.into_inner())
        .bind(to_db(after))
        .fetch_all(self.pool)
        .await?;

        rows.into_iter().map(JournalRow::into_entry).collect()
    }

    /// Delete events up to and including `up_to`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the delete fails.
    pub async fn delete_up_to(&self, entity_id: EntityId, up_to: SequenceNr) -> Result<u64, DbError> {
        let result = sqlx::query(
            r"DELETE FROM twin_journal
              WHERE entity_id = $1 AND sequence_nr <= $2",
        )
        .bind(entity_id.into_inner())
        .bind(to_db(up_to))
        .execute(self.pool)
        .await?;

        tracing::debug!(
            %entity_id,
            up_to,
            deleted = result.rows_affected(),
            "Deleted journal events"
        );
        Ok(result.rows_affected())
    }
}

/// A row from the `twin_journal` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JournalRow {
    /// Owning entity.
    pub entity_id: Uuid,
    /// Position in the entity's journal.
    pub sequence_nr: i64,
    /// Serialized [`TwinEvent`].
    pub event: serde_json::Value,
    /// Real-world timestamp.
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl JournalRow {
    /// Decode into a journal entry.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Serialization`] if the event payload is not a
    /// [`TwinEvent`], or [`DbError::InvalidRow`] for a negative sequence
    /// number.
    pub fn into_entry(self) -> Result<JournalEntry, DbError> {
        Ok(JournalEntry {
            entity_id: EntityId::from(self.entity_id),
            sequence_nr: from_db(self.sequence_nr)?,
            event: serde_json::from_value(self.event)?,
            created_at: self.created_at,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn row_decodes_event() {
        let row = JournalRow {
            entity_id: Uuid::now_v7(),
            sequence_nr: 2,
            event: serde_json::json!({ "type": "attribute_deleted", "key": "temp" }),
            created_at: chrono::Utc::now(),
        };
        let entry = row.into_entry().unwrap();
        assert_eq!(entry.sequence_nr, 2);
        assert_eq!(
            entry.event,
            TwinEvent::AttributeDeleted {
                key: "temp".to_owned()
            }
        );
    }

    #[test]
    fn row_with_unknown_event_is_rejected() {
        let row = JournalRow {
            entity_id: Uuid::now_v7(),
            sequence_nr: 2,
            event: serde_json::json!({ "type": "teleported" }),
            created_at: chrono::Utc::now(),
        };
        assert!(matches!(row.into_entry(), Err(DbError::Serialization(_))));
    }
}
