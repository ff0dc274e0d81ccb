//! Snapshot persistence in the `twin_snapshots` table.
//!
//! One row per `(entity_id, sequence_nr)`. Saves are upserts so that a
//! retried save at the same sequence number overwrites instead of failing.

use sqlx::PgPool;
use twin_types::{EntityId, SequenceNr, SnapshotRecord, SnapshotTag};
use uuid::Uuid;

use crate::error::DbError;

/// Operations on the `twin_snapshots` table.
pub struct SnapshotRepo<'a> {
    pool: &'a PgPool,
}

impl<'a> SnapshotRepo<'a> {
    /// Create a new snapshot repository bound to a connection pool.
    pub const fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    /// Insert or overwrite the snapshot at `sequence_nr`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the upsert fails.
    pub async fn upsert(
        &self,
        entity_id: EntityId,
        sequence_nr: SequenceNr,
        tag: SnapshotTag,
        payload: &serde_json::Value,
    ) -> Result<(), DbError> {
        sqlx::query(
            r"INSERT INTO twin_snapshots (entity_id, sequence_nr, tag, payload)
              VALUES ($1, $2, $3, $4)
              ON CONFLICT (entity_id, sequence_nr) DO UPDATE SET
                tag = EXCLUDED.tag,
                payload = EXCLUDED.payload,
                created_at = now()",
        )
        .bind(entity_id.into_inner())
        .bind(to_db(sequence_nr))
        .bind(tag.as_str())
        .bind(payload)
        .execute(self.pool)
        .await?;

        tracing::debug!(%entity_id, sequence_nr, %tag, "Upserted snapshot");
        Ok(())
    }

    /// Newest snapshot at or below `up_to`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the query fails, or
    /// [`DbError::InvalidRow`] if the stored sequence number is negative.
    pub async fn latest_up_to(
        &self,
        entity_id: EntityId,
        up_to: SequenceNr,
    ) -> Result<Option<SnapshotRow>, DbError> {
        let row = sqlx::query_as::<_, SnapshotRow>(
            r"SELECT entity_id, sequence_nr, tag, payload, created_at
              FROM twin_snapshots
              WHERE entity_id = $1 AND sequence_nr <= $2
              ORDER BY sequence_nr DESC
              LIMIT 1",
        )
        .bind(entity_id.into_inner())
        .bind(to_db(up_to))
        .fetch_optional(self.pool)
        .await?;

        Ok(row)
    }

    /// Delete the snapshot at exactly `sequence_nr`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the delete fails.
    pub async fn delete(&self, entity_id: EntityId, sequence_nr: SequenceNr) -> Result<u64, DbError> {
        let result = sqlx::query(
            r"DELETE FROM twin_snapshots
              WHERE entity_id = $1 AND sequence_nr = $2",
        )
        .bind(entity_id.into_inner())
        .bind(to_db(sequence_nr))
        .execute(self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// All stored sequence numbers for an entity, ascending.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the query fails, or
    /// [`DbError::InvalidRow`] if a stored sequence number is negative.
    pub async fn sequence_nrs(&self, entity_id: EntityId) -> Result<Vec<SequenceNr>, DbError> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            r"SELECT sequence_nr FROM twin_snapshots
              WHERE entity_id = $1
              ORDER BY sequence_nr",
        )
        .bind(entity_id.into_inner())
        .fetch_all(self.pool)
        .await?;

        rows.into_iter().map(|(n,)| from_db(n)).collect()
    }
}

/// A row from the `twin_snapshots` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SnapshotRow {
    /// Owning entity.
    pub entity_id: Uuid,
    /// Sequence number the snapshot was taken at.
    pub sequence_nr: i64,
    /// `protected` or `unprotected`.
    pub tag: String,
    /// Tagged twin payload.
    pub payload: serde_json::Value,
    /// When the row was last written.
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl SnapshotRow {
    /// The stored protection status.
    pub fn tag(&self) -> SnapshotTag {
        SnapshotTag::from_db(&self.tag)
    }

    /// Convert into the store-neutral record.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::InvalidRow`] if the sequence number is negative.
    pub fn into_record(self) -> Result<SnapshotRecord, DbError> {
        Ok(SnapshotRecord {
            entity_id: EntityId::from(self.entity_id),
            sequence_nr: from_db(self.sequence_nr)?,
            payload: self.payload,
            created_at: self.created_at,
        })
    }
}

/// Sequence numbers above `i64::MAX` are clamped; they never occur in
/// practice and a clamped upper bound still selects every row.
pub(crate) fn to_db(sequence_nr: SequenceNr) -> i64 {
    i64::try_from(sequence_nr).unwrap_or(i64::MAX)
}

pub(crate) fn from_db(sequence_nr: i64) -> Result<SequenceNr, DbError> {
    SequenceNr::try_from(sequence_nr)
        .map_err(|_negative| DbError::InvalidRow(format!("negative sequence_nr {sequence_nr}")))
}
