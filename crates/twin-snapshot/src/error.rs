//! Error types for the snapshot lifecycle.
//!
//! Store interaction errors never propagate out of the coordinator. The only
//! externally visible failure is [`EntityUnavailable`], sent to a requester
//! whose save failed or timed out.

use twin_types::{EntityId, SequenceNr, TwinError};

/// A failed call against the snapshot store or event journal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The backing database returned an error.
    #[error("store backend error: {message}")]
    Backend {
        /// Description of the backend failure.
        message: String,
    },

    /// A payload could not be serialized or deserialized.
    #[error("store serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// The store is not reachable.
    #[error("store unavailable: {message}")]
    Unavailable {
        /// Description of why the store is unavailable.
        message: String,
    },
}

impl From<serde_json::Error> for StoreError {
    fn from(source: serde_json::Error) -> Self {
        Self::Serialization {
            message: source.to_string(),
        }
    }
}

/// Classification of everything that can go wrong during a snapshot cycle.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SnapshotFailure {
    /// The store rejected or errored a save.
    #[error("{cause}")]
    StoreSaveFailure {
        /// Cause reported by the store.
        cause: String,
    },

    /// The store did not answer a save in time.
    #[error("the snapshot store failed to respond within {timeout_ms}ms")]
    StoreSaveTimeout {
        /// Sequence number of the timed out save.
        sequence_nr: SequenceNr,
        /// The configured deadline.
        timeout_ms: u64,
    },

    /// A response or timer no longer matches the live attempt.
    #[error("response for sequence number {sequence_nr} arrived out of order")]
    OutOfOrderResponse {
        /// Sequence number carried by the stale response.
        sequence_nr: SequenceNr,
    },

    /// A best-effort delete failed.
    #[error("best-effort delete failed: {cause}")]
    StoreDeleteFailure {
        /// Cause reported by the store.
        cause: String,
    },
}

/// The entity could not satisfy a snapshot request right now.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("entity {entity_id} is temporarily unavailable: {message}")]
pub struct EntityUnavailable {
    /// The affected entity.
    pub entity_id: EntityId,
    /// Human-readable description.
    pub message: String,
    /// What went wrong.
    pub cause: SnapshotFailure,
}

impl EntityUnavailable {
    /// Build the requester-facing error for a failed or timed out save.
    pub fn snapshot_failed(entity_id: EntityId, cause: SnapshotFailure) -> Self {
        let message = match &cause {
            SnapshotFailure::StoreSaveTimeout {
                sequence_nr,
                timeout_ms,
            } => format!(
                "Failed to save snapshot for entity <{entity_id}> with sequence number \
                 <{sequence_nr}>: the snapshot store failed to respond within {timeout_ms}ms"
            ),
            other => format!("Failed to save snapshot for entity <{entity_id}>. Cause: <{other}>"),
        };
        Self {
            entity_id,
            message,
            cause,
        }
    }

    /// Stable error code used on the wire.
    pub const fn code(&self) -> &'static str {
        match self.cause {
            SnapshotFailure::StoreSaveTimeout { .. } => "snapshot.timeout",
            _ => "entity.unavailable",
        }
    }
}

/// Errors returned by [`WorkerHandle`](crate::worker::WorkerHandle) calls.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkerError {
    /// The worker has stopped and no longer accepts messages.
    #[error("worker for entity {entity_id} has stopped")]
    Stopped {
        /// The entity whose worker is gone.
        entity_id: EntityId,
    },

    /// The snapshot request failed.
    #[error(transparent)]
    Unavailable(#[from] EntityUnavailable),

    /// The event could not be applied.
    #[error("event rejected: {0}")]
    Rejected(#[from] TwinError),

    /// The event could not be written to the journal.
    #[error("journal error: {0}")]
    Journal(#[from] StoreError),
}
