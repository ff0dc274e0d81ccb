//! Wire types for commands exchanged over the broker bridge.
//!
//! External callers send [`TakeSnapshot`] or [`ModifyTwin`]; the engine
//! answers with the matching response or an [`ErrorResponse`].

use serde::{Deserialize, Serialize};

use crate::ids::{CorrelationId, EntityId};
use crate::snapshot::SequenceNr;
use crate::twin::TwinEvent;

/// Request to take a protected snapshot of one entity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TakeSnapshot {
    /// Answer with the current checkpoint without saving anything.
    #[serde(default)]
    pub dry_run: bool,
    /// Echoed back in the response.
    #[serde(default)]
    pub correlation_id: Option<CorrelationId>,
}

/// Successful answer to [`TakeSnapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TakeSnapshotResponse {
    /// The snapshotted entity.
    pub entity_id: EntityId,
    /// Sequence number of the snapshot that satisfies the request.
    pub sequence_nr: SequenceNr,
    /// Correlation ID from the request, if any.
    #[serde(default)]
    pub correlation_id: Option<CorrelationId>,
}

/// Request to apply one event to a twin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModifyTwin {
    /// The event to journal and apply.
    pub event: TwinEvent,
    /// Echoed back in the response.
    #[serde(default)]
    pub correlation_id: Option<CorrelationId>,
}

/// Successful answer to [`ModifyTwin`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModifyTwinResponse {
    /// The modified entity.
    pub entity_id: EntityId,
    /// Revision after the event was applied.
    pub sequence_nr: SequenceNr,
    /// Correlation ID from the request, if any.
    #[serde(default)]
    pub correlation_id: Option<CorrelationId>,
}

/// Failure answer to any command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// The entity the request targeted.
    pub entity_id: EntityId,
    /// Machine-readable error code.
    pub error: String,
    /// Human-readable description.
    pub message: String,
    /// Correlation ID from the request, if any.
    #[serde(default)]
    pub correlation_id: Option<CorrelationId>,
}
