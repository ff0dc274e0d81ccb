//! Shared type definitions for the twin platform.
//!
//! This crate is the single source of truth for the value types that flow
//! between entity workers, the snapshot store, and the broker bridge.
//!
//! # Modules
//!
//! - [`ids`] -- Type-safe UUID wrappers for entity and request identifiers
//! - [`snapshot`] -- Sequence numbers, snapshot tags, checkpoints, and stored
//!   snapshot records
//! - [`twin`] -- The digital twin entity and the journal events that mutate it
//! - [`command`] -- Broker command and response wire types

pub mod command;
pub mod ids;
pub mod snapshot;
pub mod twin;

// Re-export all public types at crate root for convenience.
pub use command::{ErrorResponse, ModifyTwin, ModifyTwinResponse, TakeSnapshot, TakeSnapshotResponse};
pub use ids::{CorrelationId, EntityId};
pub use snapshot::{Checkpoint, SequenceNr, SnapshotRecord, SnapshotTag, TaggedSnapshot};
pub use twin::{JournalEntry, Twin, TwinError, TwinEvent};
