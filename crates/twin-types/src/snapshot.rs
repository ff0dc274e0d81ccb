//! Snapshot bookkeeping types.
//!
//! A [`Checkpoint`] is the last snapshot an entity worker believes to be
//! durably stored. It is a small `Copy` value that is replaced wholesale on
//! every transition and never mutated in place.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::EntityId;
use crate::twin::Twin;

/// Position of an event in an entity's journal.
///
/// Sequence numbers start at 1 for the first event; 0 means "no events yet"
/// and is also the sequence number of the empty checkpoint.
pub type SequenceNr = u64;

/// Whether a snapshot must survive retention.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotTag {
    /// Explicitly requested; never deleted by retention.
    Protected,
    /// Taken for maintenance/compaction; deletable once superseded.
    #[default]
    Unprotected,
}

impl SnapshotTag {
    /// Return `true` for [`SnapshotTag::Protected`].
    pub const fn is_protected(self) -> bool {
        matches!(self, Self::Protected)
    }

    /// Stable lowercase name, used as the database column value.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Protected => "protected",
            Self::Unprotected => "unprotected",
        }
    }

    /// Parse the database column value. Unknown values map to
    /// [`SnapshotTag::Unprotected`].
    pub fn from_db(value: &str) -> Self {
        if value == "protected" {
            Self::Protected
        } else {
            Self::Unprotected
        }
    }
}

impl core::fmt::Display for SnapshotTag {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The last snapshot believed to be durably stored for one entity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Sequence number the snapshot was taken at.
    pub sequence_nr: SequenceNr,
    /// Protection status of the snapshot.
    pub tag: SnapshotTag,
}

impl Checkpoint {
    /// Checkpoint of an entity that has never been snapshotted.
    pub const EMPTY: Self = Self {
        sequence_nr: 0,
        tag: SnapshotTag::Unprotected,
    };

    /// Create a checkpoint value.
    pub const fn new(sequence_nr: SequenceNr, tag: SnapshotTag) -> Self {
        Self { sequence_nr, tag }
    }

    /// Return `true` if this checkpoint is protected.
    pub const fn is_protected(&self) -> bool {
        self.tag.is_protected()
    }
}

/// Payload written to the snapshot store: the entity plus its tag.
///
/// Older payloads may carry no tag; those recover as
/// [`SnapshotTag::Unprotected`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaggedSnapshot {
    /// The entity state at the snapshot's sequence number.
    pub entity: Twin,
    /// Protection status the snapshot was saved with.
    #[serde(default)]
    pub tag: Option<SnapshotTag>,
}

impl TaggedSnapshot {
    /// Wrap an entity with its tag.
    pub const fn new(entity: Twin, tag: SnapshotTag) -> Self {
        Self {
            entity,
            tag: Some(tag),
        }
    }

    /// The effective tag, defaulting to unprotected.
    pub fn tag_or_default(&self) -> SnapshotTag {
        self.tag.unwrap_or_default()
    }
}

/// A snapshot as returned by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    /// The entity the snapshot belongs to.
    pub entity_id: EntityId,
    /// Sequence number the snapshot was taken at.
    pub sequence_nr: SequenceNr,
    /// Serialized [`TaggedSnapshot`].
    pub payload: serde_json::Value,
    /// When the store accepted the snapshot.
    pub created_at: DateTime<Utc>,
}
