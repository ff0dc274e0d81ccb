//! The digital twin entity and its journal events.
//!
//! A [`Twin`] is rebuilt by applying [`TwinEvent`]s in journal order. Each
//! applied event advances the revision by exactly one, so the revision is
//! always the sequence number of the last applied event.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::EntityId;
use crate::snapshot::SequenceNr;

/// Errors raised while applying an event to a twin.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TwinError {
    /// The twin was deleted; only a new `Created` event may follow.
    #[error("entity {entity_id} is deleted")]
    Deleted {
        /// The deleted entity.
        entity_id: EntityId,
    },

    /// The revision counter would overflow.
    #[error("revision overflow for entity {entity_id}")]
    RevisionOverflow {
        /// The entity whose revision overflowed.
        entity_id: EntityId,
    },
}

/// A journal event that mutates a twin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TwinEvent {
    /// The twin was created (or re-created after deletion).
    Created {
        /// Initial attributes.
        #[serde(default)]
        attributes: BTreeMap<String, serde_json::Value>,
    },
    /// A single attribute was set.
    AttributeModified {
        /// Attribute name.
        key: String,
        /// New value.
        value: serde_json::Value,
    },
    /// A single attribute was removed.
    AttributeDeleted {
        /// Attribute name.
        key: String,
    },
    /// The twin was deleted.
    Deleted,
}

/// A digital twin: the durable state of one device or thing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Twin {
    /// Entity identifier.
    pub id: EntityId,
    /// Sequence number of the last applied event (0 = no events).
    pub revision: SequenceNr,
    /// Current attribute values.
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
    /// Whether the twin has been deleted.
    #[serde(default)]
    pub deleted: bool,
    /// Time of the last applied event.
    #[serde(default)]
    pub modified_at: Option<DateTime<Utc>>,
}

impl Twin {
    /// An empty twin at revision 0.
    pub const fn new(id: EntityId) -> Self {
        Self {
            id,
            revision: 0,
            attributes: BTreeMap::new(),
            deleted: false,
            modified_at: None,
        }
    }

    /// Apply one event and return the new revision.
    ///
    /// # Errors
    ///
    /// Returns [`TwinError::Deleted`] when modifying a deleted twin, or
    /// [`TwinError::RevisionOverflow`] if the revision cannot advance.
    pub fn apply(&mut self, event: &TwinEvent) -> Result<SequenceNr, TwinError> {
        let next = self
            .revision
            .checked_add(1)
            .ok_or(TwinError::RevisionOverflow { entity_id: self.id })?;

        match event {
            TwinEvent::Created { attributes } => {
                self.attributes.clone_from(attributes);
                self.deleted = false;
            }
            TwinEvent::AttributeModified { key, value } => {
                self.ensure_live()?;
                self.attributes.insert(key.clone(), value.clone());
            }
            TwinEvent::AttributeDeleted { key } => {
                self.ensure_live()?;
                self.attributes.remove(key);
            }
            TwinEvent::Deleted => {
                self.ensure_live()?;
                self.attributes.clear();
                self.deleted = true;
            }
        }

        self.revision = next;
        self.modified_at = Some(Utc::now());
        Ok(next)
    }

    const fn ensure_live(&self) -> Result<(), TwinError> {
        if self.deleted {
            Err(TwinError::Deleted { entity_id: self.id })
        } else {
            Ok(())
        }
    }
}

/// One persisted journal event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// The entity the event belongs to.
    pub entity_id: EntityId,
    /// Position of the event in the entity's journal.
    pub sequence_nr: SequenceNr,
    /// The event itself.
    pub event: TwinEvent,
    /// When the event was appended.
    pub created_at: DateTime<Utc>,
}
