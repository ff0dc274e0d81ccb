//! Retention policy for superseded snapshots and journal events.
//!
//! After a save is confirmed, [`decide`] proposes what may be deleted. It is
//! a pure function; the coordinator turns its answer into best-effort
//! delete calls whose failures are logged and never retried.
//!
//! Rules:
//!
//! - The previous snapshot is a deletion candidate only if it is
//!   unprotected, non-empty (`sequence_nr > 0`), and not the snapshot that
//!   was just overwritten at the same sequence number.
//! - Journal events up to `confirmed - 1` are deletion candidates. The
//!   newest event stays, because journal readers that never consult
//!   snapshots still need it.

use twin_types::{Checkpoint, SequenceNr};

use crate::config::SnapshotConfig;

/// What retention allows to be deleted after a confirmed save.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionDecision {
    /// Sequence number of the snapshot to delete, if any.
    pub delete_snapshot: Option<SequenceNr>,
    /// Delete journal events up to and including this sequence number.
    pub delete_events_up_to: Option<SequenceNr>,
}

impl RetentionDecision {
    /// Return `true` if nothing is to be deleted.
    pub const fn is_empty(&self) -> bool {
        self.delete_snapshot.is_none() && self.delete_events_up_to.is_none()
    }
}

/// Decide what may be deleted once `confirmed` supersedes `previous`.
pub fn decide(
    previous: Checkpoint,
    confirmed: Checkpoint,
    config: &SnapshotConfig,
) -> RetentionDecision {
    RetentionDecision {
        delete_snapshot: snapshot_candidate(previous, confirmed, config),
        delete_events_up_to: events_candidate(confirmed, config),
    }
}

/// Whether an orphaned snapshot from a stale save may be deleted.
///
/// The orphan is never the live checkpoint, so only the configuration flag
/// and the non-empty check apply.
pub const fn orphan_deletable(
    orphan: SequenceNr,
    checkpoint: Checkpoint,
    config: &SnapshotConfig,
) -> bool {
    config.delete_old_snapshots && orphan > 0 && orphan != checkpoint.sequence_nr
}

fn snapshot_candidate(
    previous: Checkpoint,
    confirmed: Checkpoint,
    config: &SnapshotConfig,
) -> Option<SequenceNr> {
    let deletable = config.delete_old_snapshots
        && previous.sequence_nr > 0
        && !previous.is_protected()
        && previous.sequence_nr != confirmed.sequence_nr;
    deletable.then_some(previous.sequence_nr)
}

fn events_candidate(confirmed: Checkpoint, config: &SnapshotConfig) -> Option<SequenceNr> {
    if !config.delete_old_events {
        return None;
    }
    confirmed
        .sequence_nr
        .checked_sub(1)
        .filter(|up_to| *up_to > 0)
}
