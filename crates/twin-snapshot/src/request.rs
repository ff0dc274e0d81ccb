//! Snapshot requests and replies.
//!
//! The requester is an opaque reply handle chosen by the runtime that hosts
//! the coordinator (a oneshot sender in [`crate::worker`], a plain value in
//! tests). The coordinator never inspects it; it only hands it back inside
//! an [`Effect::Reply`](crate::coordinator::Effect::Reply).

use std::collections::BTreeMap;

use twin_types::{CorrelationId, SequenceNr, SnapshotTag};

use crate::error::EntityUnavailable;

/// Caller metadata carried through a snapshot cycle and echoed in the reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    /// Correlation ID supplied by the caller.
    pub correlation_id: Option<CorrelationId>,
    /// Free-form headers from the originating command.
    pub headers: BTreeMap<String, String>,
}

impl RequestContext {
    /// A context carrying only a correlation ID.
    pub const fn correlated(correlation_id: CorrelationId) -> Self {
        Self {
            correlation_id: Some(correlation_id),
            headers: BTreeMap::new(),
        }
    }
}

/// A request to snapshot the entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRequest<R> {
    /// Requested protection status.
    pub tag: SnapshotTag,
    /// Where to send the reply; `None` means nobody is waiting.
    pub requester: Option<R>,
    /// Caller metadata echoed in the reply.
    pub context: Option<RequestContext>,
    /// Answer with the current checkpoint without saving.
    pub dry_run: bool,
}

impl<R> SnapshotRequest<R> {
    /// A protected, non-dry-run request with a reply handle.
    pub const fn protected(requester: R, context: Option<RequestContext>) -> Self {
        Self {
            tag: SnapshotTag::Protected,
            requester: Some(requester),
            context,
            dry_run: false,
        }
    }

    /// Turn this request into a dry run.
    #[must_use]
    pub const fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }
}

/// The answer delivered to a requester.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotReply {
    /// Context from the request.
    pub context: Option<RequestContext>,
    /// Sequence number of the satisfying snapshot, or why there is none.
    pub outcome: Result<SequenceNr, EntityUnavailable>,
}
