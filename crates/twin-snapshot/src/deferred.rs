//! FIFO buffer for snapshot requests that arrive while a save is in flight.
//!
//! Requests are kept verbatim and replayed in arrival order once the
//! in-flight attempt resolves. Replaying may start a new attempt, in which
//! case the remaining requests go straight back into the (fresh) queue and
//! wait for the next cycle.

use std::collections::VecDeque;

use crate::request::SnapshotRequest;

/// A request parked until the current attempt resolves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeferredRequest<R> {
    /// An external snapshot request.
    Requested(SnapshotRequest<R>),
    /// A maintenance tick that fired mid-attempt.
    MaintenanceTick,
}

/// FIFO queue of [`DeferredRequest`]s.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeferredRequestQueue<R> {
    pending: VecDeque<DeferredRequest<R>>,
}

impl<R> Default for DeferredRequestQueue<R> {
    fn default() -> Self {
        Self {
            pending: VecDeque::new(),
        }
    }
}

impl<R> DeferredRequestQueue<R> {
    /// Create an empty queue.
    pub const fn new() -> Self {
        Self {
            pending: VecDeque::new(),
        }
    }

    /// Append a request at the back.
    pub fn enqueue(&mut self, request: DeferredRequest<R>) {
        self.pending.push_back(request);
    }

    /// Number of buffered requests.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Return `true` if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Hand every buffered request to `replay`, oldest first, leaving the
    /// queue empty.
    pub fn drain_into<F>(self, mut replay: F)
    where
        F: FnMut(DeferredRequest<R>),
    {
        for request in self.pending {
            replay(request);
        }
    }
}
