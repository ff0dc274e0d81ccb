//! Snapshot lifecycle management for event-sourced twin entities.
//!
//! Each entity is owned by an [`EntityWorker`] that serializes every input
//! through one mailbox. The worker delegates all snapshot decisions to a
//! pure [`SnapshotCoordinator`], which decides when to save, answers
//! requesters, enforces a single in-flight save per entity, and proposes
//! retention deletes after each confirmed save.
//!
//! # Modules
//!
//! - [`config`] -- The `snapshot` section of `twin-config.yaml`.
//! - [`coordinator`] -- The state machine: events in, effects out.
//! - [`deferred`] -- FIFO of requests waiting for the in-flight save.
//! - [`error`] -- Store errors, snapshot failures, and [`EntityUnavailable`].
//! - [`maintenance`] -- Recurring maintenance snapshot scheduling.
//! - [`memory`] -- In-process store used by tests and local runs.
//! - [`recovery`] -- Snapshot load and journal replay at startup.
//! - [`request`] -- Snapshot requests, contexts, and replies.
//! - [`retention`] -- Which superseded snapshots and events to delete.
//! - [`store`] -- [`SnapshotStore`] and [`EventJournal`] traits.
//! - [`timer`] -- Cancellable timers that deliver into a mailbox.
//! - [`worker`] -- The tokio task hosting one entity.

pub mod config;
pub mod coordinator;
pub mod deferred;
pub mod error;
pub mod maintenance;
pub mod memory;
pub mod recovery;
pub mod request;
pub mod retention;
pub mod store;
pub mod timer;
pub mod worker;

pub use config::SnapshotConfig;
pub use coordinator::{CoordinatorEvent, DeleteOutcome, Effect, EntityView, SnapshotCoordinator};
pub use error::{EntityUnavailable, SnapshotFailure, StoreError, WorkerError};
pub use memory::MemoryStore;
pub use request::{RequestContext, SnapshotReply, SnapshotRequest};
pub use store::{EventJournal, SnapshotStore};
pub use worker::{EntityWorker, WorkerHandle, WorkerStatus};
