//! `PostgreSQL` persistence for the twin platform.
//!
//! Provides the durable [`SnapshotStore`](twin_snapshot::SnapshotStore) and
//! [`EventJournal`](twin_snapshot::EventJournal) used by entity workers.
//!
//! ```text
//! EntityWorker
//!     |
//!     +-- save / load / delete snapshot --> twin_snapshots (SnapshotRepo)
//!     +-- append / replay / prune events -> twin_journal   (JournalRepo)
//! ```
//!
//! # Modules
//!
//! - [`postgres`] -- Connection pool, configuration, and migrations
//! - [`snapshot_store`] -- Rows and queries for `twin_snapshots`
//! - [`event_store`] -- Rows and queries for `twin_journal`
//! - [`pg_store`] -- Store trait implementations over both tables
//! - [`error`] -- Shared error types

pub mod error;
pub mod event_store;
pub mod pg_store;
pub mod postgres;
pub mod snapshot_store;

pub use error::DbError;
pub use event_store::{JournalRepo, JournalRow};
pub use pg_store::PgStore;
pub use postgres::{PostgresConfig, PostgresPool};
pub use snapshot_store::{SnapshotRepo, SnapshotRow};
