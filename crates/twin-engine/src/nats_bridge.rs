//! NATS request/reply bridge into entity workers.
//!
//! # Subject Convention
//!
//! - **Take snapshot:** `{prefix}.snapshot.take.{entity_id}` with a JSON
//!   [`TakeSnapshot`] body (an empty body means a plain request)
//! - **Modify twin:** `{prefix}.modify.{entity_id}` with a JSON
//!   [`ModifyTwin`] body
//!
//! Every request is answered on its reply subject with the matching JSON
//! response or an [`ErrorResponse`]. Snapshot requests arriving over the
//! broker are always protected.

use std::sync::Arc;

use futures::StreamExt as _;
use serde::Serialize;
use tracing::{debug, info, warn};
use twin_snapshot::{EventJournal, RequestContext, SnapshotStore, WorkerError};
use twin_types::{
    CorrelationId, EntityId, ErrorResponse, ModifyTwin, ModifyTwinResponse, SnapshotTag,
    TakeSnapshot, TakeSnapshotResponse,
};

use crate::error::EngineError;
use crate::registry::WorkerRegistry;

/// The command a subject addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// `{prefix}.snapshot.take.{entity_id}`
    TakeSnapshot,
    /// `{prefix}.modify.{entity_id}`
    Modify,
}

/// A parsed command subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    /// Which command.
    pub kind: CommandKind,
    /// Target entity.
    pub entity_id: EntityId,
}

impl Route {
    /// Parse `subject` under `prefix`. Returns `None` for anything that is
    /// not a well-formed command subject.
    pub fn parse(prefix: &str, subject: &str) -> Option<Self> {
        let rest = subject.strip_prefix(prefix)?.strip_prefix('.')?;
        let (kind, id) = if let Some(id) = rest.strip_prefix("snapshot.take.") {
            (CommandKind::TakeSnapshot, id)
        } else if let Some(id) = rest.strip_prefix("modify.") {
            (CommandKind::Modify, id)
        } else {
            return None;
        };
        let entity_id = id.parse().ok()?;
        Some(Self { kind, entity_id })
    }
}

/// Subscribes to command subjects and dispatches them to workers.
pub struct NatsBridge<S> {
    client: async_nats::Client,
    prefix: String,
    registry: Arc<WorkerRegistry<S>>,
}

impl<S> NatsBridge<S>
where
    S: SnapshotStore + EventJournal,
{
    /// Connect to a NATS server.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Nats`] if the connection cannot be established.
    pub async fn connect(
        url: &str,
        prefix: &str,
        registry: Arc<WorkerRegistry<S>>,
    ) -> Result<Self, EngineError> {
        let client = async_nats::connect(url).await.map_err(|e| EngineError::Nats {
            message: format!("failed to connect to NATS at {url}: {e}"),
        })?;
        info!(url, "NATS connection established");
        Ok(Self {
            client,
            prefix: prefix.to_owned(),
            registry,
        })
    }

    /// Serve commands until both subscriptions end.
    ///
    /// Each message is handled on its own task so a slow snapshot for one
    /// entity never delays another.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Nats`] if subscribing fails.
    pub async fn run(&self) -> Result<(), EngineError> {
        let take = self.subscribe(format!("{}.snapshot.take.*", self.prefix)).await?;
        let modify = self.subscribe(format!("{}.modify.*", self.prefix)).await?;
        let mut messages = futures::stream::select(take, modify);
        info!(prefix = %self.prefix, "Serving twin commands");

        while let Some(message) = messages.next().await {
            let client = self.client.clone();
            let registry = Arc::clone(&self.registry);
            let prefix = self.prefix.clone();
            tokio::spawn(async move {
                handle_message(&client, &registry, &prefix, message).await;
            });
        }

        warn!("Command subscriptions closed");
        Ok(())
    }

    async fn subscribe(&self, subject: String) -> Result<async_nats::Subscriber, EngineError> {
        debug!(subject = %subject, "Subscribing");
        self.client
            .subscribe(subject.clone())
            .await
            .map_err(|e| EngineError::Nats {
                message: format!("failed to subscribe to {subject}: {e}"),
            })
    }
}

impl<S> std::fmt::Debug for NatsBridge<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatsBridge")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

async fn handle_message<S>(
    client: &async_nats::Client,
    registry: &WorkerRegistry<S>,
    prefix: &str,
    message: async_nats::Message,
) where
    S: SnapshotStore + EventJournal,
{
    let Some(route) = Route::parse(prefix, message.subject.as_str()) else {
        warn!(subject = %message.subject, "Ignoring message on malformed subject");
        return;
    };

    let body = match route.kind {
        CommandKind::TakeSnapshot => take_snapshot(registry, route.entity_id, &message.payload).await,
        CommandKind::Modify => modify(registry, route.entity_id, &message.payload).await,
    };

    let Some(reply) = message.reply else {
        debug!(entity_id = %route.entity_id, "Command had no reply subject");
        return;
    };
    if let Err(e) = client.publish(reply, body.into()).await {
        warn!(entity_id = %route.entity_id, error = %e, "Failed to publish reply");
    }
}

/// Run a [`TakeSnapshot`] command and encode the reply.
pub async fn take_snapshot<S>(registry: &WorkerRegistry<S>, entity_id: EntityId, payload: &[u8]) -> Vec<u8>
where
    S: SnapshotStore + EventJournal,
{
    let command: TakeSnapshot = if payload.is_empty() {
        TakeSnapshot::default()
    } else {
        match serde_json::from_slice(payload) {
            Ok(command) => command,
            Err(e) => return encode(&invalid_command(entity_id, &e)),
        }
    };

    debug!(
        %entity_id,
        dry_run = command.dry_run,
        correlation_id = ?command.correlation_id,
        "Take snapshot command received"
    );

    let context = command.correlation_id.map(RequestContext::correlated);
    let outcome = match registry.get_or_start(entity_id).await {
        Ok(worker) => {
            worker
                .take_snapshot(SnapshotTag::Protected, context, command.dry_run)
                .await
        }
        Err(e) => Err(WorkerError::Journal(e)),
    };

    match outcome {
        Ok(sequence_nr) => encode(&TakeSnapshotResponse {
            entity_id,
            sequence_nr,
            correlation_id: command.correlation_id,
        }),
        Err(e) => encode(&error_response(entity_id, &e, command.correlation_id)),
    }
}

/// Run a [`ModifyTwin`] command and encode the reply.
pub async fn modify<S>(registry: &WorkerRegistry<S>, entity_id: EntityId, payload: &[u8]) -> Vec<u8>
where
    S: SnapshotStore + EventJournal,
{
    let command: ModifyTwin = match serde_json::from_slice(payload) {
        Ok(command) => command,
        Err(e) => return encode(&invalid_command(entity_id, &e)),
    };

    let outcome = match registry.get_or_start(entity_id).await {
        Ok(worker) => worker.modify(command.event).await,
        Err(e) => Err(WorkerError::Journal(e)),
    };

    match outcome {
        Ok(sequence_nr) => encode(&ModifyTwinResponse {
            entity_id,
            sequence_nr,
            correlation_id: command.correlation_id,
        }),
        Err(e) => encode(&error_response(entity_id, &e, command.correlation_id)),
    }
}

/// Map a worker error onto the wire error shape.
pub fn error_response(
    entity_id: EntityId,
    error: &WorkerError,
    correlation_id: Option<CorrelationId>,
) -> ErrorResponse {
    let (code, message) = match error {
        WorkerError::Unavailable(unavailable) => (unavailable.code(), unavailable.message.clone()),
        WorkerError::Stopped { .. } => ("entity.stopped", error.to_string()),
        WorkerError::Rejected(_) => ("twin.rejected", error.to_string()),
        WorkerError::Journal(_) => ("store.error", error.to_string()),
    };
    ErrorResponse {
        entity_id,
        error: code.to_owned(),
        message,
        correlation_id,
    }
}

fn invalid_command(entity_id: EntityId, error: &serde_json::Error) -> ErrorResponse {
    ErrorResponse {
        entity_id,
        error: "command.invalid".to_owned(),
        message: error.to_string(),
        correlation_id: None,
    }
}

fn encode<T: Serialize>(value: &T) -> Vec<u8> {
    serde_json::to_vec(value).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to encode reply");
        Vec::new()
    })
}
