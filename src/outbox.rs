//! The outbox dispatch handler.
//!
//! Sealed batches are serialized into self-contained payloads and written to the outbox tree of
//! the database, keyed by batch ID, from which the delivery layer of the node picks them up.

use std::sync::Arc;

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::batch::{DispatchHandler, DispatchState};
use crate::database::Database;
use crate::models::{BatchPersisted, Bytes32, Data, Message};

/// The payload of a dispatched batch, as written to the outbox.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchPayload {
    pub batch: BatchPersisted,
    pub messages: Vec<Message>,
    pub data: Vec<Data>,
    #[serde(default)]
    pub pins: Vec<Bytes32>,
}

impl From<&DispatchState> for BatchPayload {
    fn from(state: &DispatchState) -> Self {
        Self {
            batch: state.persisted.clone(),
            messages: state.messages.clone(),
            data: state.data.clone(),
            pins: state.pins.clone(),
        }
    }
}

/// A dispatch handler which writes batch payloads to the outbox.
///
/// Writes are keyed by batch ID, so a batch which is dispatched again after a failure simply
/// replaces its previous payload.
#[derive(Clone)]
pub struct OutboxDispatcher {
    db: Database,
}

impl OutboxDispatcher {
    /// Create a new instance.
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

impl DispatchHandler for OutboxDispatcher {
    fn dispatch(&self, state: Arc<DispatchState>) -> BoxFuture<'static, Result<()>> {
        let db = self.db.clone();
        Box::pin(async move {
            Database::spawn_blocking(move || -> Result<()> {
                let payload = serde_json::to_vec(&BatchPayload::from(&*state)).context("error encoding batch payload")?;
                db.write_outbox(&state.persisted.id, &payload)?;
                tracing::debug!(
                    batch = %state.persisted.id,
                    attempt = state.attempt,
                    bytes = payload.len(),
                    "batch payload written to outbox"
                );
                Ok(())
            })
            .await??;
            Ok(())
        })
    }
}
