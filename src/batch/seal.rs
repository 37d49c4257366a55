//! The atomic persistence units of a batch flush.

use std::cell::RefCell;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::batch::pins::calculate_pins;
use crate::batch::DispatchState;
use crate::database::Database;
use crate::error::AppError;
use crate::models::{Bytes32, Event, EventType, MessageState, Transaction, TransactionType};
use crate::plugins::{MessageFilter, MessageUpdate, Persistence, StoreGroup};
use crate::utils;

/// The outcome of sealing a batch.
#[derive(Clone, Debug)]
pub(super) struct SealedBatch {
    /// The hash of the batch manifest.
    pub hash: Bytes32,
    /// The pins of each message, in batch order.
    pub pins: Vec<Vec<Bytes32>>,
}

/// Seal the given batch in one atomic unit.
///
/// The batch record is upserted, the member messages are bound to the batch only while they are
/// still `ready`, pins are computed & recorded, and the anchoring transaction along with its
/// `transaction_submitted` event are inserted. If fewer messages are bound than are in the
/// batch, the whole unit is aborted and nothing becomes visible.
#[tracing::instrument(level = "trace", skip(store, state), fields(batch = %state.persisted.id))]
pub(super) async fn seal_batch(store: Arc<dyn Persistence>, state: Arc<DispatchState>) -> Result<SealedBatch> {
    Database::spawn_blocking(move || -> Result<SealedBatch> {
        let hash = state.persisted.manifest.hash()?;
        let mut persisted = state.persisted.clone();
        persisted.hash = hash;
        persisted.dispatched = None;

        let ids: Vec<_> = state.messages.iter().map(|msg| msg.header.id).collect();
        let expected = ids.len() as u64;
        let filter = MessageFilter::ready(ids);
        let bind = MessageUpdate { batch: Some(persisted.id), ..Default::default() };
        let sealed_pins = RefCell::new(vec![]);

        store.run_as_group(&|group: &mut dyn StoreGroup| {
            let pins = calculate_pins(group, persisted.tx.tx_type, &state.messages)?;
            group.upsert_batch(&persisted)?;
            let updated = group.update_messages(&filter, &bind)?;
            if updated != expected {
                return Err(AppError::BatchBindMismatch { batch: persisted.id, expected, updated }.into());
            }
            for (msg, msg_pins) in state.messages.iter().zip(pins.iter()).filter(|(_, pins)| !pins.is_empty()) {
                let update = MessageUpdate { pins: Some(msg_pins.iter().map(|pin| pin.to_string()).collect()), ..Default::default() };
                group.update_message(&msg.header.id, &update)?;
            }
            match (persisted.tx.tx_type, persisted.tx.id) {
                (TransactionType::None, _) | (_, None) => (),
                (tx_type, Some(tx_id)) => {
                    let tx = Transaction {
                        id: tx_id,
                        namespace: persisted.namespace.clone(),
                        tx_type,
                        created: utils::now_millis(),
                    };
                    group.insert_transaction(&tx)?;
                    group.insert_event(&Event::new(EventType::TransactionSubmitted, &persisted.namespace, tx_id, Some(tx_id)))?;
                }
            }
            *sealed_pins.borrow_mut() = pins;
            Ok(())
        })
        .context("error sealing batch")?;

        Ok(SealedBatch { hash, pins: sealed_pins.into_inner() })
    })
    .await?
}

/// Mark the messages of a dispatched batch as `sent`, recording the dispatch time of the batch
/// along with a `batch_dispatched` event, all in one atomic unit.
#[tracing::instrument(level = "trace", skip(store, state), fields(batch = %state.persisted.id))]
pub(super) async fn mark_dispatched(store: Arc<dyn Persistence>, state: Arc<DispatchState>) -> Result<()> {
    Database::spawn_blocking(move || -> Result<()> {
        let ids: Vec<_> = state.messages.iter().map(|msg| msg.header.id).collect();
        let expected = ids.len() as u64;
        let filter = MessageFilter::ready(ids);
        let sent = MessageUpdate { state: Some(MessageState::Sent), ..Default::default() };
        let mut persisted = state.persisted.clone();
        persisted.dispatched = Some(utils::now_millis());

        store.run_as_group(&|group: &mut dyn StoreGroup| {
            let updated = group.update_messages(&filter, &sent)?;
            if updated != expected {
                tracing::warn!(batch = %persisted.id, expected, updated, "not all messages of dispatched batch were still ready");
            }
            group.upsert_batch(&persisted)?;
            group.insert_event(&Event::new(EventType::BatchDispatched, &persisted.namespace, persisted.id, persisted.tx.id))?;
            Ok(())
        })
        .context("error marking batch as dispatched")
    })
    .await?
}
