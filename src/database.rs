//! Database management.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use sled::transaction::{ConflictableTransactionError, TransactionError, TransactionalTree, Transactional};
use sled::{Config as SledConfig, Db};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{ShutdownError, ShutdownResult, ERR_DB_FLUSH, ERR_DB_TRANSACTION, ERR_ITER_FAILURE};
use crate::models::{BatchPersisted, Bytes32, Data, Event, IdAndSequence, Message, MessageState, Nonce, Transaction};
use crate::plugins::{MessageFilter, MessageQuery, MessageUpdate, Persistence, StoreGroup};
use crate::utils;

pub type Tree = sled::Tree;

/// The default path to use for data storage.
pub const DEFAULT_DATA_PATH: &str = "/usr/local/hadron/batch";
/// The DB tree of messages, keyed by ID.
const TREE_MESSAGES: &str = "messages";
/// The DB tree of the message sequence index, keyed by sequence with the message ID as value.
const TREE_MESSAGE_SEQUENCES: &str = "message_sequences";
/// The DB tree of the sequences of `ready` messages, keyed by sequence with the message ID as value.
const TREE_READY_SEQUENCES: &str = "ready_sequences";
/// The DB tree of data items, keyed by ID.
const TREE_DATA: &str = "data";
/// The DB tree of batches, keyed by ID.
const TREE_BATCHES: &str = "batches";
/// The DB tree of transactions, keyed by ID.
const TREE_TRANSACTIONS: &str = "transactions";
/// The DB tree of events, keyed by sequence.
const TREE_EVENTS: &str = "events";
/// The DB tree of private pinning context nonces, keyed by context hash.
const TREE_NONCES: &str = "nonces";
/// The DB tree of dispatched batch payloads awaiting pickup, keyed by batch ID.
const TREE_OUTBOX: &str = "outbox";

/// The default path to use for data storage.
pub fn default_data_path() -> String {
    DEFAULT_DATA_PATH.to_string()
}

/// An abstraction over the Hadron batch database.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

struct DatabaseInner {
    /// System runtime config.
    #[allow(dead_code)]
    config: Arc<Config>,
    /// The underlying DB handle.
    db: Db,
    messages: Tree,
    sequences: Tree,
    ready: Tree,
    data: Tree,
    batches: Tree,
    transactions: Tree,
    events: Tree,
    nonces: Tree,
    outbox: Tree,
}

impl Database {
    /// Open the database for usage.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        // Determine the database path, and ensure it exists.
        let dbpath = PathBuf::from(&config.storage_data_path);
        tokio::fs::create_dir_all(&dbpath)
            .await
            .context("error creating dir for hadron batch database")?;

        Self::spawn_blocking(move || -> Result<Self> {
            let db = SledConfig::new().path(dbpath).mode(sled::Mode::HighThroughput).open()?;
            let open = |name: &str| db.open_tree(name).with_context(|| format!("could not open DB tree {}", name));
            let inner = Arc::new(DatabaseInner {
                config,
                messages: open(TREE_MESSAGES)?,
                sequences: open(TREE_MESSAGE_SEQUENCES)?,
                ready: open(TREE_READY_SEQUENCES)?,
                data: open(TREE_DATA)?,
                batches: open(TREE_BATCHES)?,
                transactions: open(TREE_TRANSACTIONS)?,
                events: open(TREE_EVENTS)?,
                nonces: open(TREE_NONCES)?,
                outbox: open(TREE_OUTBOX)?,
                db,
            });
            Ok(Self { inner })
        })
        .await?
    }

    /// Spawn a blocking database-related function, returning a ShutdownError if anything goes
    /// wrong related to spawning & joining.
    #[tracing::instrument(level = "trace", skip(f), err)]
    pub async fn spawn_blocking<F, R>(f: F) -> ShutdownResult<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|err| ShutdownError::from(anyhow::Error::from(err)))
    }

    /// Get a handle to the DB tree of the message sequence index.
    ///
    /// Every insert into this tree corresponds to a newly stored message.
    pub fn sequences_tree(&self) -> Tree {
        self.inner.sequences.clone()
    }

    /// Store the given message, assigning it the next local sequence.
    ///
    /// Messages which already carry a non-zero sequence keep it, which is used when importing
    /// messages from another store.
    pub fn insert_message(&self, msg: &mut Message) -> Result<u64> {
        if msg.sequence == 0 {
            msg.sequence = self.inner.db.generate_id().context("error generating message sequence")? + 1;
        }
        let (id, seq_key, is_ready) = (msg.header.id, utils::encode_u64(msg.sequence), msg.state == MessageState::Ready);
        let encoded = utils::encode_model(&*msg)?;
        (&self.inner.messages, &self.inner.sequences, &self.inner.ready)
            .transaction(|(messages, sequences, ready)| {
                messages.insert(&id.as_bytes()[..], encoded.as_slice())?;
                sequences.insert(&seq_key[..], &id.as_bytes()[..])?;
                if is_ready {
                    ready.insert(&seq_key[..], &id.as_bytes()[..])?;
                } else {
                    ready.remove(&seq_key[..])?;
                }
                Ok(())
            })
            .map_err(|err: TransactionError<()>| anyhow::anyhow!("{}: {:?}", ERR_DB_TRANSACTION, err))?;
        self.inner.db.flush().context(ERR_DB_FLUSH)?;
        Ok(msg.sequence)
    }

    /// Store the given data item.
    pub fn insert_data(&self, data: &Data) -> Result<()> {
        let encoded = utils::encode_model(data)?;
        self.inner
            .data
            .insert(&data.id.as_bytes()[..], encoded)
            .context("error storing data item")?;
        self.inner.data.flush().context(ERR_DB_FLUSH)?;
        Ok(())
    }

    /// Write a dispatched batch payload to the outbox, replacing any previous payload of the
    /// same batch.
    pub fn write_outbox(&self, batch: &Uuid, payload: &[u8]) -> Result<()> {
        self.inner
            .outbox
            .insert(&batch.as_bytes()[..], payload)
            .context("error writing batch payload to outbox")?;
        self.inner.outbox.flush().context(ERR_DB_FLUSH)?;
        Ok(())
    }

    /// Get a dispatched batch payload from the outbox.
    pub fn get_outbox(&self, batch: &Uuid) -> Result<Option<Vec<u8>>> {
        let val = self
            .inner
            .outbox
            .get(&batch.as_bytes()[..])
            .context("error reading batch payload from outbox")?;
        Ok(val.map(|ivec| ivec.to_vec()))
    }

    /// Get all events in sequence order.
    pub fn get_events(&self) -> Result<Vec<Event>> {
        let mut events = vec![];
        for kv_res in self.inner.events.iter() {
            let (_, val) = kv_res.context(ERR_ITER_FAILURE)?;
            events.push(utils::decode_model(&val)?);
        }
        Ok(events)
    }

    /// Get a handle to the DB tree of messages.
    #[cfg(test)]
    pub(crate) fn messages_tree(&self) -> Tree {
        self.inner.messages.clone()
    }

    /// Get a transaction by ID.
    pub fn get_transaction_by_id(&self, id: &Uuid) -> Result<Option<Transaction>> {
        let val = self.inner.transactions.get(&id.as_bytes()[..]).context("error reading transaction")?;
        val.map(|val| utils::decode_model(&val)).transpose()
    }
}

impl Persistence for Database {
    #[tracing::instrument(level = "trace", skip(self))]
    fn get_message_ids(&self, query: &MessageQuery) -> Result<Vec<IdAndSequence>> {
        let start = match query.after_sequence.checked_add(1) {
            Some(start) => utils::encode_u64(start),
            None => return Ok(vec![]),
        };
        // Ready messages are paged from their own index, so already processed history is
        // never scanned.
        let (index, state_filter) = match query.state {
            Some(MessageState::Ready) => (&self.inner.ready, None),
            state => (&self.inner.sequences, state),
        };
        let mut page = Vec::with_capacity(query.limit.min(1_000));
        for kv_res in index.range::<&[u8], std::ops::RangeFrom<&[u8]>>(&start[..]..) {
            if page.len() >= query.limit {
                break;
            }
            let (key, val) = kv_res.context(ERR_ITER_FAILURE)?;
            let (sequence, id) = (utils::decode_u64(&key)?, utils::decode_uuid(&val)?);
            if let Some(state) = state_filter {
                match self.get_message_by_id(&id)? {
                    Some(msg) if msg.state == state => (),
                    _ => continue,
                }
            }
            page.push(IdAndSequence { id, sequence });
        }
        Ok(page)
    }

    fn get_message_by_id(&self, id: &Uuid) -> Result<Option<Message>> {
        let val = self.inner.messages.get(&id.as_bytes()[..]).context("error reading message")?;
        val.map(|val| utils::decode_model(&val)).transpose()
    }

    fn get_data_by_id(&self, id: &Uuid) -> Result<Option<Data>> {
        let val = self.inner.data.get(&id.as_bytes()[..]).context("error reading data item")?;
        val.map(|val| utils::decode_model(&val)).transpose()
    }

    fn get_batch_by_id(&self, id: &Uuid) -> Result<Option<BatchPersisted>> {
        let val = self.inner.batches.get(&id.as_bytes()[..]).context("error reading batch")?;
        val.map(|val| utils::decode_model(&val)).transpose()
    }

    fn get_nonce(&self, hash: &Bytes32) -> Result<Option<Nonce>> {
        let val = self.inner.nonces.get(&hash.as_bytes()[..]).context("error reading nonce")?;
        val.map(|val| utils::decode_model(&val)).transpose()
    }

    #[tracing::instrument(level = "trace", skip(self, work))]
    fn run_as_group(&self, work: &dyn Fn(&mut dyn StoreGroup) -> Result<()>) -> Result<()> {
        let inner = &self.inner;
        let res = (&inner.batches, &inner.messages, &inner.ready, &inner.transactions, &inner.events, &inner.nonces).transaction(
            |(batches, messages, ready, transactions, events, nonces)| {
                let mut group = SledGroup { batches, messages, ready, transactions, events, nonces };
                work(&mut group).map_err(ConflictableTransactionError::Abort)
            },
        );
        match res {
            Ok(()) => (),
            Err(TransactionError::Abort(err)) => return Err(err),
            Err(TransactionError::Storage(err)) => return Err(anyhow::Error::from(err).context(ERR_DB_TRANSACTION)),
        }
        inner.db.flush().context(ERR_DB_FLUSH)?;
        Ok(())
    }
}

/// The trees of a multi-tree sled transaction.
///
/// Sled conflicts surfacing from these trees are reported as errors of the unit of work, which
/// aborts it, and the caller retries the whole unit.
struct SledGroup<'a> {
    batches: &'a TransactionalTree,
    messages: &'a TransactionalTree,
    ready: &'a TransactionalTree,
    transactions: &'a TransactionalTree,
    events: &'a TransactionalTree,
    nonces: &'a TransactionalTree,
}

impl<'a> SledGroup<'a> {
    fn read_message(&self, id: &Uuid) -> Result<Option<Message>> {
        let val = self.messages.get(&id.as_bytes()[..]).context("error reading message in transaction")?;
        val.map(|val| utils::decode_model(&val)).transpose()
    }

    /// Write the given message, keeping the ready index in line with its state.
    fn write_message(&self, msg: &Message) -> Result<()> {
        let encoded = utils::encode_model(msg)?;
        self.messages
            .insert(&msg.header.id.as_bytes()[..], encoded)
            .context("error writing message in transaction")?;
        let seq_key = utils::encode_u64(msg.sequence);
        if msg.state == MessageState::Ready {
            self.ready
                .insert(&seq_key[..], &msg.header.id.as_bytes()[..])
                .context("error writing ready index in transaction")?;
        } else {
            self.ready.remove(&seq_key[..]).context("error writing ready index in transaction")?;
        }
        Ok(())
    }
}

impl<'a> StoreGroup for SledGroup<'a> {
    fn upsert_batch(&mut self, batch: &BatchPersisted) -> Result<()> {
        let encoded = utils::encode_model(batch)?;
        self.batches
            .insert(&batch.id.as_bytes()[..], encoded)
            .context("error writing batch in transaction")?;
        Ok(())
    }

    fn update_messages(&mut self, filter: &MessageFilter, update: &MessageUpdate) -> Result<u64> {
        tracing::trace!(%filter, "updating messages");
        let mut count = 0;
        for id in filter.ids.iter() {
            let mut msg = match self.read_message(id)? {
                Some(msg) if filter.matches(&msg) => msg,
                _ => continue,
            };
            update.apply(&mut msg);
            self.write_message(&msg)?;
            count += 1;
        }
        Ok(count)
    }

    fn update_message(&mut self, id: &Uuid, update: &MessageUpdate) -> Result<bool> {
        let mut msg = match self.read_message(id)? {
            Some(msg) => msg,
            None => return Ok(false),
        };
        update.apply(&mut msg);
        self.write_message(&msg)?;
        Ok(true)
    }

    fn insert_transaction(&mut self, tx: &Transaction) -> Result<()> {
        let encoded = utils::encode_model(tx)?;
        self.transactions
            .insert(&tx.id.as_bytes()[..], encoded)
            .context("error writing transaction in transaction")?;
        Ok(())
    }

    fn insert_event(&mut self, event: &Event) -> Result<u64> {
        let sequence = self.events.generate_id().context("error generating event sequence")? + 1;
        let mut event = event.clone();
        event.sequence = sequence;
        let encoded = utils::encode_model(&event)?;
        self.events
            .insert(&utils::encode_u64(sequence)[..], encoded)
            .context("error writing event in transaction")?;
        Ok(sequence)
    }

    fn get_nonce(&mut self, hash: &Bytes32) -> Result<Option<Nonce>> {
        let val = self.nonces.get(&hash.as_bytes()[..]).context("error reading nonce in transaction")?;
        val.map(|val| utils::decode_model(&val)).transpose()
    }

    fn upsert_nonce(&mut self, nonce: &Nonce) -> Result<()> {
        let encoded = utils::encode_model(nonce)?;
        self.nonces
            .insert(&nonce.hash.as_bytes()[..], encoded)
            .context("error writing nonce in transaction")?;
        Ok(())
    }
}
