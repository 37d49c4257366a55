use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use futures::future::BoxFuture;
use rand::prelude::*;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::batch::{DispatchHandler, DispatchState};
use crate::config::Config;
use crate::data::CachedDataManager;
use crate::database::Database;
use crate::models::{
    BatchPersisted, Bytes32, Data, Event, IdAndSequence, Message, MessageHeader, MessageState, MessageType, Nonce, SignerRef, Transaction,
    TransactionType,
};
use crate::plugins::{MessageFilter, MessageQuery, MessageUpdate, Persistence, StoreGroup};
use crate::utils;

pub const NAMESPACE: &str = "ns1";
pub const AUTHOR: &str = "did:hadron:org/abcd";
pub const SIGNING_KEY: &str = "0x12345";

/// Build a new ready message with the given topics.
pub fn new_message(msg_type: MessageType, tx_type: TransactionType, topics: &[&str], group: Option<Bytes32>) -> Message {
    let header = MessageHeader {
        id: Uuid::new_v4(),
        namespace: NAMESPACE.into(),
        msg_type,
        tx_type,
        topics: topics.iter().map(|topic| topic.to_string()).collect(),
        tag: String::new(),
        group,
        signer: SignerRef { author: AUTHOR.into(), key: SIGNING_KEY.into() },
        created: utils::now_millis(),
    };
    let hash = Bytes32::sha256(&serde_json::to_vec(&header).unwrap_or_default());
    Message {
        header,
        hash,
        data: vec![],
        state: MessageState::Ready,
        batch: None,
        pins: vec![],
        sequence: 0,
    }
}

/// Build a new data item with a random value.
pub fn new_data() -> Data {
    let value = serde_json::json!({ "value": rand::thread_rng().gen_range(0..u32::MAX) });
    Data {
        id: Uuid::new_v4(),
        namespace: NAMESPACE.into(),
        hash: Bytes32::sha256(value.to_string().as_bytes()),
        value,
        created: utils::now_millis(),
    }
}

/// A random privacy group hash.
pub fn new_group() -> Bytes32 {
    let mut group = [0u8; 32];
    rand::thread_rng().fill(&mut group);
    Bytes32(group)
}

/// Store a new broadcast message along with one data item, returning the stored message.
pub fn store_broadcast_message(db: &Database, topics: &[&str]) -> Result<(Message, Data)> {
    let mut msg = new_message(MessageType::Broadcast, TransactionType::BatchPin, topics, None);
    let data = new_data();
    msg.data.push(data.data_ref());
    db.insert_data(&data)?;
    db.insert_message(&mut msg)?;
    Ok((msg, data))
}

/// Store a batch of messages which share the given shape, returning them in sequence order.
pub fn store_messages(db: &Database, count: usize, msg_type: MessageType, tx_type: TransactionType, group: Option<Bytes32>) -> Result<Vec<Message>> {
    let mut msgs = Vec::with_capacity(count);
    for _ in 0..count {
        let mut msg = new_message(msg_type, tx_type, &["topic1"], group);
        db.insert_message(&mut msg)?;
        msgs.push(msg);
    }
    Ok(msgs)
}

/// Build the test data manager over the given store.
pub fn new_data_manager(config: &Config, store: Arc<dyn Persistence>) -> Arc<CachedDataManager> {
    Arc::new(CachedDataManager::new(config, store))
}

/// Wait for the given condition to hold, polling every few milliseconds.
pub async fn wait_for<F>(timeout: Duration, mut condition: F) -> Result<()>
where
    F: FnMut() -> Result<bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition()? {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("timeout after {:?} waiting for condition", timeout);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Receive the next dispatched batch, failing after the given timeout.
pub async fn next_dispatch(rx: &mut mpsc::UnboundedReceiver<Arc<DispatchState>>, timeout: Duration) -> Result<Arc<DispatchState>> {
    tokio::time::timeout(timeout, rx.recv())
        .await
        .context("timeout waiting for batch dispatch")?
        .context("dispatch channel closed")
}

/// A dispatch handler which records every dispatch attempt, failing the first few of them.
#[derive(Clone)]
pub struct RecordingHandler {
    tx: mpsc::UnboundedSender<Arc<DispatchState>>,
    failures: Arc<AtomicUsize>,
}

impl RecordingHandler {
    /// Create a new handler along with the receiver of its recorded dispatch attempts.
    pub fn new(failures: usize) -> (Self, mpsc::UnboundedReceiver<Arc<DispatchState>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx, failures: Arc::new(AtomicUsize::new(failures)) }, rx)
    }
}

impl DispatchHandler for RecordingHandler {
    fn dispatch(&self, state: Arc<DispatchState>) -> BoxFuture<'static, Result<()>> {
        let (tx, failures) = (self.tx.clone(), self.failures.clone());
        Box::pin(async move {
            let _ = tx.send(state);
            let should_fail = failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |val| val.checked_sub(1))
                .is_ok();
            if should_fail {
                bail!("pop");
            }
            Ok(())
        })
    }
}

/// A persistence wrapper which injects failures.
pub struct FaultyStore {
    pub inner: Database,
    /// The number of upcoming message ID queries which will fail.
    pub read_failures: AtomicUsize,
    /// The number of upcoming units of work in which the bulk batch binding will under-report.
    pub short_binds: AtomicUsize,
}

impl FaultyStore {
    pub fn new(inner: Database) -> Self {
        Self { inner, read_failures: AtomicUsize::new(0), short_binds: AtomicUsize::new(0) }
    }

    fn take_fault(counter: &AtomicUsize) -> bool {
        counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |val| val.checked_sub(1)).is_ok()
    }
}

impl Persistence for FaultyStore {
    fn get_message_ids(&self, query: &MessageQuery) -> Result<Vec<IdAndSequence>> {
        if Self::take_fault(&self.read_failures) {
            bail!("injected read failure");
        }
        self.inner.get_message_ids(query)
    }

    fn get_message_by_id(&self, id: &Uuid) -> Result<Option<Message>> {
        self.inner.get_message_by_id(id)
    }

    fn get_data_by_id(&self, id: &Uuid) -> Result<Option<Data>> {
        self.inner.get_data_by_id(id)
    }

    fn get_batch_by_id(&self, id: &Uuid) -> Result<Option<BatchPersisted>> {
        self.inner.get_batch_by_id(id)
    }

    fn get_nonce(&self, hash: &Bytes32) -> Result<Option<Nonce>> {
        self.inner.get_nonce(hash)
    }

    fn run_as_group(&self, work: &dyn Fn(&mut dyn StoreGroup) -> Result<()>) -> Result<()> {
        let short_bind = Self::take_fault(&self.short_binds);
        self.inner.run_as_group(&|group: &mut dyn StoreGroup| {
            let mut faulty = FaultyGroup { inner: group, short_bind };
            work(&mut faulty)
        })
    }
}

/// A unit of work wrapper which under-reports bulk batch bindings.
struct FaultyGroup<'a> {
    inner: &'a mut dyn StoreGroup,
    short_bind: bool,
}

impl<'a> StoreGroup for FaultyGroup<'a> {
    fn upsert_batch(&mut self, batch: &BatchPersisted) -> Result<()> {
        self.inner.upsert_batch(batch)
    }

    fn update_messages(&mut self, filter: &MessageFilter, update: &MessageUpdate) -> Result<u64> {
        let count = self.inner.update_messages(filter, update)?;
        if self.short_bind && update.batch.is_some() {
            return Ok(count.saturating_sub(1));
        }
        Ok(count)
    }

    fn update_message(&mut self, id: &Uuid, update: &MessageUpdate) -> Result<bool> {
        self.inner.update_message(id, update)
    }

    fn insert_transaction(&mut self, tx: &Transaction) -> Result<()> {
        self.inner.insert_transaction(tx)
    }

    fn insert_event(&mut self, event: &Event) -> Result<u64> {
        self.inner.insert_event(event)
    }

    fn get_nonce(&mut self, hash: &Bytes32) -> Result<Option<Nonce>> {
        self.inner.get_nonce(hash)
    }

    fn upsert_nonce(&mut self, nonce: &Nonce) -> Result<()> {
        self.inner.upsert_nonce(nonce)
    }
}
