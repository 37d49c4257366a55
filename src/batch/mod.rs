//! Batch manager.
//!
//! The batch manager reads newly stored messages in strict sequence order, and routes each ready
//! message to a batch processor dedicated to the (dispatcher, namespace, author, group) of the
//! message. Processors accumulate messages into bounded batches, seal each batch atomically along
//! with its pins, and hand the sealed batch to the dispatch handler registered for its type.
//!
//! ## Rewind
//! Messages are not guaranteed to become visible in the order of their sequence, as concurrent
//! writers may commit out of order. Every stored message is signalled to the manager through
//! `new_messages`, and a signal for a sequence which the sequencer has already read past causes
//! the cursor to be rewound to just before it. Delivery into the pipeline is therefore
//! at-least-once, and duplicates are dropped by the processors and by the `ready` state guard
//! of the seal.

mod cursor;
#[cfg(test)]
mod cursor_test;
pub mod pins;
#[cfg(test)]
mod pins_test;
mod processor;
mod seal;
mod sequencer;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::Config;
use crate::error::AppError;
use crate::models::{BatchManifest, BatchPersisted, BatchType, Bytes32, Data, Message, MessageType, SignerRef, TransactionRef, TransactionType};
use crate::plugins::{DataManager, LocalNodeInfo, Persistence};
use crate::shutdown::Shutdown;
use crate::utils;

pub use cursor::{read_page, SequenceCursor};
pub use processor::{BatchWork, FlushStatus, ProcessorState, ProcessorStatus};

use cursor::Notifier;
use processor::ProcessorHandle;
use sequencer::Sequencer;

pub(crate) const METRIC_READ_OFFSET: &str = "hadron_batch_read_offset";
pub(crate) const METRIC_BATCHES_DISPATCHED: &str = "hadron_batch_batches_dispatched";
pub(crate) const METRIC_FLUSH_ERRORS: &str = "hadron_batch_flush_errors";
pub(crate) const METRIC_ACTIVE_PROCESSORS: &str = "hadron_batch_active_processors";

/// The capacity of the new message signal channel.
const NEW_MESSAGES_CHANNEL_CAPACITY: usize = 1000;

/// A map of active processors, keyed by processor name.
///
/// This map is only ever written by the sequencer, and is read without blocking by status calls.
pub(crate) type ProcessorsMap = Arc<ArcSwap<HashMap<Arc<String>, ProcessorHandle>>>;

/// The handler of sealed batches of a dispatcher.
///
/// Returning an error causes the same batch to be dispatched again after a backoff. Handlers
/// must therefore be idempotent per batch ID.
pub trait DispatchHandler: Send + Sync + 'static {
    fn dispatch(&self, state: Arc<DispatchState>) -> BoxFuture<'static, Result<()>>;
}

impl<F, Fut> DispatchHandler for F
where
    F: Fn(Arc<DispatchState>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn dispatch(&self, state: Arc<DispatchState>) -> BoxFuture<'static, Result<()>> {
        Box::pin((self)(state))
    }
}

/// The batching options of a dispatcher.
#[derive(Clone, Debug)]
pub struct DispatcherOptions {
    pub batch_type: BatchType,
    /// The maximum number of messages per batch.
    pub batch_max_size: usize,
    /// The maximum estimated payload size per batch.
    pub batch_max_bytes: u64,
    /// The amount of time a batch may accumulate before it is flushed.
    pub batch_timeout: Duration,
    /// The amount of time a processor may sit idle before it is disposed of.
    pub dispose_timeout: Duration,
}

impl DispatcherOptions {
    /// Build options of the given batch type from the configured defaults.
    pub fn from_config(config: &Config, batch_type: BatchType) -> Self {
        Self {
            batch_type,
            batch_max_size: config.batch_size,
            batch_max_bytes: config.batch_max_bytes,
            batch_timeout: config.batch_timeout(),
            dispose_timeout: config.batch_dispose_timeout(),
        }
    }

    fn validate(&self, name: &str) -> Result<()> {
        if self.batch_max_size == 0 {
            return Err(AppError::InvalidInput(format!("dispatcher {} must allow at least 1 message per batch", name)).into());
        }
        if self.batch_max_bytes == 0 {
            return Err(AppError::InvalidInput(format!("dispatcher {} must allow a non-zero batch payload size", name)).into());
        }
        Ok(())
    }
}

/// A registered dispatcher.
pub(crate) struct Dispatcher {
    pub name: Arc<String>,
    pub tx_type: TransactionType,
    pub msg_types: Vec<MessageType>,
    pub handler: Arc<dyn DispatchHandler>,
    pub options: DispatcherOptions,
}

/// The state of a batch in flight, as handed to dispatch handlers.
#[derive(Clone, Debug)]
pub struct DispatchState {
    /// The batch record, as sealed.
    pub persisted: BatchPersisted,
    /// The messages of the batch, in sequence order.
    pub messages: Vec<Message>,
    /// The data of the batch, in order of first reference.
    pub data: Vec<Data>,
    /// The pins of the batch, one per (message, topic) in batch order.
    pub pins: Vec<Bytes32>,
    /// The dispatch attempt, starting at 1.
    pub attempt: u32,
}

impl DispatchState {
    /// Build the in-flight state of a new batch from the given work.
    fn new(id: Uuid, batch_type: BatchType, tx_type: TransactionType, key: &ProcessorKey, node: Uuid, work: Vec<BatchWork>) -> Self {
        let tx = TransactionRef {
            tx_type,
            id: if tx_type == TransactionType::None { None } else { Some(Uuid::new_v4()) },
        };
        let (mut messages, mut data) = (Vec::with_capacity(work.len()), Vec::<Data>::new());
        for item in work {
            for data_item in item.data {
                if !data.iter().any(|existing| existing.id == data_item.id) {
                    data.push(data_item);
                }
            }
            messages.push(item.msg);
        }
        let manifest = BatchManifest::new(id, tx.clone(), &messages, &data);
        Self {
            persisted: BatchPersisted {
                id,
                batch_type,
                namespace: key.namespace.clone(),
                node,
                signer: key.signer.clone(),
                group: key.group,
                created: utils::now_millis(),
                hash: Bytes32::default(),
                manifest,
                tx,
                dispatched: None,
            },
            messages,
            data,
            pins: vec![],
            attempt: 0,
        }
    }
}

/// The identity of a processor instance.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct ProcessorKey {
    pub namespace: String,
    pub signer: SignerRef,
    pub group: Option<Bytes32>,
}

impl ProcessorKey {
    /// The name of the processor of this key under the given dispatcher.
    pub fn processor_name(&self, dispatcher: &str) -> String {
        let group = self.group.map(|group| group.to_string()).unwrap_or_default();
        format!("{}|{}|{}|{}", dispatcher, self.namespace, self.signer.author, group)
    }
}

/// A snapshot of the status of the batch manager.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ManagerStatus {
    /// The last sequence handed to the pipeline.
    pub read_offset: u64,
    /// The pending rewind offset, if any.
    pub rewind_offset: Option<u64>,
    /// The active processors, ordered by name.
    pub processors: Vec<ProcessorStatusEntry>,
}

/// The status of a single processor.
#[derive(Clone, Debug, Serialize)]
pub struct ProcessorStatusEntry {
    pub name: String,
    #[serde(flatten)]
    pub status: ProcessorStatus,
}

/// A cloneable handle for taking status snapshots of a batch manager.
#[derive(Clone)]
pub struct StatusHandle {
    processors: ProcessorsMap,
    cursor: Arc<SequenceCursor>,
}

impl StatusHandle {
    /// Take a non-blocking snapshot of the batch manager's status.
    pub fn status(&self) -> ManagerStatus {
        let processors = self.processors.load();
        let mut entries: Vec<_> = processors
            .iter()
            .map(|(name, handle)| ProcessorStatusEntry {
                name: name.as_ref().clone(),
                status: handle.status.load().as_ref().clone(),
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        ManagerStatus {
            read_offset: self.cursor.read_offset(),
            rewind_offset: self.cursor.rewind_offset(),
            processors: entries,
        }
    }
}

/// A builder of batch managers.
#[derive(Default)]
pub struct BatchManagerBuilder {
    config: Option<Arc<Config>>,
    store: Option<Arc<dyn Persistence>>,
    data: Option<Arc<dyn DataManager>>,
    node: Option<Arc<dyn LocalNodeInfo>>,
    shutdown_tx: Option<broadcast::Sender<()>>,
}

impl BatchManagerBuilder {
    pub fn config(mut self, config: Arc<Config>) -> Self {
        self.config = Some(config);
        self
    }

    pub fn persistence(mut self, store: Arc<dyn Persistence>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn data_manager(mut self, data: Arc<dyn DataManager>) -> Self {
        self.data = Some(data);
        self
    }

    pub fn node_info(mut self, node: Arc<dyn LocalNodeInfo>) -> Self {
        self.node = Some(node);
        self
    }

    /// The system shutdown channel; a manager which is not given one owns a private channel.
    pub fn shutdown(mut self, shutdown_tx: broadcast::Sender<()>) -> Self {
        self.shutdown_tx = Some(shutdown_tx);
        self
    }

    /// Build a new batch manager, failing if a required collaborator is missing.
    pub fn build(self) -> Result<BatchManager> {
        let config = self.config.ok_or(AppError::MissingDependency("config"))?;
        let store = self.store.ok_or(AppError::MissingDependency("persistence plugin"))?;
        let data = self.data.ok_or(AppError::MissingDependency("data manager"))?;
        let node = self.node.ok_or(AppError::MissingDependency("local node info"))?;
        let shutdown_tx = self.shutdown_tx.unwrap_or_else(|| broadcast::channel(1).0);
        Ok(BatchManager::new(config, store, data, node, shutdown_tx))
    }
}

/// The batch manager.
pub struct BatchManager {
    config: Arc<Config>,
    store: Arc<dyn Persistence>,
    data: Arc<dyn DataManager>,
    node: Arc<dyn LocalNodeInfo>,

    /// Registered dispatchers, keyed by name.
    dispatchers: HashMap<Arc<String>, Arc<Dispatcher>>,
    /// Registered dispatchers, keyed by the (transaction type, message type) they handle.
    routes: HashMap<(TransactionType, MessageType), Arc<Dispatcher>>,

    processors: ProcessorsMap,
    cursor: Arc<SequenceCursor>,
    tap: Arc<Notify>,
    new_messages_tx: mpsc::Sender<u64>,
    /// Taken when the manager is started.
    new_messages_rx: Option<mpsc::Receiver<u64>>,
    rewinds_tx: mpsc::Sender<u64>,
    /// Taken when the manager is started.
    rewinds_rx: Option<mpsc::Receiver<u64>>,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// Join handles of the notifier & sequencer tasks.
    handles: Vec<JoinHandle<Result<()>>>,
}

impl BatchManager {
    /// Create a builder of batch managers.
    pub fn builder() -> BatchManagerBuilder {
        BatchManagerBuilder::default()
    }

    /// Create a new instance.
    pub fn new(
        config: Arc<Config>, store: Arc<dyn Persistence>, data: Arc<dyn DataManager>, node: Arc<dyn LocalNodeInfo>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        metrics::register_gauge!(METRIC_READ_OFFSET, metrics::Unit::Count, "the last message sequence read by the batch sequencer");
        metrics::register_counter!(METRIC_BATCHES_DISPATCHED, metrics::Unit::Count, "the number of batches dispatched");
        metrics::register_counter!(METRIC_FLUSH_ERRORS, metrics::Unit::Count, "the number of failed batch flush attempts");
        metrics::register_gauge!(METRIC_ACTIVE_PROCESSORS, metrics::Unit::Count, "the number of active batch processors");

        let (new_messages_tx, new_messages_rx) = mpsc::channel(NEW_MESSAGES_CHANNEL_CAPACITY);
        let (rewinds_tx, rewinds_rx) = mpsc::channel(NEW_MESSAGES_CHANNEL_CAPACITY);
        Self {
            config,
            store,
            data,
            node,
            dispatchers: Default::default(),
            routes: Default::default(),
            processors: Default::default(),
            cursor: Arc::new(SequenceCursor::new(0)),
            tap: Arc::new(Notify::new()),
            new_messages_tx,
            new_messages_rx: Some(new_messages_rx),
            rewinds_tx,
            rewinds_rx: Some(rewinds_rx),
            shutdown_tx,
            handles: vec![],
        }
    }

    /// Register a dispatcher for the given transaction type & message types.
    ///
    /// Registration is idempotent by name, a later registration replacing an earlier one, and
    /// must happen before the manager is started.
    pub fn register_dispatcher<H: DispatchHandler>(
        &mut self, name: &str, tx_type: TransactionType, msg_types: &[MessageType], handler: H, options: DispatcherOptions,
    ) -> Result<()> {
        if self.new_messages_rx.is_none() {
            return Err(AppError::AlreadyStarted.into());
        }
        if msg_types.is_empty() {
            return Err(AppError::InvalidInput(format!("dispatcher {} must handle at least 1 message type", name)).into());
        }
        options.validate(name)?;

        let name = Arc::new(name.to_string());
        if let Some(previous) = self.dispatchers.remove(&name) {
            self.routes.retain(|_, dispatcher| !Arc::ptr_eq(dispatcher, &previous));
        }
        let dispatcher = Arc::new(Dispatcher {
            name: name.clone(),
            tx_type,
            msg_types: msg_types.to_vec(),
            handler: Arc::new(handler),
            options,
        });
        for msg_type in dispatcher.msg_types.iter() {
            tracing::debug!(dispatcher = %name, %tx_type, %msg_type, "registering dispatcher");
            self.routes.insert((tx_type, *msg_type), dispatcher.clone());
        }
        self.dispatchers.insert(name, dispatcher);
        Ok(())
    }

    /// Start the notifier & sequencer tasks of this manager.
    pub fn start(&mut self) -> Result<()> {
        if self.new_messages_rx.is_none() {
            return Err(AppError::AlreadyStarted.into());
        }
        if self.dispatchers.is_empty() {
            return Err(AppError::InvalidInput("at least 1 dispatcher must be registered before starting".into()).into());
        }
        let (new_messages_rx, rewinds_rx) = match (self.new_messages_rx.take(), self.rewinds_rx.take()) {
            (Some(new_messages_rx), Some(rewinds_rx)) => (new_messages_rx, rewinds_rx),
            _ => return Err(AppError::AlreadyStarted.into()),
        };

        let notifier = Notifier::new(
            self.cursor.clone(),
            new_messages_rx,
            rewinds_rx,
            self.tap.clone(),
            Shutdown::new(self.shutdown_tx.subscribe()),
        );
        self.handles.push(notifier.spawn());

        let sequencer = Sequencer::new(
            self.config.clone(),
            self.store.clone(),
            self.data.clone(),
            self.node.node_id(),
            Arc::new(self.routes.clone()),
            self.processors.clone(),
            self.cursor.clone(),
            self.tap.clone(),
            self.shutdown_tx.clone(),
        );
        self.handles.push(sequencer.spawn());
        tracing::info!(dispatchers = self.dispatchers.len(), "batch manager started");
        Ok(())
    }

    /// A sender of the sequences of newly stored messages.
    pub fn new_messages(&self) -> mpsc::Sender<u64> {
        self.new_messages_tx.clone()
    }

    /// A sender of rewind triggers.
    ///
    /// Each sequence sent causes the sequencer to read again from that sequence, which is how
    /// messages that became ready after the cursor moved past them are picked up.
    pub fn rewinds(&self) -> mpsc::Sender<u64> {
        self.rewinds_tx.clone()
    }

    /// Take a non-blocking snapshot of the status of this manager.
    pub fn status(&self) -> ManagerStatus {
        self.status_handle().status()
    }

    /// A cloneable handle for taking status snapshots of this manager.
    pub fn status_handle(&self) -> StatusHandle {
        StatusHandle { processors: self.processors.clone(), cursor: self.cursor.clone() }
    }

    /// Wake the sequencer, causing it to poll storage and reap idle processors.
    pub fn shoulder_tap(&self) {
        self.tap.notify_one();
    }

    /// Force every active processor to flush whatever it has buffered.
    pub fn tap_processors(&self) {
        for (name, handle) in self.processors.load().iter() {
            if handle.tap().is_err() {
                tracing::trace!(processor = %name, "processor busy or closed, skipping tap");
            }
        }
    }

    /// Trigger shutdown of this manager.
    pub fn close(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Wait for every task of this manager to stop.
    pub async fn wait_stop(&mut self) -> Result<()> {
        for handle in self.handles.drain(..) {
            if let Err(err) = handle.await.context("error joining batch manager task handle").and_then(|res| res) {
                tracing::error!(error = ?err, "error shutting down batch manager task");
            }
        }
        tracing::debug!("batch manager shutdown complete");
        Ok(())
    }
}
