//! The batch sequencer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::batch::cursor::{read_page, SequenceCursor};
use crate::batch::processor::{BatchProcessor, BatchWork, ProcessorHandle, ProcessorMsg};
use crate::batch::{Dispatcher, ProcessorKey, ProcessorsMap, METRIC_ACTIVE_PROCESSORS};
use crate::config::Config;
use crate::database::Database;
use crate::error::AppError;
use crate::models::{IdAndSequence, Message, MessageType, TransactionType};
use crate::plugins::{DataManager, Persistence};
use crate::shutdown::Shutdown;

/// The outcome of assembling a message with its data.
#[derive(Debug)]
pub(super) enum Assembled {
    /// The message & all of its data are available.
    Ready(BatchWork),
    /// Not all of the data of the message is available yet.
    MissingData,
    /// The message no longer exists.
    NotFound,
}

/// The outcome of routing a message to a processor.
enum Delivery {
    Delivered,
    /// The message can never be delivered & is skipped.
    Skipped,
    /// The message needs to be read again.
    Retry,
}

/// The task which reads messages in sequence order & routes them to processors.
pub(super) struct Sequencer {
    config: Arc<Config>,
    store: Arc<dyn Persistence>,
    data: Arc<dyn DataManager>,
    node_id: Uuid,
    routes: Arc<HashMap<(TransactionType, MessageType), Arc<Dispatcher>>>,

    processors: ProcessorsMap,
    /// Join handles of active processors.
    processor_tasks: HashMap<Arc<String>, JoinHandle<()>>,
    /// Join handles of reaped processors which may still be draining.
    reaped_tasks: Vec<JoinHandle<()>>,

    cursor: Arc<SequenceCursor>,
    tap: Arc<Notify>,
    last_poll: Option<Instant>,
    /// The retry schedule of consecutive delivery failures.
    retry: ExponentialBackoff,

    /// A channel used for triggering graceful shutdown, from which processors subscribe.
    shutdown_tx: broadcast::Sender<()>,
    shutdown: Shutdown,
}

impl Sequencer {
    /// Create a new instance.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>, store: Arc<dyn Persistence>, data: Arc<dyn DataManager>, node_id: Uuid,
        routes: Arc<HashMap<(TransactionType, MessageType), Arc<Dispatcher>>>, processors: ProcessorsMap, cursor: Arc<SequenceCursor>,
        tap: Arc<Notify>, shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        let shutdown = Shutdown::new(shutdown_tx.subscribe());
        let retry = config.retry_backoff();
        Self {
            config,
            store,
            data,
            node_id,
            routes,
            processors,
            processor_tasks: Default::default(),
            reaped_tasks: vec![],
            cursor,
            tap,
            last_poll: None,
            retry,
            shutdown_tx,
            shutdown,
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::debug!(read_offset = self.cursor.read_offset(), "batch sequencer has started");

        loop {
            if self.shutdown.is_shutdown() {
                break;
            }
            self.reap_quiescing_processors().await;

            let page = match self.read_page_with_retry().await {
                Some(page) => page,
                None => break,
            };
            let page_full = page.len() >= self.config.batch_read_page_size;
            for entry in page {
                match self.dispatch_message(entry).await {
                    Delivery::Delivered | Delivery::Skipped => self.reset_retry_delay(),
                    Delivery::Retry => {
                        // Re-read from this message on the next pass.
                        self.cursor.rewind_to(entry.sequence.saturating_sub(1));
                        self.backoff_after_failure().await;
                        break;
                    }
                }
            }
            if self.shutdown.is_shutdown() {
                break;
            }
            if !page_full {
                self.wait_for_new_messages().await;
            }
        }

        self.shutdown_processors().await;
        tracing::debug!(read_offset = self.cursor.read_offset(), "batch sequencer has shutdown");
        Ok(())
    }

    /// Read the next page of messages, retrying with backoff until success or shutdown.
    async fn read_page_with_retry(&mut self) -> Option<Vec<IdAndSequence>> {
        let mut backoff = self.config.retry_backoff();
        loop {
            self.last_poll = Some(Instant::now());
            match read_page(self.store.clone(), &self.cursor, self.config.batch_read_page_size, true).await {
                Ok(page) => return Some(page),
                Err(err) => {
                    tracing::error!(error = ?err, read_offset = self.cursor.read_offset(), "error reading messages");
                    let delay = backoff.next_backoff().unwrap_or(backoff.max_interval);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => (),
                        _ = self.shutdown.recv() => return None,
                    }
                }
            }
        }
    }

    /// Wait before reading again after a message could not be routed, backing off further with
    /// each consecutive failure.
    async fn backoff_after_failure(&mut self) {
        let delay = self.next_retry_delay();
        tokio::select! {
            _ = tokio::time::sleep(delay) => (),
            _ = self.shutdown.recv() => (),
        }
    }

    /// The delay to apply after the next consecutive delivery failure.
    pub(super) fn next_retry_delay(&mut self) -> Duration {
        self.retry.next_backoff().unwrap_or(self.retry.max_interval)
    }

    /// Start the retry schedule over, after a successful delivery.
    pub(super) fn reset_retry_delay(&mut self) {
        self.retry.reset();
    }

    /// Wait for a new message signal, the poll timeout or shutdown, whichever comes first.
    ///
    /// Consecutive polls are always spaced by at least the minimum poll delay.
    async fn wait_for_new_messages(&mut self) {
        tokio::select! {
            _ = self.tap.notified() => (),
            _ = tokio::time::sleep(self.config.batch_read_poll_timeout()) => (),
            _ = self.shutdown.recv() => return,
        }

        let min_delay = self.config.batch_minimum_poll_delay();
        if let Some(last_poll) = self.last_poll {
            let next_poll = last_poll + min_delay;
            if next_poll > Instant::now() {
                tokio::select! {
                    _ = tokio::time::sleep_until(next_poll) => (),
                    _ = self.shutdown.recv() => (),
                }
            }
        }
    }

    /// Assemble the given message & route it to its processor.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn dispatch_message(&mut self, entry: IdAndSequence) -> Delivery {
        let work = match self.assemble_message_data(entry.id).await {
            Ok(Assembled::Ready(work)) => work,
            Ok(Assembled::MissingData) => {
                tracing::debug!(message = %entry.id, sequence = entry.sequence, "message is missing data, skipping");
                return Delivery::Skipped;
            }
            Ok(Assembled::NotFound) => {
                tracing::debug!(message = %entry.id, sequence = entry.sequence, "message not found, skipping");
                return Delivery::Skipped;
            }
            Err(err) => {
                tracing::error!(error = ?err, message = %entry.id, sequence = entry.sequence, "error assembling message data");
                return Delivery::Retry;
            }
        };

        let handle = match self.get_processor(&work.msg) {
            Ok(handle) => handle,
            Err(err) => {
                if self.shutdown.is_shutdown() {
                    return Delivery::Retry;
                }
                tracing::error!(error = %err, message = %entry.id, sequence = entry.sequence, "unable to route message, skipping");
                return Delivery::Skipped;
            }
        };

        // Delivery applies backpressure from the processor, which may be busy flushing.
        tokio::select! {
            res = handle.tx.send(ProcessorMsg::Work(work)) => match res {
                Ok(()) => Delivery::Delivered,
                Err(_) => {
                    tracing::warn!(message = %entry.id, "processor channel closed, message will be read again");
                    Delivery::Retry
                }
            },
            _ = self.shutdown.recv() => Delivery::Retry,
        }
    }

    /// Load the given message along with its data.
    pub(super) async fn assemble_message_data(&self, id: Uuid) -> Result<Assembled> {
        let data = self.data.clone();
        let found = Database::spawn_blocking(move || data.get_message_with_data_cached(&id)).await??;
        Ok(match found {
            None => Assembled::NotFound,
            Some(found) if !found.all_present => Assembled::MissingData,
            Some(found) => Assembled::Ready(BatchWork { msg: found.message, data: found.data }),
        })
    }

    /// Get the processor for the given message, spawning it as needed.
    pub(super) fn get_processor(&mut self, msg: &Message) -> Result<ProcessorHandle> {
        let header = &msg.header;
        let dispatcher = self
            .routes
            .get(&(header.tx_type, header.msg_type))
            .ok_or(AppError::UnknownDispatcher { tx_type: header.tx_type, msg_type: header.msg_type })?;
        let key = ProcessorKey {
            namespace: header.namespace.clone(),
            signer: header.signer.clone(),
            group: header.group,
        };
        let name = Arc::new(key.processor_name(&dispatcher.name));
        if let Some(handle) = self.processors.load().get(&name) {
            return Ok(handle.clone());
        }

        // Subscribe before checking for shutdown, so the new processor can not miss the signal.
        let shutdown = Shutdown::new(self.shutdown_tx.subscribe());
        if self.shutdown.is_shutdown() {
            return Err(AppError::ShuttingDown.into());
        }
        tracing::debug!(processor = %name, "spawning new batch processor");
        let (processor, handle) = BatchProcessor::new(
            self.config.clone(),
            name.clone(),
            dispatcher.clone(),
            key,
            self.node_id,
            self.store.clone(),
            self.data.clone(),
            self.tap.clone(),
            shutdown,
        );
        self.processor_tasks.insert(name.clone(), processor.spawn());

        let mut processors = self.processors.load().as_ref().clone();
        processors.insert(name, handle.clone());
        metrics::gauge!(METRIC_ACTIVE_PROCESSORS, processors.len() as f64);
        self.processors.store(Arc::new(processors));
        Ok(handle)
    }

    /// Remove quiescing processors from the registry, asking each of them to stop.
    async fn reap_quiescing_processors(&mut self) {
        self.reaped_tasks.retain(|task| !task.is_finished());
        let current = self.processors.load_full();
        let quiescing: Vec<_> = current
            .iter()
            .filter(|(_, handle)| handle.is_quiescing())
            .map(|(name, _)| name.clone())
            .collect();
        if quiescing.is_empty() {
            return;
        }

        let mut processors = current.as_ref().clone();
        let mut closing = Vec::with_capacity(quiescing.len());
        for name in quiescing {
            tracing::debug!(processor = %name, "reaping idle batch processor");
            if let Some(handle) = processors.remove(&name) {
                closing.push(handle);
            }
            if let Some(task) = self.processor_tasks.remove(&name) {
                self.reaped_tasks.push(task);
            }
        }
        metrics::gauge!(METRIC_ACTIVE_PROCESSORS, processors.len() as f64);
        self.processors.store(Arc::new(processors));

        for handle in closing {
            tokio::select! {
                _ = handle.tx.send(ProcessorMsg::Close) => (),
                _ = self.shutdown.recv() => return,
            }
        }
    }

    /// Close every processor & wait for all of them to stop.
    async fn shutdown_processors(&mut self) {
        let processors = self.processors.swap(Default::default());
        for (name, handle) in processors.iter() {
            if handle.tx.try_send(ProcessorMsg::Close).is_err() {
                tracing::trace!(processor = %name, "processor channel full, relying on shutdown signal");
            }
        }
        drop(processors);
        metrics::gauge!(METRIC_ACTIVE_PROCESSORS, 0.0);

        let tasks = self.processor_tasks.drain().map(|(_, task)| task).chain(self.reaped_tasks.drain(..));
        for task in tasks.collect::<Vec<_>>() {
            if let Err(err) = task.await {
                tracing::error!(error = ?err, "error joining batch processor task");
            }
        }
    }
}
