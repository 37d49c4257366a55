//! Batch processor.

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use backoff::backoff::Backoff;
use serde::Serialize;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::batch::seal;
use crate::batch::{DispatchState, Dispatcher, ProcessorKey, METRIC_BATCHES_DISPATCHED, METRIC_FLUSH_ERRORS};
use crate::config::Config;
use crate::models::{Data, Message, MessageState};
use crate::plugins::{DataManager, Persistence};
use crate::shutdown::Shutdown;
use crate::utils;

/// The number of recently flushed sequences tracked by a processor for duplicate detection.
const FLUSHED_SEQUENCES_CAPACITY: usize = 1000;

/// A message routed to a processor.
pub(crate) enum ProcessorMsg {
    /// A ready message to be batched.
    Work(BatchWork),
    /// A request to flush whatever is buffered.
    Tap,
    /// A request to flush whatever is buffered and then stop.
    Close,
}

/// A ready message along with its resolved data.
#[derive(Clone, Debug)]
pub struct BatchWork {
    pub msg: Message,
    pub data: Vec<Data>,
}

impl BatchWork {
    /// An estimate of the number of bytes this work will add to a batch payload.
    pub fn estimate_size(&self) -> u64 {
        self.msg.estimate_size(true) + self.data.iter().map(Data::estimate_size).sum::<u64>()
    }
}

/// The lifecycle state of a processor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessorState {
    Idle,
    Accumulating,
    Flushing,
    Quiescing,
}

impl Default for ProcessorState {
    fn default() -> Self {
        Self::Idle
    }
}

/// Flush statistics of a processor.
#[derive(Clone, Debug, Default, Serialize)]
pub struct FlushStatus {
    /// The attempt number of the current or most recent flush.
    pub attempt: u32,
    pub last_flush_start: Option<i64>,
    pub last_flush_error: Option<String>,
    pub last_flush_error_time: Option<i64>,
    pub total_batches: u64,
    pub total_errors: u64,
    pub average_batch_messages: f64,
    pub average_batch_data: f64,
    pub average_batch_bytes: f64,
    pub average_flush_time_ms: f64,
}

/// A status snapshot of a processor.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ProcessorStatus {
    pub dispatcher: String,
    pub state: ProcessorState,
    /// The ID of the batch currently being flushed, if any.
    pub flushing: Option<Uuid>,
    /// The number of messages held by the processor, including those of a batch in flight.
    pub buffered: usize,
    /// The estimated payload size of the messages held by the processor.
    pub buffered_bytes: u64,
    pub flush: FlushStatus,
}

impl ProcessorStatus {
    /// Check if this processor is flushing a batch.
    pub fn is_flushing(&self) -> bool {
        self.flushing.is_some()
    }
}

/// The handle of an active processor, as held in the processor registry.
#[derive(Clone)]
pub(crate) struct ProcessorHandle {
    pub tx: mpsc::Sender<ProcessorMsg>,
    pub status: Arc<ArcSwap<ProcessorStatus>>,
}

impl ProcessorHandle {
    /// Ask the processor to flush, without waiting; fails if the processor's channel is full.
    pub fn tap(&self) -> Result<()> {
        self.tx
            .try_send(ProcessorMsg::Tap)
            .map_err(|_| anyhow::anyhow!("processor channel unavailable"))
    }

    /// Check if the processor has marked itself as quiescing.
    pub fn is_quiescing(&self) -> bool {
        self.status.load().state == ProcessorState::Quiescing
    }
}

/// Progress of a batch through the steps of a flush, preserved across attempts.
#[derive(Default)]
struct FlushProgress {
    sealed: bool,
    dispatched: bool,
}

/// A processor which accumulates messages of one dispatcher & key into batches.
pub(crate) struct BatchProcessor {
    config: Arc<Config>,
    name: Arc<String>,
    dispatcher: Arc<Dispatcher>,
    key: ProcessorKey,
    node_id: Uuid,
    store: Arc<dyn Persistence>,
    data: Arc<dyn DataManager>,

    work_rx: mpsc::Receiver<ProcessorMsg>,
    /// The published status of this processor.
    status: Arc<ArcSwap<ProcessorStatus>>,
    /// The working copy of this processor's status.
    local: ProcessorStatus,
    /// The shoulder tap of the manager, used to have idle processors reaped.
    manager_tap: Arc<Notify>,
    shutdown: Shutdown,

    /// Buffered work, ordered by sequence.
    queue: Vec<BatchWork>,
    queue_bytes: u64,
    first_buffered_at: Option<Instant>,
    last_activity: Instant,
    flushed_sequences: VecDeque<u64>,
    closed: bool,
}

impl BatchProcessor {
    /// Create a new instance along with the handle used to communicate with it.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>, name: Arc<String>, dispatcher: Arc<Dispatcher>, key: ProcessorKey, node_id: Uuid, store: Arc<dyn Persistence>,
        data: Arc<dyn DataManager>, manager_tap: Arc<Notify>, shutdown: Shutdown,
    ) -> (Self, ProcessorHandle) {
        let (tx, work_rx) = mpsc::channel(1);
        let local = ProcessorStatus { dispatcher: dispatcher.name.as_ref().clone(), ..Default::default() };
        let status = Arc::new(ArcSwap::from_pointee(local.clone()));
        let handle = ProcessorHandle { tx, status: status.clone() };
        let processor = Self {
            config,
            name,
            dispatcher,
            key,
            node_id,
            store,
            data,
            work_rx,
            status,
            local,
            manager_tap,
            shutdown,
            queue: vec![],
            queue_bytes: 0,
            first_buffered_at: None,
            last_activity: Instant::now(),
            flushed_sequences: VecDeque::with_capacity(FLUSHED_SEQUENCES_CAPACITY),
            closed: false,
        };
        (processor, handle)
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        tracing::debug!(processor = %self.name, "batch processor has started");

        loop {
            if self.closed {
                break;
            }
            let now = Instant::now();
            let flush_at = self.first_buffered_at.map(|at| at + self.dispatcher.options.batch_timeout);
            let dispose_at = self.last_activity + self.dispatcher.options.dispose_timeout;
            let can_quiesce = self.queue.is_empty() && self.local.state != ProcessorState::Quiescing;
            tokio::select! {
                msg_opt = self.work_rx.recv() => self.handle_msg(msg_opt).await,
                _ = tokio::time::sleep_until(flush_at.unwrap_or(now)), if flush_at.is_some() => self.flush().await,
                _ = tokio::time::sleep_until(dispose_at), if can_quiesce => self.begin_quiescing(),
                _ = self.shutdown.recv() => self.drain().await,
            }
        }

        tracing::debug!(
            processor = %self.name,
            total_batches = self.local.flush.total_batches,
            "batch processor has shutdown"
        );
    }

    /// Handle a message from the sequencer.
    async fn handle_msg(&mut self, msg_opt: Option<ProcessorMsg>) {
        match msg_opt {
            Some(ProcessorMsg::Work(work)) => self.handle_work(work).await,
            Some(ProcessorMsg::Tap) => {
                if !self.queue.is_empty() {
                    self.flush().await;
                }
            }
            Some(ProcessorMsg::Close) | None => self.drain().await,
        }
    }

    /// Flush whatever is buffered and then stop.
    ///
    /// During shutdown the flush gets a single attempt, as its retry loop stops on shutdown.
    async fn drain(&mut self) {
        if !self.queue.is_empty() {
            self.flush().await;
        }
        self.closed = true;
    }

    /// Handle a new piece of work, flushing as needed.
    ///
    /// Recently flushed sequences are dropped, which happens when the sequencer rewinds. Work
    /// for a sequence which is already buffered replaces the buffered copy. When adding the work
    /// would push the buffer over the byte cap, the already buffered work is flushed first and
    /// the new work starts the next batch.
    #[tracing::instrument(level = "trace", skip(self, work), fields(processor = %self.name, sequence = work.msg.sequence))]
    async fn handle_work(&mut self, work: BatchWork) {
        self.last_activity = Instant::now();
        if self.local.state == ProcessorState::Quiescing {
            tracing::debug!(processor = %self.name, "new work received, no longer quiescing");
            self.local.state = ProcessorState::Idle;
        }

        let sequence = work.msg.sequence;
        if self.flushed_sequences.contains(&sequence) {
            tracing::debug!(processor = %self.name, sequence, "ignoring message which was recently flushed");
            self.publish();
            return;
        }
        if let Ok(idx) = self.queue.binary_search_by_key(&sequence, |item| item.msg.sequence) {
            tracing::debug!(processor = %self.name, sequence, "replacing buffered message");
            let previous = self.queue.remove(idx);
            self.queue_bytes = self.queue_bytes.saturating_sub(previous.estimate_size());
        }
        let size = work.estimate_size();
        if self.would_overflow(size) {
            tracing::debug!(processor = %self.name, sequence, size, "batch byte cap reached, flushing before adding");
            self.flush().await;
            if self.closed {
                return;
            }
        }

        self.add_work(work, size);
        let options = &self.dispatcher.options;
        if self.queue.len() >= options.batch_max_size || self.queue_bytes >= options.batch_max_bytes {
            self.flush().await;
        } else {
            self.local.state = ProcessorState::Accumulating;
            self.publish();
        }
    }

    /// Add the given work to the buffer in sequence order.
    fn add_work(&mut self, work: BatchWork, size: u64) {
        let sequence = work.msg.sequence;
        let idx = self
            .queue
            .binary_search_by_key(&sequence, |item| item.msg.sequence)
            .unwrap_or_else(|idx| idx);
        if self.first_buffered_at.is_none() {
            self.first_buffered_at = Some(Instant::now());
        }
        self.queue.insert(idx, work);
        self.queue_bytes += size;
    }

    /// Check if adding work of the given size would push the buffer over the byte cap.
    fn would_overflow(&self, size: u64) -> bool {
        !self.queue.is_empty() && self.queue_bytes + size > self.dispatcher.options.batch_max_bytes
    }

    /// Mark this processor as quiescing, asking the manager to reap it.
    fn begin_quiescing(&mut self) {
        tracing::debug!(processor = %self.name, "batch processor is idle, quiescing");
        self.local.state = ProcessorState::Quiescing;
        self.publish();
        self.manager_tap.notify_one();
    }

    /// Publish the working copy of this processor's status.
    fn publish(&self) {
        let mut status = self.local.clone();
        status.buffered += self.queue.len();
        status.buffered_bytes += self.queue_bytes;
        self.status.store(Arc::new(status));
    }

    /// Flush the buffered work as a single batch.
    ///
    /// The batch is retried with backoff, keeping the same batch ID & content, until it has been
    /// sealed, dispatched & marked as sent, or until shutdown.
    async fn flush(&mut self) {
        let work = std::mem::take(&mut self.queue);
        let bytes = std::mem::replace(&mut self.queue_bytes, 0);
        self.first_buffered_at = None;
        if work.is_empty() {
            return;
        }

        let id = Uuid::new_v4();
        let options = &self.dispatcher.options;
        let mut state = Arc::new(DispatchState::new(id, options.batch_type, self.dispatcher.tx_type, &self.key, self.node_id, work));
        let (count, data_count) = (state.messages.len(), state.data.len());
        tracing::debug!(processor = %self.name, batch = %id, messages = count, bytes, "flushing batch");

        let started = Instant::now();
        self.local.state = ProcessorState::Flushing;
        self.local.flushing = Some(id);
        self.local.buffered = count;
        self.local.buffered_bytes = bytes;
        self.local.flush.attempt = 0;
        self.local.flush.last_flush_start = Some(utils::now_millis());

        let mut backoff = self.config.retry_backoff();
        let mut progress = FlushProgress::default();
        loop {
            let attempt = {
                let state = Arc::make_mut(&mut state);
                state.attempt += 1;
                state.attempt
            };
            self.local.flush.attempt = attempt;
            self.publish();

            let err = match self.flush_attempt(&mut state, &mut progress).await {
                Ok(()) => break,
                Err(err) => err,
            };
            if self.shutdown.is_shutdown() {
                tracing::debug!(processor = %self.name, batch = %id, "abandoning batch flush due to shutdown");
                self.abandon_flush();
                return;
            }
            tracing::error!(error = ?err, processor = %self.name, batch = %id, attempt, "error flushing batch");
            metrics::increment_counter!(METRIC_FLUSH_ERRORS);
            self.local.flush.last_flush_error = Some(format!("{:#}", err));
            self.local.flush.last_flush_error_time = Some(utils::now_millis());
            self.local.flush.total_errors += 1;
            self.publish();

            let delay = backoff.next_backoff().unwrap_or(backoff.max_interval);
            tokio::select! {
                _ = tokio::time::sleep(delay) => (),
                _ = self.shutdown.recv() => {
                    tracing::debug!(processor = %self.name, batch = %id, "abandoning batch flush due to shutdown");
                    self.abandon_flush();
                    return;
                }
            }
        }

        // Record the flushed sequences & update the cached copies of the sent messages.
        for msg in state.messages.iter() {
            if self.flushed_sequences.len() >= FLUSHED_SEQUENCES_CAPACITY {
                self.flushed_sequences.pop_front();
            }
            self.flushed_sequences.push_back(msg.sequence);
            let mut sent = msg.clone();
            sent.state = MessageState::Sent;
            self.data.update_message_if_cached(&sent);
        }
        metrics::increment_counter!(METRIC_BATCHES_DISPATCHED);

        let stats = &mut self.local.flush;
        stats.total_batches += 1;
        let n = stats.total_batches as f64;
        stats.average_batch_messages += (count as f64 - stats.average_batch_messages) / n;
        stats.average_batch_data += (data_count as f64 - stats.average_batch_data) / n;
        stats.average_batch_bytes += (bytes as f64 - stats.average_batch_bytes) / n;
        stats.average_flush_time_ms += (started.elapsed().as_secs_f64() * 1000.0 - stats.average_flush_time_ms) / n;
        self.local.flushing = None;
        self.local.buffered = 0;
        self.local.buffered_bytes = 0;
        self.local.state = ProcessorState::Idle;
        self.last_activity = Instant::now();
        self.publish();
        tracing::debug!(processor = %self.name, batch = %id, messages = count, "batch dispatched");
    }

    /// A single attempt at the remaining steps of a flush.
    async fn flush_attempt(&mut self, state: &mut Arc<DispatchState>, progress: &mut FlushProgress) -> Result<()> {
        if !progress.sealed {
            let sealed = seal::seal_batch(self.store.clone(), state.clone()).await?;
            let inner = Arc::make_mut(state);
            inner.persisted.hash = sealed.hash;
            inner.pins = sealed.pins.iter().flatten().copied().collect();
            for (msg, pins) in inner.messages.iter_mut().zip(sealed.pins.iter()) {
                msg.batch = Some(inner.persisted.id);
                msg.pins = pins.iter().map(|pin| pin.to_string()).collect();
            }
            progress.sealed = true;
        }

        // A dispatch in flight always runs to completion, even during shutdown.
        if !progress.dispatched {
            let handler = self.dispatcher.handler.clone();
            handler.dispatch(state.clone()).await.context("batch dispatch handler failed")?;
            progress.dispatched = true;
        }

        seal::mark_dispatched(self.store.clone(), state.clone()).await
    }

    /// Reset the flush status after a flush was abandoned due to shutdown.
    fn abandon_flush(&mut self) {
        self.local.flushing = None;
        self.local.buffered = 0;
        self.local.buffered_bytes = 0;
        self.local.state = ProcessorState::Idle;
        self.closed = true;
        self.publish();
    }
}
