//! The sequence cursor & new message notifier.

use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::batch::METRIC_READ_OFFSET;
use crate::database::Database;
use crate::models::{IdAndSequence, MessageState};
use crate::plugins::{MessageQuery, Persistence};
use crate::shutdown::Shutdown;

/// The read position of the sequencer over the message sequence index.
#[derive(Debug, Default)]
pub struct SequenceCursor {
    state: Mutex<CursorState>,
}

#[derive(Clone, Copy, Debug, Default)]
struct CursorState {
    /// The last sequence handed to the pipeline.
    read_offset: u64,
    /// The earliest offset which needs to be read again, if any.
    rewind_offset: Option<u64>,
}

impl SequenceCursor {
    /// Create a new instance positioned after the given sequence.
    pub fn new(read_offset: u64) -> Self {
        Self { state: Mutex::new(CursorState { read_offset, rewind_offset: None }) }
    }

    /// The last sequence handed to the pipeline.
    pub fn read_offset(&self) -> u64 {
        self.state.lock().read_offset
    }

    /// The pending rewind offset, if any.
    pub fn rewind_offset(&self) -> Option<u64> {
        self.state.lock().rewind_offset
    }

    /// Record that a message with the given sequence has been committed.
    ///
    /// A message which is not ahead of the cursor was committed out of order, so a rewind to
    /// just before it is requested. A pending rewind is only ever lowered by this, never raised.
    /// Returns `true` if a rewind was requested.
    pub fn notify_new_message(&self, sequence: u64) -> bool {
        let mut state = self.state.lock();
        if sequence > state.read_offset {
            return false;
        }
        let target = sequence.saturating_sub(1);
        state.rewind_offset = Some(state.rewind_offset.map_or(target, |current| current.min(target)));
        true
    }

    /// Request that everything after the given offset is read again.
    pub fn rewind_to(&self, offset: u64) {
        let mut state = self.state.lock();
        state.rewind_offset = Some(state.rewind_offset.map_or(offset, |current| current.min(offset)));
    }

    /// Apply any pending rewind which is behind the cursor, returning the resulting offset.
    fn apply_rewind(&self) -> u64 {
        let mut state = self.state.lock();
        if let Some(rewind) = state.rewind_offset.take() {
            if rewind < state.read_offset {
                tracing::debug!(from = state.read_offset, to = rewind, "rewinding sequence cursor");
                state.read_offset = rewind;
            }
        }
        state.read_offset
    }

    /// Advance the cursor to the given sequence.
    fn advance(&self, sequence: u64) {
        self.state.lock().read_offset = sequence;
        metrics::gauge!(METRIC_READ_OFFSET, sequence as f64);
    }
}

/// Read the next page of ready message summaries from the position of the cursor.
///
/// When `rewind` is set any pending rewind is applied first. The cursor is advanced to the
/// last sequence of the page, and left untouched when the page is empty.
#[tracing::instrument(level = "trace", skip(store, cursor))]
pub async fn read_page(store: Arc<dyn Persistence>, cursor: &SequenceCursor, page_size: usize, rewind: bool) -> Result<Vec<IdAndSequence>> {
    let after_sequence = if rewind { cursor.apply_rewind() } else { cursor.read_offset() };
    let query = MessageQuery { after_sequence, state: Some(MessageState::Ready), limit: page_size };
    let page = Database::spawn_blocking(move || store.get_message_ids(&query)).await??;
    if let Some(last) = page.last() {
        cursor.advance(last.sequence);
    }
    Ok(page)
}

/// A task which drains the new message & rewind channels into the cursor, waking the sequencer.
pub(super) struct Notifier {
    cursor: Arc<SequenceCursor>,
    new_messages: mpsc::Receiver<u64>,
    /// Sequences from which messages need to be read again.
    rewinds: mpsc::Receiver<u64>,
    tap: Arc<Notify>,
    shutdown: Shutdown,
}

impl Notifier {
    /// Create a new instance.
    pub fn new(
        cursor: Arc<SequenceCursor>, new_messages: mpsc::Receiver<u64>, rewinds: mpsc::Receiver<u64>, tap: Arc<Notify>, shutdown: Shutdown,
    ) -> Self {
        Self { cursor, new_messages, rewinds, tap, shutdown }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::debug!("new message notifier has started");
        loop {
            tokio::select! {
                seq_opt = self.new_messages.recv() => match seq_opt {
                    Some(sequence) => self.handle_new_message(sequence),
                    None => break,
                },
                Some(sequence) = self.rewinds.recv() => self.handle_rewind(sequence),
                _ = self.shutdown.recv() => break,
            }
        }
        tracing::debug!("new message notifier has shutdown");
        Ok(())
    }

    /// Handle a new message signal, coalescing any further signals which are already queued.
    fn handle_new_message(&mut self, sequence: u64) {
        let mut rewound = self.cursor.notify_new_message(sequence);
        let mut count = 1usize;
        while let Ok(sequence) = self.new_messages.try_recv() {
            rewound |= self.cursor.notify_new_message(sequence);
            count += 1;
        }
        tracing::trace!(count, rewound, "new messages signalled");
        self.tap.notify_one();
    }

    /// Handle a rewind trigger, so that the next read starts again from the given sequence.
    fn handle_rewind(&mut self, sequence: u64) {
        let mut earliest = sequence;
        while let Ok(sequence) = self.rewinds.try_recv() {
            earliest = earliest.min(sequence);
        }
        tracing::debug!(sequence = earliest, "rewind requested");
        self.cursor.rewind_to(earliest.saturating_sub(1));
        self.tap.notify_one();
    }
}
