//! A watcher of newly stored messages.

use anyhow::Result;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::database::Database;
use crate::shutdown::Shutdown;
use crate::utils;

/// A task which watches the message sequence index, signalling the sequence of every newly
/// stored message to the batch manager.
pub struct SequenceWatcher {
    /// A subscription to all inserts into the sequence index.
    subscriber: sled::Subscriber,
    /// The new message channel of the batch manager.
    new_messages: mpsc::Sender<u64>,
    shutdown: Shutdown,
}

impl SequenceWatcher {
    /// Create a new instance.
    ///
    /// The subscription is established immediately, so every insert made after this call is
    /// observed by the watcher, even if it is spawned later.
    pub fn new(db: &Database, new_messages: mpsc::Sender<u64>, shutdown: broadcast::Receiver<()>) -> Self {
        let subscriber = db.sequences_tree().watch_prefix(b"");
        Self { subscriber, new_messages, shutdown: Shutdown::new(shutdown) }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::debug!("sequence watcher has started");

        loop {
            tokio::select! {
                event_opt = &mut self.subscriber => match event_opt {
                    Some(sled::Event::Insert { key, .. }) => {
                        if !self.handle_insert(&key).await {
                            break;
                        }
                    }
                    Some(sled::Event::Remove { .. }) => continue,
                    None => break,
                },
                _ = self.shutdown.recv() => break,
            }
        }

        tracing::debug!("sequence watcher has shutdown");
        Ok(())
    }

    /// Signal the sequence of an inserted index key, returning `false` once the batch manager
    /// no longer accepts signals.
    async fn handle_insert(&mut self, key: &[u8]) -> bool {
        let sequence = match utils::decode_u64(key) {
            Ok(sequence) => sequence,
            Err(err) => {
                tracing::error!(error = ?err, "malformed key in message sequence index");
                return true;
            }
        };
        tokio::select! {
            res = self.new_messages.send(sequence) => match res {
                Ok(()) => true,
                Err(_) => {
                    tracing::debug!("new message channel closed");
                    false
                }
            },
            _ = self.shutdown.recv() => false,
        }
    }
}
