//! Shutdown signal tracking.

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;

/// A receiver of the system shutdown signal which remembers once the signal has been observed.
///
/// Tasks hold one of these for the full duration of their lifetime, so that every `select!`
/// site as well as every retry loop of a task observes the same shutdown state.
#[derive(Debug)]
pub struct Shutdown {
    is_shutdown: bool,
    notify: broadcast::Receiver<()>,
}

impl Shutdown {
    /// Create a new instance.
    pub fn new(notify: broadcast::Receiver<()>) -> Self {
        Self { is_shutdown: false, notify }
    }

    /// Check if shutdown has been signalled, without blocking.
    pub fn is_shutdown(&mut self) -> bool {
        if !self.is_shutdown {
            match self.notify.try_recv() {
                Err(TryRecvError::Empty) => (),
                // A value, a lag or a closed channel all mean the system is going down.
                _ => self.is_shutdown = true,
            }
        }
        self.is_shutdown
    }

    /// Wait for the shutdown signal.
    pub async fn recv(&mut self) {
        if self.is_shutdown {
            return;
        }
        let _ = self.notify.recv().await;
        self.is_shutdown = true;
    }
}
