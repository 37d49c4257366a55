use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use crate::server::spawn_server;
use hadron_batch::batch::{BatchManager, DispatcherOptions};
use hadron_batch::config::Config;
use hadron_batch::data::CachedDataManager;
use hadron_batch::database::Database;
use hadron_batch::models::{BatchType, MessageType, TransactionType};
use hadron_batch::outbox::OutboxDispatcher;
use hadron_batch::plugins::{Persistence, StaticNodeInfo};
use hadron_batch::watcher::SequenceWatcher;

/// The application object for when the batch daemon is running as a server.
pub struct App {
    /// The application's runtime config.
    _config: Arc<Config>,
    /// The application's database system.
    _db: Database,

    /// The batch manager.
    manager: BatchManager,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The join handle of the message sequence watcher.
    watcher_handle: JoinHandle<Result<()>>,
    /// The join handle of the metrics & status server.
    metrics_server: JoinHandle<Result<()>>,
}

impl App {
    /// Create a new instance.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        let (shutdown_tx, _) = broadcast::channel(10);

        // Initialize this node's storage.
        let db = Database::new(config.clone()).await.context("error opening database")?;
        let store: Arc<dyn Persistence> = Arc::new(db.clone());
        let data = Arc::new(CachedDataManager::new(&config, store.clone()));

        // Build the batch manager along with its dispatchers.
        let mut manager = BatchManager::builder()
            .config(config.clone())
            .persistence(store)
            .data_manager(data)
            .node_info(Arc::new(StaticNodeInfo(config.node_id)))
            .shutdown(shutdown_tx.clone())
            .build()
            .context("error building batch manager")?;
        let outbox = OutboxDispatcher::new(db.clone());
        manager.register_dispatcher(
            "broadcast_pinned",
            TransactionType::BatchPin,
            &[MessageType::Broadcast, MessageType::Definition, MessageType::TransferBroadcast],
            outbox.clone(),
            DispatcherOptions::from_config(&config, BatchType::Broadcast),
        )?;
        manager.register_dispatcher(
            "private_pinned",
            TransactionType::BatchPin,
            &[MessageType::Private, MessageType::GroupInit, MessageType::TransferPrivate],
            outbox.clone(),
            DispatcherOptions::from_config(&config, BatchType::Private),
        )?;
        manager.register_dispatcher(
            "private_unpinned",
            TransactionType::Unpinned,
            &[MessageType::Private],
            outbox,
            DispatcherOptions::from_config(&config, BatchType::Private),
        )?;

        // Subscribe to new messages before starting, so that nothing stored after the initial
        // read of the sequencer goes unsignalled.
        let watcher = SequenceWatcher::new(&db, manager.new_messages(), shutdown_tx.subscribe());
        manager.start().context("error starting batch manager")?;
        let watcher_handle = watcher.spawn();

        let metrics_server = spawn_server(&config, manager.status_handle(), shutdown_tx.subscribe());

        Ok(Self {
            _config: config,
            _db: db,
            manager,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
            watcher_handle,
            metrics_server,
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut signals = StreamMap::new();
        signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));

        loop {
            tokio::select! {
                Some((_, sig)) = signals.next() => {
                    tracing::debug!(signal = ?sig, "signal received, beginning graceful shutdown");
                    let _ = self.shutdown_tx.send(());
                    break;
                }
                _ = self.shutdown_rx.next() => break,
            }
        }

        // Begin shutdown routine.
        tracing::debug!("Hadron batch daemon is shutting down");
        if let Err(err) = self.manager.wait_stop().await {
            tracing::error!(error = ?err, "error shutting down batch manager");
        }
        if let Err(err) = self.watcher_handle.await.context("error joining sequence watcher handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down sequence watcher");
        }
        if let Err(err) = self.metrics_server.await.context("error joining metrics server handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down metrics server");
        }

        tracing::debug!("Hadron batch daemon shutdown complete");
        Ok(())
    }
}
