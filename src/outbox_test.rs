use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::batch::{BatchManager, DispatcherOptions};
use crate::config::Config;
use crate::database::Database;
use crate::fixtures;
use crate::models::{BatchType, MessageState, MessageType, TransactionType};
use crate::outbox::{BatchPayload, OutboxDispatcher};
use crate::plugins::{Persistence, StaticNodeInfo};

#[tokio::test]
async fn dispatched_batches_are_written_to_outbox() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let db = Database::new(config.clone()).await?;
    let store: Arc<dyn Persistence> = Arc::new(db.clone());
    let mut manager = BatchManager::builder()
        .config(config.clone())
        .persistence(store.clone())
        .data_manager(fixtures::new_data_manager(&config, store))
        .node_info(Arc::new(StaticNodeInfo(config.node_id)))
        .build()?;
    let options = DispatcherOptions::from_config(&config, BatchType::Broadcast);
    manager.register_dispatcher("broadcast_pinned", TransactionType::BatchPin, &[MessageType::Broadcast], OutboxDispatcher::new(db.clone()), options)?;
    manager.start()?;

    let (msg, data) = fixtures::store_broadcast_message(&db, &["topic1"])?;
    let id = msg.header.id;
    fixtures::wait_for(Duration::from_secs(5), || Ok(db.get_message_by_id(&id)?.map(|msg| msg.state) == Some(MessageState::Sent))).await?;

    let stored = db.get_message_by_id(&id)?.context("expected message to be stored")?;
    let batch_id = stored.batch.context("expected message to be bound to a batch")?;
    let encoded = db.get_outbox(&batch_id)?.context("expected batch payload in outbox")?;
    let payload: BatchPayload = serde_json::from_slice(&encoded)?;
    assert!(payload.batch.id == batch_id, "expected payload batch {} got {}", batch_id, payload.batch.id);
    assert!(payload.messages.len() == 1, "expected 1 message got {}", payload.messages.len());
    assert!(payload.messages[0].header.id == id, "expected message {} got {}", id, payload.messages[0].header.id);
    assert!(payload.data.len() == 1, "expected 1 data item got {}", payload.data.len());
    assert!(payload.data[0].id == data.id, "expected data {} got {}", data.id, payload.data[0].id);
    assert!(payload.pins.len() == 1, "expected 1 pin got {}", payload.pins.len());
    let expected_pin = payload.pins[0].to_string();
    assert!(stored.pins == vec![expected_pin.clone()], "expected message pins [{}] got {:?}", expected_pin, stored.pins);

    manager.close();
    manager.wait_stop().await
}
