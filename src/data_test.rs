use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::Config;
use crate::data::CachedDataManager;
use crate::database::Database;
use crate::fixtures;
use crate::models::{Bytes32, MessageState, MessageType, TransactionType};
use crate::plugins::{DataManager, Persistence};

#[tokio::test]
async fn resolves_message_with_all_data() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let db = Database::new(config.clone()).await?;
    let (msg, data) = fixtures::store_broadcast_message(&db, &["topic1"])?;
    let manager = CachedDataManager::new(&config, Arc::new(db));

    let found = manager.get_message_with_data_cached(&msg.header.id)?.context("expected message to be found")?;

    assert!(found.all_present, "expected all data to be present");
    assert!(found.message == msg, "expected message {:?} got {:?}", msg, found.message);
    assert!(found.data == vec![data], "expected 1 matching data item got {:?}", found.data);
    assert!(manager.len() == 1, "expected 1 cache entry got {}", manager.len());

    Ok(())
}

#[tokio::test]
async fn unknown_message_is_not_found() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let db = Database::new(config.clone()).await?;
    let manager = CachedDataManager::new(&config, Arc::new(db));

    let found = manager.get_message_with_data_cached(&uuid::Uuid::new_v4())?;

    assert!(found.is_none(), "expected no message got {:?}", found);
    assert!(manager.is_empty(), "expected empty cache got {}", manager.len());

    Ok(())
}

#[tokio::test]
async fn missing_data_is_reported_and_not_cached() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let db = Database::new(config.clone()).await?;
    let mut msg = fixtures::new_message(MessageType::Broadcast, TransactionType::BatchPin, &["topic1"], None);
    let data = fixtures::new_data();
    msg.data.push(data.data_ref());
    db.insert_message(&mut msg)?;
    let manager = CachedDataManager::new(&config, Arc::new(db.clone()));

    let found = manager.get_message_with_data_cached(&msg.header.id)?.context("expected message to be found")?;
    assert!(!found.all_present, "expected data to be reported missing");
    assert!(manager.is_empty(), "expected empty cache got {}", manager.len());

    // Once the data arrives the message resolves fully.
    db.insert_data(&data)?;
    let found = manager.get_message_with_data_cached(&msg.header.id)?.context("expected message to be found")?;
    assert!(found.all_present, "expected all data to be present after insert");
    assert!(manager.len() == 1, "expected 1 cache entry got {}", manager.len());

    Ok(())
}

#[tokio::test]
async fn data_hash_mismatch_counts_as_missing() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let db = Database::new(config.clone()).await?;
    let mut msg = fixtures::new_message(MessageType::Broadcast, TransactionType::BatchPin, &["topic1"], None);
    let data = fixtures::new_data();
    let mut data_ref = data.data_ref();
    data_ref.hash = Bytes32::sha256(b"something else");
    msg.data.push(data_ref);
    db.insert_data(&data)?;
    db.insert_message(&mut msg)?;
    let manager = CachedDataManager::new(&config, Arc::new(db));

    let found = manager.get_message_with_data_cached(&msg.header.id)?.context("expected message to be found")?;

    assert!(!found.all_present, "expected mismatched data to be reported missing");
    assert!(found.data.is_empty(), "expected no resolved data got {}", found.data.len());

    Ok(())
}

#[tokio::test]
async fn cached_message_is_served_and_updated() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let db = Database::new(config.clone()).await?;
    let (msg, _) = fixtures::store_broadcast_message(&db, &["topic1"])?;
    let store: Arc<dyn Persistence> = Arc::new(db.clone());
    let manager = CachedDataManager::new(&config, store);
    manager.get_message_with_data_cached(&msg.header.id)?;

    let mut sent = msg.clone();
    sent.state = MessageState::Sent;
    manager.update_message_if_cached(&sent);
    let found = manager.get_message_with_data_cached(&msg.header.id)?.context("expected message to be found")?;

    // The store still holds the ready copy, so this can only have been served from cache.
    assert!(found.message.state == MessageState::Sent, "expected cached state sent got {}", found.message.state);
    let stored = db.get_message_by_id(&msg.header.id)?.context("expected stored message")?;
    assert!(stored.state == MessageState::Ready, "expected stored state ready got {}", stored.state);

    Ok(())
}

#[tokio::test]
async fn cache_is_bounded() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let db = Database::new(config.clone()).await?;
    let mut bounded = (*config).clone();
    bounded.cache_max_entries = 3;
    let mut ids = vec![];
    for _ in 0..5 {
        ids.push(fixtures::store_broadcast_message(&db, &["topic1"])?.0.header.id);
    }
    let manager = CachedDataManager::new(&bounded, Arc::new(db));

    for id in ids.iter() {
        manager.get_message_with_data_cached(id)?;
    }

    assert!(manager.len() == 3, "expected 3 cache entries got {}", manager.len());

    Ok(())
}
